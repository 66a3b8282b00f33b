//! The rollback store filled by detach and read by the paired regen.

use std::collections::BTreeMap;

use weft_core::{NodeId, Value};

use crate::sp::{LatentDb, SimValue};

/// Everything a detach removed from the trace, keyed for the paired regen.
///
/// Insertion is append-only during a single detach; the store is read (never
/// written) during the paired restoring regen, and simply dropped when a
/// proposal is accepted. Callers treat it as opaque.
#[derive(Debug, Default)]
pub struct Db {
    values: BTreeMap<NodeId, SimValue>,
    families: BTreeMap<(NodeId, Value), NodeId>,
    latents: BTreeMap<NodeId, Box<dyn LatentDb>>,
}

impl Db {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register_value(&mut self, node: NodeId, value: SimValue) {
        self.values.insert(node, value);
    }

    pub(crate) fn value(&self, node: NodeId) -> Option<&SimValue> {
        self.values.get(&node)
    }

    pub(crate) fn register_family(&mut self, maker: NodeId, id: Value, root: NodeId) {
        self.families.insert((maker, id), root);
    }

    pub(crate) fn family(&self, maker: NodeId, id: &Value) -> Option<NodeId> {
        self.families.get(&(maker, id.clone())).copied()
    }

    /// Family roots captured by the detach that filled this store.
    pub(crate) fn family_roots(&self) -> Vec<NodeId> {
        self.families.values().copied().collect()
    }

    pub(crate) fn has_latent_db(&self, maker: NodeId) -> bool {
        self.latents.contains_key(&maker)
    }

    pub(crate) fn register_latent_db(&mut self, maker: NodeId, db: Box<dyn LatentDb>) {
        self.latents.insert(maker, db);
    }

    pub(crate) fn latent_db(&self, maker: NodeId) -> Option<&dyn LatentDb> {
        self.latents.get(&maker).map(|b| b.as_ref())
    }

    pub(crate) fn latent_db_mut(&mut self, maker: NodeId) -> Option<&mut (dyn LatentDb + '_)> {
        match self.latents.get_mut(&maker) {
            Some(b) => Some(b.as_mut()),
            None => None,
        }
    }
}
