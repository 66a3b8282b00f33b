//! Lexical environments.
//!
//! Frames live in an arena owned by the trace and chain through parent ids.
//! Bindings always map symbols to nodes, never to values; a lookup node reads
//! the bound node's current value, so rebinding semantics stay with the graph.

use std::collections::BTreeMap;

use weft_core::{EnvId, NodeId, WeftError};

#[derive(Debug, Clone, Default)]
struct EnvFrame {
    parent: Option<EnvId>,
    bindings: BTreeMap<String, NodeId>,
}

/// Arena of environment frames.
#[derive(Debug, Clone, Default)]
pub struct EnvTable {
    frames: Vec<EnvFrame>,
}

impl EnvTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh frame chained to `parent`.
    pub fn new_frame(&mut self, parent: Option<EnvId>) -> EnvId {
        let id = EnvId::from_raw(self.frames.len() as u64);
        self.frames.push(EnvFrame {
            parent,
            bindings: BTreeMap::new(),
        });
        id
    }

    fn frame(&self, env: EnvId) -> Result<&EnvFrame, WeftError> {
        self.frames
            .get(env.as_raw() as usize)
            .ok_or_else(|| WeftError::Assertion(format!("unknown environment frame {env:?}")))
    }

    fn frame_mut(&mut self, env: EnvId) -> Result<&mut EnvFrame, WeftError> {
        self.frames
            .get_mut(env.as_raw() as usize)
            .ok_or_else(|| WeftError::Assertion(format!("unknown environment frame {env:?}")))
    }

    /// Binds `symbol` to `node` in `env`, shadowing any previous binding.
    pub fn bind(&mut self, env: EnvId, symbol: &str, node: NodeId) -> Result<(), WeftError> {
        self.frame_mut(env)?.bindings.insert(symbol.to_owned(), node);
        Ok(())
    }

    /// Removes the binding of `symbol` from `env`, if present.
    pub fn unbind(&mut self, env: EnvId, symbol: &str) -> Result<(), WeftError> {
        self.frame_mut(env)?.bindings.remove(symbol);
        Ok(())
    }

    /// Returns the node bound to `symbol` in `env`, if any.
    pub fn lookup(&self, env: EnvId, symbol: &str) -> Result<Option<NodeId>, WeftError> {
        Ok(self.frame(env)?.bindings.get(symbol).copied())
    }

    /// Searches the frame chain for `symbol`.
    pub fn find_symbol(&self, env: EnvId, symbol: &str) -> Result<NodeId, WeftError> {
        let mut cursor = Some(env);
        while let Some(id) = cursor {
            let frame = self.frame(id)?;
            if let Some(node) = frame.bindings.get(symbol) {
                return Ok(*node);
            }
            cursor = frame.parent;
        }
        Err(WeftError::UnboundSymbol(symbol.to_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_lookup_prefers_inner_frame() {
        let mut envs = EnvTable::new();
        let outer = envs.new_frame(None);
        let inner = envs.new_frame(Some(outer));
        envs.bind(outer, "x", NodeId::from_raw(1)).unwrap();
        envs.bind(inner, "x", NodeId::from_raw(2)).unwrap();
        assert_eq!(envs.find_symbol(inner, "x").unwrap(), NodeId::from_raw(2));
        assert_eq!(envs.find_symbol(outer, "x").unwrap(), NodeId::from_raw(1));
    }

    #[test]
    fn miss_reports_unbound_symbol() {
        let mut envs = EnvTable::new();
        let env = envs.new_frame(None);
        let err = envs.find_symbol(env, "missing").unwrap_err();
        assert_eq!(err, WeftError::UnboundSymbol("missing".to_owned()));
    }
}
