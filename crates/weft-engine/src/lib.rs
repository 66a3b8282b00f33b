#![deny(missing_docs)]
#![doc = "Dynamic trace graph, scaffolds and detach/regen machinery for MCMC inference."]

//! The execution core of a trace-based probabilistic programming engine.
//!
//! A [`Trace`] holds the dataflow graph built by evaluating directives of a
//! small Lisp-like language. Inference proposes changes by constructing a
//! [`Scaffold`] over the random choices it wants to move, extracting the
//! affected sub-trace with [`detach_and_extract`], re-simulating it with
//! [`regen_and_attach`], and accepting or rejecting on the weight
//! difference; rejection replays the extracted state from the [`Db`].

pub mod consistency;
mod db;
mod detach;
mod env;
mod lkernel;
mod node;
mod regen;
mod scaffold;
mod sp;
pub mod sps;
mod trace;

pub use db::Db;
pub use detach::detach_and_extract;
pub use lkernel::{AaaKernel, DeterministicLKernel, KernelCtx, LKernel};
pub use node::{EdgeType, Node, NodeKind};
pub use regen::regen_and_attach;
pub use scaffold::{construct_scaffold, Scaffold};
pub use sp::{
    AbsorbQuery, Args, EsrRefPsp, LatentDb, NullRequestPsp, Psp, PspSlot, ScopeRole, SimValue,
    Sp, SpAux, SpRecord,
};
pub use trace::Trace;
