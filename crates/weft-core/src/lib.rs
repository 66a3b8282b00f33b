#![deny(missing_docs)]
#![doc = "Core value model, identifiers, errors and RNG for the weft trace engine."]

pub mod errors;
pub mod ids;
pub mod rng;
mod value;

pub use errors::WeftError;
pub use ids::{DirectiveId, EnvId, NodeId};
pub use rng::{substream_seed, TraceRng};
pub use value::{Esr, EsrEnv, Hsr, Matrix, RequestValue, Value};
