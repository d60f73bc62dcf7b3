//! Citation-grounded legal research memo generation.
//!
//! The core is two subsystems sharing one data model: a passage store that
//! turns uploaded document text into searchable embedded passages, and a
//! gated multi-phase workflow that sequences retrieval, extraction,
//! validation, and drafting into a single auditable run. A hard verification
//! gate blocks run completion until every check passes.

pub mod chunk;
pub mod cli;
pub mod embed;
pub mod engine;
pub mod error;
pub mod executor;
pub mod export;
pub mod lm;
pub mod model;
pub mod phases;
pub mod store;
pub mod verify;

pub use error::{Error, Result};
