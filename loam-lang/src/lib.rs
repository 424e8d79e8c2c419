//! Middle-end of the loam compiler: simplification and tail-modulo-cons
//! passes over the lambda IR.
//!
//! The IR arrives from the front end as one term per compilation unit and
//! leaves, semantically unchanged, for code generation. See
//! [`passes::optimize`] for the pipeline.

pub mod interner;
pub mod lambda;
pub mod passes;
pub mod utils;
pub mod warnings;

pub use passes::{optimize, Config};
