//! Queue consumers for the two pipeline stages.
//!
//! Each worker is a [`carousel::JobHandler`] run by a carousel daemon; the
//! daemon owns claiming, concurrency, and redelivery, the handler owns the
//! domain consequences (commit, refund, asset transitions).

pub mod generation;
pub mod materialization;

pub use generation::GenerationHandler;
pub use materialization::MaterializationHandler;
