//! Job lifecycle types and state transitions.

pub mod transitions;
pub mod types;

pub use transitions::RetryPolicy;
pub use types::*;
