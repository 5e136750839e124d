//! Superstep coordination over a shared blackboard
//!
//! The registry decides what may run, the coordinator runs it, and the shared
//! state records what happened.

pub mod types;
pub mod state;
pub mod registry;
pub mod executor;
pub mod hooks;
pub mod coordinator;

pub use types::*;
pub use state::*;
pub use registry::*;
pub use executor::*;
pub use hooks::*;
pub use coordinator::*;
