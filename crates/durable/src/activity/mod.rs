//! Activity abstractions
//!
//! Activities are units of work that are executed by activity workers. They:
//! - Run outside the orchestration, at least once
//! - Report failure as a value recorded in history
//! - Observe worker shutdown via a cancellation token

mod context;
mod definition;
mod registry;

pub use context::ActivityContext;
pub use definition::{Activity, ActivityError, ACTIVITY_FAILED};
pub use registry::{ActivityFuture, ActivityRegistry, AnyActivity};
