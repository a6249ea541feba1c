//! Consumer group engine and supervisor.
//!
//! - [`ConsumerGroup`]: workers consuming partition claims with one callback
//! - [`MessageHandler`]: the callback contract
//! - [`RetryPolicy`] / [`ErrorPolicy`]: what happens when the callback panics or fails
//! - [`ConsumerGroups`]: start and stop several engines together

mod group;
mod handler;
mod panic_trace;
pub mod policy;
mod supervisor;
mod worker;

pub use group::ConsumerGroup;
pub use handler::{handler_fn, HandlerFn, MessageHandler};
pub use policy::{ErrorPolicy, RetryPolicy};
pub use supervisor::{Consumer, ConsumerGroups};
pub use worker::WorkerState;
