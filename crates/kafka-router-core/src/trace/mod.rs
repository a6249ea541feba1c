//! Trace propagation.
//!
//! A [`TraceContext`] is built once per inbound request or consumed record
//! and handed by reference to everything that runs on its behalf. Producers
//! stamp its identifiers on outbound messages; consumers rebuild it from
//! message headers.

pub mod call_id;
mod context;

pub use call_id::{inbound_layer, next_sibling, CallId};
pub use context::{loggable_payload, TraceContext};
pub use crate::config::TraceSettings;

/// Wire header names shared by producers and consumers.
pub mod headers {
    /// Globally unique request id.
    pub const TRACE_ID: &str = "traceId";
    /// Hierarchical call id.
    pub const CALL_ID: &str = "rpcId";
    /// Routing group.
    pub const GROUP: &str = "group";
    /// Name of the calling service.
    pub const ORIGIN: &str = "from";
}
