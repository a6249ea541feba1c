//! Request-scoped trace context.

use std::borrow::Cow;
use std::sync::Arc;

use tracing::Span;
use uuid::Uuid;

use super::call_id::{inbound_layer, CallId};
use super::headers;
use crate::broker::Record;
use crate::config::{Environment, TraceSettings};

/// Correlation identifiers carried through every operation of one request.
///
/// Clones share the call-id counter, so sibling calls made from any clone of
/// the same request context observe distinct ids. The trace id never changes
/// once the context exists.
#[derive(Debug, Clone)]
pub struct TraceContext {
    trace_id: String,
    call_id: Arc<CallId>,
    routing_group: String,
    origin: String,
    service: String,
    benchmark: bool,
    environment: Environment,
}

impl TraceContext {
    /// Build the context of an inbound request from its wire headers.
    ///
    /// A missing trace id is replaced by a fresh one, the received call id
    /// gains a `.0` layer, and an empty routing group falls back to the
    /// configured default. Never fails; unknown headers and non-UTF-8 values
    /// are ignored.
    pub fn at_server_entry<'a, I>(pairs: I, settings: &TraceSettings) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [u8])>,
    {
        let mut trace_id = String::new();
        let mut call_id = String::new();
        let mut group = String::new();
        let mut origin = String::new();

        for (key, value) in pairs {
            let Ok(value) = std::str::from_utf8(value) else {
                continue;
            };
            match key {
                headers::TRACE_ID => trace_id = value.to_string(),
                headers::CALL_ID => call_id = value.to_string(),
                headers::GROUP => group = value.to_string(),
                headers::ORIGIN => origin = value.to_string(),
                _ => {}
            }
        }

        Self::assemble(trace_id, &call_id, group, origin, settings)
    }

    /// Build the context of a consumed record from its headers.
    pub fn from_record(record: &Record, settings: &TraceSettings) -> Self {
        Self::at_server_entry(
            record
                .headers
                .iter()
                .map(|h| (h.key.as_str(), h.value.as_ref())),
            settings,
        )
    }

    /// Context for work with no inbound request, such as a scheduled job.
    pub fn detached(settings: &TraceSettings) -> Self {
        Self::assemble(String::new(), "", String::new(), String::new(), settings)
    }

    fn assemble(
        trace_id: String,
        received_call_id: &str,
        group: String,
        origin: String,
        settings: &TraceSettings,
    ) -> Self {
        let trace_id = if trace_id.is_empty() {
            Uuid::new_v4().to_string()
        } else {
            trace_id
        };
        let benchmark =
            !settings.benchmark_prefix.is_empty() && trace_id.starts_with(&settings.benchmark_prefix);
        let routing_group = if group.is_empty() {
            settings.default_group.clone()
        } else {
            group
        };

        Self {
            trace_id,
            call_id: Arc::new(CallId::new(inbound_layer(received_call_id))),
            routing_group,
            origin,
            service: settings.service_name.clone(),
            benchmark,
            environment: settings.environment,
        }
    }

    /// Context for a call this service makes to another service.
    ///
    /// Advances the shared call id to the next sibling and returns a context
    /// holding a snapshot of the new value.
    #[must_use]
    pub fn for_outbound_sibling(&self) -> Self {
        let next = self.call_id.advance_sibling();
        Self {
            call_id: Arc::new(CallId::new(next)),
            ..self.clone()
        }
    }

    /// Context for handling a call received with `received_call_id`.
    ///
    /// The trace id, group and origin are kept; the call id becomes a new
    /// layer below the received one.
    #[must_use]
    pub fn for_inbound_layer(&self, received_call_id: &str) -> Self {
        Self {
            call_id: Arc::new(CallId::new(inbound_layer(received_call_id))),
            ..self.clone()
        }
    }

    /// Copy of this context with an explicit benchmark flag.
    #[must_use]
    pub fn with_benchmark(mut self, benchmark: bool) -> Self {
        self.benchmark = benchmark;
        self
    }

    /// Copy of this context running in `environment`.
    #[must_use]
    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Globally unique request id.
    #[must_use]
    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Current call id.
    #[must_use]
    pub fn call_id(&self) -> String {
        self.call_id.get()
    }

    /// Routing group.
    #[must_use]
    pub fn routing_group(&self) -> &str {
        &self.routing_group
    }

    /// Name of the calling service.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Name of this service.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Environment this context runs in.
    #[must_use]
    pub fn environment(&self) -> Environment {
        self.environment
    }

    /// Whether this request is replayed or synthetic benchmark traffic.
    #[must_use]
    pub fn is_benchmark_traffic(&self) -> bool {
        self.benchmark
    }

    /// Whether this request should prefer gray (canary) backends.
    #[must_use]
    pub fn is_gray(&self) -> bool {
        self.environment == Environment::Gray
    }

    /// `name` with a `_shadow` suffix under benchmark traffic.
    #[must_use]
    pub fn shadow_name<'a>(&self, name: &'a str) -> Cow<'a, str> {
        if self.benchmark {
            Cow::Owned(format!("{name}_shadow"))
        } else {
            Cow::Borrowed(name)
        }
    }

    /// Headers stamped on outbound messages.
    ///
    /// The origin header is only added when the service name is known.
    #[must_use]
    pub fn outbound_headers(&self) -> Vec<(&'static str, String)> {
        let mut out = vec![
            (headers::TRACE_ID, self.trace_id.clone()),
            (headers::CALL_ID, self.call_id()),
            (headers::GROUP, self.routing_group.clone()),
        ];
        if !self.service.is_empty() {
            out.push((headers::ORIGIN, self.service.clone()));
        }
        out
    }

    /// Compact `group;callId;traceId` label for log lines.
    #[must_use]
    pub fn trace_label(&self) -> String {
        format!("{};{};{}", self.routing_group, self.call_id(), self.trace_id)
    }

    /// Span carrying the correlation identifiers.
    #[must_use]
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "trace",
            trace_id = %self.trace_id,
            call_id = %self.call_id(),
            group = %self.routing_group,
            origin = %self.origin,
        )
    }
}

/// Payload text for log lines.
///
/// In production, payloads longer than `max_logged_payload_chars`
/// characters are cut and suffixed with `...`.
#[must_use]
pub fn loggable_payload<'a>(payload: &'a [u8], settings: &TraceSettings) -> Cow<'a, str> {
    let text = String::from_utf8_lossy(payload);
    if settings.environment != Environment::Prod {
        return text;
    }

    let max = settings.max_logged_payload_chars;
    match text.char_indices().nth(max) {
        Some((cut, _)) => Cow::Owned(format!("{}...", &text[..cut])),
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> TraceSettings {
        TraceSettings {
            service_name: "orders".to_string(),
            default_group: "blue".to_string(),
            ..TraceSettings::default()
        }
    }

    fn entry(pairs: &[(&str, &str)]) -> TraceContext {
        TraceContext::at_server_entry(
            pairs.iter().map(|(k, v)| (*k, v.as_bytes())),
            &settings(),
        )
    }

    #[test]
    fn test_entry_generates_trace_id() {
        let ctx = entry(&[]);
        assert!(Uuid::parse_str(ctx.trace_id()).is_ok());
        assert_eq!(ctx.call_id(), "0");
        assert_eq!(ctx.routing_group(), "blue");
        assert!(!ctx.is_benchmark_traffic());
    }

    #[test]
    fn test_entry_reads_headers() {
        let ctx = entry(&[
            ("traceId", "abc"),
            ("rpcId", "1.2"),
            ("group", "green"),
            ("from", "billing"),
        ]);
        assert_eq!(ctx.trace_id(), "abc");
        assert_eq!(ctx.call_id(), "1.2.0");
        assert_eq!(ctx.routing_group(), "green");
        assert_eq!(ctx.origin(), "billing");
        assert_eq!(ctx.service(), "orders");
    }

    #[test]
    fn test_benchmark_prefix_detected() {
        let ctx = entry(&[("traceId", "pts_replay-1")]);
        assert!(ctx.is_benchmark_traffic());
        assert_eq!(ctx.shadow_name("orders"), "orders_shadow");

        let ctx = entry(&[("traceId", "real-1")]);
        assert_eq!(ctx.shadow_name("orders"), "orders");
    }

    #[test]
    fn test_non_utf8_header_ignored() {
        let ctx = TraceContext::at_server_entry(
            [("traceId", &[0xff, 0xfe][..]), ("rpcId", b"3".as_slice())],
            &settings(),
        );
        assert!(Uuid::parse_str(ctx.trace_id()).is_ok());
        assert_eq!(ctx.call_id(), "3.0");
    }

    #[test]
    fn test_outbound_sibling_snapshot() {
        let ctx = entry(&[("traceId", "t"), ("rpcId", "1")]);
        let first = ctx.for_outbound_sibling();
        let second = ctx.for_outbound_sibling();

        assert_eq!(first.call_id(), "1.1");
        assert_eq!(second.call_id(), "1.2");
        assert_eq!(ctx.call_id(), "1.2");
        assert_eq!(first.trace_id(), "t");
    }

    #[test]
    fn test_clones_share_counter() {
        let ctx = entry(&[("rpcId", "4")]);
        let clone = ctx.clone();
        assert_eq!(clone.for_outbound_sibling().call_id(), "4.1");
        assert_eq!(ctx.for_outbound_sibling().call_id(), "4.2");
    }

    #[test]
    fn test_inbound_layer_keeps_trace() {
        let ctx = entry(&[("traceId", "t"), ("group", "g")]);
        let layered = ctx.for_inbound_layer("2.5");
        assert_eq!(layered.call_id(), "2.5.0");
        assert_eq!(layered.trace_id(), "t");
        assert_eq!(layered.routing_group(), "g");
        assert_eq!(ctx.for_inbound_layer("").call_id(), "0");
    }

    #[test]
    fn test_outbound_headers() {
        let ctx = entry(&[("traceId", "t"), ("rpcId", "1"), ("group", "g")]);
        let headers = ctx.outbound_headers();
        assert_eq!(
            headers,
            vec![
                ("traceId", "t".to_string()),
                ("rpcId", "1.0".to_string()),
                ("group", "g".to_string()),
                ("from", "orders".to_string()),
            ]
        );
        assert_eq!(ctx.trace_label(), "g;1.0;t");
    }

    #[test]
    fn test_detached_context() {
        let ctx = TraceContext::detached(&settings());
        assert_eq!(ctx.call_id(), "0");
        assert_eq!(ctx.routing_group(), "blue");
        assert!(!ctx.trace_id().is_empty());
    }

    #[test]
    fn test_gray_environment() {
        let ctx = TraceContext::detached(&settings());
        assert!(!ctx.is_gray());
        assert!(ctx.with_environment(Environment::Gray).is_gray());
    }

    #[test]
    fn test_payload_truncated_in_prod_only() {
        let mut settings = settings();
        settings.max_logged_payload_chars = 3;
        assert_eq!(loggable_payload("héllo".as_bytes(), &settings), "héllo");

        settings.environment = Environment::Prod;
        assert_eq!(loggable_payload("héllo".as_bytes(), &settings), "hél...");
        assert_eq!(loggable_payload(b"abc", &settings), "abc");
    }
}
