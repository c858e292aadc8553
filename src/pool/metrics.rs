#[cfg(feature = "metrics")]
mod collectors {
    use lazy_static::lazy_static;
    use prometheus::{
        register_int_counter_vec, register_int_gauge_vec, IntCounterVec, IntGaugeVec,
    };

    lazy_static! {
        pub static ref PENDING_CONNECTIONS: IntGaugeVec = register_int_gauge_vec!(
            "meshpool_pending_connections",
            "Connections dialled but not yet established, per app",
            &["app"]
        )
        .expect("register meshpool_pending_connections gauge vec");
        pub static ref ACTIVE_CONNECTIONS: IntGaugeVec = register_int_gauge_vec!(
            "meshpool_active_connections",
            "Established connections eligible for selection, per app",
            &["app"]
        )
        .expect("register meshpool_active_connections gauge vec");
        pub static ref RECONNECTS: IntCounterVec = register_int_counter_vec!(
            "meshpool_reconnects_total",
            "Reconnect attempts scheduled after a connection closed, per app",
            &["app"]
        )
        .expect("register meshpool_reconnects_total counter vec");
        pub static ref LOOKUP_FAILURES: IntCounterVec = register_int_counter_vec!(
            "meshpool_lookup_failures_total",
            "Failed lookups by reason",
            &["reason"]
        )
        .expect("register meshpool_lookup_failures_total counter vec");
        pub static ref HEARTBEATS: IntCounterVec = register_int_counter_vec!(
            "meshpool_heartbeats_total",
            "Heartbeat pings by protocol and outcome",
            &["protocol", "outcome"]
        )
        .expect("register meshpool_heartbeats_total counter vec");
    }
}

/// Pool-level prometheus counters. Compiled to no-ops without the `metrics` feature.
#[derive(Debug, Clone, Copy)]
pub struct PoolMetrics;

#[cfg(feature = "metrics")]
impl PoolMetrics {
    #[inline]
    pub fn connection_pending(app: &str) {
        collectors::PENDING_CONNECTIONS.with_label_values(&[app]).inc();
    }

    #[inline]
    pub fn connection_left_pending(app: &str) {
        collectors::PENDING_CONNECTIONS.with_label_values(&[app]).dec();
    }

    #[inline]
    pub fn connection_active(app: &str) {
        collectors::ACTIVE_CONNECTIONS.with_label_values(&[app]).inc();
    }

    #[inline]
    pub fn connection_left_active(app: &str) {
        collectors::ACTIVE_CONNECTIONS.with_label_values(&[app]).dec();
    }

    #[inline]
    pub fn reconnect_scheduled(app: &str) {
        collectors::RECONNECTS.with_label_values(&[app]).inc();
    }

    #[inline]
    pub fn lookup_failed(reason: &str) {
        collectors::LOOKUP_FAILURES.with_label_values(&[reason]).inc();
    }

    #[inline]
    pub fn heartbeat(protocol: &str, ok: bool) {
        let outcome = if ok { "ok" } else { "error" };
        collectors::HEARTBEATS
            .with_label_values(&[protocol, outcome])
            .inc();
    }

    /// Render every registered collector in the prometheus text format.
    pub fn gather() -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(not(feature = "metrics"))]
impl PoolMetrics {
    #[inline]
    pub fn connection_pending(_app: &str) {}

    #[inline]
    pub fn connection_left_pending(_app: &str) {}

    #[inline]
    pub fn connection_active(_app: &str) {}

    #[inline]
    pub fn connection_left_active(_app: &str) {}

    #[inline]
    pub fn reconnect_scheduled(_app: &str) {}

    #[inline]
    pub fn lookup_failed(_reason: &str) {}

    #[inline]
    pub fn heartbeat(_protocol: &str, _ok: bool) {}

    pub fn gather() -> String {
        String::new()
    }
}

/// Force registration so that exported metrics exist before first use.
#[inline]
pub fn init() {
    #[cfg(feature = "metrics")]
    {
        lazy_static::initialize(&collectors::PENDING_CONNECTIONS);
        lazy_static::initialize(&collectors::ACTIVE_CONNECTIONS);
        lazy_static::initialize(&collectors::RECONNECTS);
        lazy_static::initialize(&collectors::LOOKUP_FAILURES);
        lazy_static::initialize(&collectors::HEARTBEATS);
    }
}
