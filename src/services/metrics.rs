use lazy_static::lazy_static;
use prometheus::{register_counter, register_counter_vec, Counter, CounterVec, TextEncoder};

lazy_static! {
    pub static ref LOGINS_COUNTER: CounterVec = register_counter_vec!(
        "auth_logins_total",
        "Login attempts by tenant and status",
        &["tenant", "status"]
    )
    .unwrap();

    pub static ref MFA_FAILURES: Counter = register_counter!(
        "auth_mfa_failures_total",
        "Second-factor codes that did not verify"
    )
    .unwrap();

    pub static ref REFRESH_COUNTER: CounterVec = register_counter_vec!(
        "auth_refresh_total",
        "Refresh rotations by outcome",
        &["outcome"]
    )
    .unwrap();

    pub static ref REUSE_DETECTED: Counter = register_counter!(
        "auth_refresh_reuse_detected_total",
        "Refresh families revoked after token reuse"
    )
    .unwrap();

    pub static ref OUTBOX_COUNTER: CounterVec = register_counter_vec!(
        "email_outbox_total",
        "Outbox deliveries by outcome",
        &["outcome"]
    )
    .unwrap();

    pub static ref AUDIT_WRITE_FAILURES: Counter = register_counter!(
        "audit_write_failures_total",
        "Audit rows that could not be persisted (swallowed)"
    )
    .unwrap();

    pub static ref TELEMETRY_FORWARDS: CounterVec = register_counter_vec!(
        "device_telemetry_forwards_total",
        "Telemetry forwards by outcome",
        &["outcome"]
    )
    .unwrap();
}

/// Render the default registry in the Prometheus text format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    encoder
        .encode_to_string(&prometheus::gather())
        .unwrap_or_default()
}
