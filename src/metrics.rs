use tracing::trace;

// Counters are emitted as trace events; the Prometheus recorder only backs /metrics.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "pixelift.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn webhook_event(event_type: &str, outcome: &'static str) {
    trace!(
        target = "pixelift.metrics",
        event_type = event_type,
        outcome = outcome,
        "webhook_events_total_inc"
    );
}

pub fn checkout_created(kind: &'static str, elapsed_ms: u128) {
    trace!(
        target = "pixelift.metrics",
        kind = kind,
        elapsed_ms = elapsed_ms as u64,
        "checkout_sessions_total_inc"
    );
}

pub fn credits_granted(credits: i64) {
    trace!(
        target = "pixelift.metrics",
        credits = credits,
        "credits_granted_total_add"
    );
}
