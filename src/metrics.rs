use tracing::trace;

// Trace-level counters; the Prometheus endpoint only renders the recorder.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "argus.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn attempt_elapsed(state: &'static str, attempt: u32, elapsed_ms: u128) {
    trace!(
        target = "argus.metrics",
        state = state,
        attempt = attempt,
        elapsed_ms = elapsed_ms as u64,
        "attempt_elapsed"
    );
}

pub fn cache_lookup(hit: bool) {
    trace!(
        target = "argus.metrics",
        hit = hit,
        "validation_cache_lookup"
    );
}
