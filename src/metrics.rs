use crate::models::Platform;
use tracing::trace;

// Counters are emitted as trace events under `relay.metrics`; they are not
// fed to the Prometheus recorder, so `/metrics` does not include them.

pub fn inc_requests(route: &'static str) {
    trace!(target = "relay.metrics", route = route, "requests_total_inc");
}

pub fn item_outcome(platform: Platform, operation: &'static str, outcome: &'static str) {
    trace!(
        target = "relay.metrics",
        platform = platform.as_str(),
        operation = operation,
        outcome = outcome,
        "items_total_inc"
    );
}

pub fn dispatch_dropped(platform: Platform, queue: &'static str) {
    trace!(
        target = "relay.metrics",
        platform = platform.as_str(),
        queue = queue,
        "dispatch_dropped_inc"
    );
}

pub fn item_elapsed(platform: Platform, operation: &'static str, elapsed_ms: u128) {
    trace!(
        target = "relay.metrics",
        platform = platform.as_str(),
        operation = operation,
        elapsed_ms = elapsed_ms as u64,
        "item_elapsed"
    );
}
