//! Metric names shared by all crates.
//!
//! Crates record through the `metrics` facade macros using these constants.
//! Nothing is exported unless the embedding binary installs a recorder.
//!
//! Naming: `slimprobe_<area>_<what>`, `_total` suffix for counters,
//! `_seconds` for histograms.
//!
//! ```ignore
//! metrics::counter!(slimprobe_core::metrics::PROBE_CALLS_TOTAL).increment(1);
//! ```

/// Label key for the probe protocol (http, https, ws, ...)
pub const LABEL_PROTOCOL: &str = "protocol";

/// Label key for the IPC command name
pub const LABEL_COMMAND: &str = "command";

/// Label key for an outcome (ok, error)
pub const LABEL_RESULT: &str = "result";

// ─── Inspector ──────────────────────────────────────────────────────

/// Instrumented containers started (counter)
pub const INSPECTOR_CONTAINERS_STARTED_TOTAL: &str = "slimprobe_inspector_containers_started_total";

/// Instrumented containers that crashed while monitored (counter)
pub const INSPECTOR_CONTAINER_CRASHES_TOTAL: &str = "slimprobe_inspector_container_crashes_total";

/// Sensor commands sent, labelled by command and result (counter)
pub const IPC_COMMANDS_TOTAL: &str = "slimprobe_ipc_commands_total";

// ─── HTTP probe ─────────────────────────────────────────────────────

/// Probe calls attempted (counter, label: protocol)
pub const PROBE_CALLS_TOTAL: &str = "slimprobe_probe_calls_total";

/// Probe calls that got a response (counter, label: protocol)
pub const PROBE_OK_TOTAL: &str = "slimprobe_probe_ok_total";

/// Probe calls that failed (counter, label: protocol)
pub const PROBE_ERRORS_TOTAL: &str = "slimprobe_probe_errors_total";

/// Probe request latency (histogram, seconds)
pub const PROBE_REQUEST_DURATION_SECONDS: &str = "slimprobe_probe_request_duration_seconds";

/// Pages fetched by crawlers (counter)
pub const CRAWLER_PAGES_TOTAL: &str = "slimprobe_crawler_pages_total";

/// Crawl workers currently running (gauge)
pub const CRAWLER_ACTIVE_WORKERS: &str = "slimprobe_crawler_active_workers";

/// Registers descriptions for every metric.
///
/// Call once after installing a recorder.
pub fn describe_all() {
    use metrics::{describe_counter, describe_gauge, describe_histogram};

    describe_counter!(
        INSPECTOR_CONTAINERS_STARTED_TOTAL,
        "Total number of instrumented containers started"
    );
    describe_counter!(
        INSPECTOR_CONTAINER_CRASHES_TOTAL,
        "Total number of instrumented containers that exited while monitored"
    );
    describe_counter!(IPC_COMMANDS_TOTAL, "Sensor commands sent by name and result");
    describe_counter!(PROBE_CALLS_TOTAL, "Total number of probe calls attempted");
    describe_counter!(PROBE_OK_TOTAL, "Total number of probe calls with a response");
    describe_counter!(PROBE_ERRORS_TOTAL, "Total number of failed probe calls");
    describe_histogram!(
        PROBE_REQUEST_DURATION_SECONDS,
        "Probe request latency in seconds"
    );
    describe_counter!(CRAWLER_PAGES_TOTAL, "Total number of pages fetched by crawlers");
    describe_gauge!(CRAWLER_ACTIVE_WORKERS, "Number of crawl workers currently running");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_names_are_prefixed() {
        let names = [
            INSPECTOR_CONTAINERS_STARTED_TOTAL,
            INSPECTOR_CONTAINER_CRASHES_TOTAL,
            IPC_COMMANDS_TOTAL,
            PROBE_CALLS_TOTAL,
            PROBE_OK_TOTAL,
            PROBE_ERRORS_TOTAL,
            PROBE_REQUEST_DURATION_SECONDS,
            CRAWLER_PAGES_TOTAL,
            CRAWLER_ACTIVE_WORKERS,
        ];
        for name in names {
            assert!(name.starts_with("slimprobe_"), "{name}");
        }
    }

    #[test]
    fn describe_without_recorder_is_noop() {
        describe_all();
    }
}
