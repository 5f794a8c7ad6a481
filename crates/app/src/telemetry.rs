//! Tracing and metrics bootstrap for the watcher binary.

use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{EnvFilter, fmt};

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the fmt subscriber honoring `RUST_LOG`, defaulting to `info`
/// (`debug` with `--verbose`).
pub fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_timer(fmt::time::uptime())
        .init();
}

/// Ensure the global metrics recorder is installed and return its handle.
/// The rendered text is dumped on shutdown; an exporter endpoint is left to
/// deployment tooling.
pub fn init_metrics_recorder() -> &'static PrometheusHandle {
    PROM_HANDLE.get_or_init(|| {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).expect("metrics recorder already installed");

        let upkeep_handle = handle.clone();
        thread::Builder::new()
            .name("prometheus-upkeep".into())
            .spawn(move || {
                loop {
                    thread::sleep(Duration::from_secs(5));
                    upkeep_handle.run_upkeep();
                }
            })
            .expect("failed to spawn prometheus upkeep thread");

        handle
    })
}
