//! Metrics server configuration tests.
//!
//! Only failure paths are exercised: a successful install claims the
//! process-global recorder.

use ipvs_core::config::MetricsConfig;
use ipvs_daemon::metrics_server;
use serial_test::serial;

fn config(listen_addr: &str, port: u16, endpoint: &str) -> MetricsConfig {
    MetricsConfig {
        enabled: true,
        listen_addr: listen_addr.to_string(),
        port,
        endpoint: endpoint.to_string(),
    }
}

#[test]
fn test_listen_addr_resolves_valid_config() {
    let addr = metrics_server::listen_addr(&config("127.0.0.1", 19100, "/metrics"))
        .expect("valid config should resolve");
    assert_eq!(addr.to_string(), "127.0.0.1:19100");
}

#[test]
#[serial]
fn test_install_metrics_recorder_fails_with_invalid_address() {
    let result = metrics_server::install_metrics_recorder(&config("999.999.999.999", 9100, "/metrics"));
    let err = result.unwrap_err().to_string();
    assert!(err.contains("invalid metrics listen address"), "got: {err}");
}

#[test]
#[serial]
fn test_install_metrics_recorder_rejects_unsupported_endpoint() {
    let result = metrics_server::install_metrics_recorder(&config("127.0.0.1", 19101, "/custom"));
    let err = result.unwrap_err().to_string();
    assert!(err.contains("unsupported metrics endpoint"), "got: {err}");
}
