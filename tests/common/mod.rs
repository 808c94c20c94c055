#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]
#![allow(dead_code)]

use std::sync::Arc;

use logtail_exporter::config::{build_format, GlobalConfig};
use logtail_exporter::metrics::MetricRegistry;
use logtail_exporter::parser::ColumnReader;

/// Find an available port for testing (returns port > 1024)
pub fn get_available_port() -> u16 {
    use std::net::TcpListener;

    // Bind to port 0 lets the OS assign an available ephemeral port
    let listener = TcpListener::bind("127.0.0.1:0").expect("Failed to bind to random port");
    let port = listener
        .local_addr()
        .expect("Failed to get local addr")
        .port();

    assert!(port > 1024, "Assigned port {port} should be > 1024");

    port
}

/// Wait for server to be ready on the given port
pub async fn wait_for_server(port: u16, max_attempts: u32) -> bool {
    use tokio::time::{Duration, sleep};

    for attempt in 1..=max_attempts {
        if tokio::net::TcpStream::connect(format!("localhost:{port}"))
            .await
            .is_ok()
        {
            return true;
        }

        if attempt % 10 == 0 {
            eprintln!("Still waiting for server on port {port} (attempt {attempt}/{max_attempts})");
        }

        sleep(Duration::from_millis(100)).await;
    }

    eprintln!("Failed to connect to server on port {port} after {max_attempts} attempts");
    false
}

/// Get base URL for test server
pub fn get_test_url(port: u16) -> String {
    format!("http://localhost:{port}")
}

/// The Apache access-log format used across the end-to-end scenarios.
pub const APACHE_GLOBAL: &str = r#"
histograms:
  size_buckets: [10, 100, 1000]
format:
  - remote_host: label
  -
  - remote_user: label
  -
  - request_header: request_header
  - status: label
  - body_bytes_sent: clf_number
"#;

/// Compile a `global` YAML snippet into readers plus a fresh registry.
pub fn compile(global_yaml: &str) -> (Arc<Vec<ColumnReader>>, Arc<MetricRegistry>) {
    let global: GlobalConfig = serde_yaml::from_str(global_yaml).expect("valid global section");
    let format = build_format(&global).expect("valid format section");
    let registry = Arc::new(
        MetricRegistry::new(global.registry_settings(), &format.families)
            .expect("valid families"),
    );

    (Arc::new(format.readers), registry)
}
