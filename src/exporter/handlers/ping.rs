use tracing::instrument;

/// Liveness probe.
#[instrument(fields(http.route = "/ping"))]
pub async fn ping() -> &'static str {
    "pong"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ping_body_is_pong() {
        assert_eq!(ping().await, "pong");
    }
}
