use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::cli::actions::Action;
use crate::config::{build_format, ScrapeConfig};
use crate::exporter;
use crate::metrics::MetricRegistry;
use crate::scraper::{ScraperContext, Supervisor};

/// Handle the run action: load and validate the configuration, build the
/// registry and the scraper fleet, then serve scrapes until a shutdown
/// signal arrives.
///
/// # Errors
///
/// Returns an error on a malformed configuration or when the listener
/// cannot bind; both are fatal at startup.
pub async fn handle(action: Action) -> Result<()> {
    let Action::Run { port, config } = action;

    let config = ScrapeConfig::load(&config)?;
    let format = build_format(&config.global)?;

    let registry = Arc::new(MetricRegistry::new(
        config.global.registry_settings(),
        &format.families,
    )?);

    // Static targets are resolved up front so a broken ssh section fails
    // startup instead of surfacing later inside the supervisor.
    let initial = match &config.ssh {
        Some(ssh) => ssh.resolve_targets()?,
        None => Vec::new(),
    };

    info!(
        targets = initial.len(),
        families = registry.families().len(),
        "configuration loaded"
    );

    let root = CancellationToken::new();
    registry.spawn_eviction(root.child_token());

    let ctx = ScraperContext {
        readers: Arc::new(format.readers),
        registry: Arc::clone(&registry),
        separator: config.global.separator,
        quote: config.global.quote,
    };

    let supervisor = Supervisor::new(ctx, root.child_token());
    let supervisor_task = tokio::spawn(supervisor.run(
        initial,
        config.script.clone(),
        config.reload_interval,
    ));

    let signal_token = root.clone();
    tokio::spawn(async move {
        if let Err(err) = exporter::shutdown_signal().await {
            error!(%err, "error setting up shutdown handler");
        }
        signal_token.cancel();
    });

    let served = exporter::serve(port, registry, root.clone())
        .await
        .context("exporter failed");

    // Bring the scrapers down before reporting the server's fate.
    root.cancel();
    if let Err(err) = supervisor_task.await {
        error!(%err, "supervisor task failed");
    }

    served
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_handle_fails_on_missing_config() {
        let action = Action::Run {
            port: 0,
            config: PathBuf::from("/nonexistent/scrapeconfig.yml"),
        };

        let result = handle(action).await;

        assert!(result.is_err(), "should fail with unreadable config");
    }

    #[test]
    fn test_action_creation() {
        let action = Action::Run {
            port: 5000,
            config: PathBuf::from("/etc/scrapeconfig.yml"),
        };

        let Action::Run { port, config } = action;
        assert_eq!(port, 5000);
        assert_eq!(config, PathBuf::from("/etc/scrapeconfig.yml"));
    }
}
