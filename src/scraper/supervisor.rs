use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{SshConfig, TargetSpec};
use crate::error::ScrapeError;

use super::{ScraperContext, SshScraper};

struct ScraperHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the active scraper set, keyed by target id, and reconciles it
/// against inventory snapshots: new targets get a scraper, vanished ones
/// are cancelled and awaited (so their `connected` gauge is gone before the
/// handle is dropped).
pub struct Supervisor {
    ctx: ScraperContext,
    token: CancellationToken,
    active: HashMap<String, ScraperHandle>,
}

impl Supervisor {
    pub fn new(ctx: ScraperContext, token: CancellationToken) -> Self {
        Self {
            ctx,
            token,
            active: HashMap::new(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Drive the supervisor until cancellation: start the static targets,
    /// then keep re-running the inventory script if one is configured.
    /// With no `reload_interval` the script runs once at startup.
    pub async fn run(
        mut self,
        initial: Vec<TargetSpec>,
        script: Option<String>,
        reload_interval: Option<u64>,
    ) {
        self.reconcile(initial).await;

        if let Some(script) = script {
            loop {
                if self.token.is_cancelled() {
                    break;
                }

                match run_inventory(&script).await {
                    Ok(targets) => self.reconcile(targets).await,
                    Err(err) => {
                        error!(%err, "inventory reload failed, keeping current targets");
                    }
                }

                let Some(secs) = reload_interval else { break };
                tokio::select! {
                    () = self.token.cancelled() => break,
                    () = sleep(Duration::from_secs(secs)) => {}
                }
            }
        }

        self.token.cancelled().await;
        self.shutdown().await;
    }

    /// Bring the active set in line with `targets`.
    pub async fn reconcile(&mut self, targets: Vec<TargetSpec>) {
        let desired: HashMap<String, TargetSpec> = targets
            .into_iter()
            .map(|target| (target.id.clone(), target))
            .collect();

        let removed: Vec<String> = self
            .active
            .keys()
            .filter(|id| !desired.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            self.stop(&id).await;
        }

        for (id, target) in desired {
            if !self.active.contains_key(&id) {
                self.start(target);
            }
        }
    }

    fn start(&mut self, target: TargetSpec) {
        info!(target = %target.id, environment = %target.environment, "starting scraper");

        let token = self.token.child_token();
        let scraper = SshScraper::new(target.clone(), &self.ctx, token.clone());
        let task = tokio::spawn(scraper.run());

        self.active.insert(target.id, ScraperHandle { token, task });
    }

    async fn stop(&mut self, id: &str) {
        let Some(handle) = self.active.remove(id) else {
            return;
        };

        info!(target = %id, "stopping scraper");
        handle.token.cancel();
        if let Err(err) = handle.task.await {
            error!(target = %id, %err, "scraper task failed");
        }
    }

    /// Cancel every scraper at once, then wait for all of them.
    pub async fn shutdown(&mut self) {
        for handle in self.active.values() {
            handle.token.cancel();
        }

        let tasks: Vec<_> = self
            .active
            .drain()
            .map(|(id, handle)| async move { (id, handle.task.await) })
            .collect();
        for (id, result) in futures::future::join_all(tasks).await {
            if let Err(err) = result {
                error!(target = %id, %err, "scraper task failed");
            }
        }
    }
}

/// Run the inventory script and parse its stdout as the `ssh` subtree.
async fn run_inventory(script: &str) -> Result<Vec<TargetSpec>, ScrapeError> {
    let output = tokio::process::Command::new("sh")
        .arg("-c")
        .arg(script)
        .output()
        .await
        .map_err(|err| ScrapeError::Inventory(format!("cannot execute {script:?}: {err}")))?;

    if !output.status.success() {
        return Err(ScrapeError::Inventory(format!(
            "{script:?} exited with {}",
            output.status
        )));
    }

    let ssh: SshConfig = serde_yaml::from_slice(&output.stdout)
        .map_err(|err| ScrapeError::Inventory(format!("unparseable inventory: {err}")))?;

    ssh.resolve_targets()
        .map_err(|err| ScrapeError::Inventory(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricRegistry, RegistrySettings};
    use std::sync::Arc;

    fn context() -> ScraperContext {
        ScraperContext {
            readers: Arc::new(Vec::new()),
            registry: Arc::new(
                MetricRegistry::new(RegistrySettings::default(), &[]).unwrap(),
            ),
            separator: ' ',
            quote: '"',
        }
    }

    fn target(host: &str) -> TargetSpec {
        TargetSpec {
            id: format!("ssh://{host}/var/log/app.log"),
            host: host.to_string(),
            environment: "test".to_string(),
            file: "/var/log/app.log".to_string(),
            user: "scraper".to_string(),
            password: None,
            pkey: None,
            pkey_passphrase: None,
            connect_timeout: Duration::from_millis(100),
            read_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_reconcile_starts_and_stops_scrapers() {
        let ctx = context();
        let token = CancellationToken::new();
        let mut supervisor = Supervisor::new(ctx.clone(), token.clone());

        supervisor
            .reconcile(vec![target("host-a"), target("host-b")])
            .await;
        assert_eq!(supervisor.active_count(), 2);

        // host-b disappears from the inventory, host-c appears.
        supervisor
            .reconcile(vec![target("host-a"), target("host-c")])
            .await;
        assert_eq!(supervisor.active_count(), 2);
        assert!(supervisor.active.contains_key("ssh://host-c/var/log/app.log"));
        assert!(!supervisor.active.contains_key("ssh://host-b/var/log/app.log"));

        supervisor.shutdown().await;
        assert_eq!(supervisor.active_count(), 0);
        assert_eq!(ctx.registry.connected().child_count(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_terminates_all_scrapers() {
        let ctx = context();
        let token = CancellationToken::new();
        let mut supervisor = Supervisor::new(ctx, token.clone());

        supervisor.reconcile(vec![target("host-a")]).await;

        token.cancel();
        supervisor.shutdown().await;
        assert_eq!(supervisor.active_count(), 0);
    }

    #[tokio::test]
    async fn test_inventory_script_output_is_parsed() {
        let script = r#"cat <<'EOF'
connection:
  file: /var/log/nginx/access.log
  user: deploy
environments:
  edge:
    hosts: [edge-1, edge-2]
EOF"#;

        let targets = run_inventory(script).await.unwrap();

        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].environment, "edge");
        assert_eq!(targets[0].id, "ssh://edge-1/var/log/nginx/access.log");
        assert_eq!(targets[1].host, "edge-2");
    }

    #[tokio::test]
    async fn test_failing_inventory_script_is_an_error() {
        let err = run_inventory("exit 3").await.unwrap_err();
        assert!(matches!(err, ScrapeError::Inventory(_)));

        let err = run_inventory("echo '{not yaml: ['").await.unwrap_err();
        assert!(matches!(err, ScrapeError::Inventory(_)));
    }
}
