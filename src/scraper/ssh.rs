use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use secrecy::ExposeSecret;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::TargetSpec;
use crate::error::ScrapeError;
use crate::metrics::{Instrument, LabelSet};
use crate::parser::{LogParser, ParseOutcome};

use super::ScraperContext;

/// Wait between sessions before reconnecting.
const COOLDOWN: Duration = Duration::from_secs(30);

/// How long to wait for the remote exit status after end-of-stream.
const EXIT_STATUS_GRACE: Duration = Duration::from_secs(2);

/// How one tailing session ended without an error.
enum SessionEnd {
    Cancelled,
    Eof { exit_status: Option<u32> },
}

struct ClientHandler;

#[async_trait::async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    // Targets come and go through the inventory; host keys are not pinned.
    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// The per-target lifecycle: connect, tail, feed the parser, reconnect
/// after a cooldown, until cancelled.
///
/// Every failure below the scraper is non-fatal: it is logged by kind and
/// answered with a reconnect. The `connected` gauge for
/// `{environment, host}` is 1 exactly while the remote tail is streaming
/// and the child is dropped from its family when the scraper terminates.
pub struct SshScraper {
    target: TargetSpec,
    ctx: ScraperContext,
    token: CancellationToken,
}

impl SshScraper {
    pub fn new(target: TargetSpec, ctx: &ScraperContext, token: CancellationToken) -> Self {
        Self {
            target,
            ctx: ctx.clone(),
            token,
        }
    }

    pub async fn run(self) {
        let labels = LabelSet::new(&self.target.environment).with("host", &self.target.host);
        let connected = self.ctx.registry.connected().with_labels(&labels);
        connected.set(0.0);

        while !self.token.is_cancelled() {
            match self.session(&connected).await {
                Ok(SessionEnd::Cancelled) => break,
                Ok(SessionEnd::Eof { exit_status }) => match exit_status {
                    Some(0) | None => {
                        info!(target = %self.target.id, "stream ended, reconnecting")
                    }
                    Some(code) => {
                        warn!(target = %self.target.id, code, "remote tail exited, reconnecting")
                    }
                },
                Err(err @ ScrapeError::Starvation { .. }) => {
                    warn!(target = %self.target.id, %err, "stream starved, reconnecting");
                }
                Err(err @ (ScrapeError::ConnectTimeout { .. }
                | ScrapeError::Auth { .. }
                | ScrapeError::Ssh { .. }
                | ScrapeError::Io { .. })) => {
                    error!(target = %self.target.id, %err, "session failed, reconnecting");
                }
                Err(err) => {
                    // Not expected below a scraper; retry anyway.
                    error!(target = %self.target.id, %err, "unexpected scraper error");
                }
            }
            connected.set(0.0);

            tokio::select! {
                () = self.token.cancelled() => break,
                () = sleep(COOLDOWN) => {}
            }
        }

        connected.set(0.0);
        self.ctx.registry.connected().drop_labels(&labels);
        debug!(target = %self.target.id, "scraper terminated");
    }

    /// One connect-tail-parse cycle.
    async fn session(&self, connected: &Arc<Instrument>) -> Result<SessionEnd, ScrapeError> {
        let host = &self.target.host;
        let ssh_err = |source| ScrapeError::Ssh {
            host: host.clone(),
            source,
        };

        let config = Arc::new(client::Config::default());
        let mut handle = match timeout(
            self.target.connect_timeout,
            client::connect(config, (host.as_str(), 22), ClientHandler),
        )
        .await
        {
            Err(_elapsed) => {
                return Err(ScrapeError::ConnectTimeout {
                    host: host.clone(),
                    timeout: self.target.connect_timeout,
                });
            }
            Ok(Err(source)) => return Err(ssh_err(source)),
            Ok(Ok(handle)) => handle,
        };

        self.authenticate(&mut handle).await?;

        let mut channel = handle.channel_open_session().await.map_err(ssh_err)?;
        channel
            .exec(true, tail_command(&self.target.file))
            .await
            .map_err(ssh_err)?;

        info!(target = %self.target.id, environment = %self.target.environment, "tailing");
        connected.set(1.0);

        let parser = LogParser::new(
            &self.target.environment,
            &self.target.id,
            Arc::clone(&self.ctx.readers),
            Arc::clone(&self.ctx.registry),
            self.ctx.separator,
            self.ctx.quote,
            self.target.read_timeout,
            self.token.clone(),
        );
        let result = parser.run(channel.make_reader()).await;
        connected.set(0.0);

        match result {
            Ok(ParseOutcome::Cancelled) => {
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "", "en")
                    .await;
                Ok(SessionEnd::Cancelled)
            }
            Ok(ParseOutcome::Eof) => {
                let mut exit_status = None;
                while let Ok(Some(msg)) = timeout(EXIT_STATUS_GRACE, channel.wait()).await {
                    if let ChannelMsg::ExitStatus { exit_status: code } = msg {
                        exit_status = Some(code);
                        break;
                    }
                }
                Ok(SessionEnd::Eof { exit_status })
            }
            Err(err) => {
                // Cancel the remote command before tearing the session down.
                let _ = channel.close().await;
                let _ = handle
                    .disconnect(Disconnect::ByApplication, "", "en")
                    .await;
                Err(err)
            }
        }
    }

    async fn authenticate(&self, handle: &mut Handle<ClientHandler>) -> Result<(), ScrapeError> {
        let host = &self.target.host;
        let user = &self.target.user;
        let auth_err = || ScrapeError::Auth {
            host: host.clone(),
            user: user.clone(),
        };
        let ssh_err = |source| ScrapeError::Ssh {
            host: host.clone(),
            source,
        };

        let authenticated = if let Some(path) = &self.target.pkey {
            let passphrase = self
                .target
                .pkey_passphrase
                .as_ref()
                .map(|p| p.expose_secret().to_string());
            let pair = russh_keys::load_secret_key(path, passphrase.as_deref()).map_err(|err| {
                error!(key = %path.display(), %err, "cannot load private key");
                auth_err()
            })?;
            handle
                .authenticate_publickey(user, Arc::new(pair))
                .await
                .map_err(ssh_err)?
        } else if let Some(password) = &self.target.password {
            handle
                .authenticate_password(user, password.expose_secret())
                .await
                .map_err(ssh_err)?
        } else {
            false
        };

        if authenticated {
            Ok(())
        } else {
            Err(auth_err())
        }
    }
}

/// Follow-the-name tail: start at end-of-file, survive rotation, keep
/// stderr out of the stream.
fn tail_command(file: &str) -> String {
    format!(r#"tail -n0 --follow=name "{file}" 2>/dev/null"#)
}
