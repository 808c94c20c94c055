//! The scrape configuration: one YAML document naming the global metric
//! settings, the CSV format, the SSH targets and the optional dynamic
//! inventory script.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

use crate::error::ScrapeError;
use crate::metrics::RegistrySettings;

mod format;

pub use format::{build_format, ScrapeFormat, DEFAULT_BUCKETS};

/// Environment variable naming the config file; falls back to
/// `/etc/scrapeconfig.yml`.
pub const CONFIG_PATH_ENV: &str = "SCRAPECONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/scrapeconfig.yml";

/// The path to load: `$SCRAPECONFIG` if set, the default otherwise.
pub fn default_path() -> PathBuf {
    std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScrapeConfig {
    #[serde(default)]
    pub global: GlobalConfig,
    pub ssh: Option<SshConfig>,
    /// Command line producing a dynamic inventory document on stdout; its
    /// structure is the `ssh` subtree.
    pub script: Option<String>,
    /// Seconds between inventory runs; absent = run once at startup.
    pub reload_interval: Option<u64>,
}

impl ScrapeConfig {
    pub fn load(path: &Path) -> Result<Self, ScrapeError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ScrapeError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;

        let config: Self = serde_yaml::from_str(&raw).map_err(|e| {
            ScrapeError::configuration(format!("cannot parse {}: {e}", path.display()))
        })?;

        config.global.validate()?;
        Ok(config)
    }
}

/// One `format` entry: `null` for an ignored column, otherwise a
/// single-key mapping from column name to reader type (the type itself may
/// be null, which also ignores the column).
pub type FormatEntry = Option<HashMap<String, Option<String>>>;

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    #[serde(default = "default_ttl")]
    pub ttl: u64,
    #[serde(default = "default_background_resilience")]
    pub background_resilience: u32,
    #[serde(default = "default_long_term_resilience")]
    pub long_term_resilience: u32,
    #[serde(default)]
    pub prefix: Option<String>,
    /// Histogram spec name -> optional bucket upper bounds; missing or
    /// empty bounds use [`DEFAULT_BUCKETS`].
    #[serde(default)]
    pub histograms: HashMap<String, Option<Vec<f64>>>,
    #[serde(default)]
    pub format: Vec<FormatEntry>,
    #[serde(default = "default_separator")]
    pub separator: char,
    #[serde(default = "default_quote")]
    pub quote: char,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            ttl: default_ttl(),
            background_resilience: default_background_resilience(),
            long_term_resilience: default_long_term_resilience(),
            prefix: None,
            histograms: HashMap::new(),
            format: Vec::new(),
            separator: default_separator(),
            quote: default_quote(),
        }
    }
}

impl GlobalConfig {
    fn validate(&self) -> Result<(), ScrapeError> {
        if self.ttl == 0 {
            return Err(ScrapeError::configuration("global.ttl must be positive"));
        }

        if let Some(prefix) = &self.prefix {
            if !is_valid_prefix(prefix) {
                return Err(ScrapeError::configuration(format!(
                    "invalid metrics prefix {prefix:?}"
                )));
            }
        }

        Ok(())
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            prefix: self.prefix.clone(),
            ttl: Duration::from_secs(self.ttl),
            background_resilience: self.background_resilience,
            long_term_resilience: self.long_term_resilience,
        }
    }
}

fn default_ttl() -> u64 {
    60
}

fn default_background_resilience() -> u32 {
    1
}

fn default_long_term_resilience() -> u32 {
    10
}

fn default_separator() -> char {
    ' '
}

fn default_quote() -> char {
    '"'
}

fn is_valid_prefix(prefix: &str) -> bool {
    let mut chars = prefix.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SshConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

/// Connection parameters; the `ssh.connection` block carries the defaults,
/// each environment may override any subset field by field.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectionConfig {
    pub file: Option<String>,
    pub user: Option<String>,
    pub password: Option<SecretString>,
    pub pkey: Option<PathBuf>,
    pub pkey_passphrase: Option<SecretString>,
    /// Seconds; default 30.
    pub connect_timeout: Option<u64>,
    /// Milliseconds; default 60000.
    pub read_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvironmentConfig {
    pub hosts: Hosts,
    #[serde(default)]
    pub connection: Option<ConnectionConfig>,
}

/// `hosts` accepts a single scalar or a list.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Hosts {
    One(String),
    Many(Vec<String>),
}

impl Hosts {
    pub fn as_slice(&self) -> &[String] {
        match self {
            Self::One(host) => std::slice::from_ref(host),
            Self::Many(hosts) => hosts,
        }
    }
}

/// A fully-resolved scrape target: one (host, file) pair within an
/// environment, with effective credentials and timeouts.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    /// `ssh://<host>/<file>`; the reconciliation key.
    pub id: String,
    pub host: String,
    pub environment: String,
    pub file: String,
    pub user: String,
    pub password: Option<SecretString>,
    pub pkey: Option<PathBuf>,
    pub pkey_passphrase: Option<SecretString>,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl SshConfig {
    /// Expand environments x hosts into concrete targets, applying the
    /// field-by-field connection override.
    pub fn resolve_targets(&self) -> Result<Vec<TargetSpec>, ScrapeError> {
        let mut targets = Vec::new();

        for (env_name, env) in &self.environments {
            let environment = if env_name.is_empty() { "N/A" } else { env_name };
            let conn = merge_connection(&self.connection, env.connection.as_ref());

            let file = conn.file.clone().ok_or_else(|| {
                ScrapeError::configuration(format!("environment {env_name:?} has no file"))
            })?;
            let user = conn.user.clone().ok_or_else(|| {
                ScrapeError::configuration(format!("environment {env_name:?} has no user"))
            })?;

            for host in env.hosts.as_slice() {
                targets.push(TargetSpec {
                    id: format!("ssh://{}/{}", host, file.trim_start_matches('/')),
                    host: host.clone(),
                    environment: environment.to_string(),
                    file: file.clone(),
                    user: user.clone(),
                    password: conn.password.clone(),
                    pkey: conn.pkey.clone(),
                    pkey_passphrase: conn.pkey_passphrase.clone(),
                    connect_timeout: Duration::from_secs(conn.connect_timeout.unwrap_or(30)),
                    read_timeout: Duration::from_millis(conn.read_timeout_ms.unwrap_or(60_000)),
                });
            }
        }

        Ok(targets)
    }
}

fn merge_connection(
    defaults: &ConnectionConfig,
    overrides: Option<&ConnectionConfig>,
) -> ConnectionConfig {
    let Some(over) = overrides else {
        return defaults.clone();
    };

    ConnectionConfig {
        file: over.file.clone().or_else(|| defaults.file.clone()),
        user: over.user.clone().or_else(|| defaults.user.clone()),
        password: over.password.clone().or_else(|| defaults.password.clone()),
        pkey: over.pkey.clone().or_else(|| defaults.pkey.clone()),
        pkey_passphrase: over
            .pkey_passphrase
            .clone()
            .or_else(|| defaults.pkey_passphrase.clone()),
        connect_timeout: over.connect_timeout.or(defaults.connect_timeout),
        read_timeout_ms: over.read_timeout_ms.or(defaults.read_timeout_ms),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
global:
  ttl: 30
  prefix: apache
  histograms:
    size_buckets: [10, 100, 1000]
    default_buckets:
  format:
    - remote_host: label
    -
    - remote_user: label
    -
    - request_header: request_header
    - status: label
    - body_bytes_sent: clf_number+size_buckets
ssh:
  connection:
    file: /var/log/apache2/access.log
    user: scraper
    connect_timeout: 10
  environments:
    production:
      hosts:
        - web-1
        - web-2
    staging:
      hosts: web-3
      connection:
        user: deploy
        file: /var/log/httpd/access.log
script: /usr/local/bin/inventory
reload_interval: 300
"#;

    fn parse(raw: &str) -> ScrapeConfig {
        serde_yaml::from_str(raw).unwrap()
    }

    #[test]
    fn test_sample_roundtrip() {
        let config = parse(SAMPLE);

        assert_eq!(config.global.ttl, 30);
        assert_eq!(config.global.prefix.as_deref(), Some("apache"));
        assert_eq!(config.global.format.len(), 7);
        assert_eq!(config.script.as_deref(), Some("/usr/local/bin/inventory"));
        assert_eq!(config.reload_interval, Some(300));
        // An entry with a null value is an ignored column.
        assert!(config.global.format[1].is_none());
    }

    #[test]
    fn test_global_defaults() {
        let config = parse("{}");

        assert_eq!(config.global.ttl, 60);
        assert_eq!(config.global.background_resilience, 1);
        assert_eq!(config.global.long_term_resilience, 10);
        assert_eq!(config.global.separator, ' ');
        assert_eq!(config.global.quote, '"');
        assert!(config.global.prefix.is_none());
        assert!(config.ssh.is_none());
    }

    #[test]
    fn test_resolve_targets_expands_hosts_and_merges_connections() {
        let config = parse(SAMPLE);
        let targets = config.ssh.unwrap().resolve_targets().unwrap();

        assert_eq!(targets.len(), 3);

        // BTreeMap keeps environments in name order: production first.
        let prod: Vec<_> = targets
            .iter()
            .filter(|t| t.environment == "production")
            .collect();
        assert_eq!(prod.len(), 2);
        assert_eq!(prod[0].user, "scraper");
        assert_eq!(prod[0].file, "/var/log/apache2/access.log");
        assert_eq!(prod[0].id, "ssh://web-1/var/log/apache2/access.log");
        assert_eq!(prod[0].connect_timeout, Duration::from_secs(10));
        assert_eq!(prod[0].read_timeout, Duration::from_millis(60_000));

        let staging = targets.iter().find(|t| t.environment == "staging").unwrap();
        assert_eq!(staging.host, "web-3");
        assert_eq!(staging.user, "deploy");
        assert_eq!(staging.file, "/var/log/httpd/access.log");
        // Non-overridden fields fall back to the defaults.
        assert_eq!(staging.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_missing_file_is_a_configuration_error() {
        let config = parse(
            r#"
ssh:
  connection:
    user: scraper
  environments:
    production:
      hosts: [web-1]
"#,
        );

        let err = config.ssh.unwrap().resolve_targets().unwrap_err();
        assert!(err.to_string().contains("no file"));
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let config = parse("global:\n  prefix: 9bad\n");
        assert!(config.global.validate().is_err());

        let config = parse("global:\n  prefix: good_prefix\n");
        assert!(config.global.validate().is_ok());
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let config = parse("global:\n  ttl: 0\n");
        assert!(config.global.validate().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scrapeconfig.yml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = ScrapeConfig::load(&path).unwrap();
        assert_eq!(config.global.ttl, 30);

        let err = ScrapeConfig::load(&dir.path().join("missing.yml")).unwrap_err();
        assert!(matches!(err, ScrapeError::Configuration(_)));
    }
}
