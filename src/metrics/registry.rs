use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::ScrapeError;

use super::{InstrumentKind, MetricFamily, Resilience};

/// Metric names the configuration may not claim.
pub const RESERVED_NAMES: [&str; 6] = [
    "parser_errors",
    "lines_parsed",
    "parser_errors_per_target",
    "lines_parsed_per_target",
    "connected",
    "ssh_bytes_in",
];

/// Global settings the registry is initialised with; read-only afterwards.
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub prefix: Option<String>,
    pub ttl: Duration,
    pub background_resilience: u32,
    pub long_term_resilience: u32,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            prefix: None,
            ttl: Duration::from_secs(60),
            background_resilience: 1,
            long_term_resilience: 10,
        }
    }
}

/// A family to create from the configured format section.
#[derive(Debug, Clone)]
pub struct FamilyDef {
    pub base_name: String,
    pub help: String,
    pub kind: InstrumentKind,
    /// Bucket upper bounds for histograms; `None` for counters.
    pub buckets: Option<Vec<f64>>,
}

/// Process-wide registry of metric families, keyed by their configured base
/// name. Families are created once here and never destroyed.
#[derive(Debug)]
pub struct MetricRegistry {
    settings: RegistrySettings,
    /// Exposition order: reserved families first, then the format section's
    /// families in configuration order.
    families: Vec<Arc<MetricFamily>>,
    by_base_name: HashMap<String, Arc<MetricFamily>>,
    parser_errors: Arc<MetricFamily>,
    lines_parsed: Arc<MetricFamily>,
    parser_errors_per_target: Arc<MetricFamily>,
    lines_parsed_per_target: Arc<MetricFamily>,
    connected: Arc<MetricFamily>,
    ssh_bytes_in: Arc<MetricFamily>,
}

impl MetricRegistry {
    pub fn new(settings: RegistrySettings, defs: &[FamilyDef]) -> Result<Self, ScrapeError> {
        let mut builder = Builder {
            settings: &settings,
            families: Vec::with_capacity(RESERVED_NAMES.len() + defs.len()),
            by_base_name: HashMap::new(),
        };

        let parser_errors = builder.reserved(
            "parser_errors",
            "Number of lines which could not be parsed",
            InstrumentKind::Counter,
            Resilience::LongTerm,
        );
        let lines_parsed = builder.reserved(
            "lines_parsed",
            "Number of successfully parsed lines",
            InstrumentKind::Counter,
            Resilience::LongTerm,
        );
        let parser_errors_per_target = builder.reserved(
            "parser_errors_per_target",
            "Number of lines which could not be parsed, per target",
            InstrumentKind::Counter,
            Resilience::LongTerm,
        );
        let lines_parsed_per_target = builder.reserved(
            "lines_parsed_per_target",
            "Number of successfully parsed lines, per target",
            InstrumentKind::Counter,
            Resilience::LongTerm,
        );
        let connected = builder.reserved(
            "connected",
            "Whether the target is currently being tailed (1) or not (0)",
            InstrumentKind::Gauge,
            Resilience::Zombie,
        );
        let ssh_bytes_in = builder.reserved(
            "ssh_bytes_in",
            "Amount of bytes read from remote",
            InstrumentKind::Counter,
            Resilience::LongTerm,
        );

        for def in defs {
            builder.add(def)?;
        }
        let Builder {
            families,
            by_base_name,
            settings: _,
        } = builder;

        Ok(Self {
            settings,
            families,
            by_base_name,
            parser_errors,
            lines_parsed,
            parser_errors_per_target,
            lines_parsed_per_target,
            connected,
            ssh_bytes_in,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.settings.ttl
    }

    pub fn prefix(&self) -> Option<&str> {
        self.settings.prefix.as_deref()
    }

    /// All families in exposition order.
    pub fn families(&self) -> &[Arc<MetricFamily>] {
        &self.families
    }

    /// Look up a family by its configured base name (pre-prefix,
    /// pre-`_total`).
    pub fn family(&self, base_name: &str) -> Option<&Arc<MetricFamily>> {
        self.by_base_name.get(base_name)
    }

    pub fn parser_errors(&self) -> &Arc<MetricFamily> {
        &self.parser_errors
    }

    pub fn lines_parsed(&self) -> &Arc<MetricFamily> {
        &self.lines_parsed
    }

    pub fn parser_errors_per_target(&self) -> &Arc<MetricFamily> {
        &self.parser_errors_per_target
    }

    pub fn lines_parsed_per_target(&self) -> &Arc<MetricFamily> {
        &self.lines_parsed_per_target
    }

    pub fn connected(&self) -> &Arc<MetricFamily> {
        &self.connected
    }

    pub fn ssh_bytes_in(&self) -> &Arc<MetricFamily> {
        &self.ssh_bytes_in
    }

    /// Spawn one eviction timer per family, each sweeping once per TTL
    /// until `token` is cancelled. The sweeps are small and independent, so
    /// they run directly on the shared runtime.
    pub fn spawn_eviction(self: &Arc<Self>, token: CancellationToken) {
        for family in &self.families {
            let family = Arc::clone(family);
            let token = token.clone();
            let ttl = self.settings.ttl;

            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        () = tokio::time::sleep(ttl) => {
                            family.evict();
                        }
                    }
                }
                debug!(family = %family.name(), "eviction timer stopped");
            });
        }
    }
}

struct Builder<'a> {
    settings: &'a RegistrySettings,
    families: Vec<Arc<MetricFamily>>,
    by_base_name: HashMap<String, Arc<MetricFamily>>,
}

impl Builder<'_> {
    fn reserved(
        &mut self,
        base_name: &str,
        help: &str,
        kind: InstrumentKind,
        resilience: Resilience,
    ) -> Arc<MetricFamily> {
        let family = Arc::new(MetricFamily::new(
            self.exposed_name(base_name, kind),
            help.to_string(),
            kind,
            resilience,
            Arc::from(Vec::new()),
            self.settings.ttl,
            self.settings.background_resilience,
            self.settings.long_term_resilience,
        ));

        self.families.push(Arc::clone(&family));
        self.by_base_name
            .insert(base_name.to_string(), Arc::clone(&family));
        family
    }

    /// Families from the format section carry `Weak` resilience: their
    /// label sets come straight from log content and are the cardinality
    /// the two-phase policy exists for.
    fn add(&mut self, def: &FamilyDef) -> Result<(), ScrapeError> {
        if self.by_base_name.contains_key(&def.base_name) {
            return Err(ScrapeError::configuration(format!(
                "duplicate metric name {:?}",
                def.base_name
            )));
        }

        let buckets = match (&def.kind, &def.buckets) {
            (InstrumentKind::Histogram, Some(bounds)) => normalize_buckets(bounds)?,
            (InstrumentKind::Histogram, None) => {
                return Err(ScrapeError::configuration(format!(
                    "histogram {:?} has no bucket bounds",
                    def.base_name
                )));
            }
            _ => Arc::from(Vec::new()),
        };

        let family = Arc::new(MetricFamily::new(
            self.exposed_name(&def.base_name, def.kind),
            def.help.clone(),
            def.kind,
            Resilience::Weak,
            buckets,
            self.settings.ttl,
            self.settings.background_resilience,
            self.settings.long_term_resilience,
        ));

        self.families.push(Arc::clone(&family));
        self.by_base_name.insert(def.base_name.clone(), family);
        Ok(())
    }

    /// Counter names get `_total` appended unless already present; a
    /// configured prefix is prepended as `<prefix>:`.
    fn exposed_name(&self, base_name: &str, kind: InstrumentKind) -> String {
        let mut name = base_name.to_string();
        if kind == InstrumentKind::Counter && !name.ends_with("_total") {
            name.push_str("_total");
        }
        match &self.settings.prefix {
            Some(prefix) => format!("{prefix}:{name}"),
            None => name,
        }
    }
}

/// Sort ascending and guarantee a trailing `+Inf` sentinel; the result must
/// describe at least two buckets.
fn normalize_buckets(bounds: &[f64]) -> Result<Arc<[f64]>, ScrapeError> {
    if bounds.is_empty() {
        return Err(ScrapeError::configuration("empty histogram bucket list"));
    }

    let mut buckets: Vec<f64> = bounds.to_vec();
    buckets.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    buckets.dedup();

    if buckets.iter().any(|b| b.is_nan()) {
        return Err(ScrapeError::configuration("NaN histogram bucket bound"));
    }
    if buckets.last() != Some(&f64::INFINITY) {
        buckets.push(f64::INFINITY);
    }
    if buckets.len() < 2 {
        return Err(ScrapeError::configuration(
            "histogram needs at least one finite bucket bound",
        ));
    }

    Ok(Arc::from(buckets))
}
