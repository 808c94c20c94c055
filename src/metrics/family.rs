use std::collections::HashMap;
use std::fmt::Write;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, info};

use super::{Instrument, InstrumentKind, LabelSet};

/// How long an idle child stays visible and how long it stays in memory.
///
/// The two horizons are distinct so a briefly-seen high-cardinality label
/// set disappears from the scrape response quickly (first phase) while a
/// metric that merely went quiet can resurrect in place, without a value
/// discontinuity, until the second phase removes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resilience {
    /// Exposed while age <= TTL, retained while age <= (background + 1) x TTL.
    Weak,
    /// Exposed and retained while age <= (long_term + 1) x TTL.
    LongTerm,
    /// Never evicted; removed only by an explicit drop.
    Zombie,
}

/// A named, typed container of instruments sharing one schema.
///
/// Families are created at configuration load (or statically, for the
/// reserved ones) and never destroyed; their children come and go under the
/// eviction policy. Lookup and insert serialise on the family lock; the
/// exposition pass snapshots the child handles under the read lock and then
/// iterates without holding it.
#[derive(Debug)]
pub struct MetricFamily {
    name: String,
    help: String,
    kind: InstrumentKind,
    resilience: Resilience,
    /// Ascending upper bounds ending in `+Inf`; empty unless `kind` is
    /// `Histogram`.
    buckets: Arc<[f64]>,
    /// Age above which a child is hidden from exposition; `None` = always
    /// exposed.
    expose_horizon: Option<Duration>,
    /// Age above which a child is removed from memory; `None` = kept until
    /// dropped.
    retain_horizon: Option<Duration>,
    children: RwLock<HashMap<LabelSet, Arc<Instrument>>>,
}

impl MetricFamily {
    /// `name` must already be the exposed name (prefix and `_total`
    /// normalisation applied by the registry).
    pub(super) fn new(
        name: String,
        help: String,
        kind: InstrumentKind,
        resilience: Resilience,
        buckets: Arc<[f64]>,
        ttl: Duration,
        background_resilience: u32,
        long_term_resilience: u32,
    ) -> Self {
        let (expose_horizon, retain_horizon) = match resilience {
            Resilience::Weak => (
                Some(ttl),
                Some(ttl * (background_resilience + 1)),
            ),
            Resilience::LongTerm => {
                let horizon = ttl * (long_term_resilience + 1);
                (Some(horizon), Some(horizon))
            }
            Resilience::Zombie => (None, None),
        };

        Self {
            name,
            help,
            kind,
            resilience,
            buckets,
            expose_horizon,
            retain_horizon,
            children: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> InstrumentKind {
        self.kind
    }

    pub fn resilience(&self) -> Resilience {
        self.resilience
    }

    pub fn buckets(&self) -> &[f64] {
        &self.buckets
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<LabelSet, Arc<Instrument>>> {
        self.children
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<LabelSet, Arc<Instrument>>> {
        self.children
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up the child for `labels`, creating it on first use. Either way
    /// the child's `last_updated` is refreshed.
    pub fn with_labels(&self, labels: &LabelSet) -> Arc<Instrument> {
        if let Some(child) = self.read().get(labels) {
            child.touch();
            return Arc::clone(child);
        }

        let mut children = self.write();
        let child = children
            .entry(labels.clone())
            .or_insert_with(|| {
                Arc::new(Instrument::new(
                    self.kind,
                    labels.clone(),
                    Arc::clone(&self.buckets),
                ))
            });
        child.touch();
        Arc::clone(child)
    }

    /// Remove the child for `labels`, if any. Used when a scraper
    /// terminates and its `connected` gauge must disappear.
    pub fn drop_labels(&self, labels: &LabelSet) {
        if self.write().remove(labels).is_some() {
            debug!(family = %self.name, labels = %labels.render(None), "dropped instrument");
        }
    }

    pub fn child_count(&self) -> usize {
        self.read().len()
    }

    /// Remove children older than the retention horizon. Runs on the
    /// family's eviction timer, once per TTL.
    pub fn evict(&self) -> usize {
        let Some(horizon) = self.retain_horizon else {
            return 0;
        };

        let mut children = self.write();
        let before = children.len();
        children.retain(|_, child| child.age() <= horizon);
        let dropped = before - children.len();
        drop(children);

        if dropped > 0 {
            info!(family = %self.name, dropped, "dropped instrument(s) due to exceeding TTL");
        }
        dropped
    }

    /// Write the `# HELP` / `# TYPE` header and every currently-exposable
    /// child, returning the number of sample lines emitted.
    pub fn expose_to(&self, out: &mut String) -> usize {
        let _ = writeln!(out, "# HELP {} {}", self.name, escape_help(&self.help));
        let _ = writeln!(out, "# TYPE {} {}", self.name, self.kind.type_name());

        let children: Vec<Arc<Instrument>> = self.read().values().cloned().collect();

        let mut lines = 0;
        for child in children {
            if let Some(horizon) = self.expose_horizon {
                if child.age() > horizon {
                    continue;
                }
            }
            lines += child.expose_to(&self.name, out);
        }
        lines
    }
}

/// Help-text escaping per the Prometheus text format.
fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}
