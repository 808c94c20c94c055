use std::fmt::Write;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::warn;

use super::{format_value, LabelSet};

/// The four instrument kinds a family can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstrumentKind {
    Counter,
    Gauge,
    Summary,
    Histogram,
}

impl InstrumentKind {
    /// The `# TYPE` keyword for this kind.
    pub fn type_name(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Summary => "summary",
            Self::Histogram => "histogram",
        }
    }
}

/// Kind-specific value state. Histogram bucket counts are per-slot (each
/// observation lands in the lowest bucket whose upper bound covers it);
/// the exposition pass accumulates them into the cumulative form the text
/// format requires.
#[derive(Debug)]
enum ValueState {
    Counter {
        total: f64,
    },
    Gauge {
        value: f64,
    },
    Summary {
        sum: f64,
        count: u64,
    },
    Histogram {
        sum: f64,
        slot_counts: Vec<u64>,
    },
}

#[derive(Debug)]
struct State {
    value: ValueState,
    last_updated: Instant,
}

/// One measurement cell: the child of a family for one distinct label set.
///
/// All mutation and the exposition snapshot go through one short-lived
/// mutex, so concurrent `add` calls never lose updates and a scrape sees a
/// self-consistent value.
#[derive(Debug)]
pub struct Instrument {
    labels: LabelSet,
    /// Bucket upper bounds, ascending, `+Inf` last. Shared with the owning
    /// family; empty for non-histogram kinds.
    buckets: Arc<[f64]>,
    state: Mutex<State>,
}

impl Instrument {
    pub(super) fn new(kind: InstrumentKind, labels: LabelSet, buckets: Arc<[f64]>) -> Self {
        let value = match kind {
            InstrumentKind::Counter => ValueState::Counter { total: 0.0 },
            InstrumentKind::Gauge => ValueState::Gauge { value: 0.0 },
            InstrumentKind::Summary => ValueState::Summary { sum: 0.0, count: 0 },
            InstrumentKind::Histogram => ValueState::Histogram {
                sum: 0.0,
                slot_counts: vec![0; buckets.len()],
            },
        };

        Self {
            labels,
            buckets,
            state: Mutex::new(State {
                value,
                last_updated: Instant::now(),
            }),
        }
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record one observation.
    ///
    /// Counters only move forward; a negative amount is dropped with a
    /// warning. Gauges accept any sign. Summaries update sum and count,
    /// histograms update sum and the matching bucket slot.
    pub fn add(&self, amount: f64) {
        let mut state = self.lock();
        state.last_updated = Instant::now();

        match &mut state.value {
            ValueState::Counter { total } => {
                if amount < 0.0 {
                    warn!(amount, "dropping negative counter increment");
                    return;
                }
                *total += amount;
            }
            ValueState::Gauge { value } => *value += amount,
            ValueState::Summary { sum, count } => {
                *sum += amount;
                *count += 1;
            }
            ValueState::Histogram { sum, slot_counts } => {
                *sum += amount;
                let slot = self
                    .buckets
                    .iter()
                    .position(|bound| amount <= *bound)
                    .unwrap_or(self.buckets.len() - 1);
                slot_counts[slot] += 1;
            }
        }
    }

    /// Overwrite the current value. Only meaningful for gauges.
    pub fn set(&self, value: f64) {
        let mut state = self.lock();
        state.last_updated = Instant::now();

        match &mut state.value {
            ValueState::Gauge { value: current } => *current = value,
            other => {
                debug_assert!(false, "set() on non-gauge instrument");
                warn!(kind = ?other, "ignoring set() on non-gauge instrument");
            }
        }
    }

    /// Refresh `last_updated` without changing the value; called when a
    /// family hands out an existing child.
    pub(super) fn touch(&self) {
        self.lock().last_updated = Instant::now();
    }

    /// Time since the last update or touch.
    pub fn age(&self) -> Duration {
        self.lock().last_updated.elapsed()
    }

    /// Current scalar value; for summaries and histograms this is the sum.
    pub fn value(&self) -> f64 {
        match &self.lock().value {
            ValueState::Counter { total } => *total,
            ValueState::Gauge { value } => *value,
            ValueState::Summary { sum, .. } => *sum,
            ValueState::Histogram { sum, .. } => *sum,
        }
    }

    /// Append this instrument's sample lines to `out`, returning the number
    /// of lines written. Histogram buckets are emitted cumulatively and in
    /// ascending order, the last one as `le="+Inf"`.
    pub fn expose_to(&self, name: &str, out: &mut String) -> usize {
        // Snapshot under the lock, render outside it.
        enum Snapshot {
            Scalar(f64),
            Summary { sum: f64, count: u64 },
            Histogram { sum: f64, slot_counts: Vec<u64> },
        }

        let snapshot = {
            let state = self.lock();
            match &state.value {
                ValueState::Counter { total } => Snapshot::Scalar(*total),
                ValueState::Gauge { value } => Snapshot::Scalar(*value),
                ValueState::Summary { sum, count } => Snapshot::Summary {
                    sum: *sum,
                    count: *count,
                },
                ValueState::Histogram { sum, slot_counts } => Snapshot::Histogram {
                    sum: *sum,
                    slot_counts: slot_counts.clone(),
                },
            }
        };

        match snapshot {
            Snapshot::Scalar(value) => {
                let _ = writeln!(
                    out,
                    "{name}{{{}}} {}",
                    self.labels.render(None),
                    format_value(value)
                );
                1
            }
            Snapshot::Summary { sum, count } => {
                let rendered = self.labels.render(None);
                let _ = writeln!(out, "{name}_sum{{{rendered}}} {}", format_value(sum));
                let _ = writeln!(out, "{name}_count{{{rendered}}} {count}");
                2
            }
            Snapshot::Histogram { sum, slot_counts } => {
                let mut cumulative = 0u64;
                for (bound, slot) in self.buckets.iter().zip(&slot_counts) {
                    cumulative += slot;
                    let _ = writeln!(
                        out,
                        "{name}_bucket{{{}}} {cumulative}",
                        self.labels.render(Some(&format_value(*bound)))
                    );
                }

                let rendered = self.labels.render(None);
                let _ = writeln!(out, "{name}_count{{{rendered}}} {cumulative}");
                let _ = writeln!(out, "{name}_sum{{{rendered}}} {}", format_value(sum));
                self.buckets.len() + 2
            }
        }
    }
}
