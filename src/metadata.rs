//! Last-known descriptive fields per train number.
//!
//! Upstream feeds drop `product` and `destination` for a cycle or two at a
//! time. The cache fills those gaps for up to `ttl` so the display does not
//! flicker between a value and nothing.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};

use crate::model::elapsed_secs;

#[derive(Debug, Clone, PartialEq)]
struct Stamped {
    value: String,
    at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct MetadataEntry {
    product: Option<Stamped>,
    destination: Option<Stamped>,
}

/// Optional descriptive fields of one observation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainMetadata {
    pub product: Option<String>,
    pub destination: Option<String>,
}

/// Which fields of a [`TrainMetadata`] came from the cache rather than the
/// observation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Backfilled {
    pub product: bool,
    pub destination: bool,
}

#[derive(Debug)]
pub struct MetadataCache {
    entries: HashMap<String, MetadataEntry>,
    ttl_secs: f64,
}

impl MetadataCache {
    pub fn new(ttl_secs: f64) -> Self {
        Self {
            entries: HashMap::new(),
            ttl_secs,
        }
    }

    /// Resolves each field independently: a non-empty observed value is
    /// stored and used; otherwise a cached value younger than the TTL is
    /// substituted; otherwise the field stays empty.
    pub fn resolve(
        &mut self,
        train_number: &str,
        observed: TrainMetadata,
        now: DateTime<Utc>,
    ) -> (TrainMetadata, Backfilled) {
        let entry = self.entries.entry(train_number.to_string()).or_default();
        let ttl = self.ttl_secs;

        let (product, product_backfilled) = resolve_field(&mut entry.product, observed.product, now, ttl);
        let (destination, destination_backfilled) =
            resolve_field(&mut entry.destination, observed.destination, now, ttl);

        if entry.product.is_none() && entry.destination.is_none() {
            self.entries.remove(train_number);
        }

        (
            TrainMetadata {
                product,
                destination,
            },
            Backfilled {
                product: product_backfilled,
                destination: destination_backfilled,
            },
        )
    }

    /// Drops entries for train numbers no longer reported, and entries whose
    /// every field has outlived the TTL.
    pub fn sweep(&mut self, active_numbers: &HashSet<String>, now: DateTime<Utc>) {
        let ttl = self.ttl_secs;
        self.entries.retain(|number, entry| {
            if !active_numbers.contains(number) {
                return false;
            }
            for field in [&mut entry.product, &mut entry.destination] {
                if field.as_ref().is_some_and(|s| !is_fresh(s, now, ttl)) {
                    *field = None;
                }
            }
            entry.product.is_some() || entry.destination.is_some()
        });
    }

    pub fn contains(&self, train_number: &str) -> bool {
        self.entries.contains_key(train_number)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn is_fresh(stamped: &Stamped, now: DateTime<Utc>, ttl: f64) -> bool {
    elapsed_secs(stamped.at, now) < ttl
}

fn resolve_field(
    slot: &mut Option<Stamped>,
    observed: Option<String>,
    now: DateTime<Utc>,
    ttl: f64,
) -> (Option<String>, bool) {
    let observed = observed
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    if let Some(value) = observed {
        *slot = Some(Stamped {
            value: value.clone(),
            at: now,
        });
        return (Some(value), false);
    }

    match slot {
        Some(stamped) if is_fresh(stamped, now, ttl) => (Some(stamped.value.clone()), true),
        _ => {
            *slot = None;
            (None, false)
        }
    }
}
