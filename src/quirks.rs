//! Data-driven corrections for known upstream oddities.
//!
//! All product renames, reserved number ranges and sentinel speed values are
//! listed here as data and applied in one pass, so adding a quirk means adding
//! a row rather than another conditional.

use serde::Deserialize;

use crate::model::Observation;

/// Forces product and/or destination for a reserved train-number range.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumberRangeOverride {
    pub from: u32,
    pub to: u32,
    pub product: Option<String>,
    pub destination: Option<String>,
}

impl NumberRangeOverride {
    fn matches(&self, train_number: &str) -> bool {
        train_number
            .trim()
            .parse::<u32>()
            .is_ok_and(|n| (self.from..=self.to).contains(&n))
    }
}

/// A reported speed value that one product uses to mean "unknown".
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeedSentinel {
    pub product: String,
    pub value: f64,
}

/// Alias pair, matched case-insensitively against the reported product.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductAlias {
    pub alias: String,
    pub canonical: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct QuirkTable {
    pub aliases: Vec<ProductAlias>,
    pub overrides: Vec<NumberRangeOverride>,
    pub sentinels: Vec<SpeedSentinel>,
}

impl Default for QuirkTable {
    fn default() -> Self {
        let alias = |alias: &str, canonical: &str| ProductAlias {
            alias: alias.to_string(),
            canonical: canonical.to_string(),
        };
        Self {
            aliases: vec![
                alias("SJ Snabbtåg", "SJ High-Speed"),
                alias("X2000", "SJ High-Speed"),
                alias("SJ Regional", "Regionaltåg"),
                alias("Pendeltag", "Pendeltåg"),
                alias("SL Pendeltåg", "Pendeltåg"),
            ],
            overrides: vec![NumberRangeOverride {
                from: 7000,
                to: 7999,
                product: Some("Arlanda Express".to_string()),
                destination: None,
            }],
            sentinels: vec![SpeedSentinel {
                product: "Pendeltåg".to_string(),
                value: 1.0,
            }],
        }
    }
}

impl QuirkTable {
    /// Returns the canonical display name for a product, or the input
    /// unchanged when no alias matches.
    pub fn canonical_product(&self, product: &str) -> String {
        let trimmed = product.trim();
        self.aliases
            .iter()
            .find(|a| a.alias.to_lowercase() == trimmed.to_lowercase())
            .map(|a| a.canonical.clone())
            .unwrap_or_else(|| trimmed.to_string())
    }

    /// Applies aliases, number-range overrides and speed sentinels, in that
    /// order.
    pub fn apply(&self, observation: &mut Observation) {
        if let Some(product) = observation.product.as_deref() {
            observation.product = Some(self.canonical_product(product));
        }

        if let Some(rule) = self
            .overrides
            .iter()
            .find(|r| r.matches(&observation.train_number))
        {
            if let Some(product) = &rule.product {
                observation.product = Some(product.clone());
            }
            if let Some(destination) = &rule.destination {
                observation.destination = Some(destination.clone());
            }
        }

        let product = observation.product.as_deref();
        if let (Some(product), Some(speed)) = (product, observation.reported_speed) {
            let is_sentinel = self
                .sentinels
                .iter()
                .any(|s| s.product == product && (s.value - speed).abs() < f64::EPSILON);
            if is_sentinel {
                observation.reported_speed = None;
            }
        }
    }
}
