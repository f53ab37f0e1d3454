//! Train position normalization and speed estimation.
//!
//! Raw position reports go through [`normalizer::Normalizer`], which fixes up
//! known data quirks, backfills metadata and fills in a speed when none was
//! reported. [`registry::Registry`] holds the current record per train and
//! evicts trains that stop reporting.

pub mod clock;
pub mod config;
pub mod estimator;
pub mod fetch;
pub mod geo;
pub mod metadata;
pub mod model;
pub mod normalizer;
pub mod output;
pub mod parser;
pub mod quirks;
pub mod registry;
pub mod samples;
pub mod scheduler;
pub mod stats;
