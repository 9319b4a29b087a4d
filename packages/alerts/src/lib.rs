#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Threshold alert engine.
//!
//! Each reading moves its `(site, parameter)` between nominal, warning, and
//! critical purely by comparison against a rule's thresholds. Evaluation is
//! stateless: a batch of readings in, a list of alerts out. Deduplication
//! and expiry are separate helpers the caller applies to its own store.

pub mod engine;
pub mod rules;

pub use engine::{
    Alert, EXPIRY_HOURS, Level, Reading, Severity, classify, dedup_latest, evaluate, expire,
    expiry_window, merge_alerts,
};
pub use rules::{Direction, Limit, RuleSet, ThresholdRule};

/// Errors from loading a rule table.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// The TOML could not be parsed.
    #[error("Rule table parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// A rule is internally inconsistent.
    #[error("Invalid rule for {parameter}: {message}")]
    Invalid {
        /// Parameter code of the offending rule.
        parameter: String,
        /// What is wrong with it.
        message: String,
    },
}
