//! Source registry: loads every source definition from embedded TOML.
//!
//! Each `.toml` file in `packages/source/sources/` is baked into the binary
//! at compile time via [`include_str!`]. Adding a source means adding a
//! TOML file and a line below; no fetcher code changes unless the upstream
//! speaks a new protocol.

use crate::source_def::{SourceDefinition, parse_source_toml};

/// Environment variable holding a comma-separated source id filter.
pub const SOURCES_ENV: &str = "COMPLIANCE_MAP_SOURCES";

/// TOML configs embedded at compile time.
const SOURCE_TOMLS: &[(&str, &str)] = &[
    // ── ArcGIS ───────────────────────────────────────────────────────
    ("attains", include_str!("../sources/attains.toml")),
    // ── Envirofacts ──────────────────────────────────────────────────
    ("npdes", include_str!("../sources/npdes.toml")),
    ("sdwis", include_str!("../sources/sdwis.toml")),
    // ── ECHO ─────────────────────────────────────────────────────────
    ("echo_cwa", include_str!("../sources/echo_cwa.toml")),
    // ── NWIS ─────────────────────────────────────────────────────────
    ("groundwater", include_str!("../sources/groundwater.toml")),
];

#[cfg(test)]
const EXPECTED_SOURCE_COUNT: usize = 5;

/// Returns all configured source definitions, parsed from embedded TOML.
///
/// # Panics
///
/// Panics if any TOML config is malformed (the configs are embedded, so
/// this surfaces in tests before it can reach a deployment).
#[must_use]
pub fn all_sources() -> Vec<SourceDefinition> {
    SOURCE_TOMLS
        .iter()
        .map(|(name, toml)| {
            parse_source_toml(toml).unwrap_or_else(|e| panic!("Failed to parse {name}.toml: {e}"))
        })
        .collect()
}

/// Returns the sources to serve, filtered by `filter` or the
/// [`SOURCES_ENV`] environment variable. If neither is set, all sources
/// are returned.
#[must_use]
pub fn enabled_sources(filter: Option<String>) -> Vec<SourceDefinition> {
    let filter = filter.or_else(|| std::env::var(SOURCES_ENV).ok());
    filter_sources(all_sources(), filter.as_deref())
}

fn filter_sources(all: Vec<SourceDefinition>, filter: Option<&str>) -> Vec<SourceDefinition> {
    let Some(filter) = filter.filter(|f| !f.trim().is_empty()) else {
        return all;
    };

    let ids: Vec<&str> = filter.split(',').map(str::trim).collect();
    let available: Vec<String> = all.iter().map(|s| s.id().to_string()).collect();

    let filtered: Vec<SourceDefinition> =
        all.into_iter().filter(|s| ids.contains(&s.id())).collect();

    if filtered.is_empty() {
        log::warn!(
            "No matching sources found for filter {ids:?}. Available: {}",
            available.join(", ")
        );
    }

    filtered
}

#[cfg(test)]
mod tests {
    use compliance_map_source_models::EntityKind;

    use super::*;

    #[test]
    fn loads_all_sources() {
        assert_eq!(all_sources().len(), EXPECTED_SOURCE_COUNT);
    }

    #[test]
    fn source_ids_are_unique_and_match_file_names() {
        let sources = all_sources();
        let mut ids: Vec<&str> = sources.iter().map(|s| s.id.as_str()).collect();
        for ((name, _), id) in SOURCE_TOMLS.iter().zip(&ids) {
            assert_eq!(name, id);
        }
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), EXPECTED_SOURCE_COUNT);
    }

    #[test]
    fn all_sources_validate() {
        for source in &all_sources() {
            assert!(!source.name.is_empty(), "{}: name is empty", source.id);
            assert!(source.ttl_hours > 0, "{}: zero ttl", source.id);
            if let Err(e) = source.validate() {
                panic!("{e}");
            }
        }
    }

    #[test]
    fn every_entity_kind_has_a_source() {
        let sources = all_sources();
        for kind in [
            EntityKind::AssessmentUnit,
            EntityKind::Permit,
            EntityKind::WaterSystem,
            EntityKind::Well,
            EntityKind::Facility,
        ] {
            assert!(sources.iter().any(|s| s.kind == kind), "no source for {kind}");
        }
    }

    #[test]
    fn filter_selects_listed_ids() {
        let filtered = filter_sources(all_sources(), Some("sdwis, groundwater"));
        let ids: Vec<&str> = filtered.iter().map(SourceDefinition::id).collect();
        assert_eq!(ids, ["sdwis", "groundwater"]);
    }

    #[test]
    fn blank_filter_keeps_everything() {
        assert_eq!(filter_sources(all_sources(), Some("  ")).len(), EXPECTED_SOURCE_COUNT);
        assert_eq!(filter_sources(all_sources(), None).len(), EXPECTED_SOURCE_COUNT);
    }

    #[test]
    fn unknown_filter_yields_nothing() {
        assert!(filter_sources(all_sources(), Some("nope")).is_empty());
    }
}
