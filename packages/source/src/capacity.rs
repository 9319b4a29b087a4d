//! Per-region capacity capping.
//!
//! Some regions return far more entities than a snapshot should carry.
//! Capping never drops a flagged entity to make room for an unflagged one.
//! Regions known to be large are also fetched by a lighter path, chosen by
//! [`choose_path`].

use std::collections::BTreeMap;

use compliance_map_source_models::{Entity, FetchPath, RegionSummary};

/// Picks the fetch path from an upstream record count.
///
/// Only a count strictly above `threshold` selects
/// [`FetchPath::LargeRegion`]. An unknown count (the count request failed)
/// falls back to [`FetchPath::Standard`].
#[must_use]
pub fn choose_path(count: Option<u64>, threshold: u64) -> FetchPath {
    match count {
        Some(count) if count > threshold => FetchPath::LargeRegion,
        _ => FetchPath::Standard,
    }
}

/// Caps `entities` at `cap`, keeping flagged entities first.
///
/// Relative order is preserved within the flagged and unflagged groups.
/// Returns the retained entities and whether anything was dropped.
#[must_use]
pub fn cap_entities(entities: Vec<Entity>, cap: usize) -> (Vec<Entity>, bool) {
    if entities.len() <= cap {
        return (entities, false);
    }

    let (mut kept, unflagged): (Vec<Entity>, Vec<Entity>) =
        entities.into_iter().partition(Entity::is_flagged);

    if kept.len() >= cap {
        kept.truncate(cap);
    } else {
        let room = cap - kept.len();
        kept.extend(unflagged.into_iter().take(room));
    }

    (kept, true)
}

/// Builds a [`RegionSummary`]: bucket counts over every normalized entity,
/// then the capped entity list.
#[must_use]
pub fn summarize(
    region: &str,
    entities: Vec<Entity>,
    cap: usize,
    path: FetchPath,
) -> RegionSummary {
    let mut counts = BTreeMap::new();
    for entity in &entities {
        *counts.entry(entity.bucket).or_insert(0_u64) += 1;
    }
    let total = entities.len() as u64;
    let (entities, truncated) = cap_entities(entities, cap);

    if truncated {
        log::info!(
            "{region}: capped {total} entities to {} (flagged kept first)",
            entities.len()
        );
    }

    RegionSummary {
        region: region.to_string(),
        total,
        counts,
        entities,
        truncated,
        path,
    }
}

#[cfg(test)]
mod tests {
    use compliance_map_source_models::{Bucket, EntityKind};

    use super::*;

    fn entity(i: usize, bucket: Bucket) -> Entity {
        Entity {
            id: format!("E{i}"),
            name: format!("Entity {i}"),
            region: "CA".to_string(),
            kind: EntityKind::AssessmentUnit,
            lat: Some(36.0),
            lng: Some(-120.0),
            bucket,
            attributes: BTreeMap::new(),
        }
    }

    fn mixed(flagged: usize, unflagged: usize) -> Vec<Entity> {
        // Interleave so flagged entities are not already at the front.
        let mut out = Vec::new();
        let (mut f, mut u) = (0, 0);
        while f < flagged || u < unflagged {
            if u < unflagged {
                out.push(entity(flagged + u, Bucket::Good));
                u += 1;
            }
            if f < flagged {
                out.push(entity(f, Bucket::Impaired));
                f += 1;
            }
        }
        out
    }

    #[test]
    fn under_cap_is_untouched() {
        let input = mixed(3, 3);
        let (kept, truncated) = cap_entities(input.clone(), 10);
        assert!(!truncated);
        assert_eq!(kept, input);
    }

    #[test]
    fn flagged_overflow_keeps_only_flagged() {
        let (kept, truncated) = cap_entities(mixed(2100, 400), 2000);
        assert!(truncated);
        assert_eq!(kept.len(), 2000);
        assert!(kept.iter().all(Entity::is_flagged));
        // First 2000 flagged in original order.
        assert_eq!(kept[0].id, "E0");
        assert_eq!(kept[1999].id, "E1999");
    }

    #[test]
    fn unflagged_fill_remaining_room() {
        let (kept, truncated) = cap_entities(mixed(5, 20), 10);
        assert!(truncated);
        assert_eq!(kept.len(), 10);
        assert_eq!(kept.iter().filter(|e| e.is_flagged()).count(), 5);
    }

    #[test]
    fn path_switches_only_above_threshold() {
        assert_eq!(choose_path(Some(4001), 4000), FetchPath::LargeRegion);
        assert_eq!(choose_path(Some(4000), 4000), FetchPath::Standard);
        assert_eq!(choose_path(Some(0), 4000), FetchPath::Standard);
    }

    #[test]
    fn unknown_count_uses_standard_path() {
        assert_eq!(choose_path(None, 4000), FetchPath::Standard);
        assert_eq!(choose_path(None, 0), FetchPath::Standard);
    }

    #[test]
    fn summary_counts_are_taken_before_capping() {
        let summary = summarize("CA", mixed(2100, 400), 2000, FetchPath::LargeRegion);
        assert_eq!(summary.total, 2500);
        assert_eq!(summary.counts[&Bucket::Impaired], 2100);
        assert_eq!(summary.counts[&Bucket::Good], 400);
        assert_eq!(summary.entities.len(), 2000);
        assert!(summary.truncated);
        assert_eq!(summary.path, FetchPath::LargeRegion);
    }
}
