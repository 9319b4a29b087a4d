//! Letter grades for a location from the entities around it.

use std::collections::BTreeMap;

use compliance_map_grid::GridCell;
use compliance_map_source_models::EntityKind;
use serde::Serialize;
use strum_macros::{AsRefStr, Display};

/// Overall grade. `Incomplete` means nothing was found to grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Display, AsRefStr)]
pub enum Grade {
    /// Nothing flagged.
    A,
    /// Under 10% flagged.
    B,
    /// Under 25% flagged.
    C,
    /// Under half flagged.
    D,
    /// Half or more flagged.
    F,
    /// No entities to grade.
    Incomplete,
}

impl Grade {
    /// Grade for `flagged` out of `total` entities.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_counts(flagged: usize, total: usize) -> Self {
        if total == 0 {
            return Self::Incomplete;
        }
        let share = flagged as f64 / total as f64;
        if flagged == 0 {
            Self::A
        } else if share < 0.1 {
            Self::B
        } else if share < 0.25 {
            Self::C
        } else if share < 0.5 {
            Self::D
        } else {
            Self::F
        }
    }
}

/// Flagged and total counts for one entity kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindCounts {
    /// Entities of this kind.
    pub total: usize,
    /// How many of them are flagged.
    pub flagged: usize,
}

/// A location's grade with the counts behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationGrade {
    /// Grade from the flagged share across all kinds.
    pub grade: Grade,
    /// Entities considered.
    pub total: usize,
    /// Flagged entities among them.
    pub flagged: usize,
    /// The same counts split by entity kind.
    pub by_kind: BTreeMap<EntityKind, KindCounts>,
}

/// Grades the entities in `cell`.
#[must_use]
pub fn grade_location(cell: &GridCell) -> LocationGrade {
    let mut by_kind: BTreeMap<EntityKind, KindCounts> = BTreeMap::new();
    for entity in cell.iter() {
        let counts = by_kind.entry(entity.kind).or_default();
        counts.total += 1;
        if entity.bucket.is_flagged() {
            counts.flagged += 1;
        }
    }

    let total = by_kind.values().map(|c| c.total).sum();
    let flagged = by_kind.values().map(|c| c.flagged).sum();

    LocationGrade {
        grade: Grade::from_counts(flagged, total),
        total,
        flagged,
        by_kind,
    }
}

#[cfg(test)]
mod tests {
    use compliance_map_grid::GridIndex;

    use super::*;
    use crate::test_support::{entity, flagged};

    #[test]
    fn thresholds() {
        assert_eq!(Grade::from_counts(0, 0), Grade::Incomplete);
        assert_eq!(Grade::from_counts(0, 10), Grade::A);
        assert_eq!(Grade::from_counts(1, 20), Grade::B);
        assert_eq!(Grade::from_counts(1, 10), Grade::C);
        assert_eq!(Grade::from_counts(1, 4), Grade::D);
        assert_eq!(Grade::from_counts(1, 2), Grade::F);
    }

    #[test]
    fn grades_a_cell() {
        let grid = GridIndex::build([
            entity("a", "MD", 38.95, -77.05),
            entity("b", "MD", 38.95, -77.05),
            flagged(entity("c", "MD", 38.95, -77.05)),
        ]);
        let graded = grade_location(&grid.lookup(38.95, -77.05));
        assert_eq!(graded.total, 3);
        assert_eq!(graded.flagged, 1);
        assert_eq!(graded.grade, Grade::D);
        assert_eq!(graded.by_kind[&EntityKind::Permit].flagged, 1);
    }

    #[test]
    fn grade_serializes_camel_case_counts() {
        let grid = GridIndex::build([flagged(entity("a", "MD", 38.95, -77.05))]);
        let json = serde_json::to_value(grade_location(&grid.lookup(38.95, -77.05))).unwrap();
        assert_eq!(json["grade"], "F");
        assert_eq!(json["total"], 1);
        assert_eq!(json["byKind"]["permit"]["flagged"], 1);
        assert_eq!(json["byKind"]["permit"]["total"], 1);
    }

    #[test]
    fn empty_cell_is_incomplete() {
        assert_eq!(grade_location(&GridCell::default()).grade, Grade::Incomplete);
    }
}
