#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Fixed-resolution spatial bucketing.
//!
//! Coordinates are floored to a 0.1° grid (≈11 km). A [`GridIndex`] maps
//! each occupied [`CellKey`] to a [`GridCell`] holding one list of entities
//! per [`EntityKind`]. Point lookups union the target cell with its eight
//! neighbors so a point near a cell edge still finds entities just across
//! it.
//!
//! The index is built once per source build and never mutated afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use compliance_map_source_models::{Entity, EntityKind};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Cell size in degrees.
pub const RESOLUTION: f64 = 0.1;

/// Cells per degree.
const SCALE: f64 = 10.0;

/// Slack added before flooring so `2.3 * 10.0 == 22.999999999999996`
/// still lands in cell 23.
const EPSILON: f64 = 1e-9;

// ── Cell key ─────────────────────────────────────────────────────────────

/// Integer cell indices for one grid cell.
///
/// Serialized as `"{lat}_{lng}"` with one decimal, e.g. `"38.9_-77.1"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey {
    lat: i32,
    lng: i32,
}

impl CellKey {
    /// Floors a coordinate to its cell. Returns `None` for non-finite or
    /// out-of-range coordinates.
    #[must_use]
    pub fn from_coords(lat: f64, lng: f64) -> Option<Self> {
        if !(lat.is_finite() && lng.is_finite()) {
            return None;
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            return None;
        }
        Some(Self {
            lat: index(lat),
            lng: index(lng),
        })
    }

    /// The south-west corner of the cell in degrees.
    #[must_use]
    pub fn origin(self) -> (f64, f64) {
        (f64::from(self.lat) / SCALE, f64::from(self.lng) / SCALE)
    }

    /// The 3×3 window centred on this cell, in key order.
    #[must_use]
    pub fn window(self) -> [Self; 9] {
        let mut keys = [self; 9];
        let mut i = 0;
        for dlat in -1..=1 {
            for dlng in -1..=1 {
                keys[i] = Self {
                    lat: self.lat + dlat,
                    lng: self.lng + dlng,
                };
                i += 1;
            }
        }
        keys
    }
}

#[allow(clippy::cast_possible_truncation)]
fn index(degrees: f64) -> i32 {
    (degrees * SCALE + EPSILON).floor() as i32
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (lat, lng) = self.origin();
        write!(f, "{lat:.1}_{lng:.1}")
    }
}

/// Error parsing a [`CellKey`] from its string form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseCellKeyError(String);

impl fmt::Display for ParseCellKeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid cell key {:?}", self.0)
    }
}

impl std::error::Error for ParseCellKeyError {}

impl FromStr for CellKey {
    type Err = ParseCellKeyError;

    #[allow(clippy::cast_possible_truncation)]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseCellKeyError(s.to_string());
        let (lat, lng) = s.split_once('_').ok_or_else(err)?;
        let lat: f64 = lat.parse().map_err(|_| err())?;
        let lng: f64 = lng.parse().map_err(|_| err())?;
        if !(lat.is_finite() && lng.is_finite()) {
            return Err(err());
        }
        Ok(Self {
            lat: (lat * SCALE).round() as i32,
            lng: (lng * SCALE).round() as i32,
        })
    }
}

impl Serialize for CellKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CellKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ── Grid cell ────────────────────────────────────────────────────────────

/// Entities in one cell (or a merged window), one list per kind, each in
/// build insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GridCell {
    entities: BTreeMap<EntityKind, Vec<Entity>>,
}

impl GridCell {
    fn push(&mut self, entity: Entity) {
        self.entities.entry(entity.kind).or_default().push(entity);
    }

    fn merge_from(&mut self, other: &Self) {
        for (kind, list) in &other.entities {
            self.entities
                .entry(*kind)
                .or_default()
                .extend(list.iter().cloned());
        }
    }

    /// Entities of `kind`.
    #[must_use]
    pub fn get(&self, kind: EntityKind) -> &[Entity] {
        self.entities.get(&kind).map_or(&[][..], Vec::as_slice)
    }

    /// Kinds present, in order.
    pub fn kinds(&self) -> impl Iterator<Item = EntityKind> + '_ {
        self.entities.keys().copied()
    }

    /// All entities, grouped by kind.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values().flatten()
    }

    /// Total entity count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entities.values().map(Vec::len).sum()
    }

    /// Returns `true` if the cell holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entities.values().all(Vec::is_empty)
    }
}

// ── Grid index ───────────────────────────────────────────────────────────

/// A complete grid for one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridIndex {
    cells: BTreeMap<CellKey, GridCell>,
    /// Entities without usable coordinates. Reachable by region and id but
    /// never by point lookup.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    unlocated: Vec<Entity>,
}

impl GridIndex {
    /// Buckets `entities` into cells, preserving their order within each
    /// cell and kind.
    #[must_use]
    pub fn build(entities: impl IntoIterator<Item = Entity>) -> Self {
        let mut index = Self::default();
        for entity in entities {
            match entity
                .coords()
                .and_then(|(lat, lng)| CellKey::from_coords(lat, lng))
            {
                Some(key) => index.cells.entry(key).or_default().push(entity),
                None => index.unlocated.push(entity),
            }
        }
        index
    }

    /// Cell key for a coordinate. Identical at build and lookup time.
    #[must_use]
    pub fn cell_key(lat: f64, lng: f64) -> Option<CellKey> {
        CellKey::from_coords(lat, lng)
    }

    /// Unions the 3×3 window around `(lat, lng)`. Returns an empty cell when
    /// nothing in the window has data or the coordinate is invalid.
    #[must_use]
    pub fn lookup(&self, lat: f64, lng: f64) -> GridCell {
        let mut merged = GridCell::default();
        let Some(center) = CellKey::from_coords(lat, lng) else {
            return merged;
        };
        for key in center.window() {
            if let Some(cell) = self.cells.get(&key) {
                merged.merge_from(cell);
            }
        }
        merged
    }

    /// The cell at `key`, if occupied.
    #[must_use]
    pub fn cell(&self, key: &CellKey) -> Option<&GridCell> {
        self.cells.get(key)
    }

    /// Every entity, located ones first in key order.
    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.cells
            .values()
            .flat_map(GridCell::iter)
            .chain(self.unlocated.iter())
    }

    /// Entities fetched for region `code` (case-insensitive).
    #[must_use]
    pub fn in_region(&self, code: &str) -> Vec<&Entity> {
        self.entities()
            .filter(|e| e.region.eq_ignore_ascii_case(code))
            .collect()
    }

    /// The entity with identifier `id`. Linear in the entity count.
    #[must_use]
    pub fn by_id(&self, id: &str) -> Option<&Entity> {
        self.entities().find(|e| e.id == id)
    }

    /// Number of occupied cells.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Number of entities placed in a cell.
    #[must_use]
    pub fn located_count(&self) -> usize {
        self.cells.values().map(GridCell::len).sum()
    }

    /// Number of entities, located or not.
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.located_count() + self.unlocated.len()
    }
}
