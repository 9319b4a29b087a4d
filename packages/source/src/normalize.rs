//! Raw record → [`Entity`] normalization.
//!
//! Fetchers hand back loosely-typed JSON objects. A [`FieldMapping`] names
//! the fields that carry the identifier, display name, coordinates and
//! pass-through attributes; ordered [`BucketRule`]s classify each record.
//!
//! Fetchers that derive coordinates from geometry or a secondary join
//! write them to [`GEOMETRY_LAT`] / [`GEOMETRY_LNG`] and the joined display
//! name to [`JOINED_NAME`]; mapped fields always win over those.

use std::collections::BTreeMap;

use compliance_map_source_models::{Bucket, Entity};
use serde::Deserialize;

use crate::source_def::SourceDefinition;

/// Latitude derived by the fetcher (geometry, centroid, or join).
pub const GEOMETRY_LAT: &str = "_lat";
/// Longitude derived by the fetcher (geometry, centroid, or join).
pub const GEOMETRY_LNG: &str = "_lng";
/// Display name supplied by a secondary join.
pub const JOINED_NAME: &str = "_joined_name";

/// Maps source-specific JSON field names to entity fields.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldMapping {
    /// Identifier fields, tried in order.
    pub id: Vec<String>,
    /// Display-name fields, tried in order (first non-empty wins).
    #[serde(default)]
    pub name: Vec<String>,
    /// Latitude field (number or numeric string).
    #[serde(default)]
    pub lat: Option<String>,
    /// Longitude field (number or numeric string).
    #[serde(default)]
    pub lng: Option<String>,
    /// Fields copied into [`Entity::attributes`] when present.
    #[serde(default)]
    pub attributes: Vec<String>,
}

/// Assigns `bucket` when `field` satisfies `when`.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketRule {
    /// Bucket to assign.
    pub bucket: Bucket,
    /// Field to test.
    pub field: String,
    /// Condition on the field value.
    pub when: Condition,
}

/// A test against one field value.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// String value equals one of `values` (case-insensitive).
    OneOf {
        /// Accepted values.
        values: Vec<String>,
    },
    /// String value contains `value` (case-insensitive).
    Contains {
        /// Substring to look for.
        value: String,
    },
    /// Numeric value strictly greater than `value`.
    Above {
        /// Bound.
        value: f64,
    },
    /// Numeric value strictly less than `value`.
    Below {
        /// Bound.
        value: f64,
    },
    /// Field is present and non-empty.
    Present,
}

impl Condition {
    fn matches(&self, value: Option<&serde_json::Value>) -> bool {
        match self {
            Self::OneOf { values } => value
                .and_then(value_to_string)
                .is_some_and(|s| values.iter().any(|v| v.eq_ignore_ascii_case(&s))),
            Self::Contains { value: needle } => value
                .and_then(value_to_string)
                .is_some_and(|s| s.to_lowercase().contains(&needle.to_lowercase())),
            Self::Above { value: bound } => value.and_then(value_to_f64).is_some_and(|v| v > *bound),
            Self::Below { value: bound } => value.and_then(value_to_f64).is_some_and(|v| v < *bound),
            Self::Present => value.and_then(value_to_string).is_some(),
        }
    }
}

impl BucketRule {
    fn matches(&self, record: &serde_json::Value) -> bool {
        self.when.matches(get_field(record, &self.field))
    }
}

// ── Field access ─────────────────────────────────────────────────────────

/// Gets a field by exact name, falling back to a case-insensitive match.
///
/// Envirofacts has served the same table with upper- and lower-case column
/// names over time.
pub fn get_field<'a>(record: &'a serde_json::Value, field: &str) -> Option<&'a serde_json::Value> {
    let obj = record.as_object()?;
    obj.get(field).or_else(|| {
        obj.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(field))
            .map(|(_, v)| v)
    })
}

/// Renders a scalar as a trimmed, non-empty string.
#[must_use]
pub fn value_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Reads a number or numeric string.
#[must_use]
pub fn value_to_f64(value: &serde_json::Value) -> Option<f64> {
    let parsed = match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

fn first_string(record: &serde_json::Value, fields: &[String]) -> Option<String> {
    fields
        .iter()
        .filter_map(|f| get_field(record, f))
        .find_map(value_to_string)
}

fn coordinate(
    record: &serde_json::Value,
    mapped: Option<&str>,
    derived: &str,
    limit: f64,
) -> Option<f64> {
    mapped
        .and_then(|f| get_field(record, f))
        .and_then(value_to_f64)
        .or_else(|| get_field(record, derived).and_then(value_to_f64))
        .filter(|v| v.abs() <= limit)
}

// ── Normalization ────────────────────────────────────────────────────────

/// Classifies a raw record. First matching rule wins.
#[must_use]
pub fn classify(definition: &SourceDefinition, record: &serde_json::Value) -> Bucket {
    definition
        .buckets
        .iter()
        .find(|rule| rule.matches(record))
        .map_or(definition.default_bucket, |rule| rule.bucket)
}

/// Normalizes one raw record. Returns `None` when no identifier field is
/// present.
#[must_use]
pub fn normalize_record(
    definition: &SourceDefinition,
    region: &str,
    record: &serde_json::Value,
) -> Option<Entity> {
    let fields = &definition.fields;
    let id = first_string(record, &fields.id)?;
    let name = first_string(record, &fields.name)
        .or_else(|| get_field(record, JOINED_NAME).and_then(value_to_string))
        .unwrap_or_else(|| id.clone());

    let mut lat = coordinate(record, fields.lat.as_deref(), GEOMETRY_LAT, 90.0);
    let mut lng = coordinate(record, fields.lng.as_deref(), GEOMETRY_LNG, 180.0);
    // Null island is a placeholder, not a location.
    if lat == Some(0.0) && lng == Some(0.0) {
        lat = None;
        lng = None;
    }

    let attributes: BTreeMap<String, serde_json::Value> = fields
        .attributes
        .iter()
        .filter_map(|f| {
            get_field(record, f)
                .filter(|v| !v.is_null())
                .map(|v| (f.clone(), v.clone()))
        })
        .collect();

    Some(Entity {
        id,
        name,
        region: region.to_string(),
        kind: definition.kind,
        lat,
        lng,
        bucket: classify(definition, record),
        attributes,
    })
}

/// Normalizes a page of raw records, skipping records without an id.
#[must_use]
pub fn normalize_records(
    definition: &SourceDefinition,
    region: &str,
    records: &[serde_json::Value],
) -> Vec<Entity> {
    let entities: Vec<Entity> = records
        .iter()
        .filter_map(|r| normalize_record(definition, region, r))
        .collect();

    let skipped = records.len() - entities.len();
    if skipped > 0 {
        log::debug!(
            "{}/{region}: skipped {skipped} records without an identifier",
            definition.id
        );
    }
    entities
}

#[cfg(test)]
mod tests {
    use compliance_map_source_models::EntityKind;

    use super::*;
    use crate::source_def::parse_source_toml;

    fn definition() -> SourceDefinition {
        parse_source_toml(
            r#"
            id = "attains"
            name = "ATTAINS"
            kind = "assessment_unit"
            ttl_hours = 2160

            [fetcher]
            type = "arcgis"
            query_url = "https://example.test/query"
            region_field = "state"
            large_region_threshold = 4000

            [fields]
            id = ["assessmentunitidentifier", "objectid"]
            name = ["assessmentunitname"]
            lat = "latitude"
            lng = "longitude"
            attributes = ["ircategory", "causes"]

            [[buckets]]
            bucket = "impaired"
            field = "ircategory"
            when = { type = "one_of", values = ["5", "5A", "4A"] }

            [[buckets]]
            bucket = "unassessed"
            field = "ircategory"
            when = { type = "one_of", values = ["3"] }
            "#,
        )
        .unwrap()
    }

    #[test]
    fn normalizes_mapped_fields() {
        let record = serde_json::json!({
            "assessmentunitidentifier": "MD-02130903",
            "assessmentunitname": "Back River",
            "latitude": "39.27",
            "longitude": -76.45,
            "ircategory": "5",
            "causes": null,
        });
        let entity = normalize_record(&definition(), "MD", &record).unwrap();
        assert_eq!(entity.id, "MD-02130903");
        assert_eq!(entity.name, "Back River");
        assert_eq!(entity.kind, EntityKind::AssessmentUnit);
        assert_eq!(entity.coords(), Some((39.27, -76.45)));
        assert_eq!(entity.bucket, Bucket::Impaired);
        assert_eq!(entity.attributes.len(), 1);
        assert_eq!(entity.attributes["ircategory"], "5");
    }

    #[test]
    fn falls_back_to_id_as_name_and_derived_coords() {
        let record = serde_json::json!({
            "objectid": 42,
            "_lat": 38.95,
            "_lng": -77.05,
            "ircategory": "2",
        });
        let entity = normalize_record(&definition(), "DC", &record).unwrap();
        assert_eq!(entity.id, "42");
        assert_eq!(entity.name, "42");
        assert_eq!(entity.coords(), Some((38.95, -77.05)));
        assert_eq!(entity.bucket, Bucket::Good);
    }

    #[test]
    fn joined_name_is_used_when_no_mapped_name() {
        let record = serde_json::json!({"objectid": 7, "_joined_name": "Joined Facility"});
        let entity = normalize_record(&definition(), "VA", &record).unwrap();
        assert_eq!(entity.name, "Joined Facility");
        assert_eq!(entity.coords(), None);
    }

    #[test]
    fn first_matching_rule_wins() {
        let def = definition();
        assert_eq!(classify(&def, &serde_json::json!({"ircategory": "4a"})), Bucket::Impaired);
        assert_eq!(classify(&def, &serde_json::json!({"ircategory": "3"})), Bucket::Unassessed);
        assert_eq!(classify(&def, &serde_json::json!({})), Bucket::Good);
    }

    #[test]
    fn numeric_and_presence_conditions() {
        let above = Condition::Above { value: 2.0 };
        assert!(above.matches(Some(&serde_json::json!("2.5"))));
        assert!(!above.matches(Some(&serde_json::json!(2.0))));
        assert!(!above.matches(None));

        let below = Condition::Below { value: 5.0 };
        assert!(below.matches(Some(&serde_json::json!(4.9))));

        assert!(Condition::Present.matches(Some(&serde_json::json!("Y"))));
        assert!(!Condition::Present.matches(Some(&serde_json::json!("  "))));

        let contains = Condition::Contains {
            value: "significant".to_string(),
        };
        assert!(contains.matches(Some(&serde_json::json!("Significant Violation"))));
    }

    #[test]
    fn rejects_out_of_range_and_null_island_coords() {
        let record = serde_json::json!({"objectid": 1, "latitude": 0, "longitude": 0});
        assert_eq!(normalize_record(&definition(), "MD", &record).unwrap().coords(), None);

        let record = serde_json::json!({"objectid": 1, "latitude": 123.0, "longitude": -77.0});
        let entity = normalize_record(&definition(), "MD", &record).unwrap();
        assert_eq!(entity.lat, None);
    }

    #[test]
    fn field_lookup_is_case_insensitive_fallback() {
        let record = serde_json::json!({"pwsid": "MD0010001"});
        assert_eq!(get_field(&record, "PWSID").unwrap(), "MD0010001");
    }

    #[test]
    fn skips_records_without_identifier() {
        let records = vec![
            serde_json::json!({"objectid": 1}),
            serde_json::json!({"assessmentunitname": "No id"}),
        ];
        assert_eq!(normalize_records(&definition(), "MD", &records).len(), 1);
    }
}
