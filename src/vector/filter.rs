//! Metadata filter grammar for the vector index.
//!
//! Supports equality, set-inclusion (both "scalar in set" and "set-valued
//! field contains value"), and boolean AND/OR. Filters evaluate against the
//! JSON form of an embedding metadata envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A predicate over embedding metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum MetadataFilter {
    /// Field equals value.
    Eq { field: String, value: Value },
    /// Scalar field is one of the listed values.
    In { field: String, values: Vec<Value> },
    /// Array-valued field contains the value.
    Contains { field: String, value: Value },
    /// All sub-filters hold.
    And { filters: Vec<MetadataFilter> },
    /// At least one sub-filter holds.
    Or { filters: Vec<MetadataFilter> },
}

impl MetadataFilter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn in_set(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::In {
            field: field.into(),
            values,
        }
    }

    pub fn contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Contains {
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn all(filters: Vec<MetadataFilter>) -> Self {
        Self::And { filters }
    }

    pub fn any(filters: Vec<MetadataFilter>) -> Self {
        Self::Or { filters }
    }

    /// Evaluate against a metadata object.
    pub fn matches(&self, metadata: &Value) -> bool {
        match self {
            Self::Eq { field, value } => metadata.get(field) == Some(value),
            Self::In { field, values } => metadata
                .get(field)
                .map(|v| values.contains(v))
                .unwrap_or(false),
            Self::Contains { field, value } => metadata
                .get(field)
                .and_then(Value::as_array)
                .map(|array| array.contains(value))
                .unwrap_or(false),
            Self::And { filters } => filters.iter().all(|f| f.matches(metadata)),
            Self::Or { filters } => filters.iter().any(|f| f.matches(metadata)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> Value {
        json!({
            "owner_id": "alice",
            "visibility": "shared",
            "read_users": ["bob", "carol"],
            "read_teams": ["search"],
        })
    }

    #[test]
    fn test_eq() {
        assert!(MetadataFilter::eq("owner_id", "alice").matches(&envelope()));
        assert!(!MetadataFilter::eq("owner_id", "bob").matches(&envelope()));
        assert!(!MetadataFilter::eq("missing", "x").matches(&envelope()));
    }

    #[test]
    fn test_in_set() {
        let filter = MetadataFilter::in_set("visibility", vec![json!("shared"), json!("public")]);
        assert!(filter.matches(&envelope()));
        let filter = MetadataFilter::in_set("visibility", vec![json!("private")]);
        assert!(!filter.matches(&envelope()));
    }

    #[test]
    fn test_contains() {
        assert!(MetadataFilter::contains("read_users", "bob").matches(&envelope()));
        assert!(!MetadataFilter::contains("read_users", "dave").matches(&envelope()));
        // Scalar fields never satisfy contains.
        assert!(!MetadataFilter::contains("owner_id", "alice").matches(&envelope()));
    }

    #[test]
    fn test_boolean_composition() {
        let filter = MetadataFilter::any(vec![
            MetadataFilter::eq("owner_id", "dave"),
            MetadataFilter::all(vec![
                MetadataFilter::eq("visibility", "shared"),
                MetadataFilter::contains("read_teams", "search"),
            ]),
        ]);
        assert!(filter.matches(&envelope()));

        let filter = MetadataFilter::all(vec![
            MetadataFilter::eq("owner_id", "alice"),
            MetadataFilter::eq("visibility", "public"),
        ]);
        assert!(!filter.matches(&envelope()));
    }

    #[test]
    fn test_empty_and_or() {
        assert!(MetadataFilter::all(vec![]).matches(&envelope()));
        assert!(!MetadataFilter::any(vec![]).matches(&envelope()));
    }

    #[test]
    fn test_serde_round_trip() {
        let filter = MetadataFilter::any(vec![
            MetadataFilter::eq("owner_id", "alice"),
            MetadataFilter::contains("read_users", "bob"),
        ]);
        let json = serde_json::to_string(&filter).unwrap();
        let back: MetadataFilter = serde_json::from_str(&json).unwrap();
        assert_eq!(filter, back);
    }
}
