use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Field name carrying the stable natural key assigned by the registry.
pub const ID_FIELD: &str = "eu_pas_register_number";

/// Field name carrying the last-known canonical location of a record.
pub const URL_FIELD: &str = "url";

/// A single primitive field value as it appears in the scraped JSON.
///
/// Dates travel as ISO-8601 text once serialized, so there is no
/// dedicated date variant here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl Scalar {
    fn rank(&self) -> u8 {
        match self {
            Scalar::Bool(_) => 0,
            Scalar::Int(_) => 1,
            Scalar::Float(_) => 2,
            Scalar::Text(_) => 3,
        }
    }

    /// Total ordering across variants, used to sort list fields into an
    /// order-independent form.
    pub fn total_cmp(&self, other: &Scalar) -> Ordering {
        match (self, other) {
            (Scalar::Bool(a), Scalar::Bool(b)) => a.cmp(b),
            (Scalar::Int(a), Scalar::Int(b)) => a.cmp(b),
            (Scalar::Float(a), Scalar::Float(b)) => a.total_cmp(b),
            (Scalar::Text(a), Scalar::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Bool(v) => write!(f, "{v}"),
            Scalar::Int(v) => write!(f, "{v}"),
            Scalar::Float(v) => write!(f, "{v}"),
            Scalar::Text(v) => f.write_str(v),
        }
    }
}

/// A record field: either a single scalar or a list of scalars.
///
/// List order carries no meaning for comparison purposes; the history
/// engine sorts lists before diffing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    One(Scalar),
    Many(Vec<Scalar>),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::One(Scalar::Text(value.into()))
    }

    pub fn int(value: i64) -> Self {
        FieldValue::One(Scalar::Int(value))
    }

    pub fn texts<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldValue::Many(values.into_iter().map(|v| Scalar::Text(v.into())).collect())
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::One(Scalar::Text(v)) => Some(v),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record has no usable {ID_FIELD} field")]
    MissingExternalId,
}

/// One scraped study entry: a flat field map joined across runs by its
/// register number. The id and url are ordinary fields of the map, so a
/// snapshot file round-trips as a flat JSON array of flat objects.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    external_id: String,
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Builds a record from raw fields, validating the external id.
    pub fn from_fields(fields: BTreeMap<String, FieldValue>) -> Result<Self, RecordError> {
        let external_id = match fields.get(ID_FIELD) {
            Some(FieldValue::One(Scalar::Text(id))) if !id.trim().is_empty() => id.clone(),
            // Exports that strip the EUPAS prefix leave a bare number.
            Some(FieldValue::One(Scalar::Int(id))) => id.to_string(),
            _ => return Err(RecordError::MissingExternalId),
        };
        Ok(Self {
            external_id,
            fields,
        })
    }

    pub fn external_id(&self) -> &str {
        &self.external_id
    }

    pub fn url(&self) -> Option<&str> {
        self.fields.get(URL_FIELD).and_then(FieldValue::as_text)
    }

    pub fn fields(&self) -> &BTreeMap<String, FieldValue> {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Inserts or replaces a field. The external id field itself is
    /// immutable once the record is constructed.
    pub fn set(&mut self, name: impl Into<String>, value: FieldValue) {
        let name = name.into();
        if name != ID_FIELD {
            self.fields.insert(name, value);
        }
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Record {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = BTreeMap::<String, Option<FieldValue>>::deserialize(deserializer)?;
        // JSON nulls mean "not reported"; the scrape drops them too.
        let fields = raw
            .into_iter()
            .filter_map(|(name, value)| value.map(|value| (name, value)))
            .collect();
        Record::from_fields(fields).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record_from_json(json: &str) -> Record {
        serde_json::from_str(json).expect("valid record json")
    }

    #[test]
    fn record_requires_register_number() {
        let fields = BTreeMap::from([("title".to_string(), FieldValue::text("A"))]);
        assert!(matches!(
            Record::from_fields(fields),
            Err(RecordError::MissingExternalId)
        ));
    }

    #[test]
    fn record_roundtrips_as_flat_object() {
        let record = record_from_json(
            r#"{"eu_pas_register_number":"EUPAS1234","title":"A","countries":["DE","FR"]}"#,
        );
        assert_eq!(record.external_id(), "EUPAS1234");
        assert_eq!(
            record.get("countries"),
            Some(&FieldValue::texts(["DE", "FR"]))
        );

        let json = serde_json::to_string(&record).expect("serialize");
        assert_eq!(record_from_json(&json), record);
    }

    #[test]
    fn numeric_register_number_is_accepted() {
        let record = record_from_json(r#"{"eu_pas_register_number":1234,"title":"A"}"#);
        assert_eq!(record.external_id(), "1234");
    }

    #[test]
    fn null_fields_are_dropped() {
        let record = record_from_json(r#"{"eu_pas_register_number":"EUPAS1","acronym":null}"#);
        assert!(record.get("acronym").is_none());
    }

    #[test]
    fn scalar_ordering_is_total() {
        let mut values = vec![
            Scalar::Text("b".into()),
            Scalar::Int(3),
            Scalar::Text("a".into()),
            Scalar::Bool(true),
        ];
        values.sort_by(Scalar::total_cmp);
        assert_eq!(
            values,
            vec![
                Scalar::Bool(true),
                Scalar::Int(3),
                Scalar::Text("a".into()),
                Scalar::Text("b".into()),
            ]
        );
    }
}
