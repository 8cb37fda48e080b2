use std::collections::BTreeMap;

use paswatch_core::{FieldValue, Record, Scalar};

use crate::metafield::META_FIELD_CHARS;

/// A pipeline-internal annotation field, never source content.
pub fn is_meta_field(name: &str) -> bool {
    name.starts_with(META_FIELD_CHARS)
}

/// Converts a record's field map into its comparison-ready form: list
/// values sorted (element order carries no meaning on the source
/// sites), meta fields dropped when exclusion is on. Pure and
/// deterministic; two normalized maps are equal iff their key/value
/// pairs are.
pub fn normalize_record(record: &Record, exclude_meta_fields: bool) -> BTreeMap<String, FieldValue> {
    record
        .fields()
        .iter()
        .filter(|(name, _)| !(exclude_meta_fields && is_meta_field(name)))
        .map(|(name, value)| (name.clone(), normalize_value(value)))
        .collect()
}

fn normalize_value(value: &FieldValue) -> FieldValue {
    match value {
        FieldValue::Many(items) => {
            let mut items = items.clone();
            items.sort_by(Scalar::total_cmp);
            FieldValue::Many(items)
        }
        scalar => scalar.clone(),
    }
}
