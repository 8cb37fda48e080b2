use std::collections::BTreeMap;

use paswatch_core::{FieldValue, Record};
use strsim::jaro_winkler;

/// Characters that open a meta field name. None of them may start an
/// actual source field.
pub const META_FIELD_CHARS: [char; 3] = ['$', '/', '@'];

/// Prefix of the meta fields stamped by [`FieldGrouper`].
pub const MATCHED_FIELD_PREFIX: &str = "$MATCHED_";

/// Corporate filler that carries no identity when comparing
/// organization names.
const JUNK_WORDS: &[&str] = &[
    "pharmaceuticals",
    "pharma",
    "inc",
    "gmbh",
    "ltd",
    "limited",
    "co",
    "kg",
    "spa",
    "llc",
    "therapeutics",
];

/// Lowercases, strips punctuation and junk company words, collapses
/// whitespace. "Alpha Pharma GmbH" and "alpha-pharma" clean to the
/// same string.
pub fn clean_name(value: &str) -> String {
    let lowered = value.to_lowercase();
    let despecialed: String = lowered
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    despecialed
        .split_whitespace()
        .filter(|word| !JUNK_WORDS.contains(word))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Greedy grouping of free-text values: each value joins the first
/// group whose representative's cleaned form is similar enough,
/// otherwise it starts a group of its own.
pub fn group_values<I>(values: I, cutoff: f64) -> Vec<Vec<String>>
where
    I: IntoIterator<Item = String>,
{
    let mut groups: Vec<(String, Vec<String>)> = Vec::new();
    for value in values {
        let cleaned = clean_name(&value);
        match groups
            .iter_mut()
            .find(|(representative, _)| jaro_winkler(representative, &cleaned) > cutoff)
        {
            Some((_, members)) => members.push(value),
            None => groups.push((cleaned, vec![value])),
        }
    }
    groups.into_iter().map(|(_, members)| members).collect()
}

/// Stamps `$MATCHED_<FIELD>` meta fields carrying the first previously
/// seen value similar to this record's value, so spreadsheet filters
/// can group spelling variants of the same organization.
#[derive(Debug)]
pub struct FieldGrouper {
    fields: Vec<String>,
    cutoff: f64,
    groups: BTreeMap<String, Vec<String>>,
}

impl FieldGrouper {
    /// The cutoff the register's centre names behave well under.
    pub const DEFAULT_CUTOFF: f64 = 0.85;

    pub fn new(fields: Vec<String>, cutoff: f64) -> Self {
        Self {
            fields,
            cutoff,
            groups: BTreeMap::new(),
        }
    }

    pub fn assign(&mut self, record: &mut Record) {
        for field in &self.fields {
            let Some(value) = record.get(field).and_then(FieldValue::as_text) else {
                continue;
            };
            let value = value.to_string();
            let meta_name = format!("{MATCHED_FIELD_PREFIX}{}", field.to_uppercase());
            let cleaned = clean_name(&value);

            let representatives = self.groups.entry(field.clone()).or_default();
            let matched = representatives
                .iter()
                .find(|other| jaro_winkler(&cleaned, &clean_name(other)) > self.cutoff)
                .cloned();
            match matched {
                Some(representative) => {
                    record.set(&meta_name, FieldValue::text(representative));
                }
                None => {
                    representatives.push(value.clone());
                    record.set(&meta_name, FieldValue::text(value));
                }
            }
        }
    }
}
