use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::classify::{ChangeEntry, HistoryError};

/// Triage order of a changelog entry. Silent changes (no date bump)
/// come first since they are the ones a reviewer has to explain, then
/// entries whose update date disappeared, then ordinary dated updates.
pub fn date_change_rank(has_date_change: Option<bool>) -> u8 {
    match has_date_change {
        Some(false) => 0,
        None => 1,
        Some(true) => 2,
    }
}

/// Writes the accumulated change entries as one JSON document, sorted
/// by triage rank and register number, tab-indented with stable key
/// order. Nothing is written when there are no entries; writing the
/// same entries twice produces byte-identical files.
pub fn write_changelog(entries: &[ChangeEntry], path: &Path) -> Result<bool, HistoryError> {
    if entries.is_empty() {
        return Ok(false);
    }

    let mut sorted: Vec<&ChangeEntry> = entries.iter().collect();
    sorted.sort_by(|a, b| {
        date_change_rank(a.has_date_change)
            .cmp(&date_change_rank(b.has_date_change))
            .then_with(|| a.external_id.cmp(&b.external_id))
    });

    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    sorted
        .serialize(&mut serializer)
        .map_err(|source| HistoryError::ChangelogEncode {
            path: path.to_path_buf(),
            source,
        })?;
    buf.push(b'\n');

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|source| HistoryError::ChangelogIo {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }
    fs::write(path, buf).map_err(|source| HistoryError::ChangelogIo {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(true)
}
