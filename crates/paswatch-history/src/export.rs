use std::fs;
use std::path::Path;

use paswatch_core::{FieldValue, Record, Scalar, SourceSchema, SqlType};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection};
use rust_xlsxwriter::{Format, Workbook, XlsxError};
use thiserror::Error;

/// Separator used when a list field is flattened to one cell/column.
const LIST_SEPARATOR: &str = "; ";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("writing export {path}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("encoding export {path}")]
    Json {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error(transparent)]
    Xlsx(#[from] XlsxError),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

/// Writes the corpus as a JSON array of flat record objects, the file
/// a later run loads as its prior snapshot.
pub fn export_json(records: &[Record], path: &Path) -> Result<(), ExportError> {
    let mut bytes = serde_json::to_vec_pretty(records).map_err(|source| ExportError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    bytes.push(b'\n');
    fs::write(path, bytes).map_err(|source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// One-sheet workbook: bold Capital Case header row, a bold counter
/// column, list fields joined with `"; "`.
pub fn export_xlsx(
    records: &[Record],
    schema: &SourceSchema,
    path: &Path,
) -> Result<(), ExportError> {
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name("PAS Studies")?;
    let bold = Format::new().set_bold();

    for (index, spec) in schema.fields.iter().enumerate() {
        worksheet.write_string_with_format(
            0,
            (index + 1) as u16,
            capital_case(spec.name),
            &bold,
        )?;
    }

    for (row_index, record) in records.iter().enumerate() {
        let row = (row_index + 1) as u32;
        worksheet.write_number_with_format(row, 0, (row_index + 1) as f64, &bold)?;
        for (index, spec) in schema.fields.iter().enumerate() {
            let column = (index + 1) as u16;
            let Some(value) = record.get(spec.name) else {
                continue;
            };
            match value {
                FieldValue::One(Scalar::Bool(v)) => {
                    worksheet.write_boolean(row, column, *v)?;
                }
                FieldValue::One(Scalar::Int(v)) => {
                    worksheet.write_number(row, column, *v as f64)?;
                }
                FieldValue::One(Scalar::Float(v)) => {
                    worksheet.write_number(row, column, *v)?;
                }
                FieldValue::One(Scalar::Text(v)) => {
                    worksheet.write_string(row, column, v)?;
                }
                FieldValue::Many(items) => {
                    worksheet.write_string(row, column, join_list(items))?;
                }
            }
        }
    }

    workbook.save(path)?;
    Ok(())
}

/// One table named `study`, columns and types from the schema
/// (`sql_name`/`sql_type` overrides, primary key on the register
/// number, NOT NULL on required fields), one INSERT per record.
pub fn export_sqlite(
    records: &[Record],
    schema: &SourceSchema,
    path: &Path,
) -> Result<(), ExportError> {
    let conn = Connection::open(path)?;

    let columns: Vec<String> = schema
        .fields
        .iter()
        .map(|spec| {
            format!(
                "{}{}{}{}",
                spec.sql_name(),
                match spec.sql_type() {
                    SqlType::Text => " TEXT",
                    SqlType::Integer => " INTEGER",
                    SqlType::Numeric => " NUMERIC",
                },
                if spec.primary_key { " PRIMARY KEY" } else { "" },
                if spec.required { " NOT NULL" } else { "" },
            )
        })
        .collect();
    conn.execute(
        &format!("CREATE TABLE IF NOT EXISTS study ({})", columns.join(", ")),
        [],
    )?;

    let names: Vec<&str> = schema.fields.iter().map(|spec| spec.sql_name()).collect();
    let placeholders = vec!["?"; names.len()].join(",");
    let insert = format!(
        "INSERT INTO study ({}) VALUES ({placeholders})",
        names.join(",")
    );
    let mut statement = conn.prepare(&insert)?;
    for record in records {
        let values = schema
            .fields
            .iter()
            .map(|spec| sql_value(record.get(spec.name), spec.sql_type()));
        statement.execute(params_from_iter(values))?;
    }

    Ok(())
}

fn sql_value(value: Option<&FieldValue>, sql_type: SqlType) -> SqlValue {
    match value {
        None => SqlValue::Null,
        Some(FieldValue::One(Scalar::Bool(v))) => SqlValue::Integer(i64::from(*v)),
        Some(FieldValue::One(Scalar::Int(v))) => match sql_type {
            SqlType::Text => SqlValue::Text(v.to_string()),
            _ => SqlValue::Integer(*v),
        },
        Some(FieldValue::One(Scalar::Float(v))) => SqlValue::Real(*v),
        Some(FieldValue::One(Scalar::Text(v))) => match sql_type {
            // The register number column is INTEGER but travels as text.
            SqlType::Integer => v
                .parse::<i64>()
                .map(SqlValue::Integer)
                .unwrap_or_else(|_| SqlValue::Text(v.clone())),
            _ => SqlValue::Text(v.clone()),
        },
        Some(FieldValue::Many(items)) => SqlValue::Text(join_list(items)),
    }
}

fn join_list(items: &[Scalar]) -> String {
    items
        .iter()
        .map(Scalar::to_string)
        .collect::<Vec<_>>()
        .join(LIST_SEPARATOR)
}

/// `eu_pas_register_number` -> `Eu Pas Register Number`.
fn capital_case(name: &str) -> String {
    name.split('_')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
