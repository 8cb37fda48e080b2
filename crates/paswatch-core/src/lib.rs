//! Core domain model for paswatch: study records, per-source field
//! schemas and the run statistics counter store.

mod record;
mod schema;
mod stats;

pub use record::{FieldValue, Record, RecordError, Scalar, ID_FIELD, URL_FIELD};
pub use schema::{
    ema_rwd_schema, eu_pas_schema, FieldKind, FieldSpec, SchemaError, SourceSchema, SqlType,
};
pub use stats::RunStats;

pub const CRATE_NAME: &str = "paswatch-core";
