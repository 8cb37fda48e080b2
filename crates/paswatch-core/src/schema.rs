use chrono::NaiveDate;
use thiserror::Error;

use crate::record::{FieldValue, Record, Scalar, ID_FIELD, URL_FIELD};

/// Expected shape of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    /// ISO-8601 date carried as text.
    Date,
    TextList,
    IntegerList,
}

/// SQLite column affinity used by the SQL exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlType {
    Text,
    Integer,
    Numeric,
}

/// Declarative metadata for one field of a source's record schema.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
    pub primary_key: bool,
    /// Column name override for the SQL exporter.
    pub sql_name: Option<&'static str>,
    /// Column type override for the SQL exporter.
    pub sql_type: Option<SqlType>,
}

impl FieldSpec {
    pub fn sql_name(&self) -> &'static str {
        self.sql_name.unwrap_or(self.name)
    }

    pub fn sql_type(&self) -> SqlType {
        self.sql_type.unwrap_or(match self.kind {
            FieldKind::Integer => SqlType::Integer,
            _ => SqlType::Text,
        })
    }
}

const fn field(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: false,
        primary_key: false,
        sql_name: None,
        sql_type: None,
    }
}

const fn required(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: true,
        primary_key: false,
        sql_name: None,
        sql_type: None,
    }
}

const fn register_number() -> FieldSpec {
    FieldSpec {
        name: ID_FIELD,
        kind: FieldKind::Text,
        required: true,
        primary_key: true,
        sql_name: None,
        sql_type: Some(SqlType::Integer),
    }
}

const fn named(name: &'static str, kind: FieldKind, sql_name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        kind,
        required: false,
        primary_key: false,
        sql_name: Some(sql_name),
        sql_type: None,
    }
}

const fn int_column(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        kind: FieldKind::Integer,
        required: false,
        primary_key: false,
        sql_name: None,
        sql_type: Some(SqlType::Integer),
    }
}

const fn required_int_column(name: &'static str) -> FieldSpec {
    FieldSpec {
        name,
        kind: FieldKind::Integer,
        required: true,
        primary_key: false,
        sql_name: None,
        sql_type: Some(SqlType::Integer),
    }
}

/// The full field table of one source site.
#[derive(Debug, Clone, Copy)]
pub struct SourceSchema {
    pub source_id: &'static str,
    pub fields: &'static [FieldSpec],
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("{source_id} record {external_id}: required field {field} is missing")]
    MissingField {
        source_id: &'static str,
        external_id: String,
        field: &'static str,
    },
    #[error("{source_id} record {external_id}: field {field} does not match its declared shape")]
    WrongShape {
        source_id: &'static str,
        external_id: String,
        field: &'static str,
    },
}

impl SourceSchema {
    pub fn spec(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|spec| spec.name == name)
    }

    pub fn primary_key(&self) -> &'static FieldSpec {
        self.fields
            .iter()
            .find(|spec| spec.primary_key)
            .unwrap_or(&self.fields[0])
    }

    /// Validates a scraped record against this table: required fields
    /// present, present fields shaped as declared. Fields not in the
    /// table (meta fields among them) are left alone.
    pub fn validate(&self, record: &Record) -> Result<(), SchemaError> {
        for spec in self.fields {
            match record.get(spec.name) {
                None if spec.required => {
                    return Err(SchemaError::MissingField {
                        source_id: self.source_id,
                        external_id: record.external_id().to_string(),
                        field: spec.name,
                    });
                }
                None => {}
                Some(value) => {
                    if !value_matches(value, spec.kind) {
                        return Err(SchemaError::WrongShape {
                            source_id: self.source_id,
                            external_id: record.external_id().to_string(),
                            field: spec.name,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

fn value_matches(value: &FieldValue, kind: FieldKind) -> bool {
    match (kind, value) {
        (FieldKind::Text, FieldValue::One(Scalar::Text(_))) => true,
        (FieldKind::Integer, FieldValue::One(Scalar::Int(_))) => true,
        (FieldKind::Date, FieldValue::One(Scalar::Text(text))) => {
            NaiveDate::parse_from_str(text, "%Y-%m-%d").is_ok()
        }
        (FieldKind::TextList, FieldValue::Many(items)) => {
            items.iter().all(|item| matches!(item, Scalar::Text(_)))
        }
        (FieldKind::IntegerList, FieldValue::Many(items)) => {
            items.iter().all(|item| matches!(item, Scalar::Int(_)))
        }
        _ => false,
    }
}

const EU_PAS_FIELDS: &[FieldSpec] = &[
    required(URL_FIELD, FieldKind::Text),
    register_number(),
    required("state", FieldKind::Text),
    required("title", FieldKind::Text),
    required("update_date", FieldKind::Date),
    required("registration_date", FieldKind::Date),
    field("acronym", FieldKind::Text),
    required("study_type", FieldKind::Text),
    field("description", FieldKind::Text),
    required("requested_by_regulator", FieldKind::Text),
    field("risk_management_plan", FieldKind::Text),
    field("regulatory_procedure_number", FieldKind::Text),
    field("centre_name", FieldKind::Text),
    field("centre_location", FieldKind::Text),
    field("centre_name_of_investigator", FieldKind::Text),
    field("centre_organisation", FieldKind::Text),
    required("collaboration_with_research_network", FieldKind::Text),
    required("country_type", FieldKind::Text),
    required("countries", FieldKind::TextList),
    field("funding_contract_date_planed", FieldKind::Date),
    field("funding_contract_date_actual", FieldKind::Date),
    field("data_collection_date_planed", FieldKind::Date),
    field("data_collection_date_actual", FieldKind::Date),
    field("data_analysis_date_planed", FieldKind::Date),
    field("data_analysis_date_actual", FieldKind::Date),
    field("iterim_report_date_planed", FieldKind::Date),
    field("iterim_report_date_actual", FieldKind::Date),
    field("final_report_date_planed", FieldKind::Date),
    field("final_report_date_actual", FieldKind::Date),
    field("funding_companies_names", FieldKind::TextList),
    int_column("funding_companies_percentage"),
    field("funding_charities_names", FieldKind::TextList),
    int_column("funding_charities_percentage"),
    field("funding_government_body_names", FieldKind::TextList),
    int_column("funding_government_body_percentage"),
    field("funding_research_councils_names", FieldKind::TextList),
    int_column("funding_research_councils_percentage"),
    field("funding_eu_scheme_names", FieldKind::TextList),
    int_column("funding_eu_scheme_percentage"),
    field("funding_other_names", FieldKind::TextList),
    field("funding_other_percentage", FieldKind::IntegerList),
    field("substance_atc", FieldKind::TextList),
    field("substance_inn", FieldKind::TextList),
    required("medical_conditions", FieldKind::TextList),
    field("additional_medical_conditions", FieldKind::Text),
    required("age_population", FieldKind::TextList),
    required("sex_population", FieldKind::TextList),
    field("other_population", FieldKind::TextList),
    required_int_column("number_of_subjects"),
    required("uses_established_data_source", FieldKind::Text),
    required("data_source_types", FieldKind::TextList),
    field("data_sources_registered_with_encepp", FieldKind::TextList),
    field("data_sources_not_registered_with_encepp", FieldKind::TextList),
    required("scopes", FieldKind::TextList),
    required("primary_scope", FieldKind::Text),
    required("primary_outcomes", FieldKind::TextList),
    required("secondary_outcomes", FieldKind::TextList),
    required("study_design", FieldKind::TextList),
    required("follow_up", FieldKind::Text),
    field("protocol_document_url", FieldKind::Text),
    field("latest_protocol_document_url", FieldKind::Text),
    field("result_document_url", FieldKind::Text),
    field("latest_result_document_url", FieldKind::Text),
    named("references", FieldKind::TextList, "document_references"),
    field("other_documents_url", FieldKind::TextList),
];

const EMA_RWD_FIELDS: &[FieldSpec] = &[
    required(URL_FIELD, FieldKind::Text),
    register_number(),
    required("state", FieldKind::Text),
    required("title", FieldKind::Text),
    required("update_date", FieldKind::Date),
    required("registration_date", FieldKind::Date),
    field("description", FieldKind::Text),
    required("requested_by_regulator", FieldKind::Text),
    field("risk_management_plan", FieldKind::Text),
    field("regulatory_procedure_number", FieldKind::Text),
    required("countries", FieldKind::TextList),
    field("funding_contract_date_planed", FieldKind::Date),
    field("funding_contract_date_actual", FieldKind::Date),
    field("data_collection_date_planed", FieldKind::Date),
    field("data_collection_date_actual", FieldKind::Date),
    field("data_analysis_date_planed", FieldKind::Date),
    field("data_analysis_date_actual", FieldKind::Date),
    field("iterim_report_date_planed", FieldKind::Date),
    field("iterim_report_date_actual", FieldKind::Date),
    field("final_report_date_planed", FieldKind::Date),
    field("final_report_date_actual", FieldKind::Date),
    field("protocol_document_url", FieldKind::Text),
    field("study_topic", FieldKind::TextList),
    field("study_topic_other", FieldKind::Text),
    required("study_type", FieldKind::Text),
    field("study_type_other", FieldKind::Text),
    required("scopes", FieldKind::TextList),
    field("non_interventional_study_design", FieldKind::TextList),
    field("non_interventional_study_design_other", FieldKind::Text),
    field("substance_brand_name", FieldKind::TextList),
    field("substance_brand_name_other", FieldKind::Text),
    field("substance_atc", FieldKind::TextList),
    field("substance_inn", FieldKind::TextList),
    required("medical_conditions", FieldKind::TextList),
    field("additional_medical_conditions", FieldKind::Text),
    required("age_population", FieldKind::TextList),
    field("special_population", FieldKind::TextList),
    field("special_population_other", FieldKind::Text),
    required_int_column("number_of_subjects"),
    field("data_sources_registered_with_encepp", FieldKind::TextList),
    field("data_sources_not_registered_with_encepp", FieldKind::TextList),
    required("data_source_types", FieldKind::TextList),
    field("data_source_types_other", FieldKind::Text),
    required("outcomes", FieldKind::TextList),
    field("result_document_url", FieldKind::Text),
    field("latest_result_document_url", FieldKind::Text),
    named("references", FieldKind::TextList, "document_references"),
    field("other_documents_url", FieldKind::TextList),
];

/// Field table of the EU PAS Register on encepp.eu.
pub fn eu_pas_schema() -> &'static SourceSchema {
    static SCHEMA: SourceSchema = SourceSchema {
        source_id: "eu_pas",
        fields: EU_PAS_FIELDS,
    };
    &SCHEMA
}

/// Field table of the EMA Real World Data catalogue.
pub fn ema_rwd_schema() -> &'static SourceSchema {
    static SCHEMA: SourceSchema = SourceSchema {
        source_id: "ema_rwd",
        fields: EMA_RWD_FIELDS,
    };
    &SCHEMA
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn minimal_eu_pas() -> Record {
        let json = serde_json::json!({
            "url": "https://www.encepp.eu/encepp/viewResource.htm?id=1",
            "eu_pas_register_number": "48406",
            "state": "Finalised",
            "title": "A study",
            "update_date": "2023-01-01",
            "registration_date": "2022-05-04",
            "study_type": "Non-interventional study",
            "requested_by_regulator": "No",
            "collaboration_with_research_network": "No",
            "country_type": "National study",
            "countries": ["Germany"],
            "medical_conditions": ["Condition"],
            "age_population": ["Adults (18-44 years)"],
            "sex_population": ["Male", "Female"],
            "number_of_subjects": 1000,
            "uses_established_data_source": "Yes",
            "data_source_types": ["Administrative claims"],
            "scopes": ["Safety"],
            "primary_scope": "Safety",
            "primary_outcomes": ["Outcome"],
            "secondary_outcomes": ["Other outcome"],
            "study_design": ["Cohort"],
            "follow_up": "Yes",
        });
        serde_json::from_value(json).expect("valid record")
    }

    #[test]
    fn complete_record_validates() {
        eu_pas_schema()
            .validate(&minimal_eu_pas())
            .expect("record should pass validation");
    }

    #[test]
    fn missing_required_field_is_reported() {
        let mut fields: BTreeMap<_, _> = minimal_eu_pas().fields().clone();
        fields.remove("title");
        let record = Record::from_fields(fields).expect("record");
        assert!(matches!(
            eu_pas_schema().validate(&record),
            Err(SchemaError::MissingField { field: "title", .. })
        ));
    }

    #[test]
    fn malformed_date_is_reported() {
        let mut record = minimal_eu_pas();
        record.set("update_date", FieldValue::text("01/05/2023"));
        assert!(matches!(
            eu_pas_schema().validate(&record),
            Err(SchemaError::WrongShape {
                field: "update_date",
                ..
            })
        ));
    }

    #[test]
    fn scalar_where_list_expected_is_reported() {
        let mut record = minimal_eu_pas();
        record.set("countries", FieldValue::text("Germany"));
        assert!(matches!(
            eu_pas_schema().validate(&record),
            Err(SchemaError::WrongShape {
                field: "countries",
                ..
            })
        ));
    }

    #[test]
    fn sql_metadata_resolves_overrides() {
        let schema = eu_pas_schema();
        assert_eq!(schema.primary_key().name, ID_FIELD);
        assert_eq!(schema.primary_key().sql_type(), SqlType::Integer);

        let references = schema.spec("references").expect("references spec");
        assert_eq!(references.sql_name(), "document_references");
        assert_eq!(references.sql_type(), SqlType::Text);
    }
}
