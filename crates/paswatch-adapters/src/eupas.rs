//! Adapter for the EU PAS Register on encepp.eu: a form-POST search
//! returning one table of studies, and detail pages built from
//! label/value span rows spread over four tabs.

use std::collections::{BTreeMap, BTreeSet};

use paswatch_core::{eu_pas_schema, FieldValue, Record, Scalar, SourceSchema, ID_FIELD, URL_FIELD};
use scraper::{ElementRef, Html};

use crate::serialize::{
    serialize_date, serialize_document_url, serialize_primary_scope, serialize_register_number,
    strip_session_id,
};
use crate::{
    element_text, parse_selector, select_first_attr, AdapterError, ListingPage, ListingRow,
    PageRequest, SourceAdapter, StudyFilter,
};

pub const BASE_URL: &str = "https://www.encepp.eu";
const QUERY_URL: &str = "https://www.encepp.eu/encepp/studySearch.htm";

/// Single-value rows: label span followed by one value span.
const TEXT_LABELS: &[(&str, &str)] = &[
    ("Study type", "study_type"),
    ("Acronym", "acronym"),
    ("Description", "description"),
    ("Was the study requested by a regulator?", "requested_by_regulator"),
    ("Is the study required by a Risk Management Plan?", "risk_management_plan"),
    ("Regulatory procedure number", "regulatory_procedure_number"),
    ("Name of centre", "centre_name"),
    ("Location", "centre_location"),
    ("Name of principal investigator", "centre_name_of_investigator"),
    ("Organisation", "centre_organisation"),
    (
        "Is this study being carried out with the collaboration of a research network?",
        "collaboration_with_research_network",
    ),
    ("Study conducted in", "country_type"),
    ("Does the study use an established data source?", "uses_established_data_source"),
    ("Follow-up of patients", "follow_up"),
    ("Additional medical conditions", "additional_medical_conditions"),
];

/// Rows whose values live in a list under the label.
const LIST_LABELS: &[(&str, &str)] = &[
    ("Countries", "countries"),
    ("Medical conditions to be studied", "medical_conditions"),
    ("Age groups", "age_population"),
    ("Sex", "sex_population"),
    ("Other population", "other_population"),
    ("Data source types", "data_source_types"),
    ("Data sources registered with ENCePP", "data_sources_registered_with_encepp"),
    ("Data sources not registered with ENCePP", "data_sources_not_registered_with_encepp"),
    ("Primary outcome(s)", "primary_outcomes"),
    ("Secondary outcome(s)", "secondary_outcomes"),
    ("Study design", "study_design"),
    ("References", "references"),
];

/// Timeline rows: label span, planned-date span, actual-date span.
const DATE_ROWS: &[(&str, &str, &str)] = &[
    ("Date of funding contract", "funding_contract_date_planed", "funding_contract_date_actual"),
    ("Start of data collection", "data_collection_date_planed", "data_collection_date_actual"),
    ("Start of data analysis", "data_analysis_date_planed", "data_analysis_date_actual"),
    ("Interim report", "iterim_report_date_planed", "iterim_report_date_actual"),
    ("Final report of study results", "final_report_date_planed", "final_report_date_actual"),
];

/// Funding rows: label span, names span (semicolon-joined), percentage span.
const FUNDING_ROWS: &[(&str, &str, &str)] = &[
    ("Pharmaceutical company", "funding_companies_names", "funding_companies_percentage"),
    ("Charities", "funding_charities_names", "funding_charities_percentage"),
    ("Government body", "funding_government_body_names", "funding_government_body_percentage"),
    ("Research councils", "funding_research_councils_names", "funding_research_councils_percentage"),
    ("EU funding scheme", "funding_eu_scheme_names", "funding_eu_scheme_percentage"),
];

/// Document rows carrying a link instead of a text value.
const LINK_LABELS: &[(&str, &str)] = &[
    ("Study protocol", "protocol_document_url"),
    ("Latest study protocol", "latest_protocol_document_url"),
    ("Study results", "result_document_url"),
    ("Latest study results", "latest_result_document_url"),
];

#[derive(Debug, Clone, Copy)]
pub struct EuPasAdapter;

impl SourceAdapter for EuPasAdapter {
    fn source_id(&self) -> &'static str {
        "eu_pas"
    }

    fn schema(&self) -> &'static SourceSchema {
        eu_pas_schema()
    }

    fn initial_request(&self, filter: &StudyFilter) -> PageRequest {
        let register_number = filter.register_number.as_deref().unwrap_or("");
        let rmp = filter
            .rmp_category
            .map(|category| rmp_query_value(category).to_string())
            .unwrap_or_default();
        let body = if register_number.is_empty() && rmp.is_empty() {
            String::new()
        } else {
            format!("studyCriteria.resourceLabel={register_number}&studyCriteria.studyRMP={rmp}")
        };
        PageRequest::PostForm {
            url: QUERY_URL.to_string(),
            body,
        }
    }

    fn parse_listing(&self, page_url: &str, html: &str) -> Result<ListingPage, AdapterError> {
        let doc = Html::parse_document(html);
        let centre_sel = parse_selector("div.insidecentre")?;
        let centre = doc
            .select(&centre_sel)
            .next()
            .ok_or_else(|| AdapterError::MissingData {
                what: "listing content",
                url: page_url.to_string(),
            })?;

        let count_sel = parse_selector("h5")?;
        let expected_total = centre
            .select(&count_sel)
            .next()
            .and_then(element_text)
            .and_then(|text| text.split_whitespace().next()?.parse::<i64>().ok());

        let row_sel = parse_selector("table tr")?;
        let cell_sel = parse_selector("td")?;
        let mut rows = Vec::new();
        for tr in centre.select(&row_sel).skip(1) {
            let cells: Vec<ElementRef> = tr.select(&cell_sel).collect();
            if cells.len() < 4 {
                continue;
            }
            let state = element_text(cells[0]).ok_or_else(|| AdapterError::MissingData {
                what: "study state",
                url: page_url.to_string(),
            })?;
            let register_raw = element_text(cells[1]).ok_or_else(|| AdapterError::MissingData {
                what: "register number",
                url: page_url.to_string(),
            })?;
            let title = element_text(cells[2]).ok_or_else(|| AdapterError::MissingData {
                what: "study title",
                url: page_url.to_string(),
            })?;
            let update_raw = element_text(cells[3]).ok_or_else(|| AdapterError::MissingData {
                what: "update date",
                url: page_url.to_string(),
            })?;
            let href = select_first_attr(cells[2], "a", "href")?.ok_or_else(|| {
                AdapterError::MissingData {
                    what: "detail link",
                    url: page_url.to_string(),
                }
            })?;
            let detail_url = if href.starts_with('/') {
                strip_session_id(&format!("{BASE_URL}{href}"))
            } else {
                strip_session_id(&href)
            };

            rows.push(ListingRow {
                register_number: serialize_register_number(&register_raw),
                state,
                title,
                update_date: serialize_date(&update_raw, page_url)?,
                detail_url,
            });
        }

        Ok(ListingPage {
            expected_total,
            rows,
            // The register answers a search POST with one full table.
            next: None,
        })
    }

    fn parse_detail(&self, html: &str, row: &ListingRow) -> Result<Record, AdapterError> {
        let doc = Html::parse_document(html);
        let blocks = scan_labeled_blocks(&doc)?;
        let url = row.detail_url.as_str();

        let mut fields: BTreeMap<String, FieldValue> = BTreeMap::new();
        fields.insert(URL_FIELD.to_string(), FieldValue::text(url));
        fields.insert(ID_FIELD.to_string(), FieldValue::text(&row.register_number));
        fields.insert("state".to_string(), FieldValue::text(&row.state));
        fields.insert("title".to_string(), FieldValue::text(&row.title));
        fields.insert("update_date".to_string(), FieldValue::text(&row.update_date));

        if let Some(raw) = blocks.first_value("First registered") {
            fields.insert(
                "registration_date".to_string(),
                FieldValue::text(serialize_date(raw, url)?),
            );
        }

        for (label, field) in TEXT_LABELS {
            if let Some(value) = blocks.first_value(label) {
                fields.insert((*field).to_string(), FieldValue::text(value));
            }
        }

        for (label, field) in LIST_LABELS {
            let items = blocks.items(label);
            if !items.is_empty() {
                fields.insert((*field).to_string(), FieldValue::texts(items));
            }
        }

        for (label, planed, actual) in DATE_ROWS {
            let values = blocks.values(label);
            if let Some(date) = values.first().and_then(|raw| serialize_date(raw, url).ok()) {
                fields.insert((*planed).to_string(), FieldValue::text(date));
            }
            if let Some(date) = values.get(1).and_then(|raw| serialize_date(raw, url).ok()) {
                fields.insert((*actual).to_string(), FieldValue::text(date));
            }
        }

        for (label, names_field, percentage_field) in FUNDING_ROWS {
            let values = blocks.values(label);
            if let Some(names) = values.first() {
                let names: Vec<String> = names
                    .split(';')
                    .filter_map(|name| {
                        let name = name.trim();
                        (!name.is_empty()).then(|| name.to_string())
                    })
                    .collect();
                if !names.is_empty() {
                    fields.insert((*names_field).to_string(), FieldValue::texts(names));
                }
            }
            if let Some(percentage) = values.get(1).and_then(|raw| parse_percentage(raw)) {
                fields.insert((*percentage_field).to_string(), FieldValue::int(percentage));
            }
        }

        // "Other" funding rows repeat; their name/percentage spans alternate.
        let other = blocks.values("Other sources of funding");
        let mut other_names = Vec::new();
        let mut other_percentages = Vec::new();
        for pair in other.chunks(2) {
            if let Some(name) = pair.first() {
                other_names.push(name.to_string());
            }
            if let Some(percentage) = pair.get(1).and_then(|raw| parse_percentage(raw)) {
                other_percentages.push(Scalar::Int(percentage));
            }
        }
        if !other_names.is_empty() {
            fields.insert(
                "funding_other_names".to_string(),
                FieldValue::texts(other_names),
            );
        }
        if !other_percentages.is_empty() {
            fields.insert(
                "funding_other_percentage".to_string(),
                FieldValue::Many(other_percentages),
            );
        }

        for (substance_label, field) in [
            ("Substance INN", "substance_inn"),
            ("Substance class (ATC)", "substance_atc"),
        ] {
            let unique: BTreeSet<String> = blocks
                .values(substance_label)
                .iter()
                .map(|value| value.to_string())
                .collect();
            if !unique.is_empty() {
                fields.insert((*field).to_string(), FieldValue::texts(unique));
            }
        }

        if let Some(raw) = blocks.first_value("Estimated number of subjects") {
            let cleaned = raw.replace([',', ' '], "");
            let count = cleaned
                .parse::<i64>()
                .map_err(|_| AdapterError::BadValue {
                    what: "number of subjects",
                    value: raw.to_string(),
                    url: url.to_string(),
                })?;
            fields.insert("number_of_subjects".to_string(), FieldValue::int(count));
        }

        let scope_items = blocks.items("Scope of the study");
        if !scope_items.is_empty() {
            let mut scopes = Vec::new();
            for item in &scope_items {
                let stripped = serialize_primary_scope(item);
                if stripped != *item {
                    fields.insert("primary_scope".to_string(), FieldValue::text(&stripped));
                }
                scopes.push(stripped);
            }
            fields.insert("scopes".to_string(), FieldValue::texts(scopes));
        }

        for (label, field) in LINK_LABELS {
            if let Some(href) = blocks.first_link(label) {
                fields.insert(
                    (*field).to_string(),
                    FieldValue::text(serialize_document_url(BASE_URL, href)),
                );
            }
        }
        let other_documents = blocks.links("Other relevant documents");
        if !other_documents.is_empty() {
            fields.insert(
                "other_documents_url".to_string(),
                FieldValue::texts(
                    other_documents
                        .iter()
                        .map(|href| serialize_document_url(BASE_URL, href)),
                ),
            );
        }

        Ok(Record::from_fields(fields)?)
    }
}

fn rmp_query_value(category: crate::RmpCategory) -> &'static str {
    use crate::RmpCategory::*;
    match category {
        NotApplicable => "1",
        Category1 => "2",
        Category2 => "3",
        Category3 => "4",
        NonEu => "5",
    }
}

fn parse_percentage(raw: &str) -> Option<i64> {
    raw.trim().trim_end_matches('%').trim().parse().ok()
}

#[derive(Debug, Default)]
struct LabeledBlock {
    values: Vec<String>,
    items: Vec<String>,
    links: Vec<String>,
}

#[derive(Debug, Default)]
struct LabeledBlocks(BTreeMap<String, LabeledBlock>);

impl LabeledBlocks {
    fn first_value(&self, label: &str) -> Option<&str> {
        self.0
            .get(label)
            .and_then(|block| block.values.first())
            .map(String::as_str)
    }

    fn values(&self, label: &str) -> &[String] {
        self.0
            .get(label)
            .map(|block| block.values.as_slice())
            .unwrap_or(&[])
    }

    fn items(&self, label: &str) -> Vec<String> {
        self.0
            .get(label)
            .map(|block| block.items.clone())
            .unwrap_or_default()
    }

    fn first_link(&self, label: &str) -> Option<&str> {
        self.0
            .get(label)
            .and_then(|block| block.links.first())
            .map(String::as_str)
    }

    fn links(&self, label: &str) -> Vec<String> {
        self.0
            .get(label)
            .map(|block| block.links.clone())
            .unwrap_or_default()
    }
}

fn child_spans<'a>(div: ElementRef<'a>) -> Vec<ElementRef<'a>> {
    div.children()
        .filter_map(ElementRef::wrap)
        .filter(|element| element.value().name() == "span")
        .collect()
}

/// Collects every label/value row of the detail page, keyed by label.
/// Rows repeating a label (substances, "other" funding) accumulate.
fn scan_labeled_blocks(doc: &Html) -> Result<LabeledBlocks, AdapterError> {
    let div_sel = parse_selector("div")?;
    let item_sel = parse_selector("ul li")?;
    let link_sel = parse_selector("a")?;

    let mut blocks = LabeledBlocks::default();
    for div in doc.select(&div_sel) {
        let spans = child_spans(div);
        let Some(first) = spans.first() else { continue };
        let Some(label) = element_text(*first) else {
            continue;
        };
        let label = label.trim_end_matches(':').trim().to_string();
        if label.is_empty() {
            continue;
        }

        // Substance rows interleave label and value spans in one div.
        if label.starts_with("Substance") && spans.len() >= 2 {
            for pair in spans.chunks(2) {
                let (Some(pair_label), Some(value)) = (
                    pair.first().and_then(|span| element_text(*span)),
                    pair.get(1).and_then(|span| element_text(*span)),
                ) else {
                    continue;
                };
                let pair_label = pair_label.trim_end_matches(':').trim().to_string();
                blocks.0.entry(pair_label).or_default().values.push(value);
            }
            continue;
        }

        let block = blocks.0.entry(label).or_default();
        block
            .values
            .extend(spans[1..].iter().filter_map(|span| element_text(*span)));
        block.items.extend(div.select(&item_sel).filter_map(element_text));
        block.links.extend(
            div.select(&link_sel)
                .filter_map(|a| a.value().attr("href"))
                .map(str::to_string),
        );
    }
    Ok(blocks)
}
