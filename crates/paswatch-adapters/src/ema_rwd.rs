//! Adapter for the EMA Real World Data catalogue. The site is a Drupal
//! install: paginated search results and detail pages made of
//! `div.field` blocks with a label and one or more items.

use std::collections::BTreeMap;

use paswatch_core::{
    ema_rwd_schema, FieldKind, FieldValue, Record, SourceSchema, ID_FIELD, URL_FIELD,
};
use scraper::Html;

use crate::serialize::{serialize_date, serialize_document_url, serialize_register_number};
use crate::{
    parse_selector, select_all_texts, select_first_attr, select_first_text, AdapterError,
    ListingPage, ListingRow, PageRequest, RmpCategory, SourceAdapter, StudyFilter,
};

pub const BASE_URL: &str = "https://catalogues.ema.europa.eu";
const QUERY_URL: &str =
    "https://catalogues.ema.europa.eu/search?sort_bef_combine=title_ASC&f%5B0%5D=content_type%3Adarwin_study";

/// Label of each `div.field` block mapped to its schema field. The
/// value shape (single, list, date, count) comes from the schema.
const FIELD_LABELS: &[(&str, &str)] = &[
    ("Study description", "description"),
    ("Was the study requested by a regulator?", "requested_by_regulator"),
    ("Risk management plan category", "risk_management_plan"),
    ("Regulatory procedure number", "regulatory_procedure_number"),
    ("Countries of the study", "countries"),
    ("Planned date of funding contract", "funding_contract_date_planed"),
    ("Actual date of funding contract", "funding_contract_date_actual"),
    ("Planned start of data collection", "data_collection_date_planed"),
    ("Actual start of data collection", "data_collection_date_actual"),
    ("Planned start of data analysis", "data_analysis_date_planed"),
    ("Actual start of data analysis", "data_analysis_date_actual"),
    ("Planned interim report", "iterim_report_date_planed"),
    ("Actual interim report", "iterim_report_date_actual"),
    ("Planned final report", "final_report_date_planed"),
    ("Actual final report", "final_report_date_actual"),
    ("Study protocol", "protocol_document_url"),
    ("Study topic", "study_topic"),
    ("Other study topic", "study_topic_other"),
    ("Study type", "study_type"),
    ("Other study type", "study_type_other"),
    ("Scope of the study", "scopes"),
    ("Non-interventional study design", "non_interventional_study_design"),
    ("Other study design", "non_interventional_study_design_other"),
    ("Brand name", "substance_brand_name"),
    ("Other brand name", "substance_brand_name_other"),
    ("ATC code", "substance_atc"),
    ("Substance INN", "substance_inn"),
    ("Medical conditions", "medical_conditions"),
    ("Additional medical conditions", "additional_medical_conditions"),
    ("Age groups", "age_population"),
    ("Special population", "special_population"),
    ("Other special population", "special_population_other"),
    ("Estimated number of subjects", "number_of_subjects"),
    ("Data sources registered with ENCePP", "data_sources_registered_with_encepp"),
    ("Data sources not registered with ENCePP", "data_sources_not_registered_with_encepp"),
    ("Data source types", "data_source_types"),
    ("Other data source type", "data_source_types_other"),
    ("Outcomes of interest", "outcomes"),
    ("Study results", "result_document_url"),
    ("Latest study results", "latest_result_document_url"),
    ("References", "references"),
    ("Other documents", "other_documents_url"),
];

#[derive(Debug, Clone, Copy)]
pub struct EmaRwdAdapter;

impl SourceAdapter for EmaRwdAdapter {
    fn source_id(&self) -> &'static str {
        "ema_rwd"
    }

    fn schema(&self) -> &'static SourceSchema {
        ema_rwd_schema()
    }

    fn initial_request(&self, filter: &StudyFilter) -> PageRequest {
        let mut url = QUERY_URL.to_string();
        if let Some(category) = filter.rmp_category {
            url.push_str(&format!(
                "&f%5B1%5D=risk_management_plan_category%3A{}",
                rmp_query_value(category)
            ));
        }
        if let Some(register_number) = &filter.register_number {
            url.push_str(&format!("&search_api_fulltext={register_number}"));
        }
        PageRequest::Get { url }
    }

    fn parse_listing(&self, page_url: &str, html: &str) -> Result<ListingPage, AdapterError> {
        let doc = Html::parse_document(html);
        let root = doc.root_element();

        let expected_total = select_first_text(root, ".source-summary-count")?
            .and_then(|text| text.trim_matches(['(', ')']).parse::<i64>().ok());

        let row_sel = parse_selector("div.views-row")?;
        let mut rows = Vec::new();
        for entry in doc.select(&row_sel) {
            let state = select_first_text(entry, ".study-state")?.ok_or_else(|| {
                AdapterError::MissingData {
                    what: "study state",
                    url: page_url.to_string(),
                }
            })?;
            let register_raw = select_first_text(entry, ".study-number")?.ok_or_else(|| {
                AdapterError::MissingData {
                    what: "register number",
                    url: page_url.to_string(),
                }
            })?;
            let title = select_first_text(entry, ".study-title a")?.ok_or_else(|| {
                AdapterError::MissingData {
                    what: "study title",
                    url: page_url.to_string(),
                }
            })?;
            let update_raw = select_first_text(entry, ".study-update-date")?.ok_or_else(|| {
                AdapterError::MissingData {
                    what: "update date",
                    url: page_url.to_string(),
                }
            })?;
            let href = select_first_attr(entry, ".study-title a", "href")?.ok_or_else(|| {
                AdapterError::MissingData {
                    what: "detail link",
                    url: page_url.to_string(),
                }
            })?;

            rows.push(ListingRow {
                register_number: serialize_register_number(&register_raw),
                state,
                title,
                update_date: serialize_date(&update_raw, page_url)?,
                detail_url: resolve_url(page_url, &href),
            });
        }

        let next = select_first_attr(root, "li.pager__item--next a", "href")?
            .map(|href| PageRequest::Get {
                url: resolve_url(page_url, &href),
            });

        Ok(ListingPage {
            expected_total,
            rows,
            next,
        })
    }

    fn parse_detail(&self, html: &str, row: &ListingRow) -> Result<Record, AdapterError> {
        let doc = Html::parse_document(html);
        let blocks = scan_field_blocks(&doc)?;
        let url = row.detail_url.as_str();

        let mut fields: BTreeMap<String, FieldValue> = BTreeMap::new();
        fields.insert(URL_FIELD.to_string(), FieldValue::text(url));
        fields.insert(ID_FIELD.to_string(), FieldValue::text(&row.register_number));
        fields.insert("state".to_string(), FieldValue::text(&row.state));
        fields.insert("title".to_string(), FieldValue::text(&row.title));
        fields.insert("update_date".to_string(), FieldValue::text(&row.update_date));

        if let Some(block) = blocks.get("First published") {
            if let Some(raw) = block.values.first() {
                fields.insert(
                    "registration_date".to_string(),
                    FieldValue::text(serialize_date(raw, url)?),
                );
            }
        }

        let schema = self.schema();
        for (label, field) in FIELD_LABELS {
            let Some(block) = blocks.get(*label) else {
                continue;
            };
            let Some(spec) = schema.spec(field) else {
                continue;
            };

            // Document fields carry their value in the link target.
            if field.ends_with("_url") {
                match spec.kind {
                    FieldKind::TextList => {
                        if !block.links.is_empty() {
                            fields.insert(
                                (*field).to_string(),
                                FieldValue::texts(
                                    block
                                        .links
                                        .iter()
                                        .map(|href| serialize_document_url(BASE_URL, href)),
                                ),
                            );
                        }
                    }
                    _ => {
                        if let Some(href) = block.links.first() {
                            fields.insert(
                                (*field).to_string(),
                                FieldValue::text(serialize_document_url(BASE_URL, href)),
                            );
                        }
                    }
                }
                continue;
            }

            match spec.kind {
                FieldKind::Text => {
                    if let Some(value) = block.values.first() {
                        fields.insert((*field).to_string(), FieldValue::text(value));
                    }
                }
                FieldKind::Date => {
                    if let Some(raw) = block.values.first() {
                        fields.insert(
                            (*field).to_string(),
                            FieldValue::text(serialize_date(raw, url)?),
                        );
                    }
                }
                FieldKind::Integer => {
                    if let Some(raw) = block.values.first() {
                        let cleaned = raw.replace([',', ' '], "");
                        let count =
                            cleaned.parse::<i64>().map_err(|_| AdapterError::BadValue {
                                what: "subject count",
                                value: raw.to_string(),
                                url: url.to_string(),
                            })?;
                        fields.insert((*field).to_string(), FieldValue::int(count));
                    }
                }
                FieldKind::TextList => {
                    if !block.values.is_empty() {
                        fields.insert(
                            (*field).to_string(),
                            FieldValue::texts(block.values.clone()),
                        );
                    }
                }
                // No catalogue field carries an integer list.
                FieldKind::IntegerList => {}
            }
        }

        Ok(Record::from_fields(fields)?)
    }
}

fn rmp_query_value(category: RmpCategory) -> &'static str {
    match category {
        RmpCategory::Category1 => "54331",
        RmpCategory::Category2 => "54332",
        RmpCategory::Category3 => "54333",
        RmpCategory::NonEu => "54334",
        RmpCategory::NotApplicable => "54335",
    }
}

fn resolve_url(page_url: &str, href: &str) -> String {
    if let Some(query) = href.strip_prefix('?') {
        let base = page_url.split('?').next().unwrap_or(page_url);
        return format!("{base}?{query}");
    }
    if href.starts_with('/') {
        return format!("{BASE_URL}{href}");
    }
    href.to_string()
}

#[derive(Debug, Default)]
struct FieldBlock {
    values: Vec<String>,
    links: Vec<String>,
}

fn scan_field_blocks(doc: &Html) -> Result<BTreeMap<String, FieldBlock>, AdapterError> {
    let field_sel = parse_selector("div.field")?;
    let link_sel = parse_selector("a")?;

    let mut blocks: BTreeMap<String, FieldBlock> = BTreeMap::new();
    for field_div in doc.select(&field_sel) {
        let Some(label) = select_first_text(field_div, ".field__label")? else {
            continue;
        };
        let block = blocks.entry(label.trim_end_matches(':').to_string()).or_default();
        block
            .values
            .extend(select_all_texts(field_div, ".field__item")?);
        block.links.extend(
            field_div
                .select(&link_sel)
                .filter_map(|a| a.value().attr("href"))
                .map(str::to_string),
        );
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEARCH_HTML: &str = r#"
    <html><body>
    <div class="source-summary-count">(2)</div>
    <div class="view-content">
      <div class="views-row">
        <span class="study-state">Ongoing</span>
        <span class="study-number">EUPAS48406</span>
        <h3 class="study-title"><a href="/study/48406">A safety study</a></h3>
        <span class="study-update-date">04/05/2022</span>
      </div>
      <div class="views-row">
        <span class="study-state">Finalised</span>
        <span class="study-number">EUPAS50574</span>
        <h3 class="study-title"><a href="/study/50574">Another study</a></h3>
        <span class="study-update-date">17/01/2023</span>
      </div>
    </div>
    <ul class="pager"><li class="pager__item--next"><a href="?page=1">Next</a></li></ul>
    </body></html>"#;

    const STUDY_HTML: &str = r#"
    <html><body><article>
    <div class="field"><div class="field__label">First published</div>
      <div class="field__item">12/03/2021</div></div>
    <div class="field"><div class="field__label">Study type</div>
      <div class="field__item">Non-interventional study</div></div>
    <div class="field"><div class="field__label">Countries of the study</div>
      <div class="field__items">
        <div class="field__item">Sweden</div>
        <div class="field__item">Denmark</div>
      </div></div>
    <div class="field"><div class="field__label">Planned start of data collection</div>
      <div class="field__item">01/06/2021</div></div>
    <div class="field"><div class="field__label">Estimated number of subjects</div>
      <div class="field__item">4,000</div></div>
    <div class="field"><div class="field__label">Outcomes of interest</div>
      <div class="field__items"><div class="field__item">Hospitalisation</div></div></div>
    <div class="field"><div class="field__label">Study protocol</div>
      <div class="field__item"><a href="/documents/protocol-48406.pdf">Protocol</a></div></div>
    </article></body></html>"#;

    fn search_page() -> ListingPage {
        EmaRwdAdapter
            .parse_listing(
                "https://catalogues.ema.europa.eu/search?sort_bef_combine=title_ASC",
                SEARCH_HTML,
            )
            .expect("search page parses")
    }

    #[test]
    fn search_rows_and_pagination_are_extracted() {
        let page = search_page();
        assert_eq!(page.expected_total, Some(2));
        assert_eq!(page.rows.len(), 2);
        assert_eq!(page.rows[0].register_number, "48406");
        assert_eq!(page.rows[0].update_date, "2022-05-04");
        assert_eq!(
            page.rows[0].detail_url,
            "https://catalogues.ema.europa.eu/study/48406"
        );
        assert_eq!(
            page.next,
            Some(PageRequest::Get {
                url: "https://catalogues.ema.europa.eu/search?page=1".to_string()
            })
        );
    }

    #[test]
    fn rmp_filter_extends_the_query() {
        let filter = StudyFilter {
            register_number: None,
            rmp_category: Some(RmpCategory::Category2),
        };
        match EmaRwdAdapter.initial_request(&filter) {
            PageRequest::Get { url } => {
                assert!(url.contains("risk_management_plan_category%3A54332"));
            }
            other => panic!("expected get, got {other:?}"),
        }
    }

    #[test]
    fn study_fields_follow_their_schema_shape() {
        let row = search_page().rows[0].clone();
        let record = EmaRwdAdapter
            .parse_detail(STUDY_HTML, &row)
            .expect("study parses");

        assert_eq!(record.external_id(), "48406");
        assert_eq!(
            record.get("registration_date"),
            Some(&FieldValue::text("2021-03-12"))
        );
        assert_eq!(
            record.get("countries"),
            Some(&FieldValue::texts(["Sweden", "Denmark"]))
        );
        assert_eq!(
            record.get("data_collection_date_planed"),
            Some(&FieldValue::text("2021-06-01"))
        );
        assert_eq!(record.get("number_of_subjects"), Some(&FieldValue::int(4000)));
        assert_eq!(
            record.get("outcomes"),
            Some(&FieldValue::texts(["Hospitalisation"]))
        );
        assert_eq!(
            record.get("protocol_document_url"),
            Some(&FieldValue::text(
                "https://catalogues.ema.europa.eu/documents/protocol-48406.pdf"
            ))
        );
    }
}
