//! Field value normalizers shared by the source adapters.

use chrono::NaiveDate;

use crate::AdapterError;

/// Placeholder recorded when a document link leads nowhere.
pub const EMPTY_URL: &str = "Empty Url";

/// Strips one leading `EUPAS` prefix from a register number.
pub fn serialize_register_number(raw: &str) -> String {
    raw.trim().replacen("EUPAS", "", 1)
}

/// Converts the sites' dd/mm/yyyy display dates to ISO-8601.
pub fn serialize_date(raw: &str, url: &str) -> Result<String, AdapterError> {
    NaiveDate::parse_from_str(raw.trim(), "%d/%m/%Y")
        .map(|date| date.format("%Y-%m-%d").to_string())
        .map_err(|_| AdapterError::BadValue {
            what: "date",
            value: raw.to_string(),
            url: url.to_string(),
        })
}

/// Strips one leading `Primary scope : ` label from a scope value.
pub fn serialize_primary_scope(raw: &str) -> String {
    raw.replacen("Primary scope : ", "", 1)
}

/// Normalizes a document link as found in detail pages.
///
/// Absolute URLs pass through unchanged (they may be external).
/// Relative paths lose their `;jsessionid` segment and gain the site
/// base; a relative path ending in `/` goes nowhere on these sites and
/// collapses to the [`EMPTY_URL`] placeholder, as does an empty href.
pub fn serialize_document_url(base_url: &str, raw: &str) -> String {
    if raw.is_empty() {
        return EMPTY_URL.to_string();
    }
    if !raw.starts_with('/') {
        return raw.to_string();
    }
    let path = raw.split(';').next().unwrap_or(raw);
    if path.ends_with('/') {
        return EMPTY_URL.to_string();
    }
    format!("{base_url}{path}")
}

/// Drops a `;jsessionid=...` segment from a URL while keeping its query.
pub fn strip_session_id(url: &str) -> String {
    let Some(start) = url.find(";jsessionid") else {
        return url.to_string();
    };
    let rest = &url[start..];
    match rest.find('?') {
        Some(query) => format!("{}{}", &url[..start], &rest[query..]),
        None => url[..start].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://www.encepp.eu";

    #[test]
    fn register_number_strips_one_prefix() {
        assert_eq!(serialize_register_number("EUPAS123"), "123");
        assert_eq!(serialize_register_number("EUPAS31415"), "31415");
        assert_eq!(serialize_register_number("EUPAS123EUPAS"), "123EUPAS");
        assert_eq!(
            serialize_register_number("hello this is a test"),
            "hello this is a test"
        );
    }

    #[test]
    fn dates_convert_to_iso() {
        assert_eq!(serialize_date("01/02/2003", "u").unwrap(), "2003-02-01");
        assert_eq!(serialize_date("31/05/9999", "u").unwrap(), "9999-05-31");
        assert_eq!(serialize_date(" 04/05/2022 ", "u").unwrap(), "2022-05-04");
    }

    #[test]
    fn malformed_dates_are_rejected() {
        assert!(serialize_date("01-02-2003", "u").is_err());
        assert!(serialize_date("01.12.99", "u").is_err());
        assert!(serialize_date("32/01/2003", "u").is_err());
    }

    #[test]
    fn primary_scope_strips_one_label() {
        assert_eq!(
            serialize_primary_scope("Primary scope : Hello this is a scope"),
            "Hello this is a scope"
        );
        assert_eq!(serialize_primary_scope("Primary scope : "), "");
        assert_eq!(
            serialize_primary_scope("Primary scope : Primary scope : "),
            "Primary scope : "
        );
        assert_eq!(
            serialize_primary_scope("hello this is a test"),
            "hello this is a test"
        );
    }

    #[test]
    fn document_urls_normalize() {
        assert_eq!(serialize_document_url(BASE, ""), EMPTY_URL);
        assert_eq!(
            serialize_document_url(BASE, "https://elsewhere.example/doc.pdf"),
            "https://elsewhere.example/doc.pdf"
        );
        assert_eq!(
            serialize_document_url(BASE, "/encepp/openAttachment/123;jsessionid=ABC"),
            format!("{BASE}/encepp/openAttachment/123")
        );
        assert_eq!(serialize_document_url(BASE, "/encepp/"), EMPTY_URL);
    }

    #[test]
    fn session_ids_are_stripped_with_query_kept() {
        assert_eq!(
            strip_session_id("https://www.encepp.eu/encepp/viewResource.htm;jsessionid=4F2A?id=5"),
            "https://www.encepp.eu/encepp/viewResource.htm?id=5"
        );
        assert_eq!(
            strip_session_id("https://www.encepp.eu/encepp/viewResource.htm?id=5"),
            "https://www.encepp.eu/encepp/viewResource.htm?id=5"
        );
        assert_eq!(
            strip_session_id("https://www.encepp.eu/encepp/viewResource.htm;jsessionid=4F2A"),
            "https://www.encepp.eu/encepp/viewResource.htm"
        );
    }
}
