// Typed parsing of portal HTML
// Accepts a page body and returns strongly typed results or None

use crate::domain::{CaseSummary, Charge, Degree, Disposition};
use crate::providers::{PortalError, PortalResult};
use crate::utils::date::parse_portal_date;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::sync::OnceLock;
use tracing::{debug, info};

/// One `a.caseLink` anchor from a Smart Search results page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseLink {
    pub case_id: String,
    pub case_number: String,
}

static CASE_ID_PARAM_REGEX: OnceLock<Regex> = OnceLock::new();

fn case_id_param_regex() -> &'static Regex {
    CASE_ID_PARAM_REGEX.get_or_init(|| Regex::new(r"[?&]caseId=([^&#]+)").unwrap())
}

// The portal renders this sentinel instead of results when it is overloaded.
const BUSY_SENTINEL: &str = "having trouble processing";

pub fn is_busy_page(html: &str) -> bool {
    html.to_lowercase().contains(BUSY_SENTINEL)
}

/// A stale session produces the login form instead of the requested page.
pub fn is_login_page(html: &str) -> bool {
    let document = Html::parse_document(html);
    let selector = Selector::parse("form[action*='Account/Login'], input[name='Password']").unwrap();
    document.select(&selector).next().is_some()
}

/// Extract the anti-forgery token from the login form.
pub fn parse_verification_token(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("input[name='__RequestVerificationToken']").unwrap();
    document
        .select(&selector)
        .next()
        .and_then(|input| input.value().attr("value"))
        .map(String::from)
}

/// First case link on a results page. Used by resolve, which only ever takes
/// the top hit for an exact case-number search.
pub fn parse_first_case_link(html: &str) -> Option<CaseLink> {
    parse_case_links(html).into_iter().next()
}

/// Every case link on a results page, in document order, deduplicated by
/// case number. Used by name search, which fans out over all hits.
pub fn parse_case_links(html: &str) -> Vec<CaseLink> {
    let document = Html::parse_document(html);
    let anchor_selector = Selector::parse("a.caseLink").unwrap();
    let number_selector = Selector::parse(".block-link__primary").unwrap();

    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();

    for anchor in document.select(&anchor_selector) {
        let case_number = anchor
            .select(&number_selector)
            .next()
            .map(|el| collect_text(&el))
            .unwrap_or_default();
        if case_number.is_empty() {
            continue;
        }

        let href = anchor
            .value()
            .attr("data-url")
            .or_else(|| anchor.value().attr("href"))
            .unwrap_or_default();
        let Some(case_id) = extract_case_id(href) else {
            continue;
        };

        if seen.insert(case_number.clone()) {
            links.push(CaseLink {
                case_id,
                case_number,
            });
        }
    }

    debug!("Parsed {} case links", links.len());
    links
}

/// The portal `caseId` is carried as a query parameter of the link target,
/// with the last path segment as a fallback.
fn extract_case_id(href: &str) -> Option<String> {
    if let Some(caps) = case_id_param_regex().captures(href) {
        let raw = &caps[1];
        return urlencoding::decode(raw)
            .map(|decoded| decoded.into_owned())
            .ok()
            .or_else(|| Some(raw.to_string()));
    }

    let path = href.split(['?', '#']).next().unwrap_or_default();
    let last = path.trim_end_matches('/').rsplit('/').next()?;
    (!last.is_empty()).then(|| last.to_string())
}

/// Parse a case detail page into a summary. Case name and court are
/// required; a detail page without them is an invalid response.
pub fn parse_case_detail(html: &str) -> PortalResult<CaseSummary> {
    let document = Html::parse_document(html);

    let case_name = select_text(&document, "div.ssCaseDetailCaseStyle")
        .ok_or_else(|| PortalError::Parsing("case detail page has no case style".to_string()))?;
    let court = select_text(&document, "div.ssCaseDetailCourtName")
        .ok_or_else(|| PortalError::Parsing("case detail page has no court name".to_string()))?;

    let charges = parse_charges(&document);
    info!("Parsed case detail with {} charges", charges.len());

    Ok(CaseSummary {
        case_name,
        court,
        charges,
    })
}

// Charge rows and their disposition rows share one table; a disposition row
// always belongs to the charge row above it.
fn parse_charges(document: &Html) -> Vec<Charge> {
    let row_selector = Selector::parse("table.chargesGrid tr").unwrap();
    let cell_selector = Selector::parse("td").unwrap();

    let mut charges: Vec<Charge> = Vec::new();

    for row in document.select(&row_selector) {
        let classes = row.value().attr("class").unwrap_or_default();
        let cells: Vec<String> = row
            .select(&cell_selector)
            .map(|cell| collect_text(&cell))
            .collect();

        if classes.contains("chargeRow") {
            if cells.len() < 2 {
                continue;
            }
            charges.push(Charge {
                description: cells.first().cloned().unwrap_or_default(),
                statute: cells.get(1).cloned().unwrap_or_default(),
                degree: cells.get(2).and_then(|text| parse_degree(text)),
                offense_date: cells.get(3).and_then(|text| parse_portal_date(text)),
                filed_date: cells.get(4).and_then(|text| parse_portal_date(text)),
                fine: cells.get(5).and_then(|text| parse_fine(text)),
                filing_agency: cells
                    .get(6)
                    .map(|text| text.trim().to_string())
                    .filter(|text| !text.is_empty()),
                dispositions: Vec::new(),
            });
        } else if classes.contains("dispositionRow") {
            let Some(charge) = charges.last_mut() else {
                continue;
            };
            let description = cells.get(1).cloned().unwrap_or_default();
            if description.is_empty() {
                continue;
            }
            charge.dispositions.push(Disposition {
                date: cells.first().and_then(|text| parse_portal_date(text)),
                description,
            });
        }
    }

    charges
}

// Degrees render as "F1 - Felony 1" or a bare code.
fn parse_degree(text: &str) -> Option<Degree> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.split_once(" - ") {
        Some((code, description)) => Some(Degree {
            code: code.trim().to_string(),
            description: description.trim().to_string(),
        }),
        None => Some(Degree {
            code: trimmed.to_string(),
            description: trimmed.to_string(),
        }),
    }
}

fn parse_fine(text: &str) -> Option<f64> {
    let cleaned: String = text
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    cleaned.parse().ok()
}

fn select_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    document
        .select(&selector)
        .next()
        .map(|el| collect_text(&el))
        .filter(|text| !text.is_empty())
}

fn collect_text(element: &ElementRef) -> String {
    element
        .text()
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
