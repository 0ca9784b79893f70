// Export service for ZipCase
// Builds spreadsheet exports; an XLSX file is a ZIP of OOXML parts

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use std::collections::HashSet;
use std::io::{Cursor, Write};
use std::sync::Arc;
use tracing::{info, instrument};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use crate::domain::{CaseSummary, FetchStatus};
use crate::services::case_store::CaseStore;
use crate::utils::date::export_timestamp;

const SHEET_COLUMNS: [&str; 12] = [
    "Case Number",
    "Status",
    "Case Name",
    "Court",
    "Charge",
    "Statute",
    "Degree",
    "Offense Date",
    "Filed Date",
    "Fine",
    "Dispositions",
    "Filing Agency",
];

/// A finished export ready to stream to the client.
#[derive(Debug, Clone)]
pub struct ExportFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

enum Cell {
    Text(String),
    Number(f64),
    Empty,
}

pub struct ExportService {
    cases: Arc<CaseStore>,
}

impl ExportService {
    pub fn new(cases: Arc<CaseStore>) -> Self {
        Self { cases }
    }

    /// Export the requested cases as a spreadsheet. `notFound` cases are
    /// excluded; cases without a summary export as a bare status row.
    #[instrument(skip(self, case_numbers))]
    pub async fn export_xlsx(&self, case_numbers: &[String]) -> Result<ExportFile> {
        let mut rows: Vec<Vec<Cell>> = Vec::new();
        rows.push(
            SHEET_COLUMNS
                .iter()
                .map(|name| Cell::Text((*name).to_string()))
                .collect(),
        );

        let mut seen = HashSet::new();
        for case_number in case_numbers {
            if !seen.insert(case_number.clone()) {
                continue;
            }
            let Some(case) = self.cases.get(case_number).await? else {
                continue;
            };
            if case.fetch_status == FetchStatus::NotFound {
                continue;
            }

            let summary = match self.cases.read_summary_raw(case_number).await? {
                Some(raw) => CaseSummary::parse_well_formed(&raw),
                None => None,
            };

            let status = status_label(&case.fetch_status);
            match summary {
                Some(summary) if !summary.charges.is_empty() => {
                    for charge in &summary.charges {
                        rows.push(vec![
                            Cell::Text(case_number.clone()),
                            Cell::Text(status.clone()),
                            Cell::Text(summary.case_name.clone()),
                            Cell::Text(summary.court.clone()),
                            Cell::Text(charge.description.clone()),
                            Cell::Text(charge.statute.clone()),
                            charge
                                .degree
                                .as_ref()
                                .map(|degree| Cell::Text(degree.code.clone()))
                                .unwrap_or(Cell::Empty),
                            date_cell(charge.offense_date),
                            date_cell(charge.filed_date),
                            charge.fine.map(Cell::Number).unwrap_or(Cell::Empty),
                            dispositions_cell(charge),
                            charge
                                .filing_agency
                                .clone()
                                .map(Cell::Text)
                                .unwrap_or(Cell::Empty),
                        ]);
                    }
                }
                Some(summary) => {
                    rows.push(vec![
                        Cell::Text(case_number.clone()),
                        Cell::Text(status),
                        Cell::Text(summary.case_name.clone()),
                        Cell::Text(summary.court.clone()),
                        Cell::Empty,
                        Cell::Empty,
                        Cell::Empty,
                        Cell::Empty,
                        Cell::Empty,
                        Cell::Empty,
                        Cell::Empty,
                        Cell::Empty,
                    ]);
                }
                None => {
                    let mut row = vec![Cell::Text(case_number.clone()), Cell::Text(status)];
                    row.resize_with(SHEET_COLUMNS.len(), || Cell::Empty);
                    rows.push(row);
                }
            }
        }

        let filename = format!("ZipCase-Export-{}.xlsx", export_timestamp(Utc::now()));
        let bytes = build_workbook(&rows)?;
        info!("Built export {} with {} rows", filename, rows.len() - 1);

        Ok(ExportFile { filename, bytes })
    }
}

fn status_label(status: &FetchStatus) -> String {
    match status.message() {
        Some(message) => format!("{} ({})", status.kind(), message),
        None => status.kind().to_string(),
    }
}

fn date_cell(date: Option<NaiveDate>) -> Cell {
    date.map(|d| Cell::Text(d.format("%m/%d/%Y").to_string()))
        .unwrap_or(Cell::Empty)
}

fn dispositions_cell(charge: &crate::domain::Charge) -> Cell {
    if charge.dispositions.is_empty() {
        return Cell::Empty;
    }
    let joined = charge
        .dispositions
        .iter()
        .map(|d| match d.date {
            Some(date) => format!("{} ({})", d.description, date.format("%m/%d/%Y")),
            None => d.description.clone(),
        })
        .collect::<Vec<_>>()
        .join("; ");
    Cell::Text(joined)
}

fn build_workbook(rows: &[Vec<Cell>]) -> Result<Vec<u8>> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default();

    zip.start_file("[Content_Types].xml", options)
        .context("Failed to start content types part")?;
    zip.write_all(CONTENT_TYPES_XML.as_bytes())?;

    zip.start_file("_rels/.rels", options)
        .context("Failed to start package rels part")?;
    zip.write_all(PACKAGE_RELS_XML.as_bytes())?;

    zip.start_file("xl/workbook.xml", options)
        .context("Failed to start workbook part")?;
    zip.write_all(WORKBOOK_XML.as_bytes())?;

    zip.start_file("xl/_rels/workbook.xml.rels", options)
        .context("Failed to start workbook rels part")?;
    zip.write_all(WORKBOOK_RELS_XML.as_bytes())?;

    zip.start_file("xl/worksheets/sheet1.xml", options)
        .context("Failed to start worksheet part")?;
    zip.write_all(sheet_xml(rows).as_bytes())?;

    let cursor = zip.finish().context("Failed to finish workbook archive")?;
    Ok(cursor.into_inner())
}

fn sheet_xml(rows: &[Vec<Cell>]) -> String {
    let mut xml = String::from(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );

    for (row_index, row) in rows.iter().enumerate() {
        xml.push_str(&format!(r#"<row r="{}">"#, row_index + 1));
        for cell in row {
            match cell {
                Cell::Text(text) => {
                    xml.push_str(r#"<c t="inlineStr"><is><t>"#);
                    xml.push_str(&xml_escape(text));
                    xml.push_str("</t></is></c>");
                }
                Cell::Number(value) => {
                    xml.push_str(&format!("<c><v>{}</v></c>", value));
                }
                Cell::Empty => xml.push_str("<c/>"),
            }
        }
        xml.push_str("</row>");
    }

    xml.push_str("</sheetData></worksheet>");
    xml
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

const CONTENT_TYPES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#;

const PACKAGE_RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const WORKBOOK_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Cases" sheetId="1" r:id="rId1"/></sheets></workbook>"#;

const WORKBOOK_RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;
