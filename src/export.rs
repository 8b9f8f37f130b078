use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use ::time::{macros::format_description, OffsetDateTime};

use crate::types::{CombinedResult, FindingKind};

/// One spreadsheet-style row: a finding and its category.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ExportRow {
    #[serde(rename = "type")]
    pub kind: FindingKind,
    pub value: String,
}

/// Flatten a combined result: subdomains, then IPs, emails and social profiles.
pub fn export_rows(combined: &CombinedResult) -> Vec<ExportRow> {
    combined
        .fields()
        .into_iter()
        .flat_map(|(kind, values)| {
            values.iter().map(move |v| ExportRow {
                kind,
                value: v.clone(),
            })
        })
        .collect()
}

/// `scan_<domain with dots as underscores>_<source>_<YYYY-MM-DD>.json`
pub fn export_file_name(domain: &str, source: &str, at: OffsetDateTime) -> String {
    let date = at
        .format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| String::from("1970-01-01"));
    format!("scan_{}_{}_{}.json", domain.replace('.', "_"), source, date)
}

/// Write the export rows as pretty JSON into `dir` and return the file path.
pub fn write_export(
    dir: &Path,
    domain: &str,
    source: &str,
    at: OffsetDateTime,
    combined: &CombinedResult,
) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create export dir: {}", dir.display()))?;
    let path = dir.join(export_file_name(domain, source, at));
    let file = File::create(&path)
        .with_context(|| format!("failed to create export file: {}", path.display()))?;
    serde_json::to_writer_pretty(file, &export_rows(combined))?;
    Ok(path)
}
