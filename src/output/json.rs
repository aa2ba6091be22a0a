//! JSON output

use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::protocol::RunReport;
use crate::stats::RunSummary;

#[derive(Serialize)]
struct JsonReport<'a> {
    #[serde(flatten)]
    report: &'a RunReport,
    summary: RunSummary,
}

pub fn output_json(report: &RunReport) -> String {
    let wrapped = JsonReport {
        report,
        summary: RunSummary::from_results(&report.results),
    };
    serde_json::to_string_pretty(&wrapped).unwrap_or_else(|_| "{}".to_string())
}

pub fn save_json(report: &RunReport, path: &Path) -> anyhow::Result<()> {
    let json = output_json(report);
    fs::write(path, json)?;
    Ok(())
}
