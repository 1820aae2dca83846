//! Plain-text triage report for an analyzed scan.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::config::{APP_NAME, APP_VERSION};
use crate::pipeline::batch::{ItemStatus, TrackableItem};

const LINE_WIDTH: usize = 78;

const DISCLAIMER: &str = "This report was generated by an automated screening tool and is not a \
diagnosis. All findings must be reviewed and confirmed by a qualified eye-care professional \
before any clinical decision is made.";

/// Render the report for a Success item. `None` for any other item.
pub fn format_report(item: &TrackableItem) -> Option<String> {
    if item.status() != ItemStatus::Success {
        return None;
    }
    let result = item.result()?;
    let rule = "=".repeat(LINE_WIDTH);
    let timestamp = result.backend_timestamp.unwrap_or_else(Utc::now);

    let mut out = String::new();
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "{APP_NAME} v{APP_VERSION} | RETINAL SCAN TRIAGE REPORT");
    let _ = writeln!(out, "{rule}");
    let _ = writeln!(out, "File:            {}", item.file_name());
    let _ = writeln!(out, "Item ID:         {}", item.id());
    let _ = writeln!(out, "Diagnosis:       {}", result.diagnosis);
    let _ = writeln!(out, "Confidence:      {}", result.confidence);
    let _ = writeln!(out, "Mapping:         {}", item.mapping_status());
    let _ = writeln!(out, "Generated:       {}", timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
    let _ = writeln!(out, "Uncertainty:");
    for line in wrap_text(&result.uncertainty_statement, LINE_WIDTH - 2) {
        let _ = writeln!(out, "  {line}");
    }

    section(&mut out, "CLINICAL EXPLANATION", &result.explanation);
    section(&mut out, "INTERPRETABILITY", &result.explainability);
    section(
        &mut out,
        "SEGMENTATION UNCERTAINTY ANALYSIS",
        &result.segmentation_uncertainty_statement,
    );
    if let Some(anomaly) = result.anomaly_report.as_deref().filter(|a| !a.trim().is_empty()) {
        section(&mut out, "ANCILLARY FINDINGS", anomaly);
    }
    section(&mut out, "DISCLAIMER", DISCLAIMER);

    Some(out)
}

/// Write the report next to other exports as `<stem>_report.txt`.
pub fn write_report(dir: &Path, item: &TrackableItem) -> std::io::Result<PathBuf> {
    let report = format_report(item).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("Item {} has no completed analysis", item.id()),
        )
    })?;

    std::fs::create_dir_all(dir)?;
    let stem = Path::new(item.file_name())
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("scan");
    let path = dir.join(format!("{stem}_report.txt"));
    std::fs::write(&path, report)?;

    tracing::info!(item_id = %item.id(), path = %path.display(), "Report written");
    Ok(path)
}

fn section(out: &mut String, title: &str, body: &str) {
    let _ = writeln!(out);
    let _ = writeln!(out, "{title}");
    let _ = writeln!(out, "{}", "-".repeat(title.len()));
    for paragraph in body.lines() {
        for line in wrap_text(paragraph, LINE_WIDTH) {
            let _ = writeln!(out, "{line}");
        }
    }
}

/// Greedy word wrap. Empty input yields one empty line.
fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if !current.is_empty() && current.len() + word.len() + 1 > max_chars {
            lines.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(word);
    }
    if !current.is_empty() || lines.is_empty() {
        lines.push(current);
    }
    lines
}
