//! Report rendering.
//!
//! Turns the rows of a usage report into column-aligned text, CSV, or JSON.
//! Aggregated reports carry min/max/avg triplets for the seat counters;
//! cells collapse to a single value when every sample in the bucket agreed,
//! and spell out `min/max/avg` otherwise. The caller picks which optional
//! columns appear; the feature id is off by default and everything else on.
//!
//! Timestamps render as local `%Y-%m-%d %H:%M:%S`; a missing expiration
//! renders as `permanent`.

use std::io::Write;
use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{Local, TimeZone};
use serde_json::json;

use crate::check::percent_used;
use crate::report::{Aggregate, IntRange, UsageRow};

/// Output format for the report and ls front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Column,
    Csv,
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "column" => Ok(OutputFormat::Column),
            "csv" => Ok(OutputFormat::Csv),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown format '{other}' (expected column, csv, or json)")),
        }
    }
}

/// Which optional columns a report includes.
#[derive(Debug, Clone, Copy)]
pub struct FieldSelection {
    pub id: bool,
    pub counts: bool,
    pub percent: bool,
    pub expiration: bool,
    pub checked: bool,
}

impl Default for FieldSelection {
    fn default() -> Self {
        Self {
            id: false,
            counts: true,
            percent: true,
            expiration: true,
            checked: true,
        }
    }
}

/// How a report is rendered.
#[derive(Debug, Default)]
pub struct RenderOptions {
    pub format: OutputFormat,
    /// Suppress the header lines (column and CSV output only).
    pub no_headers: bool,
    pub fields: FieldSelection,
}

/// Render report rows produced with the given aggregate mode.
pub fn render(
    out: &mut impl Write,
    rows: &[UsageRow],
    aggregate: Aggregate,
    options: &RenderOptions,
) -> Result<()> {
    let ranged = aggregate != Aggregate::None;
    match options.format {
        OutputFormat::Column => render_columns(out, rows, ranged, options),
        OutputFormat::Csv => render_csv(out, rows, ranged, options),
        OutputFormat::Json => render_json(out, rows),
    }
}

fn headers(fields: &FieldSelection, ranged: bool) -> Vec<String> {
    let mut labels = Vec::new();
    if fields.id {
        labels.push("id".to_string());
    }
    labels.extend(["feature", "vendor", "version"].map(String::from));
    let triplet = |name: &str, labels: &mut Vec<String>| {
        if ranged {
            labels.push(format!("{name} min"));
            labels.push(format!("{name} max"));
            labels.push(format!("{name} avg"));
        } else {
            labels.push(name.to_string());
        }
    };
    if fields.counts {
        triplet("in use", &mut labels);
        triplet("issued", &mut labels);
    }
    if fields.percent {
        triplet("percent", &mut labels);
    }
    if fields.expiration {
        labels.push("expiration".to_string());
    }
    if fields.checked {
        if ranged {
            labels.push("check start".to_string());
            labels.push("check end".to_string());
        } else {
            labels.push("checked".to_string());
        }
    }
    labels
}

fn format_timestamp(ts: i64) -> String {
    match Local.timestamp_opt(ts, 0).single() {
        Some(when) => when.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => ts.to_string(),
    }
}

fn format_expiration(expiration: Option<i64>) -> String {
    match expiration {
        Some(ts) => format_timestamp(ts),
        None => "permanent".to_string(),
    }
}

fn percent_range(row: &UsageRow) -> IntRange {
    IntRange {
        min: percent_used(row.in_use.min, row.issued.min),
        max: percent_used(row.in_use.max, row.issued.max),
        avg: percent_used(row.in_use.avg, row.issued.avg),
    }
}

/// `min/max/avg`, collapsed to one value when the bucket never varied.
fn range_cell(range: IntRange) -> String {
    if range.min == range.max {
        range.avg.to_string()
    } else {
        format!("{}/{}/{}", range.min, range.max, range.avg)
    }
}

fn column_cells(row: &UsageRow, fields: &FieldSelection, ranged: bool) -> Vec<String> {
    let mut cells = Vec::new();
    if fields.id {
        cells.push(row.feature_id.to_string());
    }
    cells.push(row.feature.clone());
    cells.push(row.vendor.clone());
    cells.push(row.version.clone());
    let push_range = |range: IntRange, cells: &mut Vec<String>| {
        if ranged {
            cells.push(range.min.to_string());
            cells.push(range.max.to_string());
            cells.push(range.avg.to_string());
        } else {
            cells.push(range.avg.to_string());
        }
    };
    if fields.counts {
        push_range(row.in_use, &mut cells);
        push_range(row.issued, &mut cells);
    }
    if fields.percent {
        push_range(percent_range(row), &mut cells);
    }
    if fields.expiration {
        cells.push(format_expiration(row.expiration));
    }
    if fields.checked {
        cells.push(format_timestamp(row.checked.start));
        if ranged {
            cells.push(format_timestamp(row.checked.end));
        }
    }
    cells
}

/// Column cells differ from CSV cells in one way: the three range columns
/// fold into a single `min/max/avg` cell so the table stays readable.
fn folded_cells(row: &UsageRow, fields: &FieldSelection, ranged: bool) -> Vec<String> {
    let mut cells = Vec::new();
    if fields.id {
        cells.push(row.feature_id.to_string());
    }
    cells.push(row.feature.clone());
    cells.push(row.vendor.clone());
    cells.push(row.version.clone());
    if fields.counts {
        cells.push(range_cell(row.in_use));
        cells.push(range_cell(row.issued));
    }
    if fields.percent {
        cells.push(range_cell(percent_range(row)));
    }
    if fields.expiration {
        cells.push(format_expiration(row.expiration));
    }
    if fields.checked {
        if ranged && row.checked.start != row.checked.end {
            cells.push(format!(
                "{} - {}",
                format_timestamp(row.checked.start),
                format_timestamp(row.checked.end)
            ));
        } else {
            cells.push(format_timestamp(row.checked.start));
        }
    }
    cells
}

fn folded_headers(fields: &FieldSelection) -> Vec<String> {
    let mut labels = Vec::new();
    if fields.id {
        labels.push("id".to_string());
    }
    labels.extend(["feature", "vendor", "version"].map(String::from));
    if fields.counts {
        labels.push("in use".to_string());
        labels.push("issued".to_string());
    }
    if fields.percent {
        labels.push("percent".to_string());
    }
    if fields.expiration {
        labels.push("expiration".to_string());
    }
    if fields.checked {
        labels.push("checked".to_string());
    }
    labels
}

fn render_columns(
    out: &mut impl Write,
    rows: &[UsageRow],
    ranged: bool,
    options: &RenderOptions,
) -> Result<()> {
    let labels = folded_headers(&options.fields);
    let table: Vec<Vec<String>> = rows
        .iter()
        .map(|row| folded_cells(row, &options.fields, ranged))
        .collect();

    // Width pass first so every row lines up.
    let mut widths: Vec<usize> = labels.iter().map(|label| label.len()).collect();
    for cells in &table {
        for (width, cell) in widths.iter_mut().zip(cells) {
            *width = (*width).max(cell.len());
        }
    }

    if !options.no_headers {
        let header: Vec<String> = labels
            .iter()
            .zip(&widths)
            .map(|(label, width)| format!("{label:>width$}"))
            .collect();
        writeln!(out, "{}", header.join("  ")).context("failed to write report header")?;
        let dashes: Vec<String> = widths.iter().map(|width| "-".repeat(*width)).collect();
        writeln!(out, "{}", dashes.join("  ")).context("failed to write report header")?;
    }
    for cells in &table {
        let line: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{cell:>width$}"))
            .collect();
        writeln!(out, "{}", line.join("  ")).context("failed to write report row")?;
    }
    Ok(())
}

fn csv_cells(row: &UsageRow, fields: &FieldSelection, ranged: bool) -> Vec<String> {
    let mut cells = column_cells(row, fields, ranged);
    // The percent columns become three-decimal fractions of actual usage
    // rather than the rounded-up display form.
    if fields.percent {
        let offset = usize::from(fields.id) + 3 + if fields.counts { if ranged { 6 } else { 2 } } else { 0 };
        let raw = |in_use: i64, issued: i64| {
            if issued <= 0 {
                "0.000".to_string()
            } else {
                format!("{:.3}", 100.0 * in_use as f64 / issued as f64)
            }
        };
        if ranged {
            cells[offset] = raw(row.in_use.min, row.issued.min);
            cells[offset + 1] = raw(row.in_use.max, row.issued.max);
            cells[offset + 2] = raw(row.in_use.avg, row.issued.avg);
        } else {
            cells[offset] = raw(row.in_use.avg, row.issued.avg);
        }
    }
    cells
}

fn render_csv(
    out: &mut impl Write,
    rows: &[UsageRow],
    ranged: bool,
    options: &RenderOptions,
) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::NonNumeric)
        .from_writer(out);
    if !options.no_headers {
        writer
            .write_record(headers(&options.fields, ranged))
            .context("failed to write CSV header")?;
    }
    for row in rows {
        writer
            .write_record(csv_cells(row, &options.fields, ranged))
            .context("failed to write CSV row")?;
    }
    writer.flush().context("failed to flush CSV output")?;
    Ok(())
}

fn render_json(out: &mut impl Write, rows: &[UsageRow]) -> Result<()> {
    let objects: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            json!({
                "feature_id": row.feature_id,
                "feature": row.feature,
                "vendor": row.vendor,
                "version": row.version,
                "in_use": { "min": row.in_use.min, "max": row.in_use.max, "avg": row.in_use.avg },
                "issued": { "min": row.issued.min, "max": row.issued.max, "avg": row.issued.avg },
                "expiration": row.expiration,
                "checked": { "start": row.checked.start, "end": row.checked.end },
            })
        })
        .collect();
    serde_json::to_writer_pretty(&mut *out, &objects).context("failed to write JSON report")?;
    writeln!(out).context("failed to write JSON report")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::TimeRange;

    fn scalar_row() -> UsageRow {
        UsageRow {
            feature_id: 1,
            vendor: "MLM".to_string(),
            version: "R2023a".to_string(),
            feature: "MATLAB".to_string(),
            in_use: IntRange { min: 7, max: 7, avg: 7 },
            issued: IntRange { min: 10, max: 10, avg: 10 },
            expiration: None,
            checked: TimeRange { start: 1_700_000_000, end: 1_700_000_000 },
        }
    }

    fn ranged_row() -> UsageRow {
        UsageRow {
            in_use: IntRange { min: 5, max: 9, avg: 7 },
            checked: TimeRange { start: 1_700_000_000, end: 1_700_003_600 },
            ..scalar_row()
        }
    }

    fn render_to_string(rows: &[UsageRow], aggregate: Aggregate, options: &RenderOptions) -> String {
        let mut buffer = Vec::new();
        render(&mut buffer, rows, aggregate, options).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn test_range_cell_collapses_uniform_buckets() {
        assert_eq!(range_cell(IntRange { min: 7, max: 7, avg: 7 }), "7");
        assert_eq!(range_cell(IntRange { min: 5, max: 9, avg: 7 }), "5/9/7");
    }

    #[test]
    fn test_column_output_has_aligned_header_and_data() {
        let output = render_to_string(
            &[scalar_row()],
            Aggregate::None,
            &RenderOptions::default(),
        );
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].contains("feature"));
        assert!(lines[1].chars().all(|c| c == '-' || c == ' '));
        assert_eq!(lines[0].len(), lines[2].len());
        assert!(lines[2].contains("MATLAB"));
        assert!(lines[2].contains("permanent"));
        assert!(lines[2].contains("70"));
    }

    #[test]
    fn test_no_headers_drops_the_header_pair() {
        let options = RenderOptions {
            no_headers: true,
            ..RenderOptions::default()
        };
        let output = render_to_string(&[scalar_row()], Aggregate::None, &options);
        assert_eq!(output.lines().count(), 1);
    }

    #[test]
    fn test_ranged_column_cells_fold_triplets() {
        let output = render_to_string(
            &[ranged_row()],
            Aggregate::Total,
            &RenderOptions {
                no_headers: true,
                ..RenderOptions::default()
            },
        );
        assert!(output.contains("5/9/7"));
        // Issued never varied, so it stays a single value.
        assert!(output.contains(" 10 "));
        assert!(output.contains(" - "));
    }

    #[test]
    fn test_field_selection_toggles_columns() {
        let options = RenderOptions {
            fields: FieldSelection {
                id: true,
                counts: true,
                percent: false,
                expiration: false,
                checked: false,
            },
            ..RenderOptions::default()
        };
        let output = render_to_string(&[scalar_row()], Aggregate::None, &options);
        let header = output.lines().next().unwrap();
        assert!(header.contains("id"));
        assert!(header.contains("in use"));
        assert!(!header.contains("percent"));
        assert!(!header.contains("expiration"));
        assert!(!header.contains("checked"));
    }

    #[test]
    fn test_csv_scalar_row() {
        let output = render_to_string(
            &[scalar_row()],
            Aggregate::None,
            &RenderOptions {
                format: OutputFormat::Csv,
                ..RenderOptions::default()
            },
        );
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(
            lines[0],
            "\"feature\",\"vendor\",\"version\",\"in use\",\"issued\",\"percent\",\"expiration\",\"checked\""
        );
        assert!(lines[1].starts_with("\"MATLAB\",\"MLM\",\"R2023a\",7,10,70.000,\"permanent\","));
    }

    #[test]
    fn test_csv_ranged_headers_expand_triplets() {
        let output = render_to_string(
            &[ranged_row()],
            Aggregate::Total,
            &RenderOptions {
                format: OutputFormat::Csv,
                ..RenderOptions::default()
            },
        );
        let header = output.lines().next().unwrap();
        assert!(header.contains("\"in use min\",\"in use max\",\"in use avg\""));
        assert!(header.contains("\"check start\",\"check end\""));
        let data = output.lines().nth(1).unwrap();
        assert!(data.contains("5,9,7"));
        assert!(data.contains("50.000,90.000,70.000"));
    }

    #[test]
    fn test_json_output_structure() {
        let output = render_to_string(
            &[ranged_row()],
            Aggregate::Total,
            &RenderOptions {
                format: OutputFormat::Json,
                ..RenderOptions::default()
            },
        );
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        let row = &parsed[0];
        assert_eq!(row["feature"], "MATLAB");
        assert_eq!(row["in_use"]["min"], 5);
        assert_eq!(row["in_use"]["avg"], 7);
        assert_eq!(row["expiration"], serde_json::Value::Null);
        assert_eq!(row["checked"]["end"], 1_700_003_600);
    }

    #[test]
    fn test_format_parses_from_strings() {
        assert_eq!("csv".parse::<OutputFormat>().unwrap(), OutputFormat::Csv);
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert!("xml".parse::<OutputFormat>().is_err());
    }
}
