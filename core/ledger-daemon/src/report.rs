//! Renders stored ledger data for the report subcommands.

use clap::ValueEnum;
use ledger_core::{ActiveSessionRecord, QuarantinedSession, UserTotal};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Csv,
    Json,
}

pub fn render_totals(totals: &[UserTotal], format: OutputFormat) -> Result<String, String> {
    let rows: Vec<Vec<String>> = totals
        .iter()
        .map(|total| vec![total.username.clone(), total.total_minutes.to_string()])
        .collect();
    render(totals, &["Username", "TotalMinutes"], &rows, format)
}

pub fn render_active(
    records: &[ActiveSessionRecord],
    format: OutputFormat,
) -> Result<String, String> {
    let rows: Vec<Vec<String>> = records
        .iter()
        .map(|record| {
            vec![
                record.host.clone(),
                record.session_id.clone(),
                record.username.clone(),
                record.logon_time.clone(),
            ]
        })
        .collect();
    render(
        records,
        &["Host", "SessionId", "Username", "LogonTime"],
        &rows,
        format,
    )
}

pub fn render_quarantined(
    entries: &[QuarantinedSession],
    format: OutputFormat,
) -> Result<String, String> {
    let rows: Vec<Vec<String>> = entries
        .iter()
        .map(|entry| {
            vec![
                entry.host.clone(),
                entry.session_id.clone(),
                entry.username.clone(),
                entry.logon_time.clone(),
                entry.closed_at.clone(),
                entry.reason.clone(),
            ]
        })
        .collect();
    render(
        entries,
        &["Host", "SessionId", "Username", "LogonTime", "ClosedAt", "Reason"],
        &rows,
        format,
    )
}

fn render<T: Serialize>(
    items: &[T],
    headers: &[&str],
    rows: &[Vec<String>],
    format: OutputFormat,
) -> Result<String, String> {
    match format {
        OutputFormat::Json => serde_json::to_string_pretty(items)
            .map(|mut text| {
                text.push('\n');
                text
            })
            .map_err(|err| format!("Failed to serialize report: {}", err)),
        OutputFormat::Csv => Ok(render_csv(headers, rows)),
        OutputFormat::Table => Ok(render_table(headers, rows)),
    }
}

fn render_csv(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut out = String::new();
    out.push_str(&headers.join(","));
    out.push('\n');
    for row in rows {
        let fields: Vec<String> = row.iter().map(|field| csv_field(field)).collect();
        out.push_str(&fields.join(","));
        out.push('\n');
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|header| header.len()).collect();
    for row in rows {
        for (index, field) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(index) {
                *width = (*width).max(field.chars().count());
            }
        }
    }

    let format_line = |fields: Vec<&str>| -> String {
        let cells: Vec<String> = fields
            .iter()
            .zip(&widths)
            .map(|(field, width)| format!("{:<width$}", field, width = *width))
            .collect();
        let mut line = cells.join("  ").trim_end().to_string();
        line.push('\n');
        line
    };

    let mut out = format_line(headers.to_vec());
    for row in rows {
        out.push_str(&format_line(row.iter().map(String::as_str).collect()));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals() -> Vec<UserTotal> {
        vec![
            UserTotal {
                username: "alice".to_string(),
                total_minutes: 470,
            },
            UserTotal {
                username: "o'brien, pat".to_string(),
                total_minutes: 5,
            },
        ]
    }

    #[test]
    fn totals_csv_matches_report_layout() {
        let csv = render_totals(&totals(), OutputFormat::Csv).expect("render");
        assert_eq!(
            csv,
            "Username,TotalMinutes\nalice,470\n\"o'brien, pat\",5\n"
        );
    }

    #[test]
    fn totals_table_aligns_columns() {
        let table = render_totals(&totals(), OutputFormat::Table).expect("render");
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "Username      TotalMinutes");
        assert_eq!(lines[1], "alice         470");
        assert_eq!(lines[2], "o'brien, pat  5");
    }

    #[test]
    fn totals_json_is_an_array_of_objects() {
        let json = render_totals(&totals(), OutputFormat::Json).expect("render");
        let parsed: serde_json::Value = serde_json::from_str(&json).expect("json");
        assert_eq!(parsed[0]["username"], "alice");
        assert_eq!(parsed[0]["total_minutes"], 470);
    }

    #[test]
    fn active_table_renders_header_for_empty_store() {
        let table = render_active(&[], OutputFormat::Table).expect("render");
        assert_eq!(table, "Host  SessionId  Username  LogonTime\n");
    }

    #[test]
    fn csv_escapes_quotes() {
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_field("plain"), "plain");
    }
}
