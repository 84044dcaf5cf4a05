//! Rendering command results as a table, JSON or CSV

use std::borrow::Cow;

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use serde_json::{Map, Value};
use tabled::settings::Style;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    Csv,
}

impl OutputFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Table => "table",
            Self::Json => "json",
            Self::Csv => "csv",
        }
    }
}

/// Where command results and status lines go
///
/// Results are written to stdout in the selected format. Status lines are
/// dropped with `--quiet`; failures always reach stderr.
pub struct Output {
    pub format: OutputFormat,
    pub quiet: bool,
}

impl Output {
    pub fn new(format: OutputFormat, no_color: bool, quiet: bool) -> Self {
        if no_color {
            colored::control::set_override(false);
        }
        Self { format, quiet }
    }

    pub fn ok(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg.green());
        }
    }

    pub fn note(&self, msg: &str) {
        if !self.quiet {
            println!("{}", msg);
        }
    }

    pub fn fail(&self, msg: &str) {
        eprintln!("{}", msg.red());
    }

    /// A list of records
    pub fn rows<T: Tabled + Serialize>(&self, rows: &[T]) {
        match self.format {
            OutputFormat::Table if rows.is_empty() => self.note("(none)"),
            OutputFormat::Table => println!("{}", Table::new(rows).with(Style::sharp())),
            OutputFormat::Json => println!("{}", to_json(rows)),
            OutputFormat::Csv => print!("{}", csv_rows(rows)),
        }
    }

    /// Named fields of a single result
    pub fn fields(&self, fields: &[(&str, String)]) {
        match self.format {
            OutputFormat::Table => print!("{}", aligned(fields)),
            OutputFormat::Json => {
                let object: Map<String, Value> = fields
                    .iter()
                    .map(|(name, value)| (name.to_string(), Value::from(value.as_str())))
                    .collect();
                println!("{}", to_json(&object));
            }
            OutputFormat::Csv => {
                let mut out = String::new();
                push_csv_line(&mut out, fields.iter().map(|(name, _)| Cow::Borrowed(*name)));
                push_csv_line(&mut out, fields.iter().map(|(_, value)| Cow::Borrowed(value.as_str())));
                print!("{}", out);
            }
        }
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|e| format!("{{\"error\": \"{}\"}}", e))
}

/// Header line from the `Tabled` column names, then one line per row
fn csv_rows<T: Tabled>(rows: &[T]) -> String {
    let mut out = String::new();
    if rows.is_empty() {
        return out;
    }
    push_csv_line(&mut out, T::headers());
    for row in rows {
        push_csv_line(&mut out, row.fields());
    }
    out
}

fn push_csv_line<'a>(out: &mut String, cells: impl IntoIterator<Item = Cow<'a, str>>) {
    let cells: Vec<String> = cells.into_iter().map(|cell| csv_cell(&cell).into_owned()).collect();
    out.push_str(&cells.join(","));
    out.push('\n');
}

fn csv_cell(value: &str) -> Cow<'_, str> {
    if value.contains([',', '"', '\n']) {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

/// `name:` padded to the longest name, one field per line
fn aligned(fields: &[(&str, String)]) -> String {
    let width = fields.iter().map(|(name, _)| name.len() + 1).max().unwrap_or(0);
    fields
        .iter()
        .map(|(name, value)| {
            let label = format!("{:<width$}", format!("{}:", name), width = width);
            format!("{} {}\n", label.bold(), value)
        })
        .collect()
}

/// `-` for a missing value
pub fn or_dash<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

#[derive(Debug, Tabled, Serialize)]
pub struct AlarmRow {
    #[tabled(rename = "ID")]
    pub id: u32,
    #[tabled(rename = "Severity")]
    pub severity: String,
    #[tabled(rename = "Description")]
    pub description: String,
}

#[derive(Debug, Tabled, Serialize)]
pub struct PriorityRow {
    #[tabled(rename = "Reference")]
    pub reference: String,
    #[tabled(rename = "Priority")]
    pub priority: i64,
    #[tabled(rename = "Enabled")]
    pub enabled: String,
}

#[derive(Debug, Tabled, Serialize)]
pub struct SatelliteRow {
    #[tabled(rename = "Sat")]
    pub sat_id: String,
    #[tabled(rename = "GNSS")]
    pub gnss: String,
    #[tabled(rename = "SNR")]
    pub snr: String,
    #[tabled(rename = "Azimuth")]
    pub azimuth: String,
    #[tabled(rename = "Elevation")]
    pub elevation: String,
    #[tabled(rename = "PR Res")]
    pub pr_res: String,
}
