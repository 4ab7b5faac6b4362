//! Operator-facing export writers: matched items as CSV/JSON/tab-delimited
//! text, and the totals table as a human-readable CSV dump.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;

use crate::matcher::{LogEvent, LogMatcher, MatchMode};
use crate::models::{
    CountmeItem, MirrorItem, TotalsItem, COUNTME_RAW_COLUMNS, MIRRORS_RAW_COLUMNS,
};
use crate::reader::{open_log, LogLines};
use crate::weeks::week_date_range;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Json,
    Awk,
}

/// A record that can be exported as flat text.
pub trait ExportRecord: Serialize {
    fn field_names() -> Vec<&'static str>;
    fn field_values(&self) -> Vec<String>;
}

impl ExportRecord for CountmeItem {
    fn field_names() -> Vec<&'static str> {
        COUNTME_RAW_COLUMNS.iter().map(|(name, _)| *name).collect()
    }

    fn field_values(&self) -> Vec<String> {
        vec![
            self.timestamp.to_string(),
            self.host.clone(),
            self.os_name.clone(),
            self.os_version.clone(),
            self.os_variant.clone(),
            self.os_arch.clone(),
            self.sys_age.to_string(),
            self.repo_tag.clone().unwrap_or_default(),
            self.repo_arch.clone().unwrap_or_default(),
        ]
    }
}

impl ExportRecord for MirrorItem {
    fn field_names() -> Vec<&'static str> {
        MIRRORS_RAW_COLUMNS.iter().map(|(name, _)| *name).collect()
    }

    fn field_values(&self) -> Vec<String> {
        vec![
            self.timestamp.to_string(),
            self.host.clone(),
            self.repo_tag.clone().unwrap_or_default(),
            self.repo_arch.clone().unwrap_or_default(),
        ]
    }
}

/// Text sink for matched items. JSON writes one object per line; AWK writes
/// tab-separated values with an optional header row.
pub enum ItemWriter<W: Write> {
    Csv(csv::Writer<W>),
    Json(W),
    Awk(W),
}

impl<W: Write> ItemWriter<W> {
    pub fn new(format: ExportFormat, out: W, header: bool) -> Self {
        match format {
            ExportFormat::Csv => ItemWriter::Csv(
                csv::WriterBuilder::new().has_headers(header).from_writer(out),
            ),
            ExportFormat::Json => ItemWriter::Json(out),
            ExportFormat::Awk => ItemWriter::Awk(out),
        }
    }

    /// Write the header row. CSV emits its own header on the first record;
    /// JSON has none.
    pub fn write_header<T: ExportRecord>(&mut self) -> Result<()> {
        if let ItemWriter::Awk(out) = self {
            writeln!(out, "{}", T::field_names().join("\t"))?;
        }
        Ok(())
    }

    pub fn write_item<T: ExportRecord>(&mut self, item: &T) -> Result<()> {
        match self {
            ItemWriter::Csv(writer) => writer.serialize(item)?,
            ItemWriter::Json(out) => {
                serde_json::to_writer(&mut *out, item)?;
                writeln!(out)?;
            }
            ItemWriter::Awk(out) => writeln!(out, "{}", item.field_values().join("\t"))?,
        }
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        match self {
            ItemWriter::Csv(writer) => writer.flush()?,
            ItemWriter::Json(out) | ItemWriter::Awk(out) => out.flush()?,
        }
        Ok(())
    }
}

/// Stream matched items from `paths` straight to a text writer, no store
/// involved. Countme items are normalized the same way the ingestion
/// pipeline does, so text and SQLite output agree field for field.
pub fn export_logs<W: Write>(
    paths: &[PathBuf],
    mode: MatchMode,
    format: ExportFormat,
    header: bool,
    out: W,
) -> Result<()> {
    let mut writer = ItemWriter::new(format, out, header);
    if header {
        match mode {
            MatchMode::Countme => writer.write_header::<CountmeItem>()?,
            MatchMode::Mirrors => writer.write_header::<MirrorItem>()?,
        }
    }

    for path in paths {
        let lines = LogLines::new(open_log(path)?);
        for event in LogMatcher::new(mode).match_lines(lines) {
            match event? {
                LogEvent::Countme(item) => writer.write_item(&item.normalized())?,
                LogEvent::Mirror(item) => writer.write_item(&item)?,
            }
        }
    }
    writer.finish()
}

/// One row of a totals CSV dump. In the interest of human readability the
/// week number is replaced by the week's start and end dates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CsvCountItem {
    pub week_start: String,
    pub week_end: String,
    pub hits: i64,
    pub os_name: String,
    pub os_version: String,
    pub os_variant: String,
    pub os_arch: String,
    pub sys_age: i64,
    pub repo_tag: String,
    pub repo_arch: String,
}

impl CsvCountItem {
    pub fn from_totals_item(item: &TotalsItem) -> Result<Self> {
        let (week_start, week_end) = week_date_range(item.weeknum)
            .ok_or_else(|| anyhow!("week number {} out of calendar range", item.weeknum))?;
        Ok(Self {
            week_start: week_start.to_string(),
            week_end: week_end.to_string(),
            hits: item.hits,
            os_name: item.os_name.clone(),
            os_version: item.os_version.clone(),
            os_variant: item.os_variant.clone(),
            os_arch: item.os_arch.clone(),
            sys_age: item.sys_age,
            repo_tag: item.repo_tag.clone(),
            repo_arch: item.repo_arch.clone(),
        })
    }
}

/// Dump totals rows as CSV with a header row.
pub fn dump_totals_csv<W: Write>(out: W, items: &[TotalsItem]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    for item in items {
        writer.serialize(CsvCountItem::from_totals_item(item)?)?;
    }
    writer.flush().context("failed to flush totals CSV")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn totals_item() -> TotalsItem {
        TotalsItem {
            hits: 42,
            weeknum: 2614,
            os_name: "Fedora".to_string(),
            os_version: "32".to_string(),
            os_variant: "workstation".to_string(),
            os_arch: "x86_64".to_string(),
            sys_age: 1,
            repo_tag: "fedora-32".to_string(),
            repo_arch: "x86_64".to_string(),
        }
    }

    #[test]
    fn totals_csv_replaces_weeknum_with_dates() {
        let mut buf = Vec::new();
        dump_totals_csv(&mut buf, &[totals_item()]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "week_start,week_end,hits,os_name,os_version,os_variant,os_arch,sys_age,repo_tag,repo_arch"
        );
        assert_eq!(
            lines.next().unwrap(),
            "2020-02-10,2020-02-16,42,Fedora,32,workstation,x86_64,1,fedora-32,x86_64"
        );
    }

    #[test]
    fn awk_writer_tabs_and_header() {
        let item = CountmeItem {
            timestamp: 1_622_419_205,
            host: "220.245.77.146".to_string(),
            os_name: "Fedora".to_string(),
            os_version: "33".to_string(),
            os_variant: "workstation".to_string(),
            os_arch: "x86_64".to_string(),
            sys_age: 3,
            repo_tag: Some("fedora-33".to_string()),
            repo_arch: Some("x86_64".to_string()),
        };
        let mut buf = Vec::new();
        let mut writer = ItemWriter::new(ExportFormat::Awk, &mut buf, true);
        writer.write_header::<CountmeItem>().unwrap();
        writer.write_item(&item).unwrap();
        writer.finish().unwrap();
        drop(writer);

        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next().unwrap(),
            "timestamp\thost\tos_name\tos_version\tos_variant\tos_arch\tsys_age\trepo_tag\trepo_arch"
        );
        assert_eq!(
            lines.next().unwrap(),
            "1622419205\t220.245.77.146\tFedora\t33\tworkstation\tx86_64\t3\tfedora-33\tx86_64"
        );
    }

    #[test]
    fn json_writer_one_object_per_line() {
        let item = MirrorItem {
            timestamp: 123,
            host: "10.0.0.1".to_string(),
            repo_tag: Some("f33".to_string()),
            repo_arch: None,
        };
        let mut buf = Vec::new();
        let mut writer = ItemWriter::new(ExportFormat::Json, &mut buf, false);
        writer.write_item(&item).unwrap();
        writer.finish().unwrap();
        drop(writer);

        let text = String::from_utf8(buf).unwrap();
        let value: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(value["timestamp"], 123);
        assert_eq!(value["repo_arch"], serde_json::Value::Null);
    }
}
