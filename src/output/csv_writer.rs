//! CSV table writer with daily rotation and an optional sheet mirror.
//!
//! Files live under `<output_root>/<YYYY-MM-DD>/` and rotate at local-date
//! boundaries. Appends land at the end of the day's file; upserts rewrite
//! the file in place keyed by the first column. Writes to a single table
//! are serialized; tables are independent. Mirror failures are logged and
//! dropped, never propagated.

use chrono::{Local, NaiveDate};
use csv::{ReaderBuilder, WriterBuilder};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use super::sheet::SheetSink;
use super::tables::Table;

struct TableState {
    last_date: Option<NaiveDate>,
}

pub struct TableWriter {
    output_root: PathBuf,
    sheet: Option<Arc<dyn SheetSink>>,
    tables: HashMap<Table, Mutex<TableState>>,
}

impl TableWriter {
    pub fn new(output_root: PathBuf, sheet: Option<Arc<dyn SheetSink>>) -> Self {
        let tables = Table::ALL
            .into_iter()
            .map(|t| (t, Mutex::new(TableState { last_date: None })))
            .collect();
        Self {
            output_root,
            sheet,
            tables,
        }
    }

    fn day_dir(&self, date: NaiveDate) -> PathBuf {
        self.output_root.join(date.format("%Y-%m-%d").to_string())
    }

    fn table_path(&self, table: Table, date: NaiveDate) -> PathBuf {
        self.day_dir(date).join(table.file_name())
    }

    /// Append one row. Creates the day's file (with header) on first write.
    pub async fn append(&self, table: Table, row: &[String]) -> anyhow::Result<()> {
        {
            let mut state = self.tables[&table].lock().await;
            let today = Local::now().date_naive();
            self.rotate_if_needed(table, &mut state, today)?;

            let path = self.table_path(table, today);
            append_row(&path, table, row)?;
        }
        self.mirror_append(table, row).await;
        Ok(())
    }

    /// Update the row whose first column equals `key` (case-insensitive),
    /// or insert it. Applying the same row twice is byte-idempotent.
    pub async fn upsert(&self, table: Table, key: &str, row: &[String]) -> anyhow::Result<()> {
        {
            let mut state = self.tables[&table].lock().await;
            let today = Local::now().date_naive();
            self.rotate_if_needed(table, &mut state, today)?;

            let path = self.table_path(table, today);
            upsert_row(&path, table, key, row)?;
        }
        self.mirror_upsert(table, key, row).await;
        Ok(())
    }

    fn rotate_if_needed(
        &self,
        table: Table,
        state: &mut TableState,
        today: NaiveDate,
    ) -> anyhow::Result<()> {
        if let Some(previous) = state.last_date {
            if previous != today {
                // Settle the closed day's file before opening a new one.
                let prev_path = self.table_path(table, previous);
                if prev_path.exists() {
                    if let Ok(file) = std::fs::File::open(&prev_path) {
                        let _ = file.sync_all();
                    }
                }
            }
        }
        state.last_date = Some(today);
        Ok(())
    }

    async fn mirror_append(&self, table: Table, row: &[String]) {
        if let Some(sheet) = self.sheet.as_ref() {
            if let Err(err) = sheet.append(table, row).await {
                warn!(table = table.sheet_name(), %err, "sheet mirror append failed");
            }
        }
    }

    async fn mirror_upsert(&self, table: Table, key: &str, row: &[String]) {
        if let Some(sheet) = self.sheet.as_ref() {
            if let Err(err) = sheet.upsert(table, key, row).await {
                warn!(table = table.sheet_name(), %err, "sheet mirror upsert failed");
            }
        }
    }
}

fn ensure_parent(path: &Path) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn append_row(path: &Path, table: Table, row: &[String]) -> anyhow::Result<()> {
    ensure_parent(path)?;
    let fresh = !path.exists();
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
    if fresh {
        writer.write_record(table.columns())?;
    }
    writer.write_record(row)?;
    writer.flush()?;
    Ok(())
}

fn upsert_row(path: &Path, table: Table, key: &str, row: &[String]) -> anyhow::Result<()> {
    ensure_parent(path)?;

    let mut records: Vec<Vec<String>> = if path.exists() {
        let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
        reader
            .records()
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|r| r.iter().map(|f| f.to_string()).collect())
            .collect()
    } else {
        Vec::new()
    };

    match records
        .iter_mut()
        .find(|r| r.first().map(|k| k.eq_ignore_ascii_case(key)).unwrap_or(false))
    {
        Some(existing) => *existing = row.to_vec(),
        None => records.push(row.to_vec()),
    }

    // Rewrite through a sibling temp file so a crash never leaves a
    // half-written table behind.
    let tmp = path.with_extension("csv.tmp");
    {
        let mut writer = WriterBuilder::new().has_headers(false).from_path(&tmp)?;
        writer.write_record(table.columns())?;
        for record in &records {
            writer.write_record(record)?;
        }
        writer.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PipelineError, PipelineResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn today_path(root: &Path, table: Table) -> PathBuf {
        root.join(Local::now().date_naive().format("%Y-%m-%d").to_string())
            .join(table.file_name())
    }

    fn row(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn append_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TableWriter::new(dir.path().to_path_buf(), None);
        let r = row(&["1", "t", "chan", "hello", "0.00", "", "neutral", "0.1000"]);
        writer.append(Table::Messages, &r).await.unwrap();
        writer.append(Table::Messages, &r).await.unwrap();

        let contents = std::fs::read_to_string(today_path(dir.path(), Table::Messages)).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("message_id,timestamp"));
    }

    #[tokio::test]
    async fn upsert_replaces_by_key_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TableWriter::new(dir.path().to_path_buf(), None);
        let path = today_path(dir.path(), Table::TokenPrices);

        let first = row(&["0xAAA", "evm", "TKN", "1.0", "", "", "", "", ""]);
        writer.upsert(Table::TokenPrices, "0xAAA", &first).await.unwrap();
        let other = row(&["0xBBB", "evm", "OTH", "2.0", "", "", "", "", ""]);
        writer.upsert(Table::TokenPrices, "0xBBB", &other).await.unwrap();

        let updated = row(&["0xAAA", "evm", "TKN", "5.0", "", "", "", "", ""]);
        writer.upsert(Table::TokenPrices, "0xaaa", &updated).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].contains("5.0"));
        assert!(lines[2].contains("0xBBB"));

        // Idempotence: re-applying the same row leaves the bytes unchanged.
        let before = std::fs::read(&path).unwrap();
        writer.upsert(Table::TokenPrices, "0xaaa", &updated).await.unwrap();
        let after = std::fs::read(&path).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn fields_with_commas_and_quotes_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let writer = TableWriter::new(dir.path().to_path_buf(), None);
        let tricky = row(&[
            "7",
            "t",
            "chan \"one\"",
            "buy, now",
            "0.00",
            "ETH,BTC",
            "neutral",
            "0.5",
        ]);
        writer.append(Table::Messages, &tricky).await.unwrap();

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .from_path(today_path(dir.path(), Table::Messages))
            .unwrap();
        let record = reader.records().next().unwrap().unwrap();
        assert_eq!(&record[2], "chan \"one\"");
        assert_eq!(&record[3], "buy, now");
        assert_eq!(&record[5], "ETH,BTC");
    }

    struct FailingSheet {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SheetSink for FailingSheet {
        async fn append(&self, _table: Table, _row: &[String]) -> PipelineResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::TransientNetwork("sheet down".into()))
        }

        async fn upsert(&self, _table: Table, _key: &str, _row: &[String]) -> PipelineResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(PipelineError::TransientNetwork("sheet down".into()))
        }
    }

    #[tokio::test]
    async fn sheet_failure_never_fails_the_primary_write() {
        let dir = tempfile::tempdir().unwrap();
        let sheet = Arc::new(FailingSheet {
            calls: AtomicU32::new(0),
        });
        let writer = TableWriter::new(dir.path().to_path_buf(), Some(sheet.clone()));

        let r = row(&["1", "t", "chan", "hello", "0.00", "", "neutral", "0.1000"]);
        writer.append(Table::Messages, &r).await.unwrap();
        let u = row(&["0xAAA", "evm", "TKN", "1.0", "", "", "", "", ""]);
        writer.upsert(Table::TokenPrices, "0xAAA", &u).await.unwrap();

        assert!(today_path(dir.path(), Table::Messages).exists());
        assert!(today_path(dir.path(), Table::TokenPrices).exists());
        assert_eq!(sheet.calls.load(Ordering::SeqCst), 2);
    }
}
