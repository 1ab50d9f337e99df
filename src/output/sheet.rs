//! Secondary "sheet" sink mirroring the CSV tables.
//!
//! Strictly best-effort: every error on this path is logged and dropped by
//! the writer, never surfaced to the primary file write.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

use super::tables::Table;
use crate::config::SheetConfig;
use crate::error::{PipelineError, PipelineResult};

#[async_trait]
pub trait SheetSink: Send + Sync {
    async fn append(&self, table: Table, row: &[String]) -> PipelineResult<()>;

    /// Update the row whose first column equals `key`, or append.
    async fn upsert(&self, table: Table, key: &str, row: &[String]) -> PipelineResult<()>;
}

/// Google-Sheets-style values API client.
pub struct HttpSheetClient {
    client: Client,
    endpoint: String,
    spreadsheet_id: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct ValuesResponse {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

impl HttpSheetClient {
    pub fn from_config(config: &SheetConfig) -> anyhow::Result<Option<Self>> {
        if !config.enabled {
            return Ok(None);
        }
        let (Some(spreadsheet_id), Some(api_key)) =
            (config.spreadsheet_id.clone(), config.api_key.clone())
        else {
            anyhow::bail!("sheet sink enabled but spreadsheet id or api key missing");
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("callwatch/0.1")
            .build()?;
        Ok(Some(Self {
            client,
            endpoint: config.endpoint.clone(),
            spreadsheet_id,
            api_key,
        }))
    }

    fn values_url(&self, range: &str) -> String {
        format!(
            "{}/{}/values/{}",
            self.endpoint, self.spreadsheet_id, range
        )
    }

    async fn key_column(&self, table: Table) -> PipelineResult<Vec<String>> {
        let range = format!("{}!A:A", table.sheet_name());
        let response = self
            .client
            .get(self.values_url(&range))
            .query(&[("key", self.api_key.as_str())])
            .send()
            .await
            .map_err(PipelineError::from_http)?;
        crate::providers::check_status(&response)?;
        let body: ValuesResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::TransientNetwork(format!("bad values body: {e}")))?;
        Ok(body
            .values
            .into_iter()
            .map(|mut row| if row.is_empty() { String::new() } else { row.remove(0) })
            .collect())
    }

    async fn write_range(&self, range: &str, row: &[String]) -> PipelineResult<()> {
        let response = self
            .client
            .put(self.values_url(range))
            .query(&[
                ("key", self.api_key.as_str()),
                ("valueInputOption", "RAW"),
            ])
            .json(&json!({ "values": [row] }))
            .send()
            .await
            .map_err(PipelineError::from_http)?;
        crate::providers::check_status(&response)
    }
}

#[async_trait]
impl SheetSink for HttpSheetClient {
    async fn append(&self, table: Table, row: &[String]) -> PipelineResult<()> {
        let range = format!("{}!A:A", table.sheet_name());
        let url = format!("{}:append", self.values_url(&range));
        let response = self
            .client
            .post(url)
            .query(&[
                ("key", self.api_key.as_str()),
                ("valueInputOption", "RAW"),
            ])
            .json(&json!({ "values": [row] }))
            .send()
            .await
            .map_err(PipelineError::from_http)?;
        crate::providers::check_status(&response)?;
        debug!(table = table.sheet_name(), "sheet append ok");
        Ok(())
    }

    async fn upsert(&self, table: Table, key: &str, row: &[String]) -> PipelineResult<()> {
        let keys = self.key_column(table).await?;
        match keys.iter().position(|k| k.eq_ignore_ascii_case(key)) {
            Some(index) => {
                // Rows are 1-based in A1 notation.
                let range = format!("{}!A{}", table.sheet_name(), index + 1);
                self.write_range(&range, row).await
            }
            None => self.append(table, row).await,
        }
    }
}
