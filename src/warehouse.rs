//! SQL-over-HTTP client for the data warehouse.
//!
//! Statements are posted to the SQL REST API with the session context
//! (database, schema, warehouse, role) attached. Asynchronous statements are
//! polled until they finish and multi-partition results are stitched together.

use crate::auth::TokenProvider;
use crate::config::WarehouseConfig;
use crate::table::{bytes_placeholder, Grid};
use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const STATEMENTS_PATH: &str = "/api/v2/statements";
const TOKEN_TYPE_HEADER: &str = "X-Snowflake-Authorization-Token-Type";
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Escape a value for use inside a single-quoted SQL literal.
pub fn escape(s: &str) -> String {
    s.replace('\'', "''")
}

/// Single-quoted SQL string literal.
pub fn literal(s: &str) -> String {
    format!("'{}'", escape(s))
}

/// Normalise a stage identifier (`STAGE`, `SCHEMA.STAGE` or `DB.SCHEMA.STAGE`,
/// optionally prefixed with `@`). Stage names are spliced into statements
/// unquoted, so anything else is rejected.
pub fn stage_name(raw: &str) -> Result<String> {
    static STAGE_PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let trimmed = raw.trim();
    let name = trimmed.strip_prefix('@').unwrap_or(trimmed);
    let valid = STAGE_PATTERN
        .get_or_init(|| {
            Regex::new(r"^[A-Za-z_][A-Za-z0-9_$]*(\.[A-Za-z_][A-Za-z0-9_$]*){0,2}$").ok()
        })
        .as_ref()
        .map_or(false, |re| re.is_match(name));
    if !valid {
        bail!("Invalid stage name {:?}: expected DB.SCHEMA.STAGE", raw);
    }
    Ok(name.to_string())
}

/// Warehouse client shared by the AI service and the store.
#[derive(Clone)]
pub struct WarehouseClient {
    client: Client,
    config: Arc<WarehouseConfig>,
    tokens: TokenProvider,
}

impl WarehouseClient {
    pub fn new(config: WarehouseConfig) -> Self {
        let tokens = TokenProvider::new(config.auth.clone(), &config.account, &config.user);
        Self {
            client: Client::new(),
            config: Arc::new(config),
            tokens,
        }
    }

    /// Run a statement and return its rows.
    pub async fn query(&self, sql: &str) -> Result<Grid> {
        let request = StatementRequest {
            statement: sql,
            timeout: self.config.statement_timeout.as_secs(),
            database: self.config.database.as_deref(),
            schema: self.config.schema.as_deref(),
            warehouse: self.config.warehouse.as_deref(),
            role: self.config.role.as_deref(),
        };

        debug!("Executing statement: {}", first_line(sql));

        let url = format!("{}{}", self.config.base_url, STATEMENTS_PATH);
        let response = self
            .authorized(self.client.post(&url))?
            .json(&request)
            .send()
            .await
            .context("Failed to send statement to warehouse")?;

        let mut body = self.read_statement(response).await?;

        // 202: still running, poll the handle until it completes.
        let deadline = Instant::now() + self.config.statement_timeout;
        while body.result_set_meta_data.is_none() {
            let handle = body
                .statement_handle
                .clone()
                .ok_or_else(|| anyhow!("Warehouse returned neither rows nor a statement handle"))?;
            if Instant::now() >= deadline {
                anyhow::bail!("Statement {} did not finish within {:?}", handle, self.config.statement_timeout);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            body = self.fetch_partition(&handle, None).await?;
        }

        let meta = body
            .result_set_meta_data
            .take()
            .ok_or_else(|| anyhow!("Missing result metadata"))?;

        let mut raw_rows = std::mem::take(&mut body.data);
        if meta.partition_info.len() > 1 {
            let handle = body
                .statement_handle
                .clone()
                .ok_or_else(|| anyhow!("Partitioned result without a statement handle"))?;
            for partition in 1..meta.partition_info.len() {
                let mut part = self.fetch_partition(&handle, Some(partition)).await?;
                raw_rows.append(&mut part.data);
            }
        }

        let columns: Vec<String> = meta.row_type.iter().map(|c| c.name.clone()).collect();
        let rows = raw_rows
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(&meta.row_type)
                    .map(|(cell, column)| decode_cell(cell, &column.column_type))
                    .collect()
            })
            .collect::<Vec<Vec<Value>>>();

        debug!("Statement returned {} rows", rows.len());
        Ok(Grid { columns, rows })
    }

    /// Run a statement for its side effects only.
    pub async fn execute(&self, sql: &str) -> Result<()> {
        self.query(sql).await.map(|_| ())
    }

    /// Upload a file into a stage, overwriting any existing file of that name.
    pub async fn upload(&self, stage: &str, file_name: &str, data: Vec<u8>) -> Result<()> {
        use reqwest::multipart::{Form, Part};

        let stage = stage_name(stage)?;

        info!(
            "Uploading {} ({} bytes) to @{}",
            file_name,
            data.len(),
            stage
        );

        let part = Part::bytes(data)
            .file_name(file_name.to_string())
            .mime_str(mime_for(file_name))?;
        let form = Form::new()
            .part("file", part)
            .text("overwrite", "true")
            .text("auto_compress", "false");

        let url = format!("{}/{}/files", self.config.stage_upload_url, stage);
        let response = self
            .authorized(self.client.post(&url))?
            .multipart(form)
            .send()
            .await
            .context("Failed to send stage upload")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Stage upload to @{} failed ({}): {}", stage, status, text);
        }

        Ok(())
    }

    async fn fetch_partition(&self, handle: &str, partition: Option<usize>) -> Result<StatementResponse> {
        let mut url = format!("{}{}/{}", self.config.base_url, STATEMENTS_PATH, handle);
        if let Some(p) = partition {
            url.push_str(&format!("?partition={}", p));
        }
        let response = self
            .authorized(self.client.get(&url))?
            .send()
            .await
            .context("Failed to poll statement")?;
        self.read_statement(response).await
    }

    async fn read_statement(&self, response: reqwest::Response) -> Result<StatementResponse> {
        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::ACCEPTED {
            return response
                .json()
                .await
                .context("Failed to parse warehouse response");
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&text)
            .map(|e| e.message)
            .unwrap_or(text);
        anyhow::bail!("Warehouse error ({}): {}", status, message)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        let token = self.tokens.bearer()?;
        Ok(builder
            .bearer_auth(token)
            .header(TOKEN_TYPE_HEADER, self.tokens.token_type())
            .header("Accept", "application/json"))
    }
}

/// First value of a named column in the first row.
pub fn scalar<'a>(grid: &'a Grid, column: &str) -> Option<&'a Value> {
    let idx = grid.column_index(column)?;
    grid.rows.first().and_then(|row| row.get(idx))
}

/// All non-null values of a named column.
pub fn column_values<'a>(grid: &'a Grid, column: &str) -> Vec<&'a Value> {
    match grid.column_index(column) {
        Some(idx) => grid
            .rows
            .iter()
            .filter_map(|row| row.get(idx))
            .filter(|v| !v.is_null())
            .collect(),
        None => Vec::new(),
    }
}

/// Turn the API's string-encoded cell into a typed JSON value.
fn decode_cell(cell: Option<String>, column_type: &str) -> Value {
    let Some(raw) = cell else {
        return Value::Null;
    };

    match column_type {
        "fixed" => raw
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| raw.parse::<f64>().map(Value::from))
            .unwrap_or(Value::String(raw)),
        "real" => raw
            .parse::<f64>()
            .map(Value::from)
            .unwrap_or(Value::String(raw)),
        "boolean" => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => Value::String(raw),
        },
        "variant" | "object" | "array" => {
            serde_json::from_str(&raw).unwrap_or(Value::String(raw))
        }
        // Binary arrives hex-encoded.
        "binary" => Value::String(bytes_placeholder(raw.len() / 2)),
        _ => Value::String(raw),
    }
}

fn mime_for(file_name: &str) -> &'static str {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".pdf") {
        "application/pdf"
    } else if lower.ends_with(".png") {
        "image/png"
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg"
    } else {
        "application/octet-stream"
    }
}

fn first_line(sql: &str) -> &str {
    sql.trim().lines().next().unwrap_or_default()
}

// ============================================================================
// Request/Response types
// ============================================================================

#[derive(Debug, Serialize)]
struct StatementRequest<'a> {
    statement: &'a str,
    timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    database: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warehouse: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatementResponse {
    #[serde(default)]
    statement_handle: Option<String>,
    #[serde(default)]
    result_set_meta_data: Option<ResultSetMetaData>,
    #[serde(default)]
    data: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultSetMetaData {
    row_type: Vec<RowType>,
    #[serde(default)]
    partition_info: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct RowType {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}
