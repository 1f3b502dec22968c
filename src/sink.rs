use std::collections::HashSet;
use std::env;
use std::fs::{self, OpenOptions};
use std::path::PathBuf;

use serde_json::json;
use tracing::{debug, info};

use crate::error::EngineError;
use crate::extract::{Record, identity_of};
use crate::profile::SinkBinding;

/// Fixed sheet column order. `extra` fields trail these as unheadered `k=v`
/// columns, so downstream consumers can rely on the first four positions.
pub const SHEET_HEADER: [&str; 4] = ["title", "image_url", "detail_url", "value"];

pub const SINK_USER_ENV: &str = "ORIPA_SINK_USER";
pub const SINK_PASS_ENV: &str = "ORIPA_SINK_PASS";

#[derive(Debug, Default, Clone, Copy)]
pub struct WriteReport {
    pub written: usize,
}

/// Destination for admitted records. Both kinds share one contract: read the
/// existing identity keys once, append/upsert a batch in order.
pub enum Sink {
    Sheet(SheetSink),
    Rest(RestSink),
}

impl Sink {
    /// Build a sink from a profile binding. Fails fast on missing credentials
    /// before any network activity.
    pub fn from_binding(site: &str, binding: &SinkBinding) -> Result<Self, EngineError> {
        match binding {
            SinkBinding::Sheet {
                path,
                refresh_values,
            } => Ok(Self::Sheet(SheetSink {
                path: PathBuf::from(path),
                refresh_values: *refresh_values,
            })),
            SinkBinding::Rest {
                endpoint,
                index_endpoint,
            } => RestSink::new(
                site,
                endpoint,
                index_endpoint.as_deref().unwrap_or(endpoint),
            )
            .map(Self::Rest),
        }
    }

    pub async fn existing_keys(&self) -> Result<HashSet<String>, EngineError> {
        match self {
            Self::Sheet(sheet) => sheet.existing_keys(),
            Self::Rest(rest) => rest.existing_keys().await,
        }
    }

    /// Append/upsert the batch, preserving record order.
    pub async fn write(&self, records: &[Record]) -> Result<WriteReport, EngineError> {
        match self {
            Self::Sheet(sheet) => sheet.append(records),
            Self::Rest(rest) => rest.upsert(records).await,
        }
    }

    /// Whether records with an already-known identity should get their value
    /// column refreshed instead of being dropped. Sheet sinks only; the REST
    /// endpoint upserts server-side.
    pub fn refresh_enabled(&self) -> bool {
        matches!(self, Self::Sheet(sheet) if sheet.refresh_values)
    }

    /// Rewrite only the trailing value column of known rows. Label and image
    /// columns are never touched.
    pub async fn refresh(&self, records: &[Record]) -> Result<usize, EngineError> {
        match self {
            Self::Sheet(sheet) => sheet.refresh_values(records),
            Self::Rest(_) => Ok(0),
        }
    }
}

/// Append-only CSV sheet.
pub struct SheetSink {
    path: PathBuf,
    refresh_values: bool,
}

impl SheetSink {
    fn existing_keys(&self) -> Result<HashSet<String>, EngineError> {
        if !self.path.exists() {
            return Ok(HashSet::new());
        }
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)
            .map_err(|e| EngineError::Write(format!("open sheet {}: {e}", self.path.display())))?;

        let mut keys = HashSet::new();
        for row in reader.records() {
            let row =
                row.map_err(|e| EngineError::Write(format!("read sheet row: {e}")))?;
            if let Some(key) = row_identity(&row) {
                keys.insert(key);
            }
        }
        Ok(keys)
    }

    fn append(&self, records: &[Record]) -> Result<WriteReport, EngineError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| EngineError::Write(format!("create sheet dir: {e}")))?;
            }
        }
        let fresh = fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| EngineError::Write(format!("open sheet {}: {e}", self.path.display())))?;
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .has_headers(false)
            .from_writer(file);

        if fresh {
            writer
                .write_record(SHEET_HEADER)
                .map_err(|e| EngineError::Write(format!("write sheet header: {e}")))?;
        }
        for record in records {
            writer
                .write_record(sheet_row(record))
                .map_err(|e| EngineError::Write(format!("write sheet row: {e}")))?;
        }
        writer
            .flush()
            .map_err(|e| EngineError::Write(format!("flush sheet: {e}")))?;

        info!(path = %self.path.display(), written = records.len(), "sheet rows appended");
        Ok(WriteReport {
            written: records.len(),
        })
    }

    /// Rewrite the value column of rows whose identity matches one of the
    /// given records. The whole file is rewritten, but only that one column
    /// of matched rows changes.
    fn refresh_values(&self, records: &[Record]) -> Result<usize, EngineError> {
        if records.is_empty() || !self.path.exists() {
            return Ok(0);
        }
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.path)
            .map_err(|e| EngineError::Write(format!("open sheet {}: {e}", self.path.display())))?;
        let header = reader
            .headers()
            .map_err(|e| EngineError::Write(format!("read sheet header: {e}")))?
            .clone();
        let mut rows = Vec::new();
        for row in reader.records() {
            rows.push(row.map_err(|e| EngineError::Write(format!("read sheet row: {e}")))?);
        }

        let mut refreshed = 0usize;
        for record in records {
            let Some(value) = record.value else { continue };
            let key = record.identity_key();
            for row in &mut rows {
                if row_identity(row).as_deref() == Some(key.as_str()) {
                    let mut fields = row.iter().map(|f| f.to_string()).collect::<Vec<_>>();
                    while fields.len() < SHEET_HEADER.len() {
                        fields.push(String::new());
                    }
                    if fields[3] != value.to_string() {
                        fields[3] = value.to_string();
                        refreshed += 1;
                    }
                    *row = csv::StringRecord::from(fields);
                }
            }
        }
        if refreshed == 0 {
            return Ok(0);
        }

        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_path(&self.path)
            .map_err(|e| EngineError::Write(format!("rewrite sheet: {e}")))?;
        writer
            .write_record(&header)
            .map_err(|e| EngineError::Write(format!("write sheet header: {e}")))?;
        for row in &rows {
            writer
                .write_record(row)
                .map_err(|e| EngineError::Write(format!("write sheet row: {e}")))?;
        }
        writer
            .flush()
            .map_err(|e| EngineError::Write(format!("flush sheet: {e}")))?;

        info!(path = %self.path.display(), refreshed, "sheet values refreshed");
        Ok(refreshed)
    }
}

fn sheet_row(record: &Record) -> Vec<String> {
    let mut row = vec![
        record.title.clone(),
        record.image_url.clone(),
        record.detail_url.clone(),
        record.value.map(|v| v.to_string()).unwrap_or_default(),
    ];
    for (key, value) in &record.extra {
        row.push(format!("{key}={value}"));
    }
    row
}

/// Identity of one sheet row: detail column when present, image column
/// otherwise. Mirrors `Record::identity_key`.
fn row_identity(row: &csv::StringRecord) -> Option<String> {
    let detail = row.get(2).unwrap_or("").trim();
    let image = row.get(1).unwrap_or("").trim();
    let source = if !detail.is_empty() { detail } else { image };
    if source.is_empty() {
        None
    } else {
        Some(identity_of(source))
    }
}

/// Batch upsert endpoint with HTTP Basic credentials from the environment.
pub struct RestSink {
    site: String,
    endpoint: String,
    index_endpoint: String,
    user: String,
    pass: String,
    client: reqwest::Client,
}

impl RestSink {
    fn new(site: &str, endpoint: &str, index_endpoint: &str) -> Result<Self, EngineError> {
        let user = env::var(SINK_USER_ENV)
            .map_err(|_| EngineError::Config(format!("rest sink requires {SINK_USER_ENV}")))?;
        let pass = env::var(SINK_PASS_ENV)
            .map_err(|_| EngineError::Config(format!("rest sink requires {SINK_PASS_ENV}")))?;
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| EngineError::Config(format!("rest client build failed: {e}")))?;
        Ok(Self {
            site: site.to_string(),
            endpoint: endpoint.to_string(),
            index_endpoint: index_endpoint.to_string(),
            user,
            pass,
            client,
        })
    }

    async fn existing_keys(&self) -> Result<HashSet<String>, EngineError> {
        let res = self
            .client
            .get(&self.index_endpoint)
            .basic_auth(&self.user, Some(&self.pass))
            .send()
            .await
            .map_err(|e| EngineError::Write(format!("existing-index read: {e}")))?;
        let status = res.status();
        let body = res
            .text()
            .await
            .map_err(|e| EngineError::Write(format!("existing-index body read: {e}")))?;
        if !status.is_success() {
            return Err(EngineError::Write(format!(
                "existing-index HTTP {}: {}",
                status.as_u16(),
                crate::session::truncate_for_log(&body, 240)
            )));
        }
        let keys: Vec<String> = serde_json::from_str(&body)
            .map_err(|e| EngineError::Write(format!("existing-index parse: {e}")))?;
        Ok(keys.iter().map(|k| identity_of(k)).collect())
    }

    async fn upsert(&self, records: &[Record]) -> Result<WriteReport, EngineError> {
        let payload = records
            .iter()
            .map(|r| rest_entry(&self.site, r))
            .collect::<Vec<_>>();
        let res = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.user, Some(&self.pass))
            .json(&payload)
            .send()
            .await
            .map_err(|e| EngineError::Write(format!("upsert request: {e}")))?;
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        debug!(
            site = %self.site,
            status = status.as_u16(),
            body = %crate::session::truncate_for_log(&body, 240),
            "upsert response"
        );
        if !status.is_success() {
            return Err(EngineError::Write(format!(
                "upsert HTTP {}: {}",
                status.as_u16(),
                crate::session::truncate_for_log(&body, 240)
            )));
        }
        Ok(WriteReport {
            written: records.len(),
        })
    }
}

/// Shape the REST payload entry. The point/price split follows the unit
/// metadata: yen-denominated values go to `price`, everything else counts as
/// points, which is the oripa default.
fn rest_entry(site: &str, record: &Record) -> serde_json::Value {
    let unit = record
        .unit
        .as_deref()
        .map(|u| u.to_ascii_lowercase())
        .unwrap_or_default();
    let is_price = unit.contains('円') || unit.contains("yen");
    let mut extra = record.extra.clone();
    let rarity = extra.remove("rarity");
    json!({
        "source_slug": site,
        "title": record.title,
        "image_url": record.image_url,
        "detail_url": record.detail_url,
        "points": if is_price { None } else { record.value },
        "price": if is_price { record.value } else { None },
        "rarity": rarity,
        "extra": extra,
    })
}
