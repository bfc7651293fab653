//! Durable JSON-lines price store
//!
//! Layout: one file per asset under the store directory, one row per commit.
//! The asset id is hex-escaped into the file name so ids like `NEO/USD` are
//! safe path components. Files are reloaded into memory on open; reads are
//! served from memory.
//!
//! Each file tracks the byte length of its committed rows. A failed append
//! is cut back to that length, and any bytes past it left by a crash are
//! discarded on reload or before the next append.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use oracle_core::{AggregatedPrice, AggregationMethod, StorageError, StorageResult};
use crate::store::{PriceSeries, PriceStore};

const FILE_EXTENSION: &str = "jsonl";

/// Serialized row; the asset id lives in the file name
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRow {
    timestamp: DateTime<Utc>,
    value: Decimal,
    sources: Vec<String>,
    confidence: f64,
    sequence: u64,
    method: AggregationMethod,
}

impl StoredRow {
    fn from_price(price: &AggregatedPrice) -> Self {
        Self {
            timestamp: price.timestamp,
            value: price.value,
            sources: price.contributing_sources.iter().cloned().collect(),
            confidence: price.confidence,
            sequence: price.sequence,
            method: price.method,
        }
    }

    fn into_price(self, asset_id: &str) -> AggregatedPrice {
        AggregatedPrice {
            asset_id: asset_id.to_string(),
            value: self.value,
            timestamp: self.timestamp,
            contributing_sources: self.sources.into_iter().collect::<BTreeSet<_>>(),
            confidence: self.confidence,
            sequence: self.sequence,
            method: self.method,
        }
    }
}

/// Per-asset file handle plus its in-memory index
#[derive(Debug)]
struct AssetFile {
    path: PathBuf,
    /// Byte length of the committed rows; also serializes appends and rewrites
    committed_len: Mutex<u64>,
    series: RwLock<PriceSeries>,
}

impl AssetFile {
    fn new(path: PathBuf, series: PriceSeries, committed_len: u64) -> Self {
        Self {
            path,
            committed_len: Mutex::new(committed_len),
            series: RwLock::new(series),
        }
    }
}

/// File-backed store
#[derive(Debug)]
pub struct FilePriceStore {
    dir: PathBuf,
    assets: DashMap<String, Arc<AssetFile>>,
}

impl FilePriceStore {
    /// Open (creating if needed) a store directory and load every series in it
    pub async fn open(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let assets = DashMap::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            let Some(asset_id) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(decode_asset_id)
            else {
                debug!("Skipping unrecognised file {}", path.display());
                continue;
            };

            let (series, committed_len) = load_series(&path, &asset_id).await?;
            debug!("Loaded {} rows for {}", series.len(), asset_id);
            assets.insert(asset_id, Arc::new(AssetFile::new(path, series, committed_len)));
        }

        info!("Opened price store at {} ({} assets)", dir.display(), assets.len());
        Ok(Self { dir, assets })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn asset_file(&self, asset_id: &str) -> Arc<AssetFile> {
        let entry = self.assets.entry(asset_id.to_string()).or_insert_with(|| {
            let path = self
                .dir
                .join(format!("{}.{}", encode_asset_id(asset_id), FILE_EXTENSION));
            Arc::new(AssetFile::new(path, PriceSeries::new(), 0))
        });
        Arc::clone(entry.value())
    }

    fn existing(&self, asset_id: &str) -> Option<Arc<AssetFile>> {
        self.assets.get(asset_id).map(|r| Arc::clone(r.value()))
    }
}

#[async_trait]
impl PriceStore for FilePriceStore {
    async fn save(&self, price: &AggregatedPrice) -> StorageResult<()> {
        let file = self.asset_file(&price.asset_id);
        let mut committed_len = file.committed_len.lock().await;

        file.series.read().check_append(price)?;

        let mut line = serde_json::to_string(&StoredRow::from_price(price))?;
        line.push('\n');

        let mut handle = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file.path)
            .await?;

        let on_disk = handle.metadata().await?.len();
        if on_disk > *committed_len {
            warn!(
                "Discarding {} uncommitted bytes in {}",
                on_disk - *committed_len,
                file.path.display()
            );
            handle.set_len(*committed_len).await?;
        }

        if let Err(err) = write_row(&mut handle, line.as_bytes()).await {
            if let Err(rollback) = handle.set_len(*committed_len).await {
                warn!("Failed to roll back {}: {}", file.path.display(), rollback);
            }
            return Err(err.into());
        }
        *committed_len += line.len() as u64;

        let appended = file.series.write().append(price.clone());
        appended
    }

    async fn get(&self, asset_id: &str) -> StorageResult<Option<AggregatedPrice>> {
        Ok(self
            .existing(asset_id)
            .and_then(|f| f.series.read().latest().cloned()))
    }

    async fn get_range(
        &self,
        asset_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<AggregatedPrice>> {
        Ok(self
            .existing(asset_id)
            .map(|f| f.series.read().range(start, end))
            .unwrap_or_default())
    }

    async fn delete(&self, asset_id: &str, timestamp: DateTime<Utc>) -> StorageResult<bool> {
        let Some(file) = self.existing(asset_id) else {
            return Ok(false);
        };
        let mut committed_len = file.committed_len.lock().await;

        let mut remaining = file.series.read().clone();
        if !remaining.remove(timestamp) {
            return Ok(false);
        }

        let mut contents = String::new();
        for price in remaining.entries() {
            contents.push_str(&serde_json::to_string(&StoredRow::from_price(price))?);
            contents.push('\n');
        }

        // Rewrite through a temp file so a crash never leaves a torn series
        let tmp = file.path.with_extension("jsonl.tmp");
        let len = contents.len() as u64;
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &file.path).await?;

        *committed_len = len;
        *file.series.write() = remaining;
        Ok(true)
    }
}

async fn write_row(handle: &mut tokio::fs::File, row: &[u8]) -> std::io::Result<()> {
    handle.write_all(row).await?;
    handle.flush().await?;
    handle.sync_data().await
}

/// Replay a series file. Returns the series and the byte length of the rows
/// it was built from.
///
/// An unterminated or unparsable final line is a torn append and is
/// dropped; a row repeating the previous one is a replayed retry and is
/// skipped. Anything else malformed is an error.
async fn load_series(path: &Path, asset_id: &str) -> StorageResult<(PriceSeries, u64)> {
    let contents = tokio::fs::read_to_string(path).await?;
    let lines: Vec<&str> = contents.split_inclusive('\n').collect();

    let mut series = PriceSeries::new();
    let mut offset = 0u64;
    let mut committed_len = 0u64;

    for (idx, raw) in lines.iter().enumerate() {
        offset += raw.len() as u64;
        let line = raw.trim();
        if line.is_empty() {
            committed_len = offset;
            continue;
        }

        let is_last = idx + 1 == lines.len();
        let row: StoredRow = match serde_json::from_str(line) {
            Ok(row) if raw.ends_with('\n') => row,
            Err(_) | Ok(_) if is_last => {
                warn!("Dropping torn trailing row in {}", path.display());
                break;
            }
            Ok(_) => {
                return Err(StorageError::Serialization(format!(
                    "{}:{}: unterminated row",
                    path.display(),
                    idx + 1
                )))
            }
            Err(e) => {
                return Err(StorageError::Serialization(format!(
                    "{}:{}: {}",
                    path.display(),
                    idx + 1,
                    e
                )))
            }
        };

        let price = row.into_price(asset_id);
        let repeated = series
            .latest()
            .is_some_and(|last| last.timestamp == price.timestamp && last.sequence == price.sequence);
        if repeated {
            warn!("Skipping repeated row {} in {}", idx + 1, path.display());
        } else {
            series.append(price)?;
        }
        committed_len = offset;
    }

    Ok((series, committed_len))
}

/// Keep `[A-Za-z0-9-]`, escape every other byte as `_XX`
pub fn encode_asset_id(asset_id: &str) -> String {
    let mut out = String::with_capacity(asset_id.len());
    for byte in asset_id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{byte:02X}"));
        }
    }
    out
}

pub fn decode_asset_id(encoded: &str) -> Option<String> {
    let bytes = encoded.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_' {
            let hex = encoded.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
