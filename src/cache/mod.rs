//! On-disk cache of SELECT results.
//!
//! Each entry is two files named by the query fingerprint (or an explicit
//! cache name): `<name>.json` holds the result with its creation time and
//! `<name>.sql` the query text. Entries are shared across credentials since
//! the fingerprint covers the SQL text only.
//!
//! There is no locking. Concurrent writers of the same entry race and the
//! last rename wins.

mod ttl;

pub use ttl::parse_ttl;

use crate::config::Settings;
use crate::db::{DatabaseClient, QueryResult};
use crate::error::{CourierError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Units for [`CacheMetadata::age_in`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AgeUnit {
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl AgeUnit {
    fn seconds(&self) -> f64 {
        match self {
            Self::Seconds => 1.0,
            Self::Minutes => 60.0,
            Self::Hours => 3_600.0,
            Self::Days => 86_400.0,
        }
    }
}

impl FromStr for AgeUnit {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "s" | "sec" | "second" | "seconds" => Ok(Self::Seconds),
            "m" | "min" | "minute" | "minutes" => Ok(Self::Minutes),
            "h" | "hour" | "hours" => Ok(Self::Hours),
            "d" | "day" | "days" => Ok(Self::Days),
            other => Err(CourierError::config(format!(
                "Unknown age unit '{other}'. Expected seconds, minutes, hours or days"
            ))),
        }
    }
}

/// Provenance of a result that went through the cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheMetadata {
    pub created_at: DateTime<Utc>,
    /// The serialized result.
    pub cache_path: PathBuf,
    /// Sibling file holding the SQL text.
    pub query_path: PathBuf,
    pub fingerprint: String,
    /// True when the result was read from disk rather than executed.
    pub hit: bool,
}

impl CacheMetadata {
    /// Time since the entry was written.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    /// Age expressed in `unit`, fractional.
    pub fn age_in(&self, unit: AgeUnit) -> f64 {
        self.age().num_milliseconds() as f64 / 1_000.0 / unit.seconds()
    }
}

impl fmt::Display for CacheMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (created {}, {:.1} minutes old)",
            self.cache_path.display(),
            self.created_at.to_rfc3339(),
            self.age_in(AgeUnit::Minutes)
        )
    }
}

/// The `<name>.json` payload.
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    fingerprint: String,
    created_at: DateTime<Utc>,
    ttl_secs: u64,
    result: QueryResult,
}

/// Content-addressed, TTL-bound result cache in a directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    dir: PathBuf,
}

impl CacheStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.cache_dir.clone())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// SHA-256 of the SQL text with whitespace runs collapsed, hex encoded.
    pub fn fingerprint(sql: &str) -> String {
        let normalized = sql.split_whitespace().collect::<Vec<_>>().join(" ");
        hex::encode(Sha256::digest(normalized.as_bytes()))
    }

    /// Returns the cached result for `sql` if present and no older than `ttl`,
    /// otherwise runs it on `client` and stores the fresh result.
    pub async fn lookup_or_execute(
        &self,
        sql: &str,
        client: &dyn DatabaseClient,
        ttl: Duration,
        cache_name: Option<&str>,
    ) -> Result<QueryResult> {
        if let Some(hit) = self.lookup(sql, ttl, cache_name)? {
            return Ok(hit);
        }
        let result = client.execute_query(sql).await?;
        self.store(sql, result, ttl, cache_name)
    }

    /// Reads a fresh entry. Missing, expired, mismatched or corrupt entries
    /// are misses.
    pub fn lookup(
        &self,
        sql: &str,
        ttl: Duration,
        cache_name: Option<&str>,
    ) -> Result<Option<QueryResult>> {
        let fingerprint = Self::fingerprint(sql);
        let (cache_path, query_path) = self.paths(&fingerprint, cache_name)?;

        let content = match fs::read_to_string(&cache_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Cache miss: {} does not exist", cache_path.display());
                return Ok(None);
            }
            Err(e) => {
                return Err(CourierError::cache(format!(
                    "Failed to read {}: {e}",
                    cache_path.display()
                )))
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&content) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Ignoring corrupt cache file {}: {e}", cache_path.display());
                return Ok(None);
            }
        };

        if entry.fingerprint != fingerprint {
            info!(
                "Cache entry {} holds a different query, refreshing",
                cache_path.display()
            );
            return Ok(None);
        }

        let age = Utc::now() - entry.created_at;
        let expired = match chrono::Duration::from_std(ttl) {
            Ok(ttl) => age > ttl,
            Err(_) => false,
        };
        if expired {
            info!(
                "Cache entry {} expired ({}s old, ttl {}s)",
                cache_path.display(),
                age.num_seconds(),
                ttl.as_secs()
            );
            return Ok(None);
        }

        info!("Cache hit: {}", cache_path.display());
        let mut result = entry.result;
        result.cache = Some(CacheMetadata {
            created_at: entry.created_at,
            cache_path,
            query_path,
            fingerprint,
            hit: true,
        });
        Ok(Some(result))
    }

    /// Writes `result` and the SQL text, overwriting any previous entry.
    pub fn store(
        &self,
        sql: &str,
        mut result: QueryResult,
        ttl: Duration,
        cache_name: Option<&str>,
    ) -> Result<QueryResult> {
        let fingerprint = Self::fingerprint(sql);
        let (cache_path, query_path) = self.paths(&fingerprint, cache_name)?;
        fs::create_dir_all(&self.dir).map_err(|e| {
            CourierError::cache(format!(
                "Failed to create cache directory {}: {e}",
                self.dir.display()
            ))
        })?;

        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            created_at: Utc::now(),
            ttl_secs: ttl.as_secs(),
            result,
        };
        let payload = serde_json::to_string(&entry)
            .map_err(|e| CourierError::cache(format!("Failed to serialize result: {e}")))?;

        write_atomic(&query_path, sql.as_bytes())?;
        write_atomic(&cache_path, payload.as_bytes())?;
        info!(
            "Cached {} rows in {}",
            entry.result.row_count,
            cache_path.display()
        );

        result = entry.result;
        result.cache = Some(CacheMetadata {
            created_at: entry.created_at,
            cache_path,
            query_path,
            fingerprint,
            hit: false,
        });
        Ok(result)
    }

    /// Removes the entry for `sql`. Returns true if anything was deleted.
    pub fn invalidate(&self, sql: &str, cache_name: Option<&str>) -> Result<bool> {
        let (cache_path, query_path) = self.paths(&Self::fingerprint(sql), cache_name)?;
        let mut removed = false;
        for path in [cache_path, query_path] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(CourierError::cache(format!(
                        "Failed to remove {}: {e}",
                        path.display()
                    )))
                }
            }
        }
        if removed {
            debug!("Invalidated cache entry for {}", Self::fingerprint(sql));
        }
        Ok(removed)
    }

    /// Deletes every entry in the cache directory. Returns the number of
    /// entries removed.
    pub fn clear(&self) -> Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(CourierError::cache(format!(
                    "Failed to list {}: {e}",
                    self.dir.display()
                )))
            }
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let extension = path.extension().and_then(|ext| ext.to_str());
            if !matches!(extension, Some("json") | Some("sql")) {
                continue;
            }
            fs::remove_file(&path).map_err(|e| {
                CourierError::cache(format!("Failed to remove {}: {e}", path.display()))
            })?;
            if extension == Some("json") {
                removed += 1;
            }
        }
        info!("Cleared {removed} cache entries from {}", self.dir.display());
        Ok(removed)
    }

    fn paths(&self, fingerprint: &str, cache_name: Option<&str>) -> Result<(PathBuf, PathBuf)> {
        let name = match cache_name.map(str::trim).filter(|n| !n.is_empty()) {
            Some(name) => {
                let name = name.strip_suffix(".json").unwrap_or(name);
                if name.contains(['/', '\\']) || name == "." || name == ".." {
                    return Err(CourierError::config(format!(
                        "Cache name '{name}' must be a plain file name"
                    )));
                }
                name.to_string()
            }
            None => fingerprint.to_string(),
        };
        Ok((
            self.dir.join(format!("{name}.json")),
            self.dir.join(format!("{name}.sql")),
        ))
    }
}

/// Writes to a sibling temp file and renames it over `path`.
fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", std::process::id()));
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, contents)
        .and_then(|()| fs::rename(&tmp, path))
        .map_err(|e| {
            let _ = fs::remove_file(&tmp);
            CourierError::cache(format!("Failed to write {}: {e}", path.display()))
        })
}
