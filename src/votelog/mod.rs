//! Vote Log — append-only record of every attempt, plus a co-located stream
//! of hourly-limit detections.
//!
//! Both streams live in the same directory; the hourly-limit path is always
//! derived from the main log's path, never configured independently. This is
//! the fix for a bug in the source where the two files could drift apart and
//! the analytics join silently produced zero limit detections.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::StorageError;

const APPEND_RETRY_ATTEMPTS: u32 = 3;
const APPEND_RETRY_BASE_MS: u64 = 100;

/// One row of the main vote log. Field order is the persisted CSV column
/// order and must not change — historical logs are read by column position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteLogEntry {
    pub timestamp: DateTime<Utc>,
    pub instance_id: u32,
    pub instance_name: String,
    pub time_of_click: String,
    pub status: String,
    pub voting_url: String,
    pub cooldown_message: String,
    pub failure_type: String,
    pub failure_reason: String,
    pub initial_vote_count: Option<u64>,
    pub final_vote_count: Option<u64>,
    pub vote_count_change: Option<i64>,
    pub proxy_ip: String,
    pub session_token: String,
    pub click_attempts: u32,
    pub error_message: String,
    pub browser_closed: bool,
}

/// One row of the hourly-limit stream. One record per *detection*, not per
/// affected instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyLimitEntry {
    pub detected_at: DateTime<Utc>,
    pub instance_id: u32,
    pub instance_name: String,
    pub vote_count: u64,
    pub proxy_ip: String,
    pub session_token: String,
    pub cooldown_message: String,
    pub failure_type: String,
}

/// Per-hour aggregate used by the external interface's analytics view.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HourBucket {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub hourly_limit_count: u64,
    pub votes_before_limit: u64,
}

pub struct VoteLog {
    votes_path: PathBuf,
    hourly_path: PathBuf,
    write_lock: Mutex<()>,
}

impl VoteLog {
    /// `votes_path` is the main log file; the hourly-limit stream is always
    /// derived from it (same directory, fixed file name) so the two can
    /// never drift apart.
    pub fn new(votes_path: impl Into<PathBuf>) -> Self {
        let votes_path = votes_path.into();
        let hourly_path = hourly_limit_path_for(&votes_path);
        Self {
            votes_path,
            hourly_path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn votes_path(&self) -> &Path {
        &self.votes_path
    }

    pub fn hourly_path(&self) -> &Path {
        &self.hourly_path
    }

    pub async fn append_attempt(&self, entry: VoteLogEntry) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        append_with_retry(&self.votes_path, &entry).await
    }

    pub async fn append_hourly_limit(&self, entry: HourlyLimitEntry) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        append_with_retry(&self.hourly_path, &entry).await
    }

    /// Linear scan over the whole vote log. Only used at startup.
    pub fn read_all(&self) -> Result<Vec<VoteLogEntry>, StorageError> {
        if !self.votes_path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(&self.votes_path)?;
        let mut out = Vec::new();
        for record in reader.deserialize() {
            let entry: VoteLogEntry = record?;
            out.push(entry);
        }
        Ok(out)
    }

    pub fn read_all_hourly_limits(&self) -> Result<Vec<HourlyLimitEntry>, StorageError> {
        if !self.hourly_path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_path(&self.hourly_path)?;
        let mut out = Vec::new();
        for record in reader.deserialize() {
            out.push(record?);
        }
        Ok(out)
    }

    /// Derived view joining both streams by hour bucket (UTC hour, truncated
    /// at the minute).
    pub fn hourly_analytics(
        &self,
        _now: DateTime<Utc>,
    ) -> Result<BTreeMap<DateTime<Utc>, HourBucket>, StorageError> {
        let mut buckets: BTreeMap<DateTime<Utc>, HourBucket> = BTreeMap::new();

        for entry in self.read_all()? {
            let bucket = buckets.entry(hour_floor(entry.timestamp)).or_default();
            bucket.total += 1;
            if entry.status == "success" {
                bucket.success += 1;
            } else {
                bucket.failed += 1;
            }
        }

        for entry in self.read_all_hourly_limits()? {
            let bucket = buckets.entry(hour_floor(entry.detected_at)).or_default();
            bucket.hourly_limit_count += 1;
            bucket.votes_before_limit += entry.vote_count;
        }

        Ok(buckets)
    }
}

fn hour_floor(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

fn hourly_limit_path_for(votes_path: &Path) -> PathBuf {
    let dir = votes_path.parent().unwrap_or_else(|| Path::new("."));
    dir.join("hourly_limits.csv")
}

async fn append_with_retry<T: Serialize>(path: &Path, entry: &T) -> Result<(), StorageError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match append_once(path, entry) {
            Ok(()) => return Ok(()),
            Err(e) if attempt >= APPEND_RETRY_ATTEMPTS => {
                warn!("vote log append failed permanently after {} attempts: {}", attempt, e);
                return Err(StorageError::Exhausted {
                    attempts: attempt,
                    reason: e.to_string(),
                });
            }
            Err(e) => {
                let delay_ms = APPEND_RETRY_BASE_MS * 2u64.pow(attempt - 1);
                debug!("vote log append failed (attempt {}), retrying in {}ms: {}", attempt, delay_ms, e);
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            }
        }
    }
}

/// Open-append-write-flush-fsync, synchronously. Done inside a retry loop by
/// the caller; a single call here is one attempt.
fn append_once<T: Serialize>(path: &Path, entry: &T) -> Result<(), StorageError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;

    {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(&file);
        writer.serialize(entry)?;
        writer.flush()?;
    }

    file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_entry(instance_id: u32) -> VoteLogEntry {
        VoteLogEntry {
            timestamp: Utc.with_ymd_and_hms(2025, 10, 20, 13, 0, 0).unwrap(),
            instance_id,
            instance_name: format!("instance-{instance_id}"),
            time_of_click: "13:00:00".to_string(),
            status: "success".to_string(),
            voting_url: "https://example.com/vote".to_string(),
            cooldown_message: String::new(),
            failure_type: String::new(),
            failure_reason: String::new(),
            initial_vote_count: Some(12618),
            final_vote_count: Some(12619),
            vote_count_change: Some(1),
            proxy_ip: "1.2.3.4".to_string(),
            session_token: "tok-1".to_string(),
            click_attempts: 1,
            error_message: String::new(),
            browser_closed: true,
        }
    }

    #[test]
    fn hourly_limit_path_is_derived_from_votes_path() {
        let votes = PathBuf::from("/data/logs/votes.csv");
        let hourly = hourly_limit_path_for(&votes);
        assert_eq!(hourly.parent(), votes.parent());
        assert_eq!(hourly.file_name().unwrap(), "hourly_limits.csv");
    }

    #[tokio::test]
    async fn append_then_read_all_round_trips() {
        let dir = tempdir();
        let log = VoteLog::new(dir.join("votes.csv"));

        log.append_attempt(sample_entry(1)).await.unwrap();
        log.append_attempt(sample_entry(2)).await.unwrap();

        let rows = log.read_all().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].instance_id, 1);
        assert_eq!(rows[1].instance_id, 2);
        assert_eq!(rows[0].initial_vote_count, Some(12618));

        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn hourly_limit_stream_lives_next_to_main_log() {
        let dir = tempdir();
        let log = VoteLog::new(dir.join("votes.csv"));

        log.append_hourly_limit(HourlyLimitEntry {
            detected_at: Utc.with_ymd_and_hms(2025, 10, 20, 13, 0, 0).unwrap(),
            instance_id: 1,
            instance_name: "instance-1".to_string(),
            vote_count: 5,
            proxy_ip: "1.2.3.4".to_string(),
            session_token: "tok-1".to_string(),
            cooldown_message: "reactivated at 04:00 AM".to_string(),
            failure_type: "global_hourly_limit".to_string(),
        })
        .await
        .unwrap();

        assert_eq!(log.hourly_path().parent(), log.votes_path().parent());
        let rows = log.read_all_hourly_limits().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].vote_count, 5);

        std::fs::remove_dir_all(dir).ok();
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("votefleet-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }
}
