//! Session Store — a key/value blob store keyed by instance id. No decision
//! making: just durable load/save of each instance's persisted proxy
//! binding, plus the opaque path the Browser Worker uses for cookies/local
//! storage.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::StorageError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub instance_id: u32,
    pub proxy_ip: String,
    pub session_token: String,
    pub last_success_at: Option<DateTime<Utc>>,
    pub vote_count: u64,
    pub saved_at: DateTime<Utc>,
}

pub struct SessionStore {
    base_dir: PathBuf,
}

impl SessionStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self { base_dir: base_dir.into() }
    }

    fn instance_dir(&self, id: u32) -> PathBuf {
        self.base_dir.join(format!("instance_{id}"))
    }

    fn session_info_path(&self, id: u32) -> PathBuf {
        self.instance_dir(id).join("session_info.json")
    }

    /// Opaque filesystem location handed to the Browser Worker to persist
    /// cookies/local storage across opens.
    pub fn storage_state_path(&self, id: u32) -> PathBuf {
        self.instance_dir(id).join("storage")
    }

    pub fn load(&self, id: u32) -> Result<Option<SessionRecord>, StorageError> {
        let path = self.session_info_path(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)?;
        let record: SessionRecord = serde_json::from_str(&content)?;
        Ok(Some(record))
    }

    /// Atomic from the reader's perspective: write to a temp file in the
    /// same directory, fsync, then rename over the real path. A reader at
    /// any instant sees either the prior or the new record, never a
    /// partial write.
    pub fn save(&self, id: u32, record: &SessionRecord) -> Result<(), StorageError> {
        let dir = self.instance_dir(id);
        std::fs::create_dir_all(&dir)?;
        std::fs::create_dir_all(self.storage_state_path(id))?;

        let final_path = self.session_info_path(id);
        let tmp_path = dir.join(format!("session_info.json.tmp-{}", uuid::Uuid::new_v4()));

        let content = serde_json::to_string_pretty(record)?;
        {
            let file = std::fs::File::create(&tmp_path)?;
            use std::io::Write;
            let mut file = file;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp_path, &final_path)?;

        debug!(instance_id = id, "session record saved");
        Ok(())
    }

    /// List every `instance_<id>` directory under the base, for startup
    /// restoration.
    pub fn list_ids(&self) -> Result<Vec<u32>, StorageError> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let entry = entry?;
            if let Some(id) = parse_instance_dir_name(&entry.file_name().to_string_lossy()) {
                ids.push(id);
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }
}

fn parse_instance_dir_name(name: &str) -> Option<u32> {
    name.strip_prefix("instance_")?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!("votefleet-sessionstore-{}", uuid::Uuid::new_v4()));
        dir
    }

    #[test]
    fn load_missing_returns_none() {
        let store = SessionStore::new(tempdir());
        assert!(store.load(1).unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempdir();
        let store = SessionStore::new(&dir);

        let record = SessionRecord {
            instance_id: 7,
            proxy_ip: "5.6.7.8".to_string(),
            session_token: "tok-xyz".to_string(),
            last_success_at: Some(Utc::now()),
            vote_count: 3,
            saved_at: Utc::now(),
        };
        store.save(7, &record).unwrap();

        let loaded = store.load(7).unwrap().unwrap();
        assert_eq!(loaded.instance_id, 7);
        assert_eq!(loaded.vote_count, 3);
        assert_eq!(loaded.proxy_ip, "5.6.7.8");

        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn list_ids_discovers_saved_instances() {
        let dir = tempdir();
        let store = SessionStore::new(&dir);
        for id in [1, 3, 2] {
            store
                .save(
                    id,
                    &SessionRecord {
                        instance_id: id,
                        proxy_ip: String::new(),
                        session_token: String::new(),
                        last_success_at: None,
                        vote_count: 0,
                        saved_at: Utc::now(),
                    },
                )
                .unwrap();
        }
        assert_eq!(store.list_ids().unwrap(), vec![1, 2, 3]);
        std::fs::remove_dir_all(dir).ok();
    }
}
