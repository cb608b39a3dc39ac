//! File-backed node state.
//!
//! One directory holds everything: JSON singletons (registration, service
//! list, stored change, delivery config) and JSONL logs (service queue,
//! notifications, delivery log). Single-writer assumption; exactly one
//! process per identity mutates these files; there is no locking.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StateDir {
    root: PathBuf,
}

impl StateDir {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ensure(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root)
            .with_context(|| format!("creating state dir {:?}", self.root))
    }

    // --- file locations -----------------------------------------------------

    pub fn registration(&self) -> PathBuf {
        self.root.join("registration.json")
    }
    pub fn services(&self) -> PathBuf {
        self.root.join("services.json")
    }
    pub fn stored_change(&self) -> PathBuf {
        self.root.join("latest-change.json")
    }
    pub fn service_queue(&self) -> PathBuf {
        self.root.join("service-queue.jsonl")
    }
    pub fn notifications(&self) -> PathBuf {
        self.root.join("notifications.jsonl")
    }
    pub fn baemail_config(&self) -> PathBuf {
        self.root.join("baemail-config.json")
    }
    pub fn baemail_log(&self) -> PathBuf {
        self.root.join("baemail-log.jsonl")
    }

    // --- JSON singletons ----------------------------------------------------

    /// Read a JSON file. Absent file yields `None`; a corrupt file is an
    /// error rather than silently treated as missing.
    pub fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing {path:?}"))?;
                Ok(Some(value))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {path:?}")),
        }
    }

    pub fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        self.ensure()?;
        let json = serde_json::to_vec_pretty(value)?;
        std::fs::write(path, json).with_context(|| format!("writing {path:?}"))
    }

    /// Delete a file, ignoring "not found".
    pub fn delete(&self, path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {path:?}")),
        }
    }

    // --- JSONL logs ---------------------------------------------------------

    pub fn append_jsonl<T: Serialize>(&self, path: &Path, entry: &T) -> Result<()> {
        self.ensure()?;
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening {path:?}"))?;
        file.write_all(&line)
            .with_context(|| format!("appending to {path:?}"))
    }

    /// Read every parseable line of a JSONL file. Absent file yields an empty
    /// list; unparseable lines are skipped.
    pub fn read_jsonl<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {path:?}")),
        };
        Ok(text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect())
    }

    /// Rewrite a JSONL file from scratch (queue/log status updates).
    pub fn rewrite_jsonl<T: Serialize>(&self, path: &Path, entries: &[T]) -> Result<()> {
        self.ensure()?;
        let mut out = Vec::new();
        for entry in entries {
            out.extend(serde_json::to_vec(entry)?);
            out.push(b'\n');
        }
        std::fs::write(path, out).with_context(|| format!("rewriting {path:?}"))
    }
}

/// Milliseconds since the Unix epoch (entry timestamps).
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// RFC 3339 timestamp (human-facing record fields).
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        n: u32,
    }

    fn temp_state() -> (tempfile::TempDir, StateDir) {
        let dir = tempfile::tempdir().unwrap();
        let state = StateDir::new(dir.path().join("state"));
        (dir, state)
    }

    #[test]
    fn json_round_trip_and_delete() {
        let (_g, state) = temp_state();
        let path = state.registration();

        assert_eq!(state.read_json::<Row>(&path).unwrap(), None);
        state.write_json(&path, &Row { n: 7 }).unwrap();
        assert_eq!(state.read_json::<Row>(&path).unwrap(), Some(Row { n: 7 }));
        state.delete(&path).unwrap();
        assert_eq!(state.read_json::<Row>(&path).unwrap(), None);
        // Deleting again is not an error.
        state.delete(&path).unwrap();
    }

    #[test]
    fn jsonl_append_read_skips_bad_lines() {
        let (_g, state) = temp_state();
        let path = state.service_queue();

        state.append_jsonl(&path, &Row { n: 1 }).unwrap();
        state.append_jsonl(&path, &Row { n: 2 }).unwrap();
        // Corrupt line in the middle.
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(b"{not json\n").unwrap();
        }
        state.append_jsonl(&path, &Row { n: 3 }).unwrap();

        let rows: Vec<Row> = state.read_jsonl(&path).unwrap();
        assert_eq!(rows, vec![Row { n: 1 }, Row { n: 2 }, Row { n: 3 }]);
    }

    #[test]
    fn rewrite_replaces_contents() {
        let (_g, state) = temp_state();
        let path = state.service_queue();
        state.append_jsonl(&path, &Row { n: 1 }).unwrap();
        state.rewrite_jsonl(&path, &[Row { n: 9 }]).unwrap();
        let rows: Vec<Row> = state.read_jsonl(&path).unwrap();
        assert_eq!(rows, vec![Row { n: 9 }]);
    }
}
