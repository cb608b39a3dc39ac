//! Durable queue of accepted service requests awaiting fulfillment.
//!
//! Entries are appended as JSONL in arrival order. Status only moves
//! pending → fulfilled. Fulfillment rewrites the whole file; fine at
//! agent-paced request volume; flagged as a scaling limit, not a bug.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::storage::{now_millis, StateDir};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Fulfilled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub status: QueueStatus,
    pub request_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    pub from: String,
    /// Our identity at the time of acceptance.
    pub identity_key: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_txid: Option<String>,
    pub satoshis_received: u64,
    pub wallet_accepted: bool,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fulfilled_at: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ServiceQueue {
    state: StateDir,
}

impl ServiceQueue {
    pub fn new(state: StateDir) -> Self {
        Self { state }
    }

    pub fn enqueue(&self, entry: &QueueEntry) -> Result<()> {
        self.state.append_jsonl(&self.state.service_queue(), entry)
    }

    pub fn entries(&self) -> Result<Vec<QueueEntry>> {
        self.state.read_jsonl(&self.state.service_queue())
    }

    pub fn list_pending(&self) -> Result<Vec<QueueEntry>> {
        Ok(self
            .entries()?
            .into_iter()
            .filter(|e| e.status == QueueStatus::Pending)
            .collect())
    }

    /// Flip one entry to fulfilled. Returns whether a matching entry existed.
    pub fn mark_fulfilled(&self, request_id: &str) -> Result<bool> {
        let mut entries = self.entries()?;
        let mut found = false;
        for entry in &mut entries {
            if entry.request_id == request_id {
                entry.status = QueueStatus::Fulfilled;
                entry.fulfilled_at = Some(now_millis());
                found = true;
            }
        }
        if found {
            self.state.rewrite_jsonl(&self.state.service_queue(), &entries)?;
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(request_id: &str) -> QueueEntry {
        QueueEntry {
            status: QueueStatus::Pending,
            request_id: request_id.into(),
            service_id: Some("echo".into()),
            from: "02aa".into(),
            identity_key: "02bb".into(),
            input: json!({"text": "hi"}),
            payment_txid: Some("feed".into()),
            satoshis_received: 15,
            wallet_accepted: true,
            timestamp: now_millis(),
            fulfilled_at: None,
        }
    }

    fn queue() -> (tempfile::TempDir, ServiceQueue) {
        let dir = tempfile::tempdir().unwrap();
        let q = ServiceQueue::new(StateDir::new(dir.path().to_path_buf()));
        (dir, q)
    }

    #[test]
    fn enqueue_then_list_pending_round_trip() {
        let (_g, q) = queue();
        q.enqueue(&entry("r1")).unwrap();
        q.enqueue(&entry("r2")).unwrap();

        let pending = q.list_pending().unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|e| e.status == QueueStatus::Pending));
    }

    #[test]
    fn fulfillment_excludes_entry_from_pending() {
        let (_g, q) = queue();
        q.enqueue(&entry("r1")).unwrap();
        q.enqueue(&entry("r2")).unwrap();

        assert!(q.mark_fulfilled("r1").unwrap());

        let pending = q.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].request_id, "r2");

        let all = q.entries().unwrap();
        let done = all.iter().find(|e| e.request_id == "r1").unwrap();
        assert_eq!(done.status, QueueStatus::Fulfilled);
        assert!(done.fulfilled_at.is_some());
    }

    #[test]
    fn fulfilling_unknown_request_is_a_noop() {
        let (_g, q) = queue();
        q.enqueue(&entry("r1")).unwrap();
        assert!(!q.mark_fulfilled("missing").unwrap());
        assert_eq!(q.list_pending().unwrap().len(), 1);
    }
}
