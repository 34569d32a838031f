//! The turn-level audit ledger.
//!
//! One JSONL file per agent per UTC day, append-only. Each line is one
//! completed audit; ordering within a file is by write time, not turn
//! order. Appends are fsync'd so a line survives a crash immediately after
//! the write.

pub mod record;

pub use record::{RetryMetadata, TurnRecord};

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::NaiveDate;
use tokio::io::AsyncWriteExt;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct TurnLedger {
    dir: PathBuf,
}

impl TurnLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, agent_key: &str, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{agent_key}-{}.jsonl", date.format("%Y%m%d")))
    }

    /// Append one completed turn to the agent's file for the record's day.
    pub async fn append(&self, record: &TurnRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.file_for(&record.agent_key, record.timestamp.date_naive());
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        let line = serde_json::to_string(record)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        // Flush userspace buffers and fsync so the line survives a process
        // crash immediately after append.
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Load every record an agent logged on `date`. Corrupt lines are
    /// skipped with a warning; one bad write must not hide a day of turns.
    pub fn load_day(&self, agent_key: &str, date: NaiveDate) -> Result<Vec<TurnRecord>> {
        let path = self.file_for(agent_key, date);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = OpenOptions::new().read(true).open(&path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for (line_idx, line_result) in reader.lines().enumerate() {
            let line = line_result?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TurnRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => warn!(
                    line = line_idx + 1,
                    error = %err,
                    path = %path.display(),
                    "corrupt turn-ledger line, skipping"
                ),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ethos_agent::WillDecision;

    fn record(agent_key: &str, turn_index: u64) -> TurnRecord {
        TurnRecord {
            timestamp: Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap(),
            agent_key: agent_key.to_string(),
            turn_index,
            user_id: "u1".to_string(),
            user_prompt: "prompt".to_string(),
            intellect_draft: "draft".to_string(),
            intellect_reflection: "reflection".to_string(),
            retrieved_context: String::new(),
            will_decision: WillDecision::Approve,
            will_reason: "fine".to_string(),
            conscience_ledger: vec![],
            spirit_score: 6,
            spirit_note: "Coherence 6/10, drift 0.00.".to_string(),
            drift: None,
            p_t: vec![0.0, 0.0],
            mu_after: vec![0.0, 0.0],
            spirit_feedback: String::new(),
            memory_summary: String::new(),
            final_output: "answer".to_string(),
            policy_id: None,
            org_id: None,
            retry: None,
        }
    }

    #[tokio::test]
    async fn append_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TurnLedger::new(dir.path());

        ledger.append(&record("steward", 11)).await.unwrap();
        ledger.append(&record("steward", 12)).await.unwrap();

        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let loaded = ledger.load_day("steward", date).unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].turn_index, 11);
        assert_eq!(loaded[1].turn_index, 12);
    }

    #[tokio::test]
    async fn files_partition_by_agent() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TurnLedger::new(dir.path());

        ledger.append(&record("steward", 1)).await.unwrap();
        ledger.append(&record("fiduciary", 1)).await.unwrap();

        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        assert_eq!(ledger.load_day("steward", date).unwrap().len(), 1);
        assert_eq!(ledger.load_day("fiduciary", date).unwrap().len(), 1);
        assert!(ledger.load_day("nobody", date).unwrap().is_empty());
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = TurnLedger::new(dir.path());
        ledger.append(&record("steward", 1)).await.unwrap();

        let date = NaiveDate::from_ymd_opt(2026, 3, 14).unwrap();
        let path = dir.path().join("steward-20260314.jsonl");
        let mut raw = std::fs::read_to_string(&path).unwrap();
        raw.push_str("{not json at all\n");
        std::fs::write(&path, raw).unwrap();

        ledger.append(&record("steward", 2)).await.unwrap();
        let loaded = ledger.load_day("steward", date).unwrap();
        assert_eq!(loaded.len(), 2);
    }
}
