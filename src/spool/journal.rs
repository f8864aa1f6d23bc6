use crate::types::{Destination, SectorId};
use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum JournalOp {
    Migrate,
    Erase,
    EmergencyFlush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum JournalState {
    Pending,
    Committed,
}

/// One intent-log line. `pending` is appended before the file operation,
/// `committed` after it; startup replay resolves anything left pending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JournalEntry {
    pub op_id: u64,
    pub op: JournalOp,
    pub sensor_id: u32,
    pub destination: u8,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sectors: Vec<SectorId>,
    pub state: JournalState,
    pub logged_at: String,
}

/// Append-only JSON-lines intent log, fsynced per append. A torn trailing
/// line (power loss mid-append) parses as garbage and is ignored.
pub(crate) struct Journal {
    file: fs::File,
    next_op_id: u64,
}

impl Journal {
    pub fn open(path: &Path) -> Result<(Self, Vec<JournalEntry>)> {
        let mut entries: Vec<JournalEntry> = Vec::new();
        if path.exists() {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("read {}", path.display()))?;
            for line in raw.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<JournalEntry>(line) {
                    Ok(entry) => entries.push(entry),
                    Err(err) => {
                        tracing::warn!(error = %err, "discarding torn journal tail");
                        break;
                    }
                }
            }
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {}", path.display()))?;
        let next_op_id = entries.iter().map(|e| e.op_id).max().unwrap_or(0) + 1;
        Ok((Self { file, next_op_id }, entries))
    }

    fn append(&mut self, entry: &JournalEntry) -> Result<()> {
        let line = serde_json::to_string(entry)?;
        writeln!(self.file, "{line}").context("append journal entry")?;
        self.file.sync_data().context("sync journal")?;
        Ok(())
    }

    pub fn begin(
        &mut self,
        op: JournalOp,
        sensor_id: u32,
        dest: Destination,
        file_name: &str,
        sectors: &[SectorId],
    ) -> Result<u64> {
        let op_id = self.next_op_id;
        self.next_op_id += 1;
        self.append(&JournalEntry {
            op_id,
            op,
            sensor_id,
            destination: dest as u8,
            file_name: file_name.to_string(),
            sectors: sectors.to_vec(),
            state: JournalState::Pending,
            logged_at: Utc::now().to_rfc3339(),
        })?;
        Ok(op_id)
    }

    pub fn commit(
        &mut self,
        op_id: u64,
        op: JournalOp,
        sensor_id: u32,
        dest: Destination,
        file_name: &str,
    ) -> Result<()> {
        self.append(&JournalEntry {
            op_id,
            op,
            sensor_id,
            destination: dest as u8,
            file_name: file_name.to_string(),
            sectors: Vec::new(),
            state: JournalState::Committed,
            logged_at: Utc::now().to_rfc3339(),
        })
    }

    /// Truncate after startup replay; every surviving effect is on disk.
    pub fn reset(&mut self) -> Result<()> {
        self.file.set_len(0).context("truncate journal")?;
        self.file.sync_data().context("sync journal")?;
        Ok(())
    }
}
