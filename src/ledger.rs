//! Append-only CSV log of confirmation messages that actually went out.

use csv::{ReaderBuilder, WriterBuilder};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::model::SmsRecord;

pub const LEDGER_FILE: &str = "sms-ledger.csv";

#[derive(Debug, Clone)]
pub struct SmsLedger {
    path: PathBuf,
}

impl SmsLedger {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &SmsRecord) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let needs_header = fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut writer = WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        writer.serialize(record)?;
        writer.flush()?;

        tracing::info!(
            order_id = %record.order_id,
            path = %self.path.display(),
            "Recorded SMS in ledger"
        );
        Ok(())
    }

    /// Every record in file order; a missing ledger is empty.
    pub fn load(&self) -> Result<Vec<SmsRecord>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);
        let mut records = Vec::new();
        for result in reader.deserialize() {
            match result {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(error = %e, "Skipping unreadable ledger row"),
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::sample_order;
    use chrono::Utc;

    #[test]
    fn append_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SmsLedger::new(dir.path().join(LEDGER_FILE));

        ledger
            .append(&SmsRecord::from_order(&sample_order("1"), Utc::now()))
            .unwrap();
        ledger
            .append(&SmsRecord::from_order(&sample_order("2"), Utc::now()))
            .unwrap();

        let text = fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(text.matches("order_id").count(), 1);

        let records = ledger.load().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].order_id, "2");
        assert_eq!(records[0].seat, "S석");
        assert_eq!(records[0].phone_last4, "5678");
    }

    #[test]
    fn missing_ledger_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = SmsLedger::new(dir.path().join("none.csv"));
        assert!(ledger.load().unwrap().is_empty());
    }
}
