//! Append-only log of every submission attempt.
//!
//! One line per share:
//! `unix_time,disposition,target,pool_url,device,device_id,thread,hash,data`
//! with target, hash and data in hex.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::error::Result;
use crate::tracing::prelude::*;
use crate::work::header::HEADER_LEN;
use crate::work::Work;

#[derive(Debug)]
pub struct ShareLog {
    file: Mutex<File>,
}

/// Format one share log line, without the trailing newline.
pub fn format_line(
    unix_time: u64,
    disposition: &str,
    work: &Work,
    device: &str,
    device_id: u32,
) -> String {
    let mut target = work.target;
    target.reverse();
    let mut hash = work.hash;
    hash.reverse();
    let thread = work.thr_id.map(|t| t.to_string()).unwrap_or_default();
    format!(
        "{unix_time},{disposition},{},{},{device},{device_id},{thread},{},{}",
        hex::encode(target),
        work.pool.url,
        hex::encode(hash),
        hex::encode(&work.data[..HEADER_LEN]),
    )
}

impl ShareLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        info!(path = %path.display(), "Logging shares");
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn log(&self, disposition: &str, work: &Work, device: &str, device_id: u32) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let line = format_line(now, disposition, work, device, device_id);
        let mut file = self.file.lock();
        if let Err(e) = writeln!(file, "{line}").and_then(|_| file.flush()) {
            error!(error = %e, "Failed to write share log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::test_util::pool;

    #[test]
    fn test_line_layout() {
        let mut work = Work::new(7, pool(0, "http://node:8332"));
        work.thr_id = Some(3);
        work.target[31] = 0x01;
        work.hash[0] = 0xab;
        let line = format_line(1_700_000_000, "accept", &work, "cpu", 2);
        let fields: Vec<&str> = line.split(',').collect();
        assert_eq!(fields.len(), 9);
        assert_eq!(fields[0], "1700000000");
        assert_eq!(fields[1], "accept");
        assert!(fields[2].starts_with("01"));
        assert_eq!(fields[3], "http://node:8332");
        assert_eq!(&fields[4..7], &["cpu", "2", "3"]);
        assert!(fields[7].ends_with("ab"));
        assert_eq!(fields[8].len(), HEADER_LEN * 2);
    }

    #[test]
    fn test_appends_lines() {
        let path = std::env::temp_dir().join(format!("mujina-sharelog-{}.csv", std::process::id()));
        let log = ShareLog::open(&path).unwrap();
        let work = Work::new(1, pool(0, "http://node:8332"));
        log.log("reject:duplicate", &work, "cpu", 0);
        log.log("accept", &work, "cpu", 0);
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains(",reject:duplicate,"));
    }
}
