use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::Path;

use tracing::{error, info};

use binlog::gtid::GtidList;
use common::err::{ReplicationError, Result};

pub const STATEFILE_NAME: &str = "current_gtid.txt";

/// Durable record of the committed GTID list.
///
/// The file holds a NUL-terminated GTID list and is rewritten in place at
/// offset 0 on each commit; the terminator makes a shorter rewrite safe to
/// read back.
pub struct GtidStateFile {
    file: File,
}

impl GtidStateFile {
    /// Open (or create) the state file in `statedir`. A read error is fatal;
    /// starting from a position we cannot confirm would replay or skip data.
    pub fn open(statedir: &Path) -> Result<(GtidStateFile, GtidList)> {
        let path = statedir.join(STATEFILE_NAME);

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .map_err(|e| {
                ReplicationError::State(format!(
                    "Failed to open GTID state file '{}': {}",
                    path.display(),
                    e
                ))
            })?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf).map_err(|e| {
            ReplicationError::State(format!(
                "Failed to load current GTID state from file '{}': {}",
                path.display(),
                e
            ))
        })?;

        // Reading stops at the first NUL byte or EOF.
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let text = String::from_utf8_lossy(&buf[..end]);
        let list = GtidList::parse(&text);

        if !list.is_empty() {
            info!("Continuing from GTID '{}'", list);
        }

        Ok((GtidStateFile { file }, list))
    }

    /// Persist the list. Write errors are logged but do not stop progress.
    pub fn save(&mut self, list: &GtidList) {
        let mut data = list.to_string().into_bytes();
        data.push(0);

        if let Err(e) = self.file.write_at(&data, 0) {
            error!("Failed to store current GTID state: {}", e);
        }
    }
}
