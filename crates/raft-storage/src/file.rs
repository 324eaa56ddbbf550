//! # file
//!
//! why: keep term, vote and log on disk so a restarted node keeps its promises
//! relations: implements raft_core::Storage; errors from error.rs
//! what: FileStorage with an atomically replaced meta file and an append-only log
//!
//! Layout of the storage directory:
//! - `meta.json`: term and voted_for, replaced via temp file + fsync + rename
//! - `log.jsonl`: one JSON-encoded entry per line, fsynced after every append
//!
//! A crash can leave a partial final record in `log.jsonl`. It was never
//! acknowledged, so opening the directory cuts it off. A damaged record
//! anywhere else is real corruption and refuses to open.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use raft_core::{LogEntry, NodeId, Storage, Term};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::StorageError;

const META_FILE: &str = "meta.json";
const META_TEMP: &str = "meta.tmp";
const LOG_FILE: &str = "log.jsonl";

/// metadata structure for term and vote
#[derive(Debug, Default, Serialize, Deserialize)]
struct MetaData {
    term: Term,
    voted_for: Option<NodeId>,
}

/// What a pass over the log file found.
#[derive(Debug, Default)]
struct LogScan {
    entries: Vec<LogEntry>,
    offsets: Vec<u64>,
    /// end of the last complete, parseable record
    valid_len: u64,
    file_len: u64,
}

fn scan_log(path: &Path) -> Result<LogScan, StorageError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(LogScan::default()),
        Err(err) => return Err(err.into()),
    };
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);
    let mut scan = LogScan {
        file_len,
        ..LogScan::default()
    };

    let mut line = Vec::new();
    let mut offset = 0u64;
    let mut line_no = 0usize;
    loop {
        line.clear();
        let read = reader.read_until(b'\n', &mut line)?;
        if read == 0 {
            break;
        }
        line_no += 1;
        let complete = line.last() == Some(&b'\n');
        let at_end = offset + read as u64 >= file_len;

        match serde_json::from_slice::<LogEntry>(&line) {
            Ok(entry) if complete => {
                let expected = scan.entries.len() as u64 + 1;
                if entry.index != expected {
                    return Err(StorageError::OutOfOrder {
                        path: path.to_path_buf(),
                        expected,
                        found: entry.index,
                    });
                }
                scan.offsets.push(offset);
                scan.entries.push(entry);
                offset += read as u64;
                scan.valid_len = offset;
            }
            // torn final write
            _ if at_end => break,
            Ok(_) => break,
            Err(source) => {
                return Err(StorageError::Corrupt {
                    path: path.to_path_buf(),
                    line: line_no,
                    source,
                })
            }
        }
    }
    Ok(scan)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

/// file-based storage implementation using std::fs
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    log: File,
    /// byte offset of each record; record i holds index i + 1
    offsets: Vec<u64>,
    /// length of the log file covered by complete records
    end: u64,
}

impl FileStorage {
    /// open (or create) storage in `dir`, recovering from a torn log tail
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let log_path = dir.join(LOG_FILE);
        let scan = scan_log(&log_path)?;
        let log = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&log_path)?;

        if scan.valid_len < scan.file_len {
            warn!(
                path = %log_path.display(),
                valid_len = scan.valid_len,
                discarded_bytes = scan.file_len - scan.valid_len,
                "discarding torn record at end of log"
            );
            log.set_len(scan.valid_len)?;
            log.sync_data()?;
        }

        // an interrupted meta write leaves its temp file behind
        match fs::remove_file(dir.join(META_TEMP)) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
            _ => {}
        }

        info!(
            path = %dir.display(),
            entries = scan.offsets.len(),
            "opened raft storage"
        );
        Ok(Self {
            dir,
            log,
            offsets: scan.offsets,
            end: scan.valid_len,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// index of the last durable entry, 0 when empty
    pub fn last_index(&self) -> u64 {
        self.offsets.len() as u64
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn write_at_end(&mut self, buf: &[u8]) -> io::Result<()> {
        self.log.seek(SeekFrom::Start(self.end))?;
        self.log.write_all(buf)?;
        self.log.sync_data()
    }
}

impl Storage for FileStorage {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> io::Result<()> {
        let meta = MetaData { term, voted_for };
        let json = serde_json::to_vec_pretty(&meta)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        // atomic write: write to temp file then rename
        let temp_path = self.dir.join(META_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.meta_path())?;
        sync_dir(&self.dir)?;

        debug!(term, voted_for = ?voted_for, "persisted term and vote");
        Ok(())
    }

    fn load_term_and_vote(&self) -> io::Result<(Term, Option<NodeId>)> {
        let path = self.meta_path();
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            // default for new nodes
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((0, None)),
            Err(err) => return Err(err),
        };
        let meta: MetaData = serde_json::from_slice(&contents)
            .map_err(|source| StorageError::Metadata { path, source })?;
        Ok((meta.term, meta.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut expected = self.last_index() + 1;
        let mut buf = Vec::new();
        let mut offsets = Vec::with_capacity(entries.len());
        for entry in entries {
            if entry.index != expected {
                return Err(StorageError::NonContiguousAppend {
                    expected,
                    found: entry.index,
                }
                .into());
            }
            offsets.push(self.end + buf.len() as u64);
            serde_json::to_writer(&mut buf, entry)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            buf.push(b'\n');
            expected += 1;
        }

        if let Err(err) = self.write_at_end(&buf) {
            // a half-written record must not be read back as acknowledged
            if let Err(cleanup) = self.log.set_len(self.end) {
                warn!(error = %cleanup, "failed to cut partial append");
            }
            return Err(err);
        }

        self.end += buf.len() as u64;
        self.offsets.extend(offsets);
        debug!(
            entries = entries.len(),
            last_index = self.last_index(),
            "appended entries to log"
        );
        Ok(())
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        Ok(scan_log(&self.log_path())?.entries)
    }

    fn truncate_log_from(&mut self, from_index: u64) -> io::Result<()> {
        let keep = from_index.saturating_sub(1) as usize;
        let Some(&offset) = self.offsets.get(keep) else {
            return Ok(());
        };

        self.log.set_len(offset)?;
        self.log.sync_data()?;
        self.offsets.truncate(keep);
        self.end = offset;

        debug!(from_index, last_index = self.last_index(), "truncated log");
        Ok(())
    }

    fn clear(&mut self) -> io::Result<()> {
        match fs::remove_file(self.meta_path()) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => return Err(err),
            _ => {}
        }
        self.log.set_len(0)?;
        self.log.sync_data()?;
        self.offsets.clear();
        self.end = 0;
        Ok(())
    }
}
