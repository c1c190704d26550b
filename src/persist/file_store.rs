// src/persist/file_store.rs

//! File-backed session store.
//!
//! Layout of a session directory:
//!
//! - `transitions.jsonl`: one `{seq, record, checksum}` line per committed
//!   transition. A commit returns only after its line is appended and synced,
//!   so the append is the commit point.
//! - `snapshot.json`: every item's status and version as of `last_seq`,
//!   replaced atomically (temp file + rename). Once a snapshot is in place
//!   the log is truncated; records at or below `last_seq` found in the log
//!   after a crash are skipped on load.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dag::GraphStore;
use crate::errors::{ExecutionError, PlanError, Result};
use crate::persist::record::TransitionRecord;
use crate::persist::store::{Ledger, SNAPSHOT_FORMAT, SessionState, Snapshot, TransitionStore};

pub const SNAPSHOT_FILE: &str = "snapshot.json";
pub const LOG_FILE: &str = "transitions.jsonl";

#[derive(Debug, Serialize, Deserialize)]
struct LogLine {
    seq: u64,
    record: TransitionRecord,
    checksum: String,
}

fn checksum(record: &TransitionRecord) -> serde_json::Result<String> {
    let bytes = serde_json::to_vec(record)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

fn write_atomic_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    let text = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    {
        let mut file = File::create(&tmp)?;
        file.write_all(&text)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}

#[cfg_attr(not(test), allow(dead_code))]
fn torn_write(file: &mut File, line: &[u8]) -> io::Result<()> {
    file.write_all(&line[..line.len() / 2])?;
    Err(io::Error::other("write interrupted"))
}

fn save_failed(context: &str, err: impl std::fmt::Display) -> PlanError {
    ExecutionError::session_save(format!("{context}: {err}")).into()
}

fn load_failed(context: &str, err: impl std::fmt::Display) -> PlanError {
    ExecutionError::session_load(format!("{context}: {err}")).into()
}

#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    snapshot_every: usize,
    ledger: Option<Ledger>,
    log: Option<File>,
    since_snapshot: usize,
    /// A failed append could not be rolled back; the next commit goes to a
    /// fresh snapshot instead of the log.
    needs_snapshot: bool,
    #[cfg(test)]
    tear_next_append: bool,
}

impl FileStore {
    /// Open (creating if needed) a session directory. Nothing is read until
    /// [`TransitionStore::load`].
    pub fn open(dir: impl Into<PathBuf>, snapshot_every: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| load_failed(&format!("creating session dir {}", dir.display()), e))?;
        Ok(Self {
            dir,
            snapshot_every: snapshot_every.max(1),
            ledger: None,
            log: None,
            since_snapshot: 0,
            needs_snapshot: false,
            #[cfg(test)]
            tear_next_append: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    pub fn log_path(&self) -> PathBuf {
        self.dir.join(LOG_FILE)
    }

    fn open_log(&self) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())
    }

    fn log_file(&mut self) -> io::Result<&mut File> {
        let file = match self.log.take() {
            Some(file) => file,
            None => self.open_log()?,
        };
        Ok(self.log.insert(file))
    }

    fn append(&mut self, record: &TransitionRecord) -> io::Result<()> {
        let line = LogLine {
            seq: record.seq,
            record: record.clone(),
            checksum: checksum(record).map_err(io::Error::other)?,
        };
        let mut text = serde_json::to_string(&line).map_err(io::Error::other)?;
        text.push('\n');

        let tear = self.take_tear();
        let file = self.log_file()?;
        let start = file.metadata()?.len();
        let written = if tear {
            torn_write(file, text.as_bytes())
        } else {
            file.write_all(text.as_bytes()).and_then(|()| file.sync_data())
        };
        let Err(err) = written else {
            return Ok(());
        };

        // Cut the partial line so later appends do not land behind it.
        let rollback = file.set_len(start).and_then(|()| file.sync_data());
        if let Err(e) = rollback {
            warn!(
                path = %self.log_path().display(),
                error = %e,
                "could not roll back a partial log append; next commit writes a snapshot"
            );
            self.log = None;
            self.needs_snapshot = true;
        }
        Err(err)
    }

    #[cfg(test)]
    fn take_tear(&mut self) -> bool {
        std::mem::take(&mut self.tear_next_append)
    }

    #[cfg(not(test))]
    fn take_tear(&mut self) -> bool {
        false
    }

    /// Write the snapshot atomically, then drop the log records it covers.
    fn write_snapshot(&mut self) -> io::Result<()> {
        let Some(ledger) = self.ledger.as_ref() else {
            return Ok(());
        };
        let snapshot = ledger.snapshot();
        write_atomic_json(&self.snapshot_path(), &snapshot)?;

        let file = self.log_file()?;
        file.set_len(0)?;
        file.sync_data()?;
        self.since_snapshot = 0;

        debug!(
            dir = %self.dir.display(),
            last_seq = snapshot.last_seq,
            session_version = snapshot.session_version,
            "snapshot written"
        );
        Ok(())
    }

    /// Replay log lines newer than the snapshot. Stops at the first torn or
    /// corrupt line, truncates the log there and reports how many lines were
    /// dropped.
    fn replay_log(&self, ledger: &mut Ledger) -> Result<(usize, usize)> {
        let path = self.log_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(e) => return Err(load_failed("reading transition log", e)),
        };

        let mut replayed = 0usize;
        let mut offset = 0usize;
        let mut corrupt_at: Option<usize> = None;

        while offset < bytes.len() {
            let rest = &bytes[offset..];
            let Some(end) = rest.iter().position(|b| *b == b'\n') else {
                // No terminating newline: the last write was torn.
                corrupt_at = Some(offset);
                break;
            };
            let raw = &rest[..end];
            if raw.iter().all(u8::is_ascii_whitespace) {
                offset += end + 1;
                continue;
            }

            let valid = serde_json::from_slice::<LogLine>(raw)
                .ok()
                .filter(|line| line.seq == line.record.seq)
                .filter(|line| checksum(&line.record).is_ok_and(|c| c == line.checksum));
            let Some(line) = valid else {
                corrupt_at = Some(offset);
                break;
            };

            if line.seq > ledger.last_seq() && ledger.replay(&line.record) {
                replayed += 1;
            }
            offset += end + 1;
        }

        let mut discarded = 0usize;
        if let Some(at) = corrupt_at {
            discarded = bytes[at..]
                .split(|b| *b == b'\n')
                .filter(|seg| !seg.iter().all(u8::is_ascii_whitespace))
                .count();
            warn!(
                path = %path.display(),
                offset = at,
                discarded,
                "transition log has a torn or corrupt tail; truncating"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| load_failed("opening transition log for repair", e))?;
            file.set_len(at as u64)
                .map_err(|e| load_failed("truncating transition log", e))?;
            file.sync_data()
                .map_err(|e| load_failed("syncing transition log", e))?;
        }

        Ok((replayed, discarded))
    }
}

impl TransitionStore for FileStore {
    fn initialize(&mut self, graph: &GraphStore) -> Result<()> {
        self.ledger = Some(Ledger::from_graph(graph));
        self.write_snapshot()
            .map_err(|e| save_failed("writing initial snapshot", e))?;
        info!(dir = %self.dir.display(), items = graph.len(), "session initialized");
        Ok(())
    }

    fn commit(&mut self, mut record: TransitionRecord, expected_version: u64) -> Result<u64> {
        let ledger = self
            .ledger
            .as_mut()
            .ok_or_else(|| save_failed("commit", "session not initialized or loaded"))?;
        let version = ledger.apply(&mut record, expected_version)?;

        if self.needs_snapshot {
            // The snapshot covers this record and replaces the damaged log.
            self.write_snapshot()
                .map_err(|e| save_failed("writing snapshot over damaged log", e))?;
            self.needs_snapshot = false;
            return Ok(version);
        }

        if let Err(e) = self.append(&record) {
            return Err(ExecutionError::session_save(format!(
                "appending record {} to transition log: {e}",
                record.seq
            ))
            .for_item(&record.item)
            .into());
        }

        self.since_snapshot += 1;
        if self.since_snapshot >= self.snapshot_every {
            // The log append already made this commit durable.
            if let Err(e) = self.write_snapshot() {
                warn!(dir = %self.dir.display(), error = %e, "snapshot compaction failed");
            }
        }

        Ok(version)
    }

    fn load(&mut self) -> Result<Option<SessionState>> {
        let path = self.snapshot_path();
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(load_failed("reading snapshot", e)),
        };
        let snapshot: Snapshot =
            serde_json::from_str(&text).map_err(|e| load_failed("parsing snapshot", e))?;
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(load_failed(
                "snapshot",
                format!(
                    "unsupported format {} (expected {SNAPSHOT_FORMAT})",
                    snapshot.format
                ),
            ));
        }

        let mut ledger = Ledger::from_snapshot(snapshot);
        let (replayed, discarded) = self.replay_log(&mut ledger)?;
        let state = ledger.state(replayed, discarded);

        info!(
            dir = %self.dir.display(),
            last_seq = state.last_seq,
            replayed,
            discarded_tail = discarded,
            "session loaded"
        );

        self.ledger = Some(ledger);
        self.log = None;
        self.since_snapshot = replayed;
        Ok(Some(state))
    }

    fn checkpoint(&mut self) -> Result<()> {
        self.write_snapshot()
            .map_err(|e| save_failed("writing snapshot", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Item;
    use crate::persist::record::Actor;
    use crate::types::Status;
    use std::io::Write as _;

    fn graph() -> GraphStore {
        GraphStore::from_items([Item::new("P1".parse().unwrap()), Item::new("P2".parse().unwrap())])
            .unwrap()
    }

    fn record(id: &str, from: Status, to: Status) -> TransitionRecord {
        TransitionRecord::new(id.parse().unwrap(), from, to, Actor::Scheduler)
    }

    fn status_of(state: &SessionState, id: &str) -> (Status, u64) {
        let item = state.items.iter().find(|i| i.id.as_str() == id).unwrap();
        (item.status, item.version)
    }

    #[test]
    fn commits_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = FileStore::open(dir.path(), 100).unwrap();
            store.initialize(&graph()).unwrap();
            store.commit(record("P1", Status::Planned, Status::Queued), 0).unwrap();
            store.commit(record("P1", Status::Queued, Status::InProgress), 1).unwrap();
        }

        let mut store = FileStore::open(dir.path(), 100).unwrap();
        let state = store.load().unwrap().unwrap();
        assert_eq!(state.replayed, 2);
        assert_eq!(state.discarded_tail, 0);
        assert_eq!(status_of(&state, "P1"), (Status::InProgress, 2));
        assert_eq!(status_of(&state, "P2"), (Status::Planned, 0));

        // The reopened store keeps versioning from where it left off.
        assert_eq!(
            store.commit(record("P1", Status::InProgress, Status::Complete), 2).unwrap(),
            3
        );
    }

    #[test]
    fn snapshot_compaction_truncates_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::open(dir.path(), 2).unwrap();
        store.initialize(&graph()).unwrap();
        store.commit(record("P1", Status::Planned, Status::Queued), 0).unwrap();
        store.commit(record("P2", Status::Planned, Status::Queued), 0).unwrap();

        assert_eq!(fs::metadata(store.log_path()).unwrap().len(), 0);

        let mut reopened = FileStore::open(dir.path(), 2).unwrap();
        let state = reopened.load().unwrap().unwrap();
        assert_eq!(state.last_seq, 2);
        assert_eq!(state.replayed, 0);
        assert_eq!(status_of(&state, "P2"), (Status::Queued, 1));
    }

    #[test]
    fn torn_tail_is_discarded_and_truncated() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = FileStore::open(dir.path(), 100).unwrap();
            store.initialize(&graph()).unwrap();
            store.commit(record("P1", Status::Planned, Status::Queued), 0).unwrap();
        }
        let log_path = dir.path().join(LOG_FILE);
        let good_len = fs::metadata(&log_path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&log_path).unwrap();
            f.write_all(br#"{"seq":2,"record":{"seq":2,"item":"P1""#).unwrap();
        }

        let mut store = FileStore::open(dir.path(), 100).unwrap();
        let state = store.load().unwrap().unwrap();
        assert_eq!(state.replayed, 1);
        assert_eq!(state.discarded_tail, 1);
        assert_eq!(status_of(&state, "P1"), (Status::Queued, 1));
        assert_eq!(fs::metadata(&log_path).unwrap().len(), good_len);
    }

    #[test]
    fn checksum_mismatch_stops_replay() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = FileStore::open(dir.path(), 100).unwrap();
            store.initialize(&graph()).unwrap();
            store.commit(record("P1", Status::Planned, Status::Queued), 0).unwrap();
            store.commit(record("P2", Status::Planned, Status::Queued), 0).unwrap();
        }
        let log_path = dir.path().join(LOG_FILE);
        let text = fs::read_to_string(&log_path).unwrap();
        let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
        lines[0] = lines[0].replace("\"Queued\"", "\"Complete\"");
        fs::write(&log_path, lines.join("\n") + "\n").unwrap();

        let mut store = FileStore::open(dir.path(), 100).unwrap();
        let state = store.load().unwrap().unwrap();
        assert_eq!(state.replayed, 0);
        assert_eq!(state.discarded_tail, 2);
        assert_eq!(status_of(&state, "P1"), (Status::Planned, 0));
    }

    #[test]
    fn failed_append_leaves_no_torn_line_behind() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = FileStore::open(dir.path(), 100).unwrap();
            store.initialize(&graph()).unwrap();
            store.commit(record("P1", Status::Planned, Status::Queued), 0).unwrap();

            store.tear_next_append = true;
            match store.commit(record("P2", Status::Planned, Status::Queued), 0) {
                Err(PlanError::Execution(e)) => {
                    assert_eq!(e.code, crate::errors::ErrorCode::SessionSaveFailed)
                }
                other => panic!("expected save failure, got {other:?}"),
            }

            store.commit(record("P1", Status::Queued, Status::InProgress), 1).unwrap();
        }

        let text = fs::read_to_string(dir.path().join(LOG_FILE)).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));

        let mut store = FileStore::open(dir.path(), 100).unwrap();
        let state = store.load().unwrap().unwrap();
        assert_eq!(state.replayed, 2);
        assert_eq!(state.discarded_tail, 0);
        assert_eq!(status_of(&state, "P1"), (Status::InProgress, 2));
        assert_eq!(status_of(&state, "P2"), (Status::Planned, 0));
    }

    #[test]
    fn missing_session_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::open(dir.path().join("fresh"), 4).unwrap();
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn corrupt_snapshot_is_a_load_failure() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(SNAPSHOT_FILE), "{ not json").unwrap();
        let mut store = FileStore::open(dir.path(), 4).unwrap();
        match store.load() {
            Err(PlanError::Execution(e)) => {
                assert_eq!(e.code, crate::errors::ErrorCode::SessionLoadFailed)
            }
            other => panic!("expected load failure, got {other:?}"),
        }
    }
}
