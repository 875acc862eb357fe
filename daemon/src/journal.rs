//! Persistent journal: a full snapshot plus an append-only delta log.
//!
//! The snapshot file holds every descriptor; the delta file holds one JSON
//! record per line for each mutation since the snapshot was written. After
//! `snapshot_interval` deltas the journal writes a new snapshot and truncates
//! the delta file.

use crate::descriptor::{GroupDescriptor, ObjectDescriptor};
use crate::error::{Error, Result};
use crate::id::{GroupId, ObjectId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Snapshot file name inside the state directory.
pub const SNAPSHOT_FILE: &str = "snapshot.json";

/// Delta file name inside the state directory.
pub const DELTA_FILE: &str = "deltas.jsonl";

/// Kind of mutation recorded by a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOp {
    Put,
    Remove,
}

/// Kind of entity a delta applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Group,
    Object,
}

/// A journaled registry mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Delta {
    PutGroup {
        id: GroupId,
        descriptor: GroupDescriptor,
    },
    RemoveGroup {
        id: GroupId,
    },
    PutObject {
        id: ObjectId,
        descriptor: ObjectDescriptor,
    },
    RemoveObject {
        id: ObjectId,
    },
}

impl Delta {
    pub fn op(&self) -> DeltaOp {
        match self {
            Delta::PutGroup { .. } | Delta::PutObject { .. } => DeltaOp::Put,
            Delta::RemoveGroup { .. } | Delta::RemoveObject { .. } => DeltaOp::Remove,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Delta::PutGroup { .. } | Delta::RemoveGroup { .. } => EntityKind::Group,
            Delta::PutObject { .. } | Delta::RemoveObject { .. } => EntityKind::Object,
        }
    }
}

/// Full dump of every registered descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub groups: BTreeMap<GroupId, GroupDescriptor>,
    #[serde(default)]
    pub objects: BTreeMap<ObjectId, ObjectDescriptor>,
}

impl Snapshot {
    /// Replay this snapshot as a sequence of `Put` deltas, groups first.
    pub fn into_deltas(self) -> Vec<Delta> {
        let groups = self
            .groups
            .into_iter()
            .map(|(id, descriptor)| Delta::PutGroup { id, descriptor });
        let objects = self
            .objects
            .into_iter()
            .map(|(id, descriptor)| Delta::PutObject { id, descriptor });
        groups.chain(objects).collect()
    }
}

/// Snapshot + delta log living in one directory.
#[derive(Debug)]
pub struct Journal {
    /// Directory holding both files
    dir: PathBuf,
    /// Deltas between snapshots
    snapshot_interval: usize,
    /// Deltas written since the last snapshot
    deltas: usize,
    /// While set, appends and snapshots are suppressed
    restoring: bool,
    /// Lazily opened delta file
    delta_file: Option<File>,
}

impl Journal {
    /// Create a journal rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>, snapshot_interval: usize) -> Self {
        Self {
            dir: dir.into(),
            snapshot_interval: snapshot_interval.max(1),
            deltas: 0,
            restoring: false,
            delta_file: None,
        }
    }

    /// Directory holding the journal files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    pub fn delta_path(&self) -> PathBuf {
        self.dir.join(DELTA_FILE)
    }

    /// Number of deltas written since the last snapshot.
    pub fn pending_deltas(&self) -> usize {
        self.deltas
    }

    /// Suppress journal writes while a replay is applied.
    pub fn begin_restore(&mut self) {
        self.restoring = true;
    }

    /// Re-enable journal writes.
    pub fn finish_restore(&mut self) {
        self.restoring = false;
    }

    pub fn is_restoring(&self) -> bool {
        self.restoring
    }

    /// Append one delta, or write a snapshot if the interval is reached.
    ///
    /// `snapshot` is only called when a snapshot is due; it must reflect the
    /// registry with this delta already applied.
    pub fn append(&mut self, delta: &Delta, snapshot: impl FnOnce() -> Snapshot) -> Result<()> {
        if self.restoring {
            return Ok(());
        }

        self.deltas += 1;
        if self.deltas >= self.snapshot_interval {
            return self.write_snapshot(&snapshot());
        }

        self.write_delta(delta).map_err(Error::Persistence)?;
        debug!(op = ?delta.op(), kind = ?delta.kind(), pending = self.deltas, "Appended delta");
        Ok(())
    }

    fn write_delta(&mut self, delta: &Delta) -> io::Result<()> {
        let mut line = serde_json::to_vec(delta)?;
        line.push(b'\n');

        if self.delta_file.is_none() {
            std::fs::create_dir_all(&self.dir)?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.delta_path())?;
            self.delta_file = Some(file);
        }

        if let Some(file) = self.delta_file.as_mut() {
            file.write_all(&line)?;
            file.sync_data()?;
        }
        Ok(())
    }

    /// Overwrite the snapshot file and truncate the delta file.
    pub fn write_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        if self.restoring {
            return Ok(());
        }

        self.replace_snapshot(snapshot).map_err(Error::Persistence)?;
        self.deltas = 0;

        info!(
            groups = snapshot.groups.len(),
            objects = snapshot.objects.len(),
            "Wrote registry snapshot"
        );
        Ok(())
    }

    fn replace_snapshot(&mut self, snapshot: &Snapshot) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let tmp = self.dir.join(format!("{}.tmp", SNAPSHOT_FILE));
        {
            let mut file = File::create(&tmp)?;
            serde_json::to_writer_pretty(&mut file, snapshot)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, self.snapshot_path())?;

        // Drop the append handle before truncating
        self.delta_file = None;
        File::create(self.delta_path())?.sync_all()?;
        Ok(())
    }

    /// Read the snapshot file, if there is one.
    pub fn read_snapshot(&self) -> Result<Option<Snapshot>> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }

        let content = std::fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&content)?))
    }

    /// Read every complete delta record in order.
    ///
    /// A torn final record (no trailing newline, or undecodable last line)
    /// ends the stream. An undecodable record followed by more records is
    /// corruption.
    pub fn read_deltas(&self) -> Result<Vec<Delta>> {
        let path = self.delta_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read(&path)?;
        let mut lines: Vec<&[u8]> = content.split(|b| *b == b'\n').collect();

        // Whatever follows the final newline was never completed
        if let Some(tail) = lines.pop() {
            if !tail.is_empty() {
                warn!(bytes = tail.len(), "Ignoring partial trailing delta record");
            }
        }

        let total = lines.len();
        let mut deltas = Vec::with_capacity(total);
        for (index, line) in lines.into_iter().enumerate() {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_slice::<Delta>(line) {
                Ok(delta) => deltas.push(delta),
                Err(e) if index + 1 == total => {
                    warn!(error = %e, "Ignoring undecodable trailing delta record");
                    break;
                }
                Err(e) => {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("corrupt delta record {}: {}", index, e),
                    )));
                }
            }
        }

        Ok(deltas)
    }

    /// Move unreadable journal files aside so a fresh journal can start.
    pub fn quarantine(&mut self) -> io::Result<()> {
        self.delta_file = None;
        for path in [self.snapshot_path(), self.delta_path()] {
            if path.exists() {
                let mut aside = path.clone().into_os_string();
                aside.push(".corrupt");
                std::fs::rename(&path, &aside)?;
                warn!(path = %path.display(), "Moved unreadable journal file aside");
            }
        }
        Ok(())
    }

    /// Snapshot contents followed by the delta log, as one replay sequence.
    pub fn replay(&self) -> Result<Vec<Delta>> {
        let mut deltas = self
            .read_snapshot()?
            .map(Snapshot::into_deltas)
            .unwrap_or_default();
        deltas.extend(self.read_deltas()?);
        Ok(deltas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn put_group(name: &str) -> (GroupId, Delta) {
        let id = GroupId::new();
        let delta = Delta::PutGroup {
            id,
            descriptor: GroupDescriptor::new(name),
        };
        (id, delta)
    }

    #[test]
    fn test_append_and_replay() {
        let tmp = TempDir::new().unwrap();
        let mut journal = Journal::new(tmp.path(), 100);

        let (group, first) = put_group("Group");
        let object = ObjectId::new();
        let second = Delta::PutObject {
            id: object,
            descriptor: ObjectDescriptor::new(group, "Counter"),
        };
        let third = Delta::RemoveObject { id: object };

        for delta in [&first, &second, &third] {
            journal.append(delta, Snapshot::default).unwrap();
        }
        assert_eq!(journal.pending_deltas(), 3);

        let replay = Journal::new(tmp.path(), 100).replay().unwrap();
        assert_eq!(replay, vec![first, second, third]);
    }

    #[test]
    fn test_interval_writes_snapshot_and_truncates() {
        let tmp = TempDir::new().unwrap();
        let mut journal = Journal::new(tmp.path(), 3);

        let mut snapshot = Snapshot::default();
        for name in ["a", "b", "c"] {
            let (id, delta) = put_group(name);
            snapshot.groups.insert(id, GroupDescriptor::new(name));
            let current = snapshot.clone();
            journal.append(&delta, move || current).unwrap();
        }

        // Third delta triggered the snapshot instead of an append
        assert_eq!(journal.pending_deltas(), 0);
        assert_eq!(std::fs::metadata(journal.delta_path()).unwrap().len(), 0);
        assert_eq!(journal.read_snapshot().unwrap(), Some(snapshot.clone()));
        assert_eq!(journal.replay().unwrap(), snapshot.into_deltas());
    }

    #[test]
    fn test_partial_trailing_record_ends_stream() {
        let tmp = TempDir::new().unwrap();
        let mut journal = Journal::new(tmp.path(), 100);
        let (_, delta) = put_group("Group");
        journal.append(&delta, Snapshot::default).unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(journal.delta_path())
            .unwrap();
        file.write_all(b"{\"op\":\"put_gro").unwrap();

        assert_eq!(journal.read_deltas().unwrap(), vec![delta]);
    }

    #[test]
    fn test_corrupt_middle_record_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let journal = Journal::new(tmp.path(), 100);
        let (_, delta) = put_group("Group");
        let mut content = b"garbage\n".to_vec();
        content.extend(serde_json::to_vec(&delta).unwrap());
        content.push(b'\n');
        std::fs::write(journal.delta_path(), content).unwrap();

        assert!(journal.read_deltas().is_err());
    }

    #[test]
    fn test_restoring_suppresses_writes() {
        let tmp = TempDir::new().unwrap();
        let mut journal = Journal::new(tmp.path(), 1);
        journal.begin_restore();

        let (_, delta) = put_group("Group");
        journal
            .append(&delta, || panic!("no snapshot while restoring"))
            .unwrap();
        journal.write_snapshot(&Snapshot::default()).unwrap();
        assert!(!journal.snapshot_path().exists());
        assert!(!journal.delta_path().exists());

        journal.finish_restore();
        journal.append(&delta, Snapshot::default).unwrap();
        assert!(journal.snapshot_path().exists());
    }

    #[test]
    fn test_delta_classification() {
        let (_, put) = put_group("Group");
        assert_eq!(put.op(), DeltaOp::Put);
        assert_eq!(put.kind(), EntityKind::Group);

        let remove = Delta::RemoveObject { id: ObjectId::new() };
        assert_eq!(remove.op(), DeltaOp::Remove);
        assert_eq!(remove.kind(), EntityKind::Object);
    }
}
