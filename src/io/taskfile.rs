use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::io::format::{
    DELTA_SUFFIX, FormatError, read_change_table, read_task_file, write_change_table,
    write_task_file,
};
use crate::io::lock::{FileLock, LockError};
use crate::io::watcher::FileWatcher;
use crate::model::ObjectGraph;
use crate::sync::{ChangeMonitor, ChangeNames, ChangeSet, ChangeSynchronizer, ChangeTable, SyncError};

#[derive(Debug, thiserror::Error)]
pub enum TaskFileError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error("could not watch task file: {0}")]
    Watch(#[from] notify::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// How a task file coordinates with other processes on the same machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockBehavior {
    /// Take the advisory lock, failing after a timeout if held.
    Lock,
    /// Remove a stale lock first, then take it.
    BreakLock,
    /// Skip locking entirely. For filesystems where flock is unsupported.
    Unlocked,
}

/// Path of the sidecar change table next to a task file.
pub fn delta_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(DELTA_SUFFIX);
    path.with_file_name(name)
}

/// An open task file: the object graph, the change monitor recording this
/// device's edits, and the machinery to reconcile with concurrent editors.
///
/// The merge contract: `save` first folds in whatever other devices wrote
/// to disk since our last sync, then writes the merged state, so a save
/// never silently discards another device's work.
pub struct TaskFile {
    path: PathBuf,
    guid: String,
    graph: ObjectGraph,
    monitor: ChangeMonitor,
    dirty: bool,
    lock_behavior: LockBehavior,
    lock: Option<FileLock>,
    watcher: Option<FileWatcher>,
}

impl TaskFile {
    pub fn new(path: impl Into<PathBuf>, lock_behavior: LockBehavior) -> Self {
        TaskFile {
            path: path.into(),
            guid: Uuid::new_v4().to_string(),
            graph: ObjectGraph::new(),
            monitor: ChangeMonitor::new(),
            dirty: false,
            lock_behavior,
            lock: None,
            watcher: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File identity guid (distinct from the per-device monitor guid).
    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn graph(&self) -> &ObjectGraph {
        &self.graph
    }

    pub fn monitor(&self) -> &ChangeMonitor {
        &self.monitor
    }

    /// Mutable access for making tracked edits. Marks the file dirty;
    /// callers pass the monitor as the change sink.
    pub fn edit(&mut self) -> (&mut ObjectGraph, &mut ChangeMonitor) {
        self.dirty = true;
        (&mut self.graph, &mut self.monitor)
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Whether another process wrote the file since we last read or
    /// saved it.
    pub fn externally_changed(&self) -> bool {
        self.watcher.as_ref().is_some_and(|w| w.changed())
    }

    fn ensure_lock(&mut self) -> Result<(), TaskFileError> {
        if self.lock.is_some() {
            return Ok(());
        }
        match self.lock_behavior {
            LockBehavior::Unlocked => {}
            LockBehavior::BreakLock => {
                FileLock::break_lock(&self.path)?;
                self.lock = Some(FileLock::acquire_default(&self.path)?);
            }
            LockBehavior::Lock => {
                self.lock = Some(FileLock::acquire_default(&self.path)?);
            }
        }
        Ok(())
    }

    fn start_watcher(&mut self) -> Result<(), TaskFileError> {
        if self.watcher.is_none() && self.path.exists() {
            self.watcher = Some(FileWatcher::start(&self.path)?);
        }
        Ok(())
    }

    /// Register this device in the table with an empty baseline covering
    /// every object currently in the graph.
    fn reset_baseline(&mut self) {
        self.monitor.reset_all_changes();
        for id in self.graph.all_ids() {
            self.monitor.set_changes(id, ChangeNames::new());
        }
    }

    /// Read the file (and its sidecar) from disk, replacing any in-memory
    /// state. A missing file yields a fresh empty graph.
    pub fn load(&mut self) -> Result<(), TaskFileError> {
        self.ensure_lock()?;
        if self.path.exists() {
            let (graph, guid) = read_task_file(&self.path)?;
            self.graph = graph;
            self.guid = guid;
            self.reset_baseline();

            // Announce this device to the others by claiming a slot in
            // the sidecar table.
            let dp = delta_path(&self.path);
            let mut table = read_change_table(&dp)?;
            table.insert(
                self.monitor.guid().to_string(),
                self.monitor.changes().clone(),
            );
            write_change_table(&dp, &table)?;
        } else {
            self.graph = ObjectGraph::new();
            self.guid = Uuid::new_v4().to_string();
            self.monitor.reset_all_changes();
        }
        self.dirty = false;
        self.start_watcher()?;
        if let Some(w) = &self.watcher {
            w.mark_saved();
        }
        Ok(())
    }

    /// Fold changes other devices wrote to disk into the in-memory graph.
    /// Returns the conflict set (disk-won attribute collisions).
    pub fn merge_disk_changes(&mut self) -> Result<ChangeSet, TaskFileError> {
        let (disk, disk_guid) = read_task_file(&self.path)?;
        let dp = delta_path(&self.path);
        let mut table = read_change_table(&dp)?;

        // Frozen so the merge's own graph mutations don't count as edits.
        self.monitor.freeze();
        let result =
            ChangeSynchronizer::new(&mut self.monitor, &mut table).sync(&mut self.graph, &disk);
        self.monitor.thaw();
        let conflicts = result?;

        self.guid = disk_guid;
        write_change_table(&dp, &table)?;
        if let Some(w) = &self.watcher {
            w.clear();
        }
        Ok(conflicts)
    }

    /// Merge with the on-disk state, then write the result. Returns any
    /// conflicts found during the merge.
    pub fn save(&mut self) -> Result<ChangeSet, TaskFileError> {
        self.ensure_lock()?;
        let conflicts = if self.path.exists() {
            self.merge_disk_changes()?
        } else {
            self.reset_baseline();
            let mut table = ChangeTable::new();
            table.insert(
                self.monitor.guid().to_string(),
                self.monitor.changes().clone(),
            );
            write_change_table(&delta_path(&self.path), &table)?;
            ChangeSet::new()
        };

        write_task_file(&self.path, &self.graph, &self.guid)?;
        self.graph.clean_all();
        self.dirty = false;
        self.start_watcher()?;
        if let Some(w) = &self.watcher {
            w.mark_saved();
        }
        Ok(conflicts)
    }

    /// Withdraw this device from the sidecar table and release the lock.
    /// The in-memory graph is cleared; the monitor keeps its guid so a
    /// later `load` re-registers under the same identity.
    pub fn close(&mut self) -> Result<(), TaskFileError> {
        if self.path.exists() {
            let dp = delta_path(&self.path);
            let mut table = read_change_table(&dp)?;
            if table.remove(self.monitor.guid()).is_some() {
                write_change_table(&dp, &table)?;
            }
        }
        self.graph = ObjectGraph::new();
        self.monitor.reset_all_changes();
        self.dirty = false;
        self.watcher = None;
        self.lock = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DomainObject, ObjectKind, Section};
    use tempfile::TempDir;

    fn task(id: &str, subject: &str) -> DomainObject {
        DomainObject::new(id, ObjectKind::Task, subject)
    }

    #[test]
    fn fresh_file_saves_and_reloads() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tasks.tsk");

        let mut file = TaskFile::new(&path, LockBehavior::Lock);
        file.load().unwrap();
        {
            let (graph, monitor) = file.edit();
            graph
                .add_root(Section::Tasks, task("t1", "write report"), monitor)
                .unwrap();
        }
        assert!(file.is_dirty());
        let conflicts = file.save().unwrap();
        assert!(conflicts.is_empty());
        assert!(!file.is_dirty());
        let guid = file.guid().to_string();
        file.close().unwrap();

        let mut reread = TaskFile::new(&path, LockBehavior::Lock);
        reread.load().unwrap();
        assert_eq!(reread.guid(), guid);
        let t1 = reread.graph().get(&"t1".into()).unwrap();
        assert_eq!(t1.subject, "write report");
    }

    #[test]
    fn second_device_changes_flow_through_merge() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tasks.tsk");

        let mut a = TaskFile::new(&path, LockBehavior::Unlocked);
        a.load().unwrap();
        {
            let (graph, monitor) = a.edit();
            graph
                .add_root(Section::Tasks, task("t1", "draft"), monitor)
                .unwrap();
        }
        a.save().unwrap();

        let mut b = TaskFile::new(&path, LockBehavior::Unlocked);
        b.load().unwrap();
        {
            let (graph, monitor) = b.edit();
            graph.set_subject(&"t1".into(), "final", monitor).unwrap();
        }
        b.save().unwrap();

        let conflicts = a.merge_disk_changes().unwrap();
        assert!(conflicts.is_empty());
        assert_eq!(a.graph().get(&"t1".into()).unwrap().subject, "final");
    }

    #[test]
    fn close_withdraws_device_from_sidecar() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("tasks.tsk");

        let mut file = TaskFile::new(&path, LockBehavior::Unlocked);
        file.load().unwrap();
        {
            let (graph, monitor) = file.edit();
            graph
                .add_root(Section::Tasks, task("t1", "x"), monitor)
                .unwrap();
        }
        file.save().unwrap();
        let device = file.monitor().guid().to_string();

        let table = read_change_table(&delta_path(&path)).unwrap();
        assert!(table.contains_key(&device));

        file.close().unwrap();
        let table = read_change_table(&delta_path(&path)).unwrap();
        assert!(!table.contains_key(&device));
    }

    #[test]
    fn delta_path_appends_suffix() {
        assert_eq!(
            delta_path(Path::new("/x/tasks.tsk")),
            PathBuf::from("/x/tasks.tsk.delta")
        );
    }
}
