pub mod format;
pub mod lock;
pub mod taskfile;
pub mod watcher;

pub use format::{FormatError, atomic_write, read_change_table, read_task_file, write_change_table, write_task_file};
pub use lock::{FileLock, LockError};
pub use taskfile::{LockBehavior, TaskFile, TaskFileError, delta_path};
pub use watcher::FileWatcher;
