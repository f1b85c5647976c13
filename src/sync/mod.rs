pub mod merge;
pub mod monitor;

pub use merge::{ChangeSynchronizer, ChangeTable, SyncError};
pub use monitor::{ChangeMonitor, ChangeNames, ChangeSet};
