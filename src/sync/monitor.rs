use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::{ChangeSink, DELETED, ObjectId};

/// The set of changed-attribute names recorded for one object.
pub type ChangeNames = BTreeSet<String>;

/// Per-device record of which object attributes changed since the last
/// synchronization baseline. Keys and name sets are ordered so the
/// sidecar serialization is byte-stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChangeSet(BTreeMap<ObjectId, ChangeNames>);

impl ChangeSet {
    pub fn new() -> Self {
        ChangeSet::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, id: &ObjectId) -> Option<&ChangeNames> {
        self.0.get(id)
    }

    pub fn contains(&self, id: &ObjectId, name: &str) -> bool {
        self.0.get(id).is_some_and(|names| names.contains(name))
    }

    pub fn set(&mut self, id: ObjectId, names: ChangeNames) {
        self.0.insert(id, names);
    }

    pub fn remove(&mut self, id: &ObjectId) {
        self.0.remove(id);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectId, &ChangeNames)> {
        self.0.iter()
    }

    /// Record one change. Deletion absorbs: once `__del__` is present the
    /// record stays deletion-only, and marking deletion discards any
    /// previously recorded attribute names.
    pub fn add(&mut self, id: &ObjectId, name: &str) {
        let names = self.0.entry(id.clone()).or_default();
        if names.contains(DELETED) {
            return;
        }
        if name == DELETED {
            names.clear();
        }
        names.insert(name.to_string());
    }

    /// Ensure an (empty) record exists for an id, so that lookups return
    /// `Some` for known objects without inventing changes.
    pub fn ensure(&mut self, id: &ObjectId) {
        self.0.entry(id.clone()).or_default();
    }

    /// Union another change set into this one, per id, with `__del__`
    /// dominating. Associative and idempotent, so change sets can be
    /// folded across any number of devices in any order.
    pub fn merge_from(&mut self, other: &ChangeSet) {
        for (id, names) in &other.0 {
            for name in names {
                self.add(id, name);
            }
            // Preserve empty baselines too.
            self.0.entry(id.clone()).or_default();
        }
    }
}

/// Tracks which attributes of which objects changed during this session.
///
/// One monitor exists per open task file; its guid distinguishes this
/// device's change history from every other device sharing the file.
#[derive(Debug, Clone)]
pub struct ChangeMonitor {
    guid: String,
    changes: ChangeSet,
    frozen: u32,
}

impl ChangeMonitor {
    pub fn new() -> Self {
        ChangeMonitor {
            guid: Uuid::new_v4().to_string(),
            changes: ChangeSet::new(),
            frozen: 0,
        }
    }

    /// Stable per-session device identifier.
    pub fn guid(&self) -> &str {
        &self.guid
    }

    pub fn changes(&self) -> &ChangeSet {
        &self.changes
    }

    /// Suspend change recording. Re-entrant: nested freezes are counted.
    pub fn freeze(&mut self) {
        self.frozen += 1;
    }

    pub fn thaw(&mut self) {
        debug_assert!(self.frozen > 0, "thaw without matching freeze");
        self.frozen = self.frozen.saturating_sub(1);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen > 0
    }

    /// Changed-attribute names for an object, or `None` if untouched.
    /// A missing id is not an error.
    pub fn get_changes(&self, id: &ObjectId) -> Option<&ChangeNames> {
        self.changes.get(id)
    }

    /// Force-set a record; used when registering freshly loaded owned
    /// objects with an empty baseline.
    pub fn set_changes(&mut self, id: ObjectId, names: ChangeNames) {
        self.changes.set(id, names);
    }

    /// Clear one object's record after a merge has reconciled it.
    pub fn reset_changes(&mut self, id: &ObjectId) {
        self.changes.remove(id);
    }

    /// Clear the whole table, establishing a new baseline.
    pub fn reset_all_changes(&mut self) {
        self.changes.clear();
    }

    /// Union this monitor's record into another device's change set.
    pub fn merge_into(&self, target: &mut ChangeSet) {
        target.merge_from(&self.changes);
    }
}

impl Default for ChangeMonitor {
    fn default() -> Self {
        ChangeMonitor::new()
    }
}

impl ChangeSink for ChangeMonitor {
    fn record(&mut self, id: &ObjectId, change: &str) {
        if self.frozen > 0 {
            return;
        }
        self.changes.add(id, change);
    }

    fn record_added(&mut self, id: &ObjectId) {
        if self.frozen > 0 {
            return;
        }
        self.changes.ensure(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PARENT;

    fn id(s: &str) -> ObjectId {
        ObjectId::new(s)
    }

    #[test]
    fn records_and_resets() {
        let mut monitor = ChangeMonitor::new();
        monitor.record(&id("t1"), "subject");
        monitor.record(&id("t1"), "description");
        let names = monitor.get_changes(&id("t1")).unwrap();
        assert_eq!(names.len(), 2);
        assert!(names.contains("subject"));

        monitor.reset_changes(&id("t1"));
        assert!(monitor.get_changes(&id("t1")).is_none());
    }

    #[test]
    fn missing_id_yields_none() {
        let monitor = ChangeMonitor::new();
        assert!(monitor.get_changes(&id("nope")).is_none());
    }

    #[test]
    fn deletion_absorbs_attribute_changes() {
        let mut set = ChangeSet::new();
        set.add(&id("t1"), "subject");
        set.add(&id("t1"), DELETED);
        assert_eq!(set.get(&id("t1")).unwrap().len(), 1);
        assert!(set.contains(&id("t1"), DELETED));

        // Nothing sticks after deletion
        set.add(&id("t1"), "subject");
        assert_eq!(set.get(&id("t1")).unwrap().len(), 1);
    }

    #[test]
    fn merge_unions_per_id_with_deletion_dominating() {
        let mut a = ChangeSet::new();
        a.add(&id("t1"), "subject");
        a.add(&id("t2"), PARENT);

        let mut b = ChangeSet::new();
        b.add(&id("t1"), "description");
        b.add(&id("t2"), DELETED);

        a.merge_from(&b);
        assert_eq!(a.get(&id("t1")).unwrap().len(), 2);
        let t2 = a.get(&id("t2")).unwrap();
        assert_eq!(t2.len(), 1);
        assert!(t2.contains(DELETED));

        // Idempotent
        let snapshot = a.clone();
        a.merge_from(&b);
        assert_eq!(a, snapshot);
    }

    #[test]
    fn freeze_is_counted() {
        let mut monitor = ChangeMonitor::new();
        monitor.freeze();
        monitor.freeze();
        monitor.record(&id("t1"), "subject");
        assert!(monitor.get_changes(&id("t1")).is_none());

        monitor.thaw();
        monitor.record(&id("t1"), "subject");
        assert!(monitor.get_changes(&id("t1")).is_none());

        monitor.thaw();
        monitor.record(&id("t1"), "subject");
        assert!(monitor.get_changes(&id("t1")).is_some());
    }

    #[test]
    fn guids_are_unique_per_session() {
        assert_ne!(ChangeMonitor::new().guid(), ChangeMonitor::new().guid());
    }
}
