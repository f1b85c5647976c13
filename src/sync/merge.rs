use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::model::{
    APPEARANCE, Appearance, Attr, AttrValue, CATEGORIES, DELETED, DomainObject, EXPANSION,
    NullSink, OWNER, ObjectGraph, ObjectId, ObjectKind, PARENT, Relation, Section,
};
use crate::sync::monitor::{ChangeMonitor, ChangeNames, ChangeSet};

/// All devices' change sets, keyed by device guid. Persisted as the
/// `.delta` sidecar next to the task file.
pub type ChangeTable = BTreeMap<String, ChangeSet>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A parent or owner pointer referenced an id that no pass could
    /// resolve. Malformed input; the merge does not try to recover.
    #[error("dangling object reference: {0}")]
    DanglingReference(ObjectId),
}

/// Three-way merge between the in-memory graph, the freshly read on-disk
/// graph, and the change logs of every device sharing the file.
///
/// Disk-side changes that don't collide with local ones are folded into
/// the in-memory graph in place (preserving object identity where
/// unchanged); collisions are collected into a conflict change set which
/// is also propagated to every other device's table entry.
pub struct ChangeSynchronizer<'a> {
    monitor: &'a mut ChangeMonitor,
    all_changes: &'a mut ChangeTable,
    /// What other devices changed since we last synced: the table entry
    /// stored under our own guid.
    disk_changes: ChangeSet,
    conflicts: ChangeSet,
    mem_owner: HashMap<ObjectId, ObjectId>,
    disk_owner: HashMap<ObjectId, ObjectId>,
}

fn rel_for(kind: ObjectKind) -> Option<Relation> {
    match kind {
        ObjectKind::Note => Some(Relation::Note),
        ObjectKind::Attachment => Some(Relation::Attachment),
        ObjectKind::Effort => Some(Relation::Effort),
        ObjectKind::Category | ObjectKind::Task => None,
    }
}

fn expect<'g>(graph: &'g ObjectGraph, id: &ObjectId) -> Result<&'g DomainObject, SyncError> {
    graph
        .get(id)
        .ok_or_else(|| SyncError::DanglingReference(id.clone()))
}

/// One attribute application decided during the final pass; collected
/// first so the mem object is only borrowed mutably once per object.
enum ApplyOp {
    Plain(Attr, AttrValue),
    Appearance(Appearance),
    Categories(BTreeSet<ObjectId>),
    Expanded(bool),
}

impl<'a> ChangeSynchronizer<'a> {
    pub fn new(monitor: &'a mut ChangeMonitor, all_changes: &'a mut ChangeTable) -> Self {
        ChangeSynchronizer {
            monitor,
            all_changes,
            disk_changes: ChangeSet::new(),
            conflicts: ChangeSet::new(),
            mem_owner: HashMap::new(),
            disk_owner: HashMap::new(),
        }
    }

    /// Run the merge. `mem` is updated in place; `disk` is the graph just
    /// read from the file and is only consulted, never mutated. Returns
    /// the conflict change set.
    ///
    /// The caller freezes the monitor around this call so the merge's own
    /// mutations don't pollute the change log.
    pub fn sync(mut self, mem: &mut ObjectGraph, disk: &ObjectGraph) -> Result<ChangeSet, SyncError> {
        let own_guid = self.monitor.guid().to_string();
        for (guid, changes) in self.all_changes.iter_mut() {
            if *guid == own_guid {
                self.disk_changes = changes.clone();
            } else {
                self.monitor.merge_into(changes);
            }
        }

        self.mem_owner = mem.owner_map();
        self.disk_owner = disk.owner_map();

        for section in Section::ALL {
            self.merge_new_composites(mem, disk, section)?;
            self.merge_new_owned(mem, disk, section)?;
            self.reparent_from_disk(mem, disk, section)?;
            self.apply_deletions(mem, section);
            self.apply_owned_deletions(mem, section);
            self.apply_attributes(mem, disk, section)?;
        }

        // New clean baseline: every surviving object gets an empty record.
        self.monitor.reset_all_changes();
        for id in mem.all_ids() {
            self.monitor.set_changes(id, ChangeNames::new());
        }

        self.all_changes
            .insert(own_guid.clone(), self.monitor.changes().clone());
        // Conflicts found here must be re-surfaced on every other device
        // the next time it syncs. Merging is commutative and idempotent,
        // so the order devices pick conflicts up in doesn't matter.
        for (guid, changes) in self.all_changes.iter_mut() {
            if *guid != own_guid {
                changes.merge_from(&self.conflicts);
            }
        }

        Ok(self.conflicts)
    }

    fn locally_deleted(&self, id: &ObjectId) -> bool {
        self.monitor
            .get_changes(id)
            .is_some_and(|c| c.contains(DELETED))
    }

    // -----------------------------------------------------------------
    // Pass 1: composite objects new on disk
    // -----------------------------------------------------------------

    /// Splice disk-side new composites into mem. Children are stripped
    /// here; the hierarchy-ordered scan reaches them on their own turn.
    /// Owned collections stay on the clone and are resolved in pass 2.
    fn merge_new_composites(
        &mut self,
        mem: &mut ObjectGraph,
        disk: &ObjectGraph,
        section: Section,
    ) -> Result<(), SyncError> {
        for id in disk.composites_sorted(section) {
            if mem.contains(&id) || self.locally_deleted(&id) {
                continue;
            }
            let disk_obj = expect(disk, &id)?;
            let mut new_obj = disk_obj.clone();
            new_obj.children.clear();
            match disk_obj.parent.clone() {
                Some(pid) if mem.contains(&pid) => {
                    new_obj.parent = Some(pid.clone());
                    mem.insert(new_obj);
                    mem.push_child(&pid, &id);
                }
                Some(_) => {
                    // Parent deleted locally; the object surfaces at top
                    // level and the broken link is flagged.
                    new_obj.parent = None;
                    mem.insert(new_obj);
                    mem.push_root(section, &id);
                    self.conflicts.add(&id, PARENT);
                }
                None => {
                    mem.insert(new_obj);
                    mem.push_root(section, &id);
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Pass 2: owned objects new on disk
    // -----------------------------------------------------------------

    fn merge_new_owned(
        &mut self,
        mem: &mut ObjectGraph,
        disk: &ObjectGraph,
        section: Section,
    ) -> Result<(), SyncError> {
        for id in disk.composites_sorted(section) {
            let disk_obj = expect(disk, &id)?.clone();
            self.handle_new_owned(mem, disk, &disk_obj.notes, Relation::Note)?;
            self.handle_new_owned(mem, disk, &disk_obj.attachments, Relation::Attachment)?;
            self.handle_new_efforts(mem, disk, &disk_obj.efforts)?;
        }
        Ok(())
    }

    fn handle_new_owned(
        &mut self,
        mem: &mut ObjectGraph,
        disk: &ObjectGraph,
        ids: &[ObjectId],
        rel: Relation,
    ) -> Result<(), SyncError> {
        for oid in ids {
            let disk_obj = expect(disk, oid)?.clone();
            let deleted = self.locally_deleted(oid);

            if !mem.contains(oid) && !deleted {
                let mut new_obj = disk_obj.clone();
                if disk_obj.kind.is_composite() {
                    new_obj.children.clear();
                    match disk_obj.parent.clone() {
                        Some(pid) if mem.contains(&pid) => {
                            new_obj.parent = Some(pid.clone());
                            mem.insert(new_obj);
                            mem.push_child(&pid, oid);
                        }
                        Some(pid) => {
                            // Parent gone from mem. The object becomes a
                            // top-level member of the owner it reaches
                            // through its disk-side ancestor chain.
                            new_obj.parent = None;
                            let mut top = pid;
                            while let Some(next) = expect(disk, &top)?.parent.clone() {
                                top = next;
                            }
                            let disk_owner = self
                                .disk_owner
                                .get(&top)
                                .cloned()
                                .ok_or_else(|| SyncError::DanglingReference(top.clone()))?;
                            if mem.contains(&disk_owner) {
                                mem.insert(new_obj);
                                mem.push_owned(&disk_owner, rel, oid);
                                self.conflicts.add(oid, OWNER);
                                self.mem_owner.insert(oid.clone(), disk_owner);
                            } else {
                                // Owner deleted locally: the orphan is
                                // dropped, never resurrected ownerless.
                                self.conflicts.add(oid, DELETED);
                            }
                        }
                        None => {
                            self.attach_or_drop(mem, new_obj, rel, oid)?;
                        }
                    }
                } else {
                    self.attach_or_drop(mem, new_obj, rel, oid)?;
                }
            } else if deleted && !mem.contains(oid) {
                // Deleted locally but a spliced disk owner may still list
                // it; scrub the dangling link.
                if let Some((owner, orel)) = mem.owner_of(oid) {
                    mem.unlink_owned(&owner, orel, oid);
                }
            }

            // Recursion follows the disk structure even when this node is
            // absent from mem: a child new on disk under a locally deleted
            // node still needs its owner resolved (or a `__del__` conflict).
            self.handle_new_owned(mem, disk, &disk_obj.children, rel)?;
            self.handle_new_owned(mem, disk, &disk_obj.notes, Relation::Note)?;
            self.handle_new_owned(mem, disk, &disk_obj.attachments, Relation::Attachment)?;
        }
        Ok(())
    }

    /// Attach a new top-level owned object under the mem equivalent of
    /// its disk owner, or drop it (with a `__del__` conflict) when that
    /// owner no longer exists in mem.
    fn attach_or_drop(
        &mut self,
        mem: &mut ObjectGraph,
        new_obj: DomainObject,
        rel: Relation,
        oid: &ObjectId,
    ) -> Result<(), SyncError> {
        let disk_owner = self
            .disk_owner
            .get(oid)
            .cloned()
            .ok_or_else(|| SyncError::DanglingReference(oid.clone()))?;
        if mem.contains(&disk_owner) {
            mem.insert(new_obj);
            mem.push_owned(&disk_owner, rel, oid);
            self.mem_owner.insert(oid.clone(), disk_owner);
        } else {
            self.conflicts.add(oid, DELETED);
        }
        Ok(())
    }

    fn handle_new_efforts(
        &mut self,
        mem: &mut ObjectGraph,
        disk: &ObjectGraph,
        ids: &[ObjectId],
    ) -> Result<(), SyncError> {
        for eid in ids {
            if mem.contains(eid) {
                continue;
            }
            if self.locally_deleted(eid) {
                if let Some((owner, orel)) = mem.owner_of(eid) {
                    mem.unlink_owned(&owner, orel, eid);
                }
                continue;
            }
            let disk_effort = expect(disk, eid)?.clone();
            let task_id = disk_effort
                .parent
                .clone()
                .ok_or_else(|| SyncError::DanglingReference(eid.clone()))?;
            if mem.contains(&task_id) {
                mem.insert(disk_effort);
                mem.push_owned(&task_id, Relation::Effort, eid);
            } else {
                // Task deleted locally; forget the effort.
                self.conflicts.add(eid, DELETED);
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Pass 3: objects reparented on disk
    // -----------------------------------------------------------------

    /// Disk's parent choice wins. A two-sided divergence is still
    /// recorded as a `__parent__` conflict so other devices see it.
    fn reparent_from_disk(
        &mut self,
        mem: &mut ObjectGraph,
        disk: &ObjectGraph,
        section: Section,
    ) -> Result<(), SyncError> {
        for id in disk.all_objects(section) {
            if !self.disk_changes.contains(&id, PARENT) {
                continue;
            }
            if !mem.contains(&id) {
                if self.locally_deleted(&id) {
                    // Our deletion stands; the disk-side move is moot.
                    continue;
                }
                return Err(SyncError::DanglingReference(id));
            }

            let disk_parent = expect(disk, &id)?.parent.clone();
            let mem_obj = expect(mem, &id)?;
            let mem_parent = mem_obj.parent.clone();
            let kind = mem_obj.kind;
            let parent_conflict = self
                .monitor
                .get_changes(&id)
                .is_some_and(|c| c.contains(PARENT))
                && mem_parent != disk_parent;

            // Owner the object would report to if it ends up top-level:
            // the owner of its current root ancestor. Resolved before any
            // links are cut.
            let top_owner = {
                let mut top = id.clone();
                while let Some(p) = mem.get(&top).and_then(|o| o.parent.clone()) {
                    top = p;
                }
                self.mem_owner.get(&top).cloned()
            };

            mem.unlink(section, &id);
            match disk_parent {
                Some(pid) if mem.contains(&pid) => {
                    // A directly owned object nesting under a parent
                    // leaves its owner's top-level list.
                    if let (Some(owner), Some(orel)) = (self.mem_owner.remove(&id), rel_for(kind)) {
                        mem.unlink_owned(&owner, orel, &id);
                    }
                    mem.push_child(&pid, &id);
                    if let Some(obj) = mem.get_mut(&id) {
                        obj.parent = Some(pid);
                    }
                }
                Some(_) => {
                    // Disk's new parent is gone from mem.
                    self.promote_to_top(mem, section, &id, kind, top_owner);
                    self.conflicts.add(&id, PARENT);
                }
                None => {
                    self.promote_to_top(mem, section, &id, kind, top_owner);
                }
            }

            if parent_conflict {
                self.conflicts.add(&id, PARENT);
            }
        }
        Ok(())
    }

    fn promote_to_top(
        &mut self,
        mem: &mut ObjectGraph,
        section: Section,
        id: &ObjectId,
        kind: ObjectKind,
        top_owner: Option<ObjectId>,
    ) {
        if let Some(obj) = mem.get_mut(id) {
            obj.parent = None;
        }
        match (top_owner, rel_for(kind)) {
            (Some(owner), Some(orel)) => {
                mem.push_owned(&owner, orel, id);
                self.mem_owner.insert(id.clone(), owner);
            }
            _ => mem.push_root(section, id),
        }
    }

    // -----------------------------------------------------------------
    // Pass 4: composite objects deleted on disk
    // -----------------------------------------------------------------

    /// Disk-side deletion always wins; local unsaved changes to the same
    /// object are discarded without a conflict.
    fn apply_deletions(&mut self, mem: &mut ObjectGraph, section: Section) {
        for id in mem.composites_sorted(section) {
            if !mem.contains(&id) {
                continue; // removed with an earlier subtree
            }
            if self.disk_changes.contains(&id, DELETED) {
                mem.unlink(section, &id);
                mem.delete_subtree(&id, &mut NullSink);
            }
        }
        self.mem_owner
            .retain(|owned, owner| mem.contains(owned) && mem.contains(owner));
    }

    // -----------------------------------------------------------------
    // Pass 5: owned objects deleted on disk
    // -----------------------------------------------------------------

    fn apply_owned_deletions(&mut self, mem: &mut ObjectGraph, section: Section) {
        for id in mem.composites_sorted(section) {
            let Some(obj) = mem.get(&id) else { continue };
            let (notes, attachments, efforts) =
                (obj.notes.clone(), obj.attachments.clone(), obj.efforts.clone());
            self.handle_owned_removed(mem, &notes, Relation::Note);
            self.handle_owned_removed(mem, &attachments, Relation::Attachment);
            for eid in efforts {
                if self.disk_changes.contains(&eid, DELETED) {
                    mem.unlink_owned(&id, Relation::Effort, &eid);
                    mem.delete_subtree(&eid, &mut NullSink);
                }
            }
        }
    }

    /// Depth-first so a deleted composite's owned children are cleaned up
    /// before the object's own unlink.
    fn handle_owned_removed(&mut self, mem: &mut ObjectGraph, ids: &[ObjectId], rel: Relation) {
        for oid in ids {
            let Some(obj) = mem.get(oid) else { continue };
            let obj = obj.clone();
            self.handle_owned_removed(mem, &obj.children, rel);
            self.handle_owned_removed(mem, &obj.notes, Relation::Note);
            self.handle_owned_removed(mem, &obj.attachments, Relation::Attachment);

            if self.disk_changes.contains(oid, DELETED) {
                match &obj.parent {
                    Some(p) => mem.unlink_owned(p, Relation::Child, oid),
                    None => {
                        if let Some(owner) = self.mem_owner.get(oid).cloned() {
                            mem.unlink_owned(&owner, rel, oid);
                        } else if let Some((owner, orel)) = mem.owner_of(oid) {
                            mem.unlink_owned(&owner, orel, oid);
                        }
                    }
                }
                mem.delete_subtree(oid, &mut NullSink);
            }
        }
    }

    // -----------------------------------------------------------------
    // Pass 6: attribute-level apply
    // -----------------------------------------------------------------

    fn apply_attributes(
        &mut self,
        mem: &mut ObjectGraph,
        disk: &ObjectGraph,
        section: Section,
    ) -> Result<(), SyncError> {
        for id in mem.all_objects(section) {
            let Some(disk_changed) = self.disk_changes.get(&id) else {
                continue;
            };
            if disk_changed.is_empty() {
                continue;
            }
            let disk_changed = disk_changed.clone();
            let disk_obj = expect(disk, &id)?;
            let local = self.monitor.get_changes(&id).cloned();
            let locally_has = |name: &str| local.as_ref().is_some_and(|c| c.contains(name));

            let mut ops: Vec<ApplyOp> = Vec::new();
            {
                let mem_obj = expect(mem, &id)?;
                for name in &disk_changed {
                    match name.as_str() {
                        // Structure was settled by the earlier passes.
                        PARENT | DELETED | OWNER => {}
                        CATEGORIES => {
                            // Category ids the local side deleted are
                            // skipped; categories merged first, so any
                            // miss is a local delete.
                            let disk_cats: BTreeSet<ObjectId> = disk_obj
                                .categories
                                .iter()
                                .filter(|c| mem.contains(c))
                                .cloned()
                                .collect();
                            if locally_has(CATEGORIES) && disk_cats != mem_obj.categories {
                                self.conflicts.add(&id, CATEGORIES);
                            } else {
                                ops.push(ApplyOp::Categories(disk_cats));
                            }
                        }
                        APPEARANCE => {
                            if locally_has(APPEARANCE) {
                                if mem_obj.appearance != disk_obj.appearance {
                                    self.conflicts.add(&id, APPEARANCE);
                                }
                            } else {
                                ops.push(ApplyOp::Appearance(disk_obj.appearance.clone()));
                            }
                        }
                        // Expansion state is not data worth protecting:
                        // applied unconditionally, never a conflict.
                        EXPANSION => ops.push(ApplyOp::Expanded(disk_obj.expanded)),
                        other => {
                            let Some(attr) = Attr::from_name(other) else {
                                continue;
                            };
                            let disk_value = disk_obj.get_attr(attr);
                            if locally_has(other) && mem_obj.get_attr(attr) != disk_value {
                                // Genuine conflict: both sides changed it
                                // to different values. Memory keeps its
                                // value; the conflict is recorded.
                                self.conflicts.add(&id, other);
                            } else {
                                ops.push(ApplyOp::Plain(attr, disk_value));
                            }
                        }
                    }
                }
            }

            if let Some(mem_obj) = mem.get_mut(&id) {
                for op in ops {
                    match op {
                        ApplyOp::Plain(attr, value) => mem_obj.set_attr(attr, value),
                        ApplyOp::Appearance(a) => mem_obj.appearance = a,
                        ApplyOp::Categories(cats) => mem_obj.categories = cats,
                        ApplyOp::Expanded(e) => mem_obj.expanded = e,
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NullSink;

    fn obj(id: &str, kind: ObjectKind) -> DomainObject {
        DomainObject::new(id, kind, id.to_uppercase())
    }

    fn run(
        mem: &mut ObjectGraph,
        disk: &ObjectGraph,
        monitor: &mut ChangeMonitor,
        table: &mut ChangeTable,
    ) -> ChangeSet {
        ChangeSynchronizer::new(monitor, table)
            .sync(mem, disk)
            .expect("merge failed")
    }

    #[test]
    fn identical_graphs_merge_without_conflicts() {
        let mut mem = ObjectGraph::new();
        mem.add_root(Section::Tasks, obj("t1", ObjectKind::Task), &mut NullSink)
            .unwrap();
        let disk = mem.clone();
        let mut monitor = ChangeMonitor::new();
        let mut table = ChangeTable::new();

        let conflicts = run(&mut mem, &disk, &mut monitor, &mut table);
        assert!(conflicts.is_empty());
        assert_eq!(mem.len(), 1);
        assert!(mem.contains(&"t1".into()));
    }

    #[test]
    fn new_disk_object_is_spliced_under_mem_parent() {
        let mut mem = ObjectGraph::new();
        mem.add_root(Section::Tasks, obj("t1", ObjectKind::Task), &mut NullSink)
            .unwrap();

        let mut disk = mem.clone();
        disk.add_child(&"t1".into(), obj("t2", ObjectKind::Task), &mut NullSink)
            .unwrap();

        let mut monitor = ChangeMonitor::new();
        let mut table = ChangeTable::new();
        let conflicts = run(&mut mem, &disk, &mut monitor, &mut table);

        assert!(conflicts.is_empty());
        assert_eq!(mem.get(&"t2".into()).unwrap().parent, Some("t1".into()));
        assert!(mem.get(&"t1".into()).unwrap().children.contains(&"t2".into()));
    }

    #[test]
    fn new_disk_object_with_locally_deleted_parent_goes_top_level() {
        // mem knows t1 and deleted it; disk grew child t2 under t1
        let mut mem = ObjectGraph::new();
        let mut monitor = ChangeMonitor::new();
        mem.add_root(Section::Tasks, obj("t1", ObjectKind::Task), &mut monitor)
            .unwrap();

        let mut disk = mem.clone();
        disk.add_child(&"t1".into(), obj("t2", ObjectKind::Task), &mut NullSink)
            .unwrap();

        mem.remove_root(Section::Tasks, &"t1".into(), &mut monitor)
            .unwrap();

        let mut table = ChangeTable::new();
        let conflicts = run(&mut mem, &disk, &mut monitor, &mut table);

        assert!(mem.contains(&"t2".into()));
        assert_eq!(mem.get(&"t2".into()).unwrap().parent, None);
        assert!(mem.roots(Section::Tasks).contains(&"t2".into()));
        // t1 stays deleted (our monitor said so)
        assert!(!mem.contains(&"t1".into()));
        assert!(conflicts.contains(&"t2".into(), PARENT));
    }

    #[test]
    fn orphaned_owned_object_is_dropped() {
        // disk has note n1 owned by t1; mem deleted t1 entirely
        let mut mem = ObjectGraph::new();
        let mut monitor = ChangeMonitor::new();
        mem.add_root(Section::Tasks, obj("t1", ObjectKind::Task), &mut monitor)
            .unwrap();

        let mut disk = mem.clone();
        disk.add_owned(
            &"t1".into(),
            Relation::Note,
            obj("n1", ObjectKind::Note),
            &mut NullSink,
        )
        .unwrap();

        mem.remove_root(Section::Tasks, &"t1".into(), &mut monitor)
            .unwrap();

        let mut table = ChangeTable::new();
        let conflicts = run(&mut mem, &disk, &mut monitor, &mut table);

        assert!(!mem.contains(&"n1".into()));
        assert!(conflicts.contains(&"n1".into(), DELETED));
    }

    #[test]
    fn disk_deletion_wins_over_local_edit() {
        let mut mem = ObjectGraph::new();
        let mut monitor = ChangeMonitor::new();
        mem.add_root(Section::Tasks, obj("t1", ObjectKind::Task), &mut NullSink)
            .unwrap();
        let mut disk = mem.clone();

        // local edit
        mem.set_subject(&"t1".into(), "changed locally", &mut monitor)
            .unwrap();
        // disk-side deletion, recorded in our table entry by the deleter
        disk.remove_root(Section::Tasks, &"t1".into(), &mut NullSink)
            .unwrap();
        let mut deleted = ChangeSet::new();
        deleted.add(&"t1".into(), DELETED);
        let mut table = ChangeTable::new();
        table.insert(monitor.guid().to_string(), deleted);

        let conflicts = run(&mut mem, &disk, &mut monitor, &mut table);

        assert!(!mem.contains(&"t1".into()));
        assert!(mem.roots(Section::Tasks).is_empty());
        // deletion is decisive, not contested
        assert!(!conflicts.contains(&"t1".into(), DELETED));
        assert!(monitor.get_changes(&"t1".into()).is_none_or(|c| c.is_empty()));
    }

    #[test]
    fn conflicting_attribute_keeps_mem_value() {
        let mut mem = ObjectGraph::new();
        let mut monitor = ChangeMonitor::new();
        mem.add_root(Section::Tasks, obj("t1", ObjectKind::Task), &mut NullSink)
            .unwrap();
        let mut disk = mem.clone();

        mem.set_subject(&"t1".into(), "mem subject", &mut monitor)
            .unwrap();
        disk.set_subject(&"t1".into(), "disk subject", &mut NullSink)
            .unwrap();
        let mut remote = ChangeSet::new();
        remote.add(&"t1".into(), "subject");
        let mut table = ChangeTable::new();
        table.insert(monitor.guid().to_string(), remote);

        let conflicts = run(&mut mem, &disk, &mut monitor, &mut table);

        assert_eq!(mem.get(&"t1".into()).unwrap().subject, "mem subject");
        assert!(conflicts.contains(&"t1".into(), "subject"));
    }

    #[test]
    fn unconflicted_attribute_is_applied_from_disk() {
        let mut mem = ObjectGraph::new();
        let mut monitor = ChangeMonitor::new();
        mem.add_root(Section::Tasks, obj("t1", ObjectKind::Task), &mut NullSink)
            .unwrap();
        let mut disk = mem.clone();

        disk.set_subject(&"t1".into(), "disk subject", &mut NullSink)
            .unwrap();
        let mut remote = ChangeSet::new();
        remote.add(&"t1".into(), "subject");
        let mut table = ChangeTable::new();
        table.insert(monitor.guid().to_string(), remote);

        let conflicts = run(&mut mem, &disk, &mut monitor, &mut table);

        assert!(conflicts.is_empty());
        assert_eq!(mem.get(&"t1".into()).unwrap().subject, "disk subject");
    }

    #[test]
    fn reparent_disk_wins_and_conflict_is_recorded() {
        // shared baseline: t1, p2, p3, with t1 under p2... start flat
        let mut mem = ObjectGraph::new();
        let mut monitor = ChangeMonitor::new();
        for id in ["x", "p2", "p3"] {
            mem.add_root(Section::Tasks, obj(id, ObjectKind::Task), &mut NullSink)
                .unwrap();
        }
        let mut disk = mem.clone();

        // mem moves x under p3; disk moves x under p2
        mem.reparent(Section::Tasks, &"x".into(), Some(&"p3".into()), &mut monitor)
            .unwrap();
        disk.reparent(Section::Tasks, &"x".into(), Some(&"p2".into()), &mut NullSink)
            .unwrap();
        let mut remote = ChangeSet::new();
        remote.add(&"x".into(), PARENT);
        let mut table = ChangeTable::new();
        table.insert(monitor.guid().to_string(), remote);

        let conflicts = run(&mut mem, &disk, &mut monitor, &mut table);

        assert_eq!(mem.get(&"x".into()).unwrap().parent, Some("p2".into()));
        assert!(mem.get(&"p2".into()).unwrap().children.contains(&"x".into()));
        assert!(!mem.get(&"p3".into()).unwrap().children.contains(&"x".into()));
        assert!(conflicts.contains(&"x".into(), PARENT));
    }

    #[test]
    fn conflicts_propagate_to_other_devices() {
        let mut mem = ObjectGraph::new();
        let mut monitor = ChangeMonitor::new();
        mem.add_root(Section::Tasks, obj("t1", ObjectKind::Task), &mut NullSink)
            .unwrap();
        let mut disk = mem.clone();

        mem.set_subject(&"t1".into(), "mem", &mut monitor).unwrap();
        disk.set_subject(&"t1".into(), "disk", &mut NullSink).unwrap();
        let mut remote = ChangeSet::new();
        remote.add(&"t1".into(), "subject");
        let mut table = ChangeTable::new();
        table.insert(monitor.guid().to_string(), remote);
        table.insert("device-b".to_string(), ChangeSet::new());

        run(&mut mem, &disk, &mut monitor, &mut table);

        let b = table.get("device-b").unwrap();
        assert!(b.contains(&"t1".into(), "subject"));
    }

    #[test]
    fn category_set_conflict_keeps_mem_membership() {
        let mut mem = ObjectGraph::new();
        let mut monitor = ChangeMonitor::new();
        mem.add_root(Section::Categories, obj("c1", ObjectKind::Category), &mut NullSink)
            .unwrap();
        mem.add_root(Section::Categories, obj("c2", ObjectKind::Category), &mut NullSink)
            .unwrap();
        mem.add_root(Section::Tasks, obj("t1", ObjectKind::Task), &mut NullSink)
            .unwrap();
        let mut disk = mem.clone();

        // Each side assigns a different category set.
        mem.add_category(&"t1".into(), &"c2".into(), &mut monitor)
            .unwrap();
        disk.add_category(&"t1".into(), &"c1".into(), &mut NullSink)
            .unwrap();
        let mut remote = ChangeSet::new();
        remote.add(&"t1".into(), CATEGORIES);
        let mut table = ChangeTable::new();
        table.insert(monitor.guid().to_string(), remote);

        let conflicts = run(&mut mem, &disk, &mut monitor, &mut table);

        let cats = &mem.get(&"t1".into()).unwrap().categories;
        assert!(cats.contains(&"c2".into()));
        assert!(!cats.contains(&"c1".into()));
        assert!(conflicts.contains(&"t1".into(), CATEGORIES));
    }

    #[test]
    fn disk_link_to_locally_deleted_category_is_skipped() {
        let mut mem = ObjectGraph::new();
        let mut monitor = ChangeMonitor::new();
        mem.add_root(Section::Categories, obj("c1", ObjectKind::Category), &mut NullSink)
            .unwrap();
        mem.add_root(Section::Categories, obj("c9", ObjectKind::Category), &mut NullSink)
            .unwrap();
        mem.add_root(Section::Tasks, obj("t1", ObjectKind::Task), &mut NullSink)
            .unwrap();
        let mut disk = mem.clone();

        disk.add_category(&"t1".into(), &"c1".into(), &mut NullSink)
            .unwrap();
        disk.add_category(&"t1".into(), &"c9".into(), &mut NullSink)
            .unwrap();
        // c9 is gone locally; t1's own membership was not touched here.
        mem.remove_root(Section::Categories, &"c9".into(), &mut monitor)
            .unwrap();

        let mut remote = ChangeSet::new();
        remote.add(&"t1".into(), CATEGORIES);
        let mut table = ChangeTable::new();
        table.insert(monitor.guid().to_string(), remote);

        let conflicts = run(&mut mem, &disk, &mut monitor, &mut table);

        assert!(conflicts.is_empty());
        assert!(!mem.contains(&"c9".into()));
        let cats = &mem.get(&"t1".into()).unwrap().categories;
        assert!(cats.contains(&"c1".into()));
        assert!(!cats.contains(&"c9".into()));
    }

    #[test]
    fn appearance_conflict_keeps_mem_appearance() {
        let mut mem = ObjectGraph::new();
        let mut monitor = ChangeMonitor::new();
        mem.add_root(Section::Tasks, obj("t1", ObjectKind::Task), &mut NullSink)
            .unwrap();
        let mut disk = mem.clone();

        let red = Appearance {
            icon: Some("red".into()),
            ..Appearance::default()
        };
        let blue = Appearance {
            icon: Some("blue".into()),
            ..Appearance::default()
        };
        mem.set_appearance(&"t1".into(), red.clone(), &mut monitor)
            .unwrap();
        disk.set_appearance(&"t1".into(), blue, &mut NullSink)
            .unwrap();
        let mut remote = ChangeSet::new();
        remote.add(&"t1".into(), APPEARANCE);
        let mut table = ChangeTable::new();
        table.insert(monitor.guid().to_string(), remote);

        let conflicts = run(&mut mem, &disk, &mut monitor, &mut table);

        assert_eq!(mem.get(&"t1".into()).unwrap().appearance, red);
        assert!(conflicts.contains(&"t1".into(), APPEARANCE));
    }

    #[test]
    fn identical_appearance_change_is_not_a_conflict() {
        let mut mem = ObjectGraph::new();
        let mut monitor = ChangeMonitor::new();
        mem.add_root(Section::Tasks, obj("t1", ObjectKind::Task), &mut NullSink)
            .unwrap();
        let mut disk = mem.clone();

        let red = Appearance {
            icon: Some("red".into()),
            ..Appearance::default()
        };
        mem.set_appearance(&"t1".into(), red.clone(), &mut monitor)
            .unwrap();
        disk.set_appearance(&"t1".into(), red.clone(), &mut NullSink)
            .unwrap();
        let mut remote = ChangeSet::new();
        remote.add(&"t1".into(), APPEARANCE);
        let mut table = ChangeTable::new();
        table.insert(monitor.guid().to_string(), remote);

        let conflicts = run(&mut mem, &disk, &mut monitor, &mut table);

        assert!(conflicts.is_empty());
        assert_eq!(mem.get(&"t1".into()).unwrap().appearance, red);
    }

    #[test]
    fn new_note_under_locally_deleted_note_reattaches_to_owner() {
        // mem: t1 owns note n1, and we delete n1. disk grew n2 under n1.
        let mut mem = ObjectGraph::new();
        let mut monitor = ChangeMonitor::new();
        mem.add_root(Section::Tasks, obj("t1", ObjectKind::Task), &mut NullSink)
            .unwrap();
        mem.add_owned(
            &"t1".into(),
            Relation::Note,
            obj("n1", ObjectKind::Note),
            &mut NullSink,
        )
        .unwrap();

        let mut disk = mem.clone();
        disk.add_child(&"n1".into(), obj("n2", ObjectKind::Note), &mut NullSink)
            .unwrap();

        mem.remove_owned(&"t1".into(), Relation::Note, &"n1".into(), &mut monitor)
            .unwrap();

        let mut table = ChangeTable::new();
        let conflicts = run(&mut mem, &disk, &mut monitor, &mut table);

        // n1 stays deleted; n2 surfaces as a top-level note of the owner.
        assert!(!mem.contains(&"n1".into()));
        assert!(mem.contains(&"n2".into()));
        assert_eq!(mem.get(&"n2".into()).unwrap().parent, None);
        assert!(mem.get(&"t1".into()).unwrap().notes.contains(&"n2".into()));
        assert!(conflicts.contains(&"n2".into(), OWNER));
    }

    #[test]
    fn expansion_state_applies_without_conflict() {
        let mut mem = ObjectGraph::new();
        let mut monitor = ChangeMonitor::new();
        mem.add_root(Section::Tasks, obj("t1", ObjectKind::Task), &mut NullSink)
            .unwrap();
        let mut disk = mem.clone();

        mem.set_expanded(&"t1".into(), false, &mut monitor).unwrap();
        disk.set_expanded(&"t1".into(), true, &mut NullSink).unwrap();
        let mut remote = ChangeSet::new();
        remote.add(&"t1".into(), EXPANSION);
        let mut table = ChangeTable::new();
        table.insert(monitor.guid().to_string(), remote);

        let conflicts = run(&mut mem, &disk, &mut monitor, &mut table);

        assert!(conflicts.is_empty());
        assert!(mem.get(&"t1".into()).unwrap().expanded);
    }
}
