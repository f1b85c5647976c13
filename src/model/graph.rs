use std::collections::HashMap;

use indexmap::IndexMap;

use crate::model::object::{
    APPEARANCE, Appearance, Attr, AttrValue, CATEGORIES, DELETED, DomainObject, EXPANSION,
    ObjectId, ObjectKind, PARENT, Status,
};

/// Receiver for mutation notifications.
///
/// Every mutating graph method takes a sink, so change tracking is an
/// explicit injected dependency instead of ambient event subscription.
pub trait ChangeSink {
    fn record(&mut self, id: &ObjectId, change: &str);

    /// An object entered a monitored collection. Gives the id an empty
    /// baseline so lookups can distinguish known ids from unknown ones.
    fn record_added(&mut self, _id: &ObjectId) {}
}

/// Sink that discards everything. Used where mutations must not be
/// tracked (loading, and inside the merge itself).
pub struct NullSink;

impl ChangeSink for NullSink {
    fn record(&mut self, _id: &ObjectId, _change: &str) {}
}

/// Top-level sections of a task file, in merge order. Categories come
/// first because category membership of tasks and notes can only be
/// resolved once all categories are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Categories,
    Tasks,
    Notes,
}

impl Section {
    pub const ALL: [Section; 3] = [Section::Categories, Section::Tasks, Section::Notes];
}

/// The closed set of ownership relations a domain object participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Child,
    Note,
    Attachment,
    Effort,
}

impl Relation {
    /// The owned (non-child) relations, in traversal order.
    pub const OWNED: [Relation; 3] = [Relation::Note, Relation::Attachment, Relation::Effort];
}

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("unknown object id: {0}")]
    UnknownId(ObjectId),
    #[error("object {0} already present")]
    DuplicateId(ObjectId),
}

/// Arena of domain objects keyed by id, with per-section root lists.
///
/// Parent/child and owner links are plain ids: the graph owns every
/// object, links are data, and no back-references exist to go stale.
#[derive(Debug, Clone, Default)]
pub struct ObjectGraph {
    objects: IndexMap<ObjectId, DomainObject>,
    categories: Vec<ObjectId>,
    tasks: Vec<ObjectId>,
    notes: Vec<ObjectId>,
}

impl ObjectGraph {
    pub fn new() -> Self {
        ObjectGraph::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    pub fn get(&self, id: &ObjectId) -> Option<&DomainObject> {
        self.objects.get(id)
    }

    pub fn get_mut(&mut self, id: &ObjectId) -> Option<&mut DomainObject> {
        self.objects.get_mut(id)
    }

    pub fn roots(&self, section: Section) -> &[ObjectId] {
        match section {
            Section::Categories => &self.categories,
            Section::Tasks => &self.tasks,
            Section::Notes => &self.notes,
        }
    }

    fn roots_mut(&mut self, section: Section) -> &mut Vec<ObjectId> {
        match section {
            Section::Categories => &mut self.categories,
            Section::Tasks => &mut self.tasks,
            Section::Notes => &mut self.notes,
        }
    }

    /// The section a root of this kind belongs to. Owned notes never sit
    /// in a root list, but their kind still maps to the notes section.
    pub fn section_for(kind: ObjectKind) -> Option<Section> {
        match kind {
            ObjectKind::Category => Some(Section::Categories),
            ObjectKind::Task => Some(Section::Tasks),
            ObjectKind::Note => Some(Section::Notes),
            ObjectKind::Attachment | ObjectKind::Effort => None,
        }
    }

    // -----------------------------------------------------------------
    // Structural mutation (tracked)
    // -----------------------------------------------------------------

    /// Add a new top-level object to a section.
    pub fn add_root(
        &mut self,
        section: Section,
        obj: DomainObject,
        sink: &mut dyn ChangeSink,
    ) -> Result<ObjectId, GraphError> {
        let id = obj.id.clone();
        if self.contains(&id) {
            return Err(GraphError::DuplicateId(id));
        }
        self.objects.insert(id.clone(), obj);
        self.roots_mut(section).push(id.clone());
        sink.record_added(&id);
        Ok(id)
    }

    /// Add a new child under an existing composite object.
    pub fn add_child(
        &mut self,
        parent: &ObjectId,
        mut obj: DomainObject,
        sink: &mut dyn ChangeSink,
    ) -> Result<ObjectId, GraphError> {
        let id = obj.id.clone();
        if self.contains(&id) {
            return Err(GraphError::DuplicateId(id));
        }
        if !self.contains(parent) {
            return Err(GraphError::UnknownId(parent.clone()));
        }
        obj.parent = Some(parent.clone());
        self.objects.insert(id.clone(), obj);
        self.push_child(parent, &id);
        sink.record_added(&id);
        Ok(id)
    }

    /// Add a new owned object (note, attachment or effort) to an owner.
    pub fn add_owned(
        &mut self,
        owner: &ObjectId,
        rel: Relation,
        mut obj: DomainObject,
        sink: &mut dyn ChangeSink,
    ) -> Result<ObjectId, GraphError> {
        let id = obj.id.clone();
        if self.contains(&id) {
            return Err(GraphError::DuplicateId(id));
        }
        if !self.contains(owner) {
            return Err(GraphError::UnknownId(owner.clone()));
        }
        // Efforts point back at their task through the parent link.
        obj.parent = match rel {
            Relation::Effort => Some(owner.clone()),
            _ => None,
        };
        self.objects.insert(id.clone(), obj);
        self.push_owned(owner, rel, &id);
        sink.record_added(&id);
        Ok(id)
    }

    /// Remove a top-level object and its entire subtree.
    pub fn remove_root(
        &mut self,
        section: Section,
        id: &ObjectId,
        sink: &mut dyn ChangeSink,
    ) -> Result<(), GraphError> {
        if !self.contains(id) {
            return Err(GraphError::UnknownId(id.clone()));
        }
        self.roots_mut(section).retain(|r| r != id);
        self.delete_subtree(id, sink);
        Ok(())
    }

    /// Remove a child object (and its subtree) from its parent.
    pub fn remove_child(
        &mut self,
        parent: &ObjectId,
        id: &ObjectId,
        sink: &mut dyn ChangeSink,
    ) -> Result<(), GraphError> {
        if !self.contains(id) {
            return Err(GraphError::UnknownId(id.clone()));
        }
        let parent_obj = self
            .objects
            .get_mut(parent)
            .ok_or_else(|| GraphError::UnknownId(parent.clone()))?;
        parent_obj.children.retain(|c| c != id);
        self.delete_subtree(id, sink);
        Ok(())
    }

    /// Remove an owned object (and its subtree) from its owner.
    pub fn remove_owned(
        &mut self,
        owner: &ObjectId,
        rel: Relation,
        id: &ObjectId,
        sink: &mut dyn ChangeSink,
    ) -> Result<(), GraphError> {
        if !self.contains(id) {
            return Err(GraphError::UnknownId(id.clone()));
        }
        let owner_obj = self
            .objects
            .get_mut(owner)
            .ok_or_else(|| GraphError::UnknownId(owner.clone()))?;
        match rel {
            Relation::Child => owner_obj.children.retain(|c| c != id),
            Relation::Note => owner_obj.notes.retain(|c| c != id),
            Relation::Attachment => owner_obj.attachments.retain(|c| c != id),
            Relation::Effort => owner_obj.efforts.retain(|c| c != id),
        }
        self.delete_subtree(id, sink);
        Ok(())
    }

    /// Move an object under a new parent (or to top level with `None`).
    ///
    /// Top-level owned objects stay in their owner's collection; only
    /// section objects join the root list.
    pub fn reparent(
        &mut self,
        section: Section,
        id: &ObjectId,
        new_parent: Option<&ObjectId>,
        sink: &mut dyn ChangeSink,
    ) -> Result<(), GraphError> {
        if !self.contains(id) {
            return Err(GraphError::UnknownId(id.clone()));
        }
        if let Some(p) = new_parent
            && !self.contains(p)
        {
            return Err(GraphError::UnknownId(p.clone()));
        }
        self.unlink(section, id);
        match new_parent {
            Some(p) => {
                // A nested object leaves its owner's top-level list.
                if let Some((owner, rel)) = self.owner_of(id) {
                    self.unlink_owned(&owner, rel, id);
                }
                self.push_child(p, id);
                if let Some(obj) = self.objects.get_mut(id) {
                    obj.parent = Some(p.clone());
                }
            }
            None => {
                if let Some(obj) = self.objects.get_mut(id) {
                    obj.parent = None;
                }
                if self.owner_of(id).is_none() {
                    self.roots_mut(section).push(id.clone());
                }
            }
        }
        sink.record(id, PARENT);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Attribute mutation (tracked)
    // -----------------------------------------------------------------

    pub fn set_attr(
        &mut self,
        id: &ObjectId,
        attr: Attr,
        value: AttrValue,
        sink: &mut dyn ChangeSink,
    ) -> Result<(), GraphError> {
        let obj = self
            .objects
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownId(id.clone()))?;
        obj.set_attr(attr, value);
        if obj.status != Status::New {
            obj.status = Status::Changed;
        }
        sink.record(id, attr.name());
        Ok(())
    }

    pub fn set_subject(
        &mut self,
        id: &ObjectId,
        subject: impl Into<String>,
        sink: &mut dyn ChangeSink,
    ) -> Result<(), GraphError> {
        self.set_attr(id, Attr::Subject, AttrValue::Text(subject.into()), sink)
    }

    pub fn set_appearance(
        &mut self,
        id: &ObjectId,
        appearance: Appearance,
        sink: &mut dyn ChangeSink,
    ) -> Result<(), GraphError> {
        let obj = self
            .objects
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownId(id.clone()))?;
        obj.appearance = appearance;
        sink.record(id, APPEARANCE);
        Ok(())
    }

    pub fn set_expanded(
        &mut self,
        id: &ObjectId,
        expanded: bool,
        sink: &mut dyn ChangeSink,
    ) -> Result<(), GraphError> {
        let obj = self
            .objects
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownId(id.clone()))?;
        obj.expanded = expanded;
        sink.record(id, EXPANSION);
        Ok(())
    }

    pub fn add_category(
        &mut self,
        id: &ObjectId,
        category: &ObjectId,
        sink: &mut dyn ChangeSink,
    ) -> Result<(), GraphError> {
        if !self.contains(category) {
            return Err(GraphError::UnknownId(category.clone()));
        }
        let obj = self
            .objects
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownId(id.clone()))?;
        obj.categories.insert(category.clone());
        sink.record(id, CATEGORIES);
        Ok(())
    }

    pub fn remove_category(
        &mut self,
        id: &ObjectId,
        category: &ObjectId,
        sink: &mut dyn ChangeSink,
    ) -> Result<(), GraphError> {
        let obj = self
            .objects
            .get_mut(id)
            .ok_or_else(|| GraphError::UnknownId(id.clone()))?;
        obj.categories.remove(category);
        sink.record(id, CATEGORIES);
        Ok(())
    }

    /// Objects that are members of the given category.
    pub fn members_of(&self, category: &ObjectId) -> Vec<ObjectId> {
        self.objects
            .values()
            .filter(|o| o.categories.contains(category))
            .map(|o| o.id.clone())
            .collect()
    }

    // -----------------------------------------------------------------
    // Status cascades
    // -----------------------------------------------------------------

    /// Set a status on an object and its whole subtree (children and
    /// owned objects): a parent's logical state implies its subtree's
    /// state for persistence purposes.
    pub fn cascade_status(&mut self, id: &ObjectId, status: Status) {
        let mut ids = Vec::new();
        self.collect_all(id, &mut ids);
        for oid in ids {
            if let Some(obj) = self.objects.get_mut(&oid) {
                obj.status = status;
            }
        }
    }

    pub fn mark_deleted(&mut self, id: &ObjectId) {
        self.cascade_status(id, Status::Deleted);
    }

    pub fn mark_new(&mut self, id: &ObjectId) {
        self.cascade_status(id, Status::New);
    }

    pub fn mark_dirty(&mut self, id: &ObjectId) {
        self.cascade_status(id, Status::Changed);
    }

    pub fn clean_dirty(&mut self, id: &ObjectId) {
        self.cascade_status(id, Status::Clean);
    }

    /// Reset every object to `Clean` after a successful save.
    pub fn clean_all(&mut self) {
        for obj in self.objects.values_mut() {
            obj.status = Status::Clean;
        }
    }

    // -----------------------------------------------------------------
    // Traversal
    // -----------------------------------------------------------------

    /// Composite objects of a section in hierarchy order (parents before
    /// children). Owned objects are not included.
    pub fn composites_sorted(&self, section: Section) -> Vec<ObjectId> {
        let mut out = Vec::new();
        for root in self.roots(section) {
            self.collect_composites(root, &mut out);
        }
        out
    }

    fn collect_composites(&self, id: &ObjectId, out: &mut Vec<ObjectId>) {
        out.push(id.clone());
        if let Some(obj) = self.objects.get(id) {
            for child in obj.children.clone() {
                self.collect_composites(&child, out);
            }
        }
    }

    /// Every object reachable from a section's roots: each object is
    /// followed by its children, then its notes, attachments and efforts,
    /// recursively.
    pub fn all_objects(&self, section: Section) -> Vec<ObjectId> {
        let mut out = Vec::new();
        for root in self.roots(section) {
            self.collect_all(root, &mut out);
        }
        out
    }

    /// Every object in the file, across all sections in merge order.
    pub fn all_ids(&self) -> Vec<ObjectId> {
        let mut out = Vec::new();
        for section in Section::ALL {
            for root in self.roots(section) {
                self.collect_all(root, &mut out);
            }
        }
        out
    }

    fn collect_all(&self, id: &ObjectId, out: &mut Vec<ObjectId>) {
        out.push(id.clone());
        let Some(obj) = self.objects.get(id) else {
            return;
        };
        let links = [
            obj.children.clone(),
            obj.notes.clone(),
            obj.attachments.clone(),
            obj.efforts.clone(),
        ];
        for list in links {
            for linked in &list {
                self.collect_all(linked, out);
            }
        }
    }

    /// Map from a directly owned object's id to its owner's id. Covers
    /// notes and attachments sitting in an owner's collection; nested
    /// children reach their owner through the parent chain. Rebuilt for
    /// every merge, never persisted.
    pub fn owner_map(&self) -> HashMap<ObjectId, ObjectId> {
        let mut map = HashMap::new();
        for obj in self.objects.values() {
            for owned in obj.notes.iter().chain(obj.attachments.iter()) {
                map.insert(owned.clone(), obj.id.clone());
            }
        }
        map
    }

    /// Find the direct owner of an object, if any (linear scan).
    pub fn owner_of(&self, id: &ObjectId) -> Option<(ObjectId, Relation)> {
        for obj in self.objects.values() {
            if obj.notes.contains(id) {
                return Some((obj.id.clone(), Relation::Note));
            }
            if obj.attachments.contains(id) {
                return Some((obj.id.clone(), Relation::Attachment));
            }
            if obj.efforts.contains(id) {
                return Some((obj.id.clone(), Relation::Effort));
            }
        }
        None
    }

    // -----------------------------------------------------------------
    // Raw plumbing used by the merge (no status or tracking side effects)
    // -----------------------------------------------------------------

    /// Insert an object into the arena without linking it anywhere.
    pub(crate) fn insert(&mut self, obj: DomainObject) {
        self.objects.insert(obj.id.clone(), obj);
    }

    /// Detach an object from its parent's child list, or from the section
    /// root list if it has no parent. The object's own parent field is
    /// left for the caller to update.
    pub(crate) fn unlink(&mut self, section: Section, id: &ObjectId) {
        let parent = self.objects.get(id).and_then(|o| o.parent.clone());
        match parent {
            Some(p) => {
                if let Some(parent_obj) = self.objects.get_mut(&p) {
                    parent_obj.children.retain(|c| c != id);
                }
            }
            None => self.roots_mut(section).retain(|r| r != id),
        }
    }

    pub(crate) fn unlink_owned(&mut self, owner: &ObjectId, rel: Relation, id: &ObjectId) {
        if let Some(owner_obj) = self.objects.get_mut(owner) {
            match rel {
                Relation::Child => owner_obj.children.retain(|c| c != id),
                Relation::Note => owner_obj.notes.retain(|c| c != id),
                Relation::Attachment => owner_obj.attachments.retain(|c| c != id),
                Relation::Effort => owner_obj.efforts.retain(|c| c != id),
            }
        }
    }

    pub(crate) fn push_root(&mut self, section: Section, id: &ObjectId) {
        let roots = self.roots_mut(section);
        if !roots.contains(id) {
            roots.push(id.clone());
        }
    }

    pub(crate) fn push_child(&mut self, parent: &ObjectId, id: &ObjectId) {
        if let Some(parent_obj) = self.objects.get_mut(parent)
            && !parent_obj.children.contains(id)
        {
            parent_obj.children.push(id.clone());
        }
    }

    /// Link an already-inserted object into an owner's collection.
    /// Idempotent: a disk object spliced in with its collections intact
    /// must not gain duplicates.
    pub(crate) fn push_owned(&mut self, owner: &ObjectId, rel: Relation, id: &ObjectId) {
        if let Some(owner_obj) = self.objects.get_mut(owner) {
            let list = match rel {
                Relation::Child => &mut owner_obj.children,
                Relation::Note => &mut owner_obj.notes,
                Relation::Attachment => &mut owner_obj.attachments,
                Relation::Effort => &mut owner_obj.efforts,
            };
            if !list.contains(id) {
                list.push(id.clone());
            }
        }
    }

    /// Remove an object and everything below it from the arena, notifying
    /// the sink of each deletion. The caller detaches the top object from
    /// its parent, root list or owner first.
    pub(crate) fn delete_subtree(&mut self, id: &ObjectId, sink: &mut dyn ChangeSink) {
        let mut ids = Vec::new();
        self.collect_all(id, &mut ids);
        for oid in ids {
            self.objects.shift_remove(&oid);
            sink.record(&oid, DELETED);
        }
    }
}
