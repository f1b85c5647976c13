use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable opaque identifier for a domain object.
///
/// Identity across the memory/disk boundary is by id, never by address:
/// the same logical object loaded twice compares equal through its id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn new(id: impl Into<String>) -> Self {
        ObjectId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectId {
    fn from(s: &str) -> Self {
        ObjectId(s.to_string())
    }
}

/// Domain object kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    Category,
    Task,
    Note,
    Effort,
    Attachment,
}

impl ObjectKind {
    /// Composite kinds can own children of their own kind.
    pub fn is_composite(self) -> bool {
        matches!(
            self,
            ObjectKind::Category | ObjectKind::Task | ObjectKind::Note
        )
    }
}

/// Persistence status of a domain object.
///
/// Deletion is soft until the object is actually removed from its
/// container; status changes cascade through the composite subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    #[default]
    New,
    Changed,
    Deleted,
    Clean,
}

/// The visual attribute family. The change log records a single
/// `appearance` entry for any of these; the merge compares them
/// individually.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Appearance {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub foreground_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_color: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub font: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_icon: Option<String>,
}

// Sentinel change names shared with the sidecar format.
pub const DELETED: &str = "__del__";
pub const PARENT: &str = "__parent__";
pub const OWNER: &str = "__owner__";
pub const CATEGORIES: &str = "__categories__";
pub const APPEARANCE: &str = "appearance";
pub const EXPANSION: &str = "expandedContexts";

/// Plain attributes addressable by their change-log name.
///
/// `appearance`, `__categories__` and `expandedContexts` are families with
/// their own merge handling and are not listed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attr {
    Subject,
    Description,
    Start,
    Stop,
}

impl Attr {
    pub fn from_name(name: &str) -> Option<Attr> {
        match name {
            "subject" => Some(Attr::Subject),
            "description" => Some(Attr::Description),
            "start" => Some(Attr::Start),
            "stop" => Some(Attr::Stop),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Attr::Subject => "subject",
            Attr::Description => "description",
            Attr::Start => "start",
            Attr::Stop => "stop",
        }
    }
}

/// A typed attribute value, used by the merge's table-driven apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    Text(String),
    Time(Option<DateTime<Utc>>),
}

/// A domain object: category, task, note, attachment or effort.
///
/// Links to other objects (parent, children, owned collections,
/// categories) are stored as ids; the [`ObjectGraph`](super::ObjectGraph)
/// arena owns all objects and resolves them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainObject {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub status: Status,
    pub subject: String,
    pub description: String,
    pub appearance: Appearance,
    /// Category membership (categorizable side only; members of a
    /// category are derived by scanning).
    pub categories: BTreeSet<ObjectId>,
    /// UI expansion state. Merged unconditionally, never a conflict.
    pub expanded: bool,
    /// Composite parent (for efforts: the owning task).
    pub parent: Option<ObjectId>,
    pub children: Vec<ObjectId>,
    pub notes: Vec<ObjectId>,
    pub attachments: Vec<ObjectId>,
    /// Tasks only.
    pub efforts: Vec<ObjectId>,
    /// Effort payload.
    pub start: Option<DateTime<Utc>>,
    pub stop: Option<DateTime<Utc>>,
}

impl DomainObject {
    pub fn new(id: impl Into<ObjectId>, kind: ObjectKind, subject: impl Into<String>) -> Self {
        DomainObject {
            id: id.into(),
            kind,
            status: Status::New,
            subject: subject.into(),
            description: String::new(),
            appearance: Appearance::default(),
            categories: BTreeSet::new(),
            expanded: false,
            parent: None,
            children: Vec::new(),
            notes: Vec::new(),
            attachments: Vec::new(),
            efforts: Vec::new(),
            start: None,
            stop: None,
        }
    }

    pub fn get_attr(&self, attr: Attr) -> AttrValue {
        match attr {
            Attr::Subject => AttrValue::Text(self.subject.clone()),
            Attr::Description => AttrValue::Text(self.description.clone()),
            Attr::Start => AttrValue::Time(self.start),
            Attr::Stop => AttrValue::Time(self.stop),
        }
    }

    pub fn set_attr(&mut self, attr: Attr, value: AttrValue) {
        match (attr, value) {
            (Attr::Subject, AttrValue::Text(s)) => self.subject = s,
            (Attr::Description, AttrValue::Text(s)) => self.description = s,
            (Attr::Start, AttrValue::Time(t)) => self.start = t,
            (Attr::Stop, AttrValue::Time(t)) => self.stop = t,
            // Mismatched value shapes only arise from a corrupt change
            // log; the attribute keeps its current value.
            _ => {}
        }
    }
}
