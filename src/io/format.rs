use std::fs;
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::model::{
    Appearance, DomainObject, ObjectGraph, ObjectId, ObjectKind, Section, Status,
};
use crate::sync::ChangeTable;

/// Current main-file format version. Files claiming a newer version are
/// refused outright rather than partially read.
pub const FORMAT_VERSION: u32 = 1;

/// Suffix of the sidecar change-table file.
pub const DELTA_SUFFIX: &str = ".delta";

#[derive(Debug, thiserror::Error)]
pub enum FormatError {
    #[error("file was written by a newer version (format {found}, supported {supported})")]
    TooNew { found: u32, supported: u32 },
    #[error("could not parse task file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Write a file atomically: temp file in the same directory, then rename
/// over the target. A crash mid-write leaves the previous version intact.
pub fn atomic_write(path: &Path, content: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Main data file
// ---------------------------------------------------------------------------

/// On-disk shape of one object, with children and owned collections
/// nested inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileObject {
    id: String,
    kind: ObjectKind,
    #[serde(default)]
    subject: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    description: String,
    #[serde(default, skip_serializing_if = "appearance_is_empty")]
    appearance: Appearance,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    categories: Vec<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    expanded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stop: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    children: Vec<FileObject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    notes: Vec<FileObject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    attachments: Vec<FileObject>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    efforts: Vec<FileObject>,
}

fn appearance_is_empty(a: &Appearance) -> bool {
    *a == Appearance::default()
}

#[derive(Debug, Serialize, Deserialize)]
struct FileDoc {
    version: u32,
    guid: String,
    #[serde(default)]
    categories: Vec<FileObject>,
    #[serde(default)]
    tasks: Vec<FileObject>,
    #[serde(default)]
    notes: Vec<FileObject>,
}

fn to_file_object(graph: &ObjectGraph, id: &ObjectId) -> Option<FileObject> {
    let obj = graph.get(id)?;
    let collect = |ids: &[ObjectId]| -> Vec<FileObject> {
        ids.iter().filter_map(|c| to_file_object(graph, c)).collect()
    };
    Some(FileObject {
        id: obj.id.as_str().to_string(),
        kind: obj.kind,
        subject: obj.subject.clone(),
        description: obj.description.clone(),
        appearance: obj.appearance.clone(),
        // Links to categories removed mid-session are scrubbed on write.
        categories: obj
            .categories
            .iter()
            .filter(|c| graph.contains(c))
            .map(|c| c.as_str().to_string())
            .collect(),
        expanded: obj.expanded,
        start: obj.start,
        stop: obj.stop,
        children: collect(&obj.children),
        notes: collect(&obj.notes),
        attachments: collect(&obj.attachments),
        efforts: collect(&obj.efforts),
    })
}

fn insert_file_object(
    graph: &mut ObjectGraph,
    node: &FileObject,
    parent: Option<&ObjectId>,
    section: Option<Section>,
) {
    let id = ObjectId::new(node.id.clone());
    let mut obj = DomainObject::new(id.clone(), node.kind, node.subject.clone());
    obj.status = Status::Clean;
    obj.description = node.description.clone();
    obj.appearance = node.appearance.clone();
    obj.categories = node
        .categories
        .iter()
        .map(|c| ObjectId::new(c.clone()))
        .collect();
    obj.expanded = node.expanded;
    obj.start = node.start;
    obj.stop = node.stop;
    obj.parent = parent.cloned();
    obj.children = node
        .children
        .iter()
        .map(|c| ObjectId::new(c.id.clone()))
        .collect();
    obj.notes = node.notes.iter().map(|c| ObjectId::new(c.id.clone())).collect();
    obj.attachments = node
        .attachments
        .iter()
        .map(|c| ObjectId::new(c.id.clone()))
        .collect();
    obj.efforts = node
        .efforts
        .iter()
        .map(|c| ObjectId::new(c.id.clone()))
        .collect();
    graph.insert(obj);
    if parent.is_none()
        && let Some(section) = section
    {
        graph.push_root(section, &id);
    }

    for child in &node.children {
        insert_file_object(graph, child, Some(&id), None);
    }
    for note in &node.notes {
        insert_file_object(graph, note, None, None);
    }
    for attachment in &node.attachments {
        insert_file_object(graph, attachment, None, None);
    }
    for effort in &node.efforts {
        // Efforts reach their task through the parent link.
        insert_file_object(graph, effort, Some(&id), None);
    }
}

/// Serialize the graph and file guid to the main-file schema.
pub fn write_task_file(path: &Path, graph: &ObjectGraph, guid: &str) -> Result<(), FormatError> {
    let section_docs = |section: Section| -> Vec<FileObject> {
        graph
            .roots(section)
            .iter()
            .filter_map(|id| to_file_object(graph, id))
            .collect()
    };
    let doc = FileDoc {
        version: FORMAT_VERSION,
        guid: guid.to_string(),
        categories: section_docs(Section::Categories),
        tasks: section_docs(Section::Tasks),
        notes: section_docs(Section::Notes),
    };
    let content = serde_json::to_string_pretty(&doc)?;
    atomic_write(path, content.as_bytes())?;
    Ok(())
}

/// Read the whole main file into a graph. The version is probed before
/// the document is decoded so a too-new file is never partially read.
pub fn read_task_file(path: &Path) -> Result<(ObjectGraph, String), FormatError> {
    let content = fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    if let Some(version) = value.get("version").and_then(|v| v.as_u64())
        && version as u32 > FORMAT_VERSION
    {
        return Err(FormatError::TooNew {
            found: version as u32,
            supported: FORMAT_VERSION,
        });
    }
    let doc: FileDoc = serde_json::from_value(value)?;

    let mut graph = ObjectGraph::new();
    for (section, nodes) in [
        (Section::Categories, &doc.categories),
        (Section::Tasks, &doc.tasks),
        (Section::Notes, &doc.notes),
    ] {
        for node in nodes {
            insert_file_object(&mut graph, node, None, Some(section));
        }
    }
    Ok((graph, doc.guid))
}

// ---------------------------------------------------------------------------
// Sidecar change table
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct DeltaDoc {
    version: u32,
    changes: ChangeTable,
}

pub fn write_change_table(path: &Path, table: &ChangeTable) -> Result<(), FormatError> {
    let doc = DeltaDoc {
        version: FORMAT_VERSION,
        changes: table.clone(),
    };
    let content = serde_json::to_string_pretty(&doc)?;
    atomic_write(path, content.as_bytes())?;
    Ok(())
}

/// Read the sidecar change table; a missing file is an empty table. The
/// version is probed first: a newer sidecar may not decode with today's
/// schema at all, and must still report as too-new rather than corrupt.
pub fn read_change_table(path: &Path) -> Result<ChangeTable, FormatError> {
    if !path.exists() {
        return Ok(ChangeTable::new());
    }
    let content = fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&content)?;
    if let Some(version) = value.get("version").and_then(|v| v.as_u64())
        && version as u32 > FORMAT_VERSION
    {
        return Err(FormatError::TooNew {
            found: version as u32,
            supported: FORMAT_VERSION,
        });
    }
    let doc: DeltaDoc = serde_json::from_value(value)?;
    Ok(doc.changes)
}
