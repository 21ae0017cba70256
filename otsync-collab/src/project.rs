//! Project metadata returned by `joinProject`.
//!
//! ```text
//! project
//! └── rootFolder[0]
//!     ├── docs:    [{_id, name}]  → DocEntry { path: "main.tex" }
//!     └── folders: [{name, docs, folders}]
//!                   └── docs      → DocEntry { path: "chapters/intro.tex" }
//! ```

use serde::Deserialize;
use serde_json::Value;

use otsync_core::DocId;

use crate::protocol::ProtocolError;

/// An editable document of the project tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocEntry {
    pub id: DocId,
    /// Slash-separated path relative to the project root.
    pub path: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectInfo {
    pub id: String,
    pub name: String,
    pub documents: Vec<DocEntry>,
    /// The reply as received, for fields not modelled here.
    pub raw: Value,
}

#[derive(Deserialize)]
struct RawEntity {
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
struct RawFolder {
    #[serde(default)]
    name: String,
    #[serde(default)]
    docs: Vec<RawEntity>,
    #[serde(default)]
    folders: Vec<RawFolder>,
}

#[derive(Deserialize)]
struct RawProject {
    #[serde(rename = "_id", default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "rootFolder", default)]
    root_folder: Vec<RawFolder>,
}

impl ProjectInfo {
    pub fn from_value(raw: Value) -> Result<Self, ProtocolError> {
        let project: RawProject = serde_json::from_value(raw.clone())
            .map_err(|e| ProtocolError::DeserializationError(format!("joinProject: {e}")))?;

        let mut documents = Vec::new();
        // the root folder's own name is not part of any path
        for root in &project.root_folder {
            collect_docs(root, "", &mut documents);
        }

        Ok(Self {
            id: project.id,
            name: project.name,
            documents,
            raw,
        })
    }

    pub fn document(&self, doc_id: &str) -> Option<&DocEntry> {
        self.documents.iter().find(|d| d.id == doc_id)
    }

    pub fn find_by_path(&self, path: &str) -> Option<&DocEntry> {
        self.documents.iter().find(|d| d.path == path)
    }
}

fn collect_docs(folder: &RawFolder, prefix: &str, out: &mut Vec<DocEntry>) {
    for doc in &folder.docs {
        out.push(DocEntry {
            id: doc.id.clone(),
            path: format!("{prefix}{}", doc.name),
        });
    }
    for child in &folder.folders {
        let prefix = format!("{prefix}{}/", child.name);
        collect_docs(child, &prefix, out);
    }
}
