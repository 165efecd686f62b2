use std::collections::{BTreeMap, BTreeSet};

use crate::records::{DocumentKind, DocumentRecord};

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub record: DocumentRecord,
    pub children: Vec<TreeNode>,
}

/// Hierarchy assembled from the device's flat, parent-linked records.
#[derive(Debug, Clone)]
pub struct DocumentTree {
    roots: Vec<TreeNode>,
}

#[derive(Debug)]
pub enum PathLookup<'a> {
    Missing,
    Unique(&'a TreeNode),
    Ambiguous(usize),
}

impl DocumentTree {
    /// Builds the hierarchy under `anchor`. Records pointing at a parent
    /// that is neither the anchor nor a known record are re-rooted under
    /// the anchor instead of being dropped.
    pub fn build(anchor: &str, records: Vec<DocumentRecord>) -> Self {
        let known: BTreeSet<String> = records.iter().map(|r| r.id.clone()).collect();
        let mut by_parent: BTreeMap<String, Vec<DocumentRecord>> = BTreeMap::new();
        for record in records {
            let parent = if record.parent == anchor || known.contains(&record.parent) {
                record.parent.clone()
            } else {
                anchor.to_string()
            };
            by_parent.entry(parent).or_default().push(record);
        }
        let roots = attach_children(anchor, &mut by_parent);
        Self { roots }
    }

    pub fn roots(&self) -> &[TreeNode] {
        &self.roots
    }

    /// Slash-joined paths of every document, depth first in listing order.
    pub fn document_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        collect_document_paths(&self.roots, "", &mut paths);
        paths
    }

    /// Slash-joined paths of every folder, including nested ones.
    pub fn folder_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        collect_folder_paths(&self.roots, "", &mut paths);
        paths
    }

    /// Identifiers of every record in the tree, documents and folders alike.
    pub fn ids(&self) -> Vec<String> {
        let mut ids = Vec::new();
        collect_ids(&self.roots, &mut ids);
        ids
    }

    /// Folder-path to identifier cache for an upload batch.
    pub fn folder_map(&self) -> FolderMap {
        let mut map = FolderMap::default();
        collect_folder_ids(&self.roots, "", &mut map);
        map
    }

    /// Resolves a slash path to a node of any kind.
    pub fn lookup(&self, segments: &[impl AsRef<str>]) -> PathLookup<'_> {
        self.walk(segments, None)
    }

    /// Resolves a slash path whose final segment must be of `kind`.
    pub fn lookup_kind(&self, segments: &[impl AsRef<str>], kind: DocumentKind) -> PathLookup<'_> {
        self.walk(segments, Some(kind))
    }

    fn walk(&self, segments: &[impl AsRef<str>], leaf: Option<DocumentKind>) -> PathLookup<'_> {
        let Some((last, intermediate)) = segments.split_last() else {
            return PathLookup::Missing;
        };
        let mut level = &self.roots;
        for segment in intermediate {
            let mut matches = level
                .iter()
                .filter(|n| n.record.is_folder() && n.record.visible_name == segment.as_ref());
            let first = matches.next();
            let extra = matches.count();
            match (first, extra) {
                (None, _) => return PathLookup::Missing,
                (Some(node), 0) => level = &node.children,
                (Some(_), n) => return PathLookup::Ambiguous(n + 1),
            }
        }
        let mut matches = level
            .iter()
            .filter(|n| n.record.visible_name == last.as_ref())
            .filter(|n| leaf.is_none_or(|kind| n.record.kind == kind));
        let first = matches.next();
        let extra = matches.count();
        match (first, extra) {
            (None, _) => PathLookup::Missing,
            (Some(node), 0) => PathLookup::Unique(node),
            (Some(_), n) => PathLookup::Ambiguous(n + 1),
        }
    }
}

fn attach_children(parent_id: &str, by_parent: &mut BTreeMap<String, Vec<DocumentRecord>>) -> Vec<TreeNode> {
    let Some(records) = by_parent.remove(parent_id) else {
        return Vec::new();
    };
    records
        .into_iter()
        .map(|record| {
            let children = attach_children(&record.id, by_parent);
            TreeNode { record, children }
        })
        .collect()
}

fn join_path(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

fn collect_document_paths(nodes: &[TreeNode], prefix: &str, out: &mut Vec<String>) {
    for node in nodes {
        let path = join_path(prefix, &node.record.visible_name);
        if node.record.is_folder() {
            collect_document_paths(&node.children, &path, out);
        } else {
            out.push(path);
        }
    }
}

fn collect_folder_paths(nodes: &[TreeNode], prefix: &str, out: &mut Vec<String>) {
    for node in nodes {
        if node.record.is_folder() {
            let path = join_path(prefix, &node.record.visible_name);
            collect_folder_paths(&node.children, &path, out);
            out.push(path);
        }
    }
}

fn collect_ids(nodes: &[TreeNode], out: &mut Vec<String>) {
    for node in nodes {
        out.push(node.record.id.clone());
        collect_ids(&node.children, out);
    }
}

fn collect_folder_ids(nodes: &[TreeNode], prefix: &str, map: &mut FolderMap) {
    for node in nodes {
        if node.record.is_folder() {
            let path = join_path(prefix, &node.record.visible_name);
            map.insert(path.clone(), node.record.id.clone());
            collect_folder_ids(&node.children, &path, map);
        }
    }
}

/// Folder-path to identifier cache, built from one tree snapshot and
/// extended in place as folders are created during a batch. A path seen
/// with two distinct identifiers is remembered as ambiguous; the first
/// identifier is kept so read-only listings stay usable.
#[derive(Debug, Clone, Default)]
pub struct FolderMap {
    ids: BTreeMap<String, String>,
    ambiguous: BTreeSet<String>,
}

impl FolderMap {
    pub fn get(&self, path: &str) -> Option<&str> {
        self.ids.get(path).map(String::as_str)
    }

    pub fn is_ambiguous(&self, path: &str) -> bool {
        self.ambiguous.contains(path)
    }

    pub fn insert(&mut self, path: String, id: String) {
        use std::collections::btree_map::Entry;

        match self.ids.entry(path) {
            Entry::Vacant(slot) => {
                slot.insert(id);
            }
            Entry::Occupied(slot) => {
                self.ambiguous.insert(slot.key().clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}
