use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use slatesync_core::{DocumentKind, DocumentTree, FolderMap, PathLookup};

use crate::cli::ConflictPolicy;
use crate::sync::engine::{ReplaceItem, UploadBatch, UploadItem};
use crate::sync::render::{self, RenderError};

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("name {0:?} contains characters the device cannot handle")]
    UnsafeName(String),
    #[error("{0} occurs multiple times at the destination, cannot decide how to proceed")]
    AmbiguousTarget(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// One entry of the dry-run tree.
#[derive(Debug)]
pub struct PlanNode {
    pub name: String,
    pub folder: bool,
    pub exists: bool,
    pub gets_modified: bool,
    pub children: Vec<PlanNode>,
}

#[derive(Debug, Default)]
pub struct PushPlan {
    pub batch: UploadBatch,
    pub skipped: Vec<String>,
    pub excluded: usize,
    pub preview: Vec<PlanNode>,
}

struct Candidate {
    local_path: PathBuf,
    visible_name: String,
    rel_segments: Vec<String>,
}

/// Turns local files and directories into an upload batch against one
/// tree snapshot. Existing documents are routed by `policy`; an
/// ambiguous destination aborts planning unless the policy ignores
/// existing documents entirely.
pub fn build_plan(
    tree: &DocumentTree,
    documents: &[PathBuf],
    destination: &[String],
    policy: ConflictPolicy,
    excludes: &[glob::Pattern],
) -> Result<PushPlan, PlanError> {
    for segment in destination {
        if !render::name_is_safe(segment) {
            return Err(PlanError::UnsafeName(segment.clone()));
        }
    }

    let folders = tree.folder_map();
    let mut plan = PushPlan::default();

    for candidate in scan(documents)? {
        if let Some(unsafe_name) = std::iter::once(&candidate.visible_name)
            .chain(candidate.rel_segments.iter())
            .find(|name| !render::name_is_safe(name))
        {
            return Err(PlanError::UnsafeName(unsafe_name.clone()));
        }

        let mut segments: Vec<String> = destination.to_vec();
        segments.extend(candidate.rel_segments.iter().cloned());
        let device_path = join_path(&segments, &candidate.visible_name);

        if is_excluded(excludes, &device_path) {
            debug!(path = %device_path, "excluded from the plan");
            plan.excluded += 1;
            continue;
        }

        let mut lookup_segments = segments.clone();
        lookup_segments.push(candidate.visible_name.clone());
        let lookup = tree.lookup_kind(&lookup_segments, DocumentKind::Document);

        let (exists, gets_modified) = match (lookup, policy) {
            (PathLookup::Missing, _) | (PathLookup::Ambiguous(_), ConflictPolicy::New) => {
                plan.batch.uploads.push(UploadItem {
                    local_path: candidate.local_path,
                    visible_name: candidate.visible_name.clone(),
                    folder_segments: segments.clone(),
                });
                (false, false)
            }
            (PathLookup::Unique(_), ConflictPolicy::Skip) => {
                plan.skipped.push(device_path);
                (true, false)
            }
            (PathLookup::Unique(_), ConflictPolicy::New) => {
                plan.batch.uploads.push(UploadItem {
                    local_path: candidate.local_path,
                    visible_name: candidate.visible_name.clone(),
                    folder_segments: segments.clone(),
                });
                (true, false)
            }
            (PathLookup::Unique(node), _) => {
                let payload_only = policy == ConflictPolicy::ReplacePdfOnly;
                // A payload overwrite has to land on the file the existing
                // record already points at, whatever the local extension is.
                let file_type = if payload_only {
                    node.record
                        .file_type
                        .clone()
                        .unwrap_or_else(|| "pdf".to_string())
                } else {
                    render::file_type_of(&candidate.local_path).to_string()
                };
                plan.batch.replacements.push(ReplaceItem {
                    local_path: candidate.local_path,
                    visible_name: candidate.visible_name.clone(),
                    document_id: node.record.id.clone(),
                    parent_id: node.record.parent.clone(),
                    file_type,
                    folder_segments: segments.clone(),
                    payload_only,
                });
                (true, true)
            }
            (PathLookup::Ambiguous(_), _) => {
                return Err(PlanError::AmbiguousTarget(device_path));
            }
        };

        let level = ensure_chain(&mut plan.preview, &segments, &folders);
        level.push(PlanNode {
            name: candidate.visible_name,
            folder: false,
            exists,
            gets_modified,
            children: Vec::new(),
        });
    }

    Ok(plan)
}

/// Prints the assembled tree the way a dry run shows it, one node per
/// line with its planned fate.
pub fn print_preview(plan: &PushPlan) {
    for root in &plan.preview {
        print_node(root, "");
        println!();
    }
    if plan.excluded > 0 {
        println!("({} entries excluded)", plan.excluded);
    }
}

fn print_node(node: &PlanNode, padding: &str) {
    let note = if node.gets_modified {
        " | gets modified"
    } else if node.exists {
        " | exists already"
    } else {
        ""
    };
    println!("{padding}{}{note}", node.name);
    let deeper = format!("{padding}    ");
    for child in &node.children {
        print_node(child, &deeper);
    }
}

/// Renders every planned record into `staging` without transferring
/// anything, so the store records can be inspected. Plain uploads get a
/// fresh identity and no parent, since neither exists before a real run.
pub fn render_all(plan: &PushPlan, staging: &Path) -> Result<usize, RenderError> {
    let mut rendered = 0;
    for item in &plan.batch.uploads {
        render::render_document(
            staging,
            &render::new_record_id(),
            &item.visible_name,
            "",
            &item.local_path,
        )?;
        rendered += 1;
    }
    for item in &plan.batch.replacements {
        if item.payload_only {
            render::render_payload(staging, &item.document_id, &item.file_type, &item.local_path)?;
        } else {
            render::render_document(
                staging,
                &item.document_id,
                &item.visible_name,
                &item.parent_id,
                &item.local_path,
            )?;
        }
        rendered += 1;
    }
    Ok(rendered)
}

fn scan(documents: &[PathBuf]) -> Result<Vec<Candidate>, PlanError> {
    let mut found = Vec::new();
    for document in documents {
        let metadata = std::fs::metadata(document)?;
        if metadata.is_dir() {
            let rel = vec![file_name_of(document)];
            scan_dir(document, &rel, &mut found)?;
        } else if has_book_extension(document) {
            found.push(Candidate {
                local_path: document.clone(),
                visible_name: file_name_of(document),
                rel_segments: Vec::new(),
            });
        } else {
            warn!(path = %document.display(), "not a pdf or epub, skipping");
        }
    }
    Ok(found)
}

fn scan_dir(dir: &Path, rel: &[String], found: &mut Vec<Candidate>) -> Result<(), PlanError> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());
    for entry in entries {
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            let mut next = rel.to_vec();
            next.push(file_name_of(&path));
            scan_dir(&path, &next, found)?;
        } else if has_book_extension(&path) {
            found.push(Candidate {
                local_path: path.clone(),
                visible_name: file_name_of(&path),
                rel_segments: rel.to_vec(),
            });
        }
    }
    Ok(())
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn has_book_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf") || ext.eq_ignore_ascii_case("epub"))
}

/// A pattern hit on any path prefix takes the whole subtree out.
pub(crate) fn is_excluded(excludes: &[glob::Pattern], device_path: &str) -> bool {
    let mut prefix = String::new();
    for segment in device_path.split('/') {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(segment);
        if excludes.iter().any(|pattern| pattern.matches(&prefix)) {
            return true;
        }
    }
    false
}

fn join_path(segments: &[String], name: &str) -> String {
    if segments.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", segments.join("/"), name)
    }
}

fn ensure_chain<'a>(
    nodes: &'a mut Vec<PlanNode>,
    segments: &[String],
    folders: &FolderMap,
) -> &'a mut Vec<PlanNode> {
    let mut current = nodes;
    let mut prefix = String::new();
    for segment in segments {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(segment);
        let position = match current
            .iter()
            .position(|node| node.folder && node.name == *segment)
        {
            Some(position) => position,
            None => {
                current.push(PlanNode {
                    name: segment.clone(),
                    folder: true,
                    exists: folders.get(&prefix).is_some(),
                    gets_modified: false,
                    children: Vec::new(),
                });
                current.len() - 1
            }
        };
        current = &mut current[position].children;
    }
    current
}
