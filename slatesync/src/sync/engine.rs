use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use slatesync_core::{DeviceClient, DeviceError, FolderMap};

use crate::control::{Capability, ChannelError, ControlChannel};
use crate::sync::folders::{self, FolderError};
use crate::sync::render::{self, RenderError};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("device interface error: {0}")]
    Device(#[from] DeviceError),
    #[error("control channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error(transparent)]
    Folder(#[from] FolderError),
    #[error("record rendering failed: {0}")]
    Render(#[from] RenderError),
    #[error("replacing existing documents needs the privileged channel")]
    ChannelRequired,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A document to upload through the web interface.
#[derive(Debug, Clone)]
pub struct UploadItem {
    pub local_path: PathBuf,
    pub visible_name: String,
    pub folder_segments: Vec<String>,
}

/// An existing document whose store records get overwritten in place.
#[derive(Debug, Clone)]
pub struct ReplaceItem {
    pub local_path: PathBuf,
    pub visible_name: String,
    pub document_id: String,
    pub parent_id: String,
    pub file_type: String,
    pub folder_segments: Vec<String>,
    pub payload_only: bool,
}

#[derive(Debug, Default)]
pub struct UploadBatch {
    pub uploads: Vec<UploadItem>,
    pub replacements: Vec<ReplaceItem>,
}

impl UploadBatch {
    pub fn is_empty(&self) -> bool {
        self.uploads.is_empty() && self.replacements.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PlacedDocument {
    pub visible_name: String,
    pub location: String,
    pub device_id: Option<String>,
    pub size: u64,
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub placed: Vec<PlacedDocument>,
    pub failures: Vec<(String, String)>,
    pub folders_created: usize,
    pub restarted: bool,
}

/// Runs one batch against the device: neutral upload through the web
/// interface, folder placement over the privileged channel when it is
/// up, staged overwrites for replacements, and at most one indexer
/// restart once everything has been transferred.
pub struct UploadEngine<'a, C> {
    client: &'a DeviceClient,
    channel: Option<&'a C>,
    staging: &'a Path,
}

impl<'a, C: ControlChannel> UploadEngine<'a, C> {
    pub fn new(client: &'a DeviceClient, channel: Option<&'a C>, staging: &'a Path) -> Self {
        Self {
            client,
            channel,
            staging,
        }
    }

    /// `folders` must come from the same tree snapshot the batch was
    /// planned against; it is extended in place as folders are created.
    pub async fn run_batch(
        &self,
        folders: &mut FolderMap,
        batch: &UploadBatch,
    ) -> Result<BatchReport, EngineError> {
        let capability = match self.channel {
            Some(channel) => channel.probe().await,
            None => Capability::None,
        };
        let control = capability.is_full().then_some(self.channel).flatten();

        if !batch.replacements.is_empty() && control.is_none() {
            return Err(EngineError::ChannelRequired);
        }
        if control.is_none() && batch.uploads.iter().any(|item| !item.folder_segments.is_empty()) {
            warn!("privileged channel unavailable, documents will land at the top level");
        }

        let mut report = BatchReport::default();
        let mut needs_restart = false;

        for item in &batch.uploads {
            let mut folder_id = String::new();
            if let Some(channel) = control
                && !item.folder_segments.is_empty()
            {
                match folders::resolve_or_create(channel, folders, &item.folder_segments).await {
                    Ok((id, created)) => {
                        folder_id = id;
                        report.folders_created += created;
                        needs_restart |= created > 0;
                    }
                    Err(err @ FolderError::Ambiguous(_)) => return Err(err.into()),
                    Err(FolderError::Creation { source, created }) => {
                        // Folders made before the failure are in the store
                        // and still need the indexer restart.
                        report.folders_created += created;
                        needs_restart |= created > 0;
                        warn!(document = %item.visible_name, err = %source, "folder resolution failed");
                        report.failures.push((item.visible_name.clone(), source.to_string()));
                        continue;
                    }
                }
            }

            match self.transfer_one(item, control, &folder_id).await {
                Ok(placed) => {
                    needs_restart |= placed.device_id.is_some();
                    report.placed.push(placed);
                }
                Err(err) if is_batch_fatal(&err) => return Err(err),
                Err(err) => {
                    warn!(document = %item.visible_name, %err, "upload failed");
                    report.failures.push((item.visible_name.clone(), err.to_string()));
                }
            }
        }

        if let Some(channel) = control
            && !batch.replacements.is_empty()
        {
            let staged = self.render_replacements(batch, &mut report)?;
            if staged > 0 {
                channel.push_staging(self.staging).await?;
                needs_restart = true;
            }
        }

        if needs_restart && let Some(channel) = control {
            channel.restart_indexer().await?;
            report.restarted = true;
        }

        Ok(report)
    }

    async fn transfer_one(
        &self,
        item: &UploadItem,
        control: Option<&'a C>,
        folder_id: &str,
    ) -> Result<PlacedDocument, EngineError> {
        let payload = tokio::fs::read(&item.local_path).await?;
        let size = payload.len() as u64;
        self.client.upload("", &item.visible_name, payload).await?;

        let mut device_id = None;
        if let Some(channel) = control
            && !folder_id.is_empty()
        {
            let id = channel.latest_document_id().await?;
            channel.set_parent(&id, folder_id).await?;
            device_id = Some(id);
        }

        let location = if device_id.is_some() {
            join_segments(&item.folder_segments, &item.visible_name)
        } else {
            item.visible_name.clone()
        };
        debug!(document = %item.visible_name, location = %location, "uploaded");
        Ok(PlacedDocument {
            visible_name: item.visible_name.clone(),
            location,
            device_id,
            size,
        })
    }

    fn render_replacements(
        &self,
        batch: &UploadBatch,
        report: &mut BatchReport,
    ) -> Result<usize, EngineError> {
        std::fs::create_dir_all(self.staging)?;
        let mut staged = 0;
        for item in &batch.replacements {
            let rendered = if item.payload_only {
                render::render_payload(
                    self.staging,
                    &item.document_id,
                    &item.file_type,
                    &item.local_path,
                )
            } else {
                render::render_document(
                    self.staging,
                    &item.document_id,
                    &item.visible_name,
                    &item.parent_id,
                    &item.local_path,
                )
            };
            match rendered {
                Ok(size) => {
                    staged += 1;
                    report.placed.push(PlacedDocument {
                        visible_name: item.visible_name.clone(),
                        location: join_segments(&item.folder_segments, &item.visible_name),
                        device_id: Some(item.document_id.clone()),
                        size,
                    });
                }
                Err(err) => {
                    warn!(document = %item.visible_name, %err, "staging render failed");
                    report.failures.push((item.visible_name.clone(), err.to_string()));
                }
            }
        }
        Ok(staged)
    }
}

fn is_batch_fatal(err: &EngineError) -> bool {
    match err {
        EngineError::Device(device) => device.is_unreachable(),
        EngineError::Folder(FolderError::Ambiguous(_)) => true,
        EngineError::ChannelRequired => true,
        _ => false,
    }
}

fn join_segments(segments: &[String], name: &str) -> String {
    if segments.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", segments.join("/"), name)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    struct RecordingChannel {
        capability: Capability,
        folders_created: Mutex<Vec<(String, String)>>,
        parents_set: Mutex<Vec<(String, String)>>,
        uploads_seen: AtomicUsize,
        staging_pushes: AtomicUsize,
        restarts: AtomicUsize,
        fail_folder: Option<&'static str>,
        parent_failures: AtomicUsize,
    }

    impl RecordingChannel {
        fn with_capability(capability: Capability) -> Self {
            Self {
                capability,
                folders_created: Mutex::new(Vec::new()),
                parents_set: Mutex::new(Vec::new()),
                uploads_seen: AtomicUsize::new(0),
                staging_pushes: AtomicUsize::new(0),
                restarts: AtomicUsize::new(0),
                fail_folder: None,
                parent_failures: AtomicUsize::new(0),
            }
        }

        fn full() -> Self {
            Self::with_capability(Capability::Full)
        }

        fn failing_folder(name: &'static str) -> Self {
            Self {
                fail_folder: Some(name),
                ..Self::full()
            }
        }

        fn failing_first_parents(count: usize) -> Self {
            Self {
                parent_failures: AtomicUsize::new(count),
                ..Self::full()
            }
        }
    }

    impl ControlChannel for RecordingChannel {
        async fn probe(&self) -> Capability {
            self.capability
        }

        async fn create_folder(&self, visible_name: &str, parent_id: &str) -> Result<String, ChannelError> {
            if self.fail_folder == Some(visible_name) {
                return Err(ChannelError::Command {
                    status: 255,
                    stderr: "Connection closed by remote host".to_string(),
                });
            }
            let mut created = self.folders_created.lock().unwrap();
            created.push((visible_name.to_string(), parent_id.to_string()));
            Ok(format!("fold-{}", created.len()))
        }

        async fn latest_document_id(&self) -> Result<String, ChannelError> {
            let n = self.uploads_seen.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("dev-{n}"))
        }

        async fn set_parent(&self, document_id: &str, parent_id: &str) -> Result<(), ChannelError> {
            let failures = self.parent_failures.load(Ordering::SeqCst);
            if failures > 0 {
                self.parent_failures.store(failures - 1, Ordering::SeqCst);
                return Err(ChannelError::Command {
                    status: 1,
                    stderr: "No such file or directory".to_string(),
                });
            }
            self.parents_set
                .lock()
                .unwrap()
                .push((document_id.to_string(), parent_id.to_string()));
            Ok(())
        }

        async fn read_book_list(&self) -> Result<Option<String>, ChannelError> {
            unimplemented!()
        }

        async fn write_book_list(&self, _: &str) -> Result<(), ChannelError> {
            unimplemented!()
        }

        async fn push_staging(&self, _: &Path) -> Result<(), ChannelError> {
            self.staging_pushes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn restart_indexer(&self) -> Result<(), ChannelError> {
            self.restarts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn device_accepting_uploads() -> (MockServer, DeviceClient) {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex("^/documents/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/upload"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;
        let client = DeviceClient::with_base_url(&server.uri()).unwrap();
        (server, client)
    }

    fn item(dir: &Path, name: &str, segments: &[&str]) -> UploadItem {
        let local_path = dir.join(name);
        std::fs::write(&local_path, b"%PDF-1.4").unwrap();
        UploadItem {
            local_path,
            visible_name: name.to_string(),
            folder_segments: segments.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn a_batch_restarts_the_indexer_exactly_once_after_all_files() {
        let (_server, client) = device_accepting_uploads().await;
        let channel = RecordingChannel::full();
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let batch = UploadBatch {
            uploads: vec![
                item(dir.path(), "one.pdf", &["A"]),
                item(dir.path(), "two.pdf", &["A"]),
                item(dir.path(), "three.pdf", &["A", "B"]),
                item(dir.path(), "four.pdf", &["C"]),
                item(dir.path(), "five.pdf", &["C"]),
            ],
            replacements: Vec::new(),
        };

        let engine = UploadEngine::new(&client, Some(&channel), staging.path());
        let mut folders = FolderMap::default();
        let report = engine.run_batch(&mut folders, &batch).await.unwrap();

        assert_eq!(report.placed.len(), 5);
        assert_eq!(report.folders_created, 3);
        assert!(report.restarted);
        assert_eq!(channel.restarts.load(Ordering::SeqCst), 1);
        assert_eq!(channel.parents_set.lock().unwrap().len(), 5);
        assert_eq!(report.placed[2].location, "A/B/three.pdf");
        assert!(report.placed.iter().all(|p| p.device_id.is_some()));
    }

    #[tokio::test]
    async fn an_unreachable_channel_degrades_to_flat_uploads() {
        let (_server, client) = device_accepting_uploads().await;
        let channel = RecordingChannel::with_capability(Capability::Unreachable);
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let batch = UploadBatch {
            uploads: vec![
                item(dir.path(), "one.pdf", &["A"]),
                item(dir.path(), "two.pdf", &["A", "B"]),
            ],
            replacements: Vec::new(),
        };

        let engine = UploadEngine::new(&client, Some(&channel), staging.path());
        let mut folders = FolderMap::default();
        let report = engine.run_batch(&mut folders, &batch).await.unwrap();

        assert_eq!(report.placed.len(), 2);
        assert_eq!(report.folders_created, 0);
        assert!(!report.restarted);
        assert!(channel.folders_created.lock().unwrap().is_empty());
        assert_eq!(channel.restarts.load(Ordering::SeqCst), 0);
        assert_eq!(report.placed[0].location, "one.pdf");
        assert!(report.placed.iter().all(|p| p.device_id.is_none()));
    }

    #[tokio::test]
    async fn top_level_uploads_need_no_restart() {
        let (_server, client) = device_accepting_uploads().await;
        let channel = RecordingChannel::full();
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let batch = UploadBatch {
            uploads: vec![item(dir.path(), "loose.pdf", &[])],
            replacements: Vec::new(),
        };

        let engine = UploadEngine::new(&client, Some(&channel), staging.path());
        let mut folders = FolderMap::default();
        let report = engine.run_batch(&mut folders, &batch).await.unwrap();

        assert_eq!(report.placed.len(), 1);
        assert!(!report.restarted);
        assert_eq!(channel.restarts.load(Ordering::SeqCst), 0);
        assert!(channel.parents_set.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn ambiguous_folder_targets_abort_the_whole_batch() {
        let (_server, client) = device_accepting_uploads().await;
        let channel = RecordingChannel::full();
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let batch = UploadBatch {
            uploads: vec![item(dir.path(), "one.pdf", &["A"])],
            replacements: Vec::new(),
        };

        let mut folders = FolderMap::default();
        folders.insert("A".to_string(), "first".to_string());
        folders.insert("A".to_string(), "second".to_string());

        let engine = UploadEngine::new(&client, Some(&channel), staging.path());
        let err = engine.run_batch(&mut folders, &batch).await.unwrap_err();

        assert!(matches!(err, EngineError::Folder(FolderError::Ambiguous(_))));
        assert_eq!(channel.restarts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn a_partly_created_folder_chain_still_restarts_the_indexer() {
        let (_server, client) = device_accepting_uploads().await;
        let channel = RecordingChannel::failing_folder("B");
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let batch = UploadBatch {
            uploads: vec![item(dir.path(), "one.pdf", &["A", "B"])],
            replacements: Vec::new(),
        };

        let engine = UploadEngine::new(&client, Some(&channel), staging.path());
        let mut folders = FolderMap::default();
        let report = engine.run_batch(&mut folders, &batch).await.unwrap();

        assert!(report.placed.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "one.pdf");
        assert_eq!(report.folders_created, 1);
        assert_eq!(channel.folders_created.lock().unwrap().len(), 1);
        assert!(report.restarted);
        assert_eq!(channel.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn per_document_failures_do_not_stop_the_batch() {
        let (_server, client) = device_accepting_uploads().await;
        let channel = RecordingChannel::full();
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let mut batch = UploadBatch {
            uploads: vec![item(dir.path(), "good.pdf", &[])],
            replacements: Vec::new(),
        };
        batch.uploads.insert(
            0,
            UploadItem {
                local_path: dir.path().join("missing.pdf"),
                visible_name: "missing.pdf".to_string(),
                folder_segments: Vec::new(),
            },
        );

        let engine = UploadEngine::new(&client, Some(&channel), staging.path());
        let mut folders = FolderMap::default();
        let report = engine.run_batch(&mut folders, &batch).await.unwrap();

        assert_eq!(report.placed.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "missing.pdf");
    }

    #[tokio::test]
    async fn a_failed_reparent_is_reported_without_stopping_the_batch() {
        let (_server, client) = device_accepting_uploads().await;
        let channel = RecordingChannel::failing_first_parents(1);
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let batch = UploadBatch {
            uploads: vec![
                item(dir.path(), "first.pdf", &["A"]),
                item(dir.path(), "second.pdf", &["A"]),
            ],
            replacements: Vec::new(),
        };

        let engine = UploadEngine::new(&client, Some(&channel), staging.path());
        let mut folders = FolderMap::default();
        let report = engine.run_batch(&mut folders, &batch).await.unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "first.pdf");
        assert_eq!(report.placed.len(), 1);
        assert_eq!(report.placed[0].visible_name, "second.pdf");
        assert_eq!(report.placed[0].location, "A/second.pdf");
        assert_eq!(channel.parents_set.lock().unwrap().len(), 1);
        assert!(report.restarted);
        assert_eq!(channel.restarts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_vanished_endpoint_aborts_the_batch() {
        let client = DeviceClient::with_base_url("http://127.0.0.1:9").unwrap();
        let channel = RecordingChannel::with_capability(Capability::Unreachable);
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let batch = UploadBatch {
            uploads: vec![item(dir.path(), "one.pdf", &[])],
            replacements: Vec::new(),
        };

        let engine = UploadEngine::new(&client, Some(&channel), staging.path());
        let mut folders = FolderMap::default();
        let err = engine.run_batch(&mut folders, &batch).await.unwrap_err();

        match err {
            EngineError::Device(device) => assert!(device.is_unreachable()),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn replacements_need_the_privileged_channel() {
        let (_server, client) = device_accepting_uploads().await;
        let channel = RecordingChannel::with_capability(Capability::Unreachable);
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let source = dir.path().join("existing.pdf");
        std::fs::write(&source, b"%PDF-1.4").unwrap();
        let batch = UploadBatch {
            uploads: Vec::new(),
            replacements: vec![ReplaceItem {
                local_path: source,
                visible_name: "existing.pdf".to_string(),
                document_id: "doc-1".to_string(),
                parent_id: "".to_string(),
                file_type: "pdf".to_string(),
                folder_segments: Vec::new(),
                payload_only: false,
            }],
        };

        let engine = UploadEngine::new(&client, Some(&channel), staging.path());
        let mut folders = FolderMap::default();
        let err = engine.run_batch(&mut folders, &batch).await.unwrap_err();
        assert!(matches!(err, EngineError::ChannelRequired));
    }

    #[tokio::test]
    async fn replacements_are_staged_pushed_and_followed_by_one_restart() {
        let (_server, client) = device_accepting_uploads().await;
        let channel = RecordingChannel::full();
        let dir = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let full = dir.path().join("full.pdf");
        let payload = dir.path().join("payload.pdf");
        std::fs::write(&full, b"%PDF-1.4 full").unwrap();
        std::fs::write(&payload, b"%PDF-1.4 payload").unwrap();
        let batch = UploadBatch {
            uploads: Vec::new(),
            replacements: vec![
                ReplaceItem {
                    local_path: full,
                    visible_name: "full.pdf".to_string(),
                    document_id: "doc-full".to_string(),
                    parent_id: "fold-9".to_string(),
                    file_type: "pdf".to_string(),
                    folder_segments: vec!["Library".to_string()],
                    payload_only: false,
                },
                ReplaceItem {
                    local_path: payload,
                    visible_name: "payload.pdf".to_string(),
                    document_id: "doc-payload".to_string(),
                    parent_id: "".to_string(),
                    file_type: "pdf".to_string(),
                    folder_segments: Vec::new(),
                    payload_only: true,
                },
            ],
        };

        let engine = UploadEngine::new(&client, Some(&channel), staging.path());
        let mut folders = FolderMap::default();
        let report = engine.run_batch(&mut folders, &batch).await.unwrap();

        assert_eq!(report.placed.len(), 2);
        assert!(report.restarted);
        assert_eq!(channel.staging_pushes.load(Ordering::SeqCst), 1);
        assert_eq!(channel.restarts.load(Ordering::SeqCst), 1);
        assert!(staging.path().join("doc-full.metadata").is_file());
        assert!(staging.path().join("doc-full.pdf").is_file());
        assert!(staging.path().join("doc-payload.pdf").is_file());
        assert!(!staging.path().join("doc-payload.metadata").exists());
        assert_eq!(report.placed[0].location, "Library/full.pdf");
    }
}
