use std::io::Write;
use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info};

use crate::control::{Capability, ChannelError, ControlChannel};
use crate::sync::render;

pub const STORE_DIR: &str = "~/.local/share/slated/store";
pub const INDEXER_SERVICE: &str = "slated";
pub const BOOK_LIST_PATH: &str = "~/.slatesync-books.json";
const WRITE_TEST_PATH: &str = "~/.slatesync-write-test";

const SSH_OPTIONS: [&str; 6] = [
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "BatchMode=yes",
    "-o",
    "ConnectTimeout=5",
];

/// Channel into the reader over plain ssh and scp subprocesses.
pub struct SshChannel {
    target: String,
}

impl SshChannel {
    pub fn new(user: &str, host: &str) -> Self {
        Self {
            target: format!("{user}@{host}"),
        }
    }

    async fn exec(&self, command: &str) -> Result<String, ChannelError> {
        debug!(command, "remote command");
        let output = Command::new("ssh")
            .args(SSH_OPTIONS)
            .arg(&self.target)
            .arg(command)
            .output()
            .await?;
        if !output.status.success() {
            return Err(ChannelError::Command {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn copy_paths(&self, sources: &[PathBuf], destination: &str) -> Result<(), ChannelError> {
        if sources.is_empty() {
            return Ok(());
        }
        let mut command = Command::new("scp");
        command.args(SSH_OPTIONS).arg("-r");
        for source in sources {
            command.arg(source);
        }
        command.arg(format!("{}:{destination}", self.target));
        let output = command.output().await?;
        if !output.status.success() {
            return Err(ChannelError::Copy {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn write_remote_file(&self, payload: &str, destination: &str) -> Result<(), ChannelError> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(payload.as_bytes())?;
        self.copy_paths(&[file.path().to_path_buf()], destination).await
    }
}

impl ControlChannel for SshChannel {
    async fn probe(&self) -> Capability {
        if self.exec(&format!("touch {WRITE_TEST_PATH}")).await.is_ok() {
            return Capability::Full;
        }
        // The root filesystem ships read-only; remount once and try again.
        if self.exec("mount -o remount,rw /").await.is_err() {
            return Capability::Unreachable;
        }
        match self.exec(&format!("touch {WRITE_TEST_PATH}")).await {
            Ok(_) => Capability::Full,
            Err(_) => Capability::Unreachable,
        }
    }

    async fn create_folder(&self, visible_name: &str, parent_id: &str) -> Result<String, ChannelError> {
        let id = render::new_record_id();
        let staging = tempfile::tempdir()?;
        render::render_folder(staging.path(), &id, visible_name, parent_id)?;
        let records = [
            staging.path().join(format!("{id}.metadata")),
            staging.path().join(format!("{id}.content")),
        ];
        self.copy_paths(&records, STORE_DIR).await?;
        info!(folder = visible_name, id, "created folder record");
        Ok(id)
    }

    async fn latest_document_id(&self) -> Result<String, ChannelError> {
        let listing = self
            .exec(&format!("cd {STORE_DIR}; ls -Art -- *.metadata | tail -n 1"))
            .await?;
        newest_record_id(&listing).ok_or(ChannelError::MissingUpload)
    }

    async fn set_parent(&self, document_id: &str, parent_id: &str) -> Result<(), ChannelError> {
        let record_path = format!("{STORE_DIR}/{document_id}.metadata");
        let raw = self.exec(&format!("cat {record_path}")).await?;
        let patched = patched_parent(&raw, document_id, parent_id)?;
        self.write_remote_file(&patched, &record_path).await?;
        debug!(document_id, parent_id, "re-parented document record");
        Ok(())
    }

    async fn read_book_list(&self) -> Result<Option<String>, ChannelError> {
        match self.exec(&format!("cat {BOOK_LIST_PATH}")).await {
            Ok(raw) => Ok(Some(raw)),
            Err(ChannelError::Command { .. }) => Ok(None),
            Err(other) => Err(other),
        }
    }

    async fn write_book_list(&self, payload: &str) -> Result<(), ChannelError> {
        self.write_remote_file(payload, BOOK_LIST_PATH).await
    }

    async fn push_staging(&self, staging_dir: &Path) -> Result<(), ChannelError> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(staging_dir)? {
            entries.push(entry?.path());
        }
        entries.sort();
        self.copy_paths(&entries, STORE_DIR).await
    }

    async fn restart_indexer(&self) -> Result<(), ChannelError> {
        self.exec(&format!("systemctl restart {INDEXER_SERVICE}")).await?;
        info!("restarted the store indexer");
        Ok(())
    }
}

fn newest_record_id(listing: &str) -> Option<String> {
    let name = listing.lines().last()?.trim();
    let id = name.strip_suffix(".metadata")?;
    (!id.is_empty()).then(|| id.to_string())
}

fn patched_parent(raw: &str, document_id: &str, parent_id: &str) -> Result<String, ChannelError> {
    let mut record: serde_json::Value = serde_json::from_str(raw.trim())?;
    let Some(object) = record.as_object_mut() else {
        return Err(ChannelError::MalformedRecord(document_id.to_string()));
    };
    object.insert(
        "parent".to_string(),
        serde_json::Value::String(parent_id.to_string()),
    );
    Ok(serde_json::to_string_pretty(&record)?)
}
