use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use url::Url;

use crate::records::DocumentRecord;
use crate::tree::DocumentTree;

pub const DEFAULT_DEVICE_ADDRESS: &str = "10.11.99.1";

const CONNECTION_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("interface returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("upload of {name} was not acknowledged (status {status})")]
    UploadRejected { name: String, status: StatusCode },
}

impl DeviceError {
    /// True when the interface itself could not be reached, as opposed to
    /// it answering with an error.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, DeviceError::Request(err) if err.is_connect() || err.is_timeout())
    }
}

/// Client for the reader's USB web interface.
#[derive(Debug, Clone)]
pub struct DeviceClient {
    http: Client,
    base_url: Url,
}

impl DeviceClient {
    pub fn new(address: &str) -> Result<Self, DeviceError> {
        Self::with_base_url(&format!("http://{address}"))
    }

    pub fn with_base_url(base_url: &str) -> Result<Self, DeviceError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
        })
    }

    /// Immediate children of a folder; the empty identifier selects the
    /// top level.
    pub async fn list_children(&self, folder_id: &str) -> Result<Vec<DocumentRecord>, DeviceError> {
        let url = self.endpoint(&format!("/documents/{folder_id}"))?;
        let response = self.http.get(url).send().await?;
        Self::handle_response(response).await
    }

    /// Walks the store folder by folder and assembles the hierarchy
    /// beneath `anchor`.
    pub async fn fetch_tree(&self, anchor: &str) -> Result<DocumentTree, DeviceError> {
        let mut records = Vec::new();
        let mut visited = std::collections::BTreeSet::new();
        let mut pending = vec![anchor.to_string()];
        while let Some(folder_id) = pending.pop() {
            if !visited.insert(folder_id.clone()) {
                continue;
            }
            for child in self.list_children(&folder_id).await? {
                if child.is_folder() && !visited.contains(&child.id) {
                    pending.push(child.id.clone());
                }
                records.push(child);
            }
        }
        Ok(DocumentTree::build(anchor, records))
    }

    /// Sends one file to the store. The interface files an upload under
    /// whichever folder was listed last, so the target folder is listed
    /// first to position that pointer; the empty identifier selects the
    /// top level.
    pub async fn upload(&self, folder_id: &str, name: &str, payload: Vec<u8>) -> Result<(), DeviceError> {
        self.list_children(folder_id).await?;

        let url = self.endpoint("/upload")?;
        let part = Part::bytes(payload)
            .file_name(name.to_string())
            .mime_str(content_type_for(name))?;
        let form = Form::new().part("file", part);
        let response = self.http.post(url).multipart(form).send().await?;
        if response.status() != StatusCode::CREATED {
            return Err(DeviceError::UploadRejected {
                name: name.to_string(),
                status: response.status(),
            });
        }
        Ok(())
    }

    /// Fetches the rendered form of one document.
    pub async fn download(&self, id: &str) -> Result<Vec<u8>, DeviceError> {
        let url = self.endpoint(&format!("/download/{id}/placeholder"))?;
        let response = self.http.get(url).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(DeviceError::Api { status, body });
        }
        Ok(response.bytes().await?.to_vec())
    }

    /// Short-deadline probe of the interface. Answers false instead of
    /// erroring so callers can treat reachability as a capability.
    pub async fn check_connection(&self) -> bool {
        let Ok(url) = self.endpoint("/documents/") else {
            return false;
        };
        match self.http.get(url).timeout(CONNECTION_PROBE_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, DeviceError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, DeviceError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(DeviceError::Api { status, body })
        }
    }
}

fn content_type_for(name: &str) -> &'static str {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".pdf") {
        "application/pdf"
    } else if lower.ends_with(".epub") {
        "application/epub+zip"
    } else {
        "application/octet-stream"
    }
}
