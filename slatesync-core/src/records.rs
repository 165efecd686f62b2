use serde::{Deserialize, Serialize};

/// One entry of the reader's flat document store as served by the listing
/// endpoint. Field names follow the device wire format, including its
/// misspelled visible-name key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DocumentRecord {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Parent", default)]
    pub parent: String,
    #[serde(rename = "Type")]
    pub kind: DocumentKind,
    #[serde(rename = "VissibleName", default)]
    pub visible_name: String,
    #[serde(rename = "fileType", default, skip_serializing_if = "Option::is_none")]
    pub file_type: Option<String>,
}

impl DocumentRecord {
    pub fn is_folder(&self) -> bool {
        matches!(self.kind, DocumentKind::Collection)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum DocumentKind {
    #[serde(rename = "DocumentType")]
    Document,
    #[serde(rename = "CollectionType")]
    Collection,
}

impl DocumentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKind::Document => "DocumentType",
            DocumentKind::Collection => "CollectionType",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "DocumentType" => Some(DocumentKind::Document),
            "CollectionType" => Some(DocumentKind::Collection),
            _ => None,
        }
    }
}
