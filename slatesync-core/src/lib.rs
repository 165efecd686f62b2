mod client;
mod records;
mod tree;

pub use client::{DEFAULT_DEVICE_ADDRESS, DeviceClient, DeviceError};
pub use records::{DocumentKind, DocumentRecord};
pub use tree::{DocumentTree, FolderMap, PathLookup, TreeNode};
