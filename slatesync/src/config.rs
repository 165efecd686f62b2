use std::path::{Path, PathBuf};

use anyhow::Context;
use tempfile::TempDir;

use slatesync_core::DEFAULT_DEVICE_ADDRESS;

use crate::cli::Cli;

const DEFAULT_SSH_USER: &str = "root";
const BOOK_LIST_FILE: &str = "books.json";

/// Resolved run settings. Flags win over environment variables, which win
/// over the defaults.
#[derive(Debug)]
pub struct Settings {
    pub remote_address: String,
    pub ssh_user: String,
    pub staging_dir: PathBuf,
    pub state_path: PathBuf,
    _staging_guard: Option<TempDir>,
}

impl Settings {
    pub fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        let home = dirs::home_dir().context("cannot determine home directory")?;

        let remote_address = cli
            .remote_address
            .clone()
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| read_string_env("SLATESYNC_REMOTE_ADDRESS", DEFAULT_DEVICE_ADDRESS));

        let ssh_user = read_string_env("SLATESYNC_SSH_USER", DEFAULT_SSH_USER);

        let state_path = match read_dir_env("SLATESYNC_STATE_DIR") {
            Some(dir) => expand_with_home(&dir, &home).join(BOOK_LIST_FILE),
            None => dirs::data_dir()
                .context("cannot determine data directory")?
                .join("slatesync")
                .join(BOOK_LIST_FILE),
        };

        let chosen_staging = cli
            .transfer_dir
            .clone()
            .or_else(|| read_dir_env("SLATESYNC_TRANSFER_DIR").map(|v| expand_with_home(&v, &home)));
        let (staging_dir, staging_guard) = match chosen_staging {
            Some(dir) => {
                std::fs::create_dir_all(&dir)
                    .with_context(|| format!("cannot create transfer dir {}", dir.display()))?;
                (dir, None)
            }
            None => {
                let guard = tempfile::tempdir().context("cannot create transfer dir")?;
                if cli.debug {
                    // Rendered records are the whole point of a debug run,
                    // so the directory must outlive the process.
                    (guard.keep(), None)
                } else {
                    (guard.path().to_path_buf(), Some(guard))
                }
            }
        };

        Ok(Self {
            remote_address,
            ssh_user,
            staging_dir,
            state_path,
            _staging_guard: staging_guard,
        })
    }
}

fn read_string_env(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn read_dir_env(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn expand_with_home(value: &Path, home: &Path) -> PathBuf {
    if value == Path::new("~") {
        return home.to_path_buf();
    }
    if let Ok(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    value.to_path_buf()
}
