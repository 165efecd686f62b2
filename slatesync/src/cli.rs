use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Debug, Parser)]
#[command(name = "slatesync", version, about = "Push, pull and reconcile documents with a slate reader")]
pub struct Cli {
    /// Don't transfer anything, just show what would happen
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Destination folder: on the device for push, locally for pull
    #[arg(short, long, global = true, value_name = "FOLDER")]
    pub output: Option<String>,

    /// What to do with documents that already exist at the destination
    #[arg(long, global = true, value_enum, default_value_t = ConflictPolicy::Skip)]
    pub if_exists: ConflictPolicy,

    /// Skip paths matching this glob pattern (repeatable)
    #[arg(short, long = "exclude", global = true, value_name = "PATTERN")]
    pub exclude: Vec<String>,

    /// Network address of the reader
    #[arg(short, long, global = true, value_name = "HOST")]
    pub remote_address: Option<String>,

    /// Directory where store records are rendered before transfer
    #[arg(long, global = true, value_name = "DIR")]
    pub transfer_dir: Option<PathBuf>,

    /// Raise log verbosity (repeatable)
    #[arg(short, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Render store records into the transfer dir without touching the device
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Send documents or directories of documents to the reader
    Push {
        #[arg(value_name = "DOCUMENT", required = true)]
        documents: Vec<PathBuf>,
    },
    /// Fetch documents or folders from the reader by their device path
    Pull {
        #[arg(value_name = "PATH", required = true)]
        documents: Vec<String>,
    },
    /// Fetch every top-level entry from the reader
    Backup,
    /// Reconcile the local book list with the reader's copy
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ConflictPolicy {
    /// Leave the existing document untouched
    Skip,
    /// Upload alongside the existing document under a fresh identity
    New,
    /// Overwrite the existing document's records
    Replace,
    /// Overwrite only the existing document's payload
    ReplacePdfOnly,
}

impl ConflictPolicy {
    pub fn replaces(self) -> bool {
        matches!(self, ConflictPolicy::Replace | ConflictPolicy::ReplacePdfOnly)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_push_with_documents() {
        let cli = Cli::try_parse_from(["slatesync", "push", "a.pdf", "b.epub"]).unwrap();
        match cli.command {
            Command::Push { documents } => {
                assert_eq!(documents, vec![PathBuf::from("a.pdf"), PathBuf::from("b.epub")])
            }
            other => panic!("unexpected command: {other:?}"),
        }
        assert!(!cli.dry_run);
        assert_eq!(cli.if_exists, ConflictPolicy::Skip);
    }

    #[test]
    fn push_requires_at_least_one_document() {
        assert!(Cli::try_parse_from(["slatesync", "push"]).is_err());
    }

    #[test]
    fn accepts_every_conflict_policy_name() {
        for (name, policy) in [
            ("skip", ConflictPolicy::Skip),
            ("new", ConflictPolicy::New),
            ("replace", ConflictPolicy::Replace),
            ("replace-pdf-only", ConflictPolicy::ReplacePdfOnly),
        ] {
            let cli =
                Cli::try_parse_from(["slatesync", "--if-exists", name, "push", "a.pdf"]).unwrap();
            assert_eq!(cli.if_exists, policy);
        }
        assert!(Cli::try_parse_from(["slatesync", "--if-exists", "merge", "push", "a.pdf"]).is_err());
    }

    #[test]
    fn collects_repeated_excludes_and_verbosity() {
        let cli = Cli::try_parse_from([
            "slatesync",
            "-e",
            "Drafts/*",
            "-e",
            "*.tmp",
            "-vv",
            "backup",
        ])
        .unwrap();
        assert_eq!(cli.exclude, vec!["Drafts/*", "*.tmp"]);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Command::Backup));
    }

    #[test]
    fn global_flags_may_follow_the_subcommand() {
        let cli = Cli::try_parse_from([
            "slatesync",
            "pull",
            "Library/novel.pdf",
            "-o",
            "out",
            "--dry-run",
        ])
        .unwrap();
        assert!(cli.dry_run);
        assert_eq!(cli.output.as_deref(), Some("out"));
    }
}
