use std::path::PathBuf;

use anyhow::Context;
use thiserror::Error;
use tracing::info;

use slatesync_core::{DeviceError, DocumentTree};

use crate::cli::{Cli, Command, ConflictPolicy};
use crate::config::Settings;
use crate::control::ControlChannel;
use crate::session::DeviceSession;
use crate::sync::booklist::{BookList, BookRecord};
use crate::sync::engine::{BatchReport, EngineError, UploadEngine};
use crate::sync::folders::FolderError;
use crate::sync::plan::{self, PlanError};
use crate::sync::pull::{self, PullError};
use crate::sync::reconcile;
use crate::sync::render;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("{0}")]
    Ambiguous(String),
    #[error("endpoint not reachable, is the web interface enabled? (Settings > Storage > USB web interface)")]
    EndpointUnreachable,
    #[error("no usable connection to {0}, verify that you can ssh into the device manually")]
    ChannelUnavailable(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CommandError {
    /// 0 success, 1 ambiguous state or anything else, 2 endpoint gone,
    /// 255 privileged channel precheck failed.
    pub fn exit_code(&self) -> u8 {
        match self {
            CommandError::Ambiguous(_) => 1,
            CommandError::EndpointUnreachable => 2,
            CommandError::ChannelUnavailable(_) => 255,
            CommandError::Other(_) => 1,
        }
    }
}

pub async fn run(cli: Cli) -> Result<(), CommandError> {
    let settings = Settings::resolve(&cli)?;
    let excludes = compile_excludes(&cli.exclude)?;
    let session = DeviceSession::detect(&settings.remote_address, &settings.ssh_user)
        .await
        .map_err(|err| CommandError::Other(anyhow::Error::new(err)))?;
    if !session.endpoint_reachable() {
        return Err(CommandError::EndpointUnreachable);
    }

    let outcome = match &cli.command {
        Command::Push { documents } => {
            push(&cli, &settings, &session, documents, &excludes).await
        }
        Command::Pull { documents } => {
            let tree = session.client().fetch_tree("").await.map_err(map_device)?;
            pull_targets(&cli, &session, &tree, documents, &excludes).await
        }
        Command::Backup => {
            let tree = session.client().fetch_tree("").await.map_err(map_device)?;
            let targets: Vec<String> = tree
                .roots()
                .iter()
                .map(|node| node.record.visible_name.clone())
                .collect();
            pull_targets(&cli, &session, &tree, &targets, &excludes).await
        }
        Command::Sync => sync_book_list(&cli, &settings, &session).await,
    };
    session.eject();
    outcome
}

async fn push(
    cli: &Cli,
    settings: &Settings,
    session: &DeviceSession,
    documents: &[PathBuf],
    excludes: &[glob::Pattern],
) -> Result<(), CommandError> {
    let tree = session.client().fetch_tree("").await.map_err(map_device)?;
    let destination = split_destination(cli.output.as_deref());
    let plan = plan::build_plan(&tree, documents, &destination, cli.if_exists, excludes)
        .map_err(map_plan)?;

    if cli.dry_run {
        plan::print_preview(&plan);
        return Ok(());
    }
    if cli.debug {
        let rendered =
            plan::render_all(&plan, &settings.staging_dir).map_err(anyhow::Error::new)?;
        println!(
            "{rendered} records rendered into {}",
            settings.staging_dir.display()
        );
        return Ok(());
    }

    for path in &plan.skipped {
        println!("skipping {path}, file already present");
    }
    if plan.batch.is_empty() {
        info!("nothing to push");
        return Ok(());
    }

    let mut folders = tree.folder_map();
    let engine = UploadEngine::new(
        session.client(),
        Some(session.channel()),
        &settings.staging_dir,
    );
    let report = engine
        .run_batch(&mut folders, &plan.batch)
        .await
        .map_err(|err| map_engine(err, session.address()))?;

    record_placements(settings, &report)?;
    for placed in &report.placed {
        println!("placed {}", placed.location);
    }
    for (name, reason) in &report.failures {
        println!("failed to transfer {name}: {reason}");
    }
    info!(
        placed = report.placed.len(),
        failed = report.failures.len(),
        folders_created = report.folders_created,
        restarted = report.restarted,
        "push finished"
    );
    Ok(())
}

async fn pull_targets(
    cli: &Cli,
    session: &DeviceSession,
    tree: &DocumentTree,
    targets: &[String],
    excludes: &[glob::Pattern],
) -> Result<(), CommandError> {
    let destination = match cli.output.as_deref() {
        Some(dir) => PathBuf::from(dir),
        None => std::env::current_dir().context("cannot determine working directory")?,
    };
    let replace_existing = cli.if_exists == ConflictPolicy::Replace;

    let report = pull::pull(
        session.client(),
        tree,
        targets,
        &destination,
        excludes,
        replace_existing,
        cli.dry_run,
    )
    .await
    .map_err(map_pull)?;

    info!(
        downloaded = report.downloaded,
        skipped = report.skipped,
        failed = report.failed,
        "pull finished"
    );
    Ok(())
}

async fn sync_book_list(
    cli: &Cli,
    settings: &Settings,
    session: &DeviceSession,
) -> Result<(), CommandError> {
    if cli.dry_run {
        println!("sync does not support --dry-run, nothing was changed");
        return Ok(());
    }
    if !session.channel().probe().await.is_full() {
        return Err(CommandError::ChannelUnavailable(session.address().to_string()));
    }

    let mut local = BookList::load(&settings.state_path)
        .with_context(|| format!("cannot read {}", settings.state_path.display()))?;
    let report = reconcile::reconcile(session.client(), session.channel(), &mut local)
        .await
        .map_err(map_reconcile)?;
    local
        .save(&settings.state_path)
        .with_context(|| format!("cannot write {}", settings.state_path.display()))?;

    println!(
        "book list reconciled: {} entries ({} pruned, {} sent to the device, {} adopted)",
        report.total, report.pruned, report.appended_to_device, report.adopted_locally
    );
    Ok(())
}

/// Successful placements feed the local book list so a later `sync` can
/// tell the device about them.
fn record_placements(settings: &Settings, report: &BatchReport) -> Result<(), CommandError> {
    if report.placed.is_empty() {
        return Ok(());
    }
    let mut list = BookList::load(&settings.state_path)
        .with_context(|| format!("cannot read {}", settings.state_path.display()))?;
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    for placed in &report.placed {
        list.upsert(BookRecord {
            title: placed.visible_name.clone(),
            client_id: render::new_record_id(),
            device_id: placed.device_id.clone(),
            authors: Vec::new(),
            size: placed.size,
            modified: now,
            tags: Vec::new(),
            path: placed.location.clone(),
        });
    }
    list.save(&settings.state_path)
        .with_context(|| format!("cannot write {}", settings.state_path.display()))?;
    Ok(())
}

fn compile_excludes(patterns: &[String]) -> Result<Vec<glob::Pattern>, CommandError> {
    let compiled = patterns
        .iter()
        .map(|raw| {
            glob::Pattern::new(raw).with_context(|| format!("invalid exclude pattern {raw:?}"))
        })
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(compiled)
}

fn split_destination(output: Option<&str>) -> Vec<String> {
    output
        .map(|path| {
            path.split('/')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn map_device(err: DeviceError) -> CommandError {
    if err.is_unreachable() {
        CommandError::EndpointUnreachable
    } else {
        CommandError::Other(anyhow::Error::new(err))
    }
}

fn map_plan(err: PlanError) -> CommandError {
    match err {
        PlanError::AmbiguousTarget(_) => CommandError::Ambiguous(err.to_string()),
        other => CommandError::Other(anyhow::Error::new(other)),
    }
}

fn map_engine(err: EngineError, address: &str) -> CommandError {
    match err {
        EngineError::Device(device) if device.is_unreachable() => {
            CommandError::EndpointUnreachable
        }
        EngineError::Folder(folder @ FolderError::Ambiguous(_)) => {
            CommandError::Ambiguous(folder.to_string())
        }
        EngineError::ChannelRequired => CommandError::ChannelUnavailable(address.to_string()),
        other => CommandError::Other(anyhow::Error::new(other)),
    }
}

fn map_pull(err: PullError) -> CommandError {
    match err {
        PullError::Device(device) if device.is_unreachable() => CommandError::EndpointUnreachable,
        other => CommandError::Other(anyhow::Error::new(other)),
    }
}

fn map_reconcile(err: reconcile::ReconcileError) -> CommandError {
    match err {
        reconcile::ReconcileError::Device(device) if device.is_unreachable() => {
            CommandError::EndpointUnreachable
        }
        other => CommandError::Other(anyhow::Error::new(other)),
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use serde_json::json;
    use wiremock::matchers::{method, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[test]
    fn exit_codes_follow_the_failure_class() {
        assert_eq!(CommandError::Ambiguous("twins".into()).exit_code(), 1);
        assert_eq!(CommandError::EndpointUnreachable.exit_code(), 2);
        assert_eq!(CommandError::ChannelUnavailable("10.11.99.1".into()).exit_code(), 255);
        assert_eq!(CommandError::Other(anyhow::anyhow!("boom")).exit_code(), 1);
    }

    #[test]
    fn destinations_split_on_slashes_and_drop_empty_segments() {
        assert_eq!(split_destination(Some("A/B")), vec!["A", "B"]);
        assert_eq!(split_destination(Some("/A//B/")), vec!["A", "B"]);
        assert!(split_destination(None).is_empty());
    }

    #[test]
    fn broken_exclude_patterns_are_rejected_up_front() {
        assert!(compile_excludes(&["ok*".to_string()]).is_ok());
        assert!(compile_excludes(&["[broken".to_string()]).is_err());
    }

    #[tokio::test]
    async fn a_dry_run_push_talks_to_the_device_read_only() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex("^/documents/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;
        let address = server.uri().trim_start_matches("http://").to_string();

        let dir = tempfile::tempdir().unwrap();
        let book = dir.path().join("book.pdf");
        std::fs::write(&book, b"%PDF-1.4").unwrap();

        let cli = Cli::try_parse_from([
            "slatesync",
            "-r",
            &address,
            "--dry-run",
            "push",
            book.to_str().unwrap(),
        ])
        .unwrap();

        run(cli).await.unwrap();
    }

    #[tokio::test]
    async fn an_unreachable_endpoint_maps_to_exit_code_two() {
        let dir = tempfile::tempdir().unwrap();
        let book = dir.path().join("book.pdf");
        std::fs::write(&book, b"%PDF-1.4").unwrap();

        let cli = Cli::try_parse_from([
            "slatesync",
            "-r",
            "127.0.0.1:9",
            "push",
            book.to_str().unwrap(),
        ])
        .unwrap();

        let err = run(cli).await.unwrap_err();
        assert!(matches!(err, CommandError::EndpointUnreachable));
        assert_eq!(err.exit_code(), 2);
    }
}
