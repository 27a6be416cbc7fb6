//! Long-running and bulk sync commands.

use std::sync::Arc;

use folio_core::api::ProjectApi;
use folio_core::background_worker::{BackgroundSyncWorker, OfflineProjectStore, SyncReport};
use folio_core::config::SyncMode;
use folio_core::connectivity::Connectivity;
use folio_core::media_sync::MediaAutoSync;
use folio_core::project_key::ProjectKey;
use folio_core::provider::{SyncProvider, SyncProviderExt};
use folio_core::sync_queue::{ProjectSyncStatus, SyncQueue, SyncStage};

use crate::cli::http::DirectoryMediaSync;
use crate::cli::{CliError, CliResult, Context};

fn require_server(ctx: &Context, command: &str) -> CliResult {
    if ctx.mode == SyncMode::Server {
        Ok(())
    } else {
        Err(CliError::Usage(format!(
            "'{}' needs server mode (set sync_mode and websocket_url)",
            command
        )))
    }
}

async fn wait_for_ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("[folio] Could not listen for Ctrl-C: {}", e);
    }
}

pub async fn handle_sync_all(ctx: &Context, projects: Vec<ProjectKey>) -> CliResult {
    require_server(ctx, "sync-all")?;
    let api = ctx.require_api()?;

    let projects = if projects.is_empty() {
        let mut keys = Vec::new();
        for descriptor in api.list_projects().await? {
            keys.push(descriptor.key()?);
        }
        keys
    } else {
        projects
    };
    if projects.is_empty() {
        println!("No projects to sync.");
        return Ok(());
    }

    let queue = Arc::new(SyncQueue::new(
        Arc::new(api),
        Connectivity::default(),
        ctx.mode,
        ctx.deps().timings,
    ));
    let _progress = queue.subscribe_queue(|state| {
        if let Some(current) = &state.current_key {
            log::info!(
                "[SyncQueue] {}/{} {}",
                state.completed + state.failed + 1,
                state.total,
                current
            );
        }
    });

    let runner = Arc::clone(&queue);
    let mut run = tokio::spawn(async move { runner.sync_all_projects(projects).await });
    let state = tokio::select! {
        joined = &mut run => joined.ok().flatten(),
        _ = wait_for_ctrl_c() => {
            queue.cancel();
            run.await.ok().flatten()
        }
    };

    print_summary(&queue.summary());
    match state {
        Some(state) => {
            println!(
                "{} of {} projects synced, {} failed",
                state.completed, state.total, state.failed
            );
            if state.failed > 0 {
                return Err(CliError::Usage(format!("{} project(s) failed", state.failed)));
            }
            Ok(())
        }
        None => Err(CliError::Usage("Sync did not run".into())),
    }
}

fn print_summary(summary: &[ProjectSyncStatus]) {
    for status in summary {
        let mark = match status.stage {
            SyncStage::Completed => "✓",
            SyncStage::Failed => "✗",
            _ => "…",
        };
        let finished = status
            .completed_at
            .map(|at| at.format("%H:%M:%S").to_string())
            .unwrap_or_default();
        match &status.error {
            Some(error) => println!("{} {} {:>3}% {}  {}", mark, status.key, status.progress, finished, error),
            None => println!("{} {} {:>3}% {}", mark, status.key, status.progress, finished),
        }
    }
}

pub async fn handle_worker(ctx: &Context, once: bool) -> CliResult {
    require_server(ctx, "worker")?;
    let api = ctx.require_api()?;
    let worker = BackgroundSyncWorker::new(
        OfflineProjectStore::new(ctx.store()),
        Arc::new(api),
        Connectivity::default(),
        ctx.mode,
    );

    if once {
        match worker.sync_pending_items().await {
            Some(report) => print_report(&report),
            None => println!("Nothing ran (offline or already running)."),
        }
        return Ok(());
    }

    worker.start();
    println!("Background worker running. Press Ctrl-C to stop.");
    wait_for_ctrl_c().await;
    worker.stop();
    if let Some(report) = worker.last_report() {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SyncReport) {
    for key in &report.created {
        println!("✓ Created {}", key);
    }
    for key in &report.updated {
        println!("✓ Updated {}", key);
    }
    for (key, error) in &report.errors {
        println!("✗ {}: {}", key, error);
    }
    if report.all_success && report.created.is_empty() && report.updated.is_empty() {
        println!("Nothing pending.");
    }
}

pub async fn handle_watch(ctx: &Context, key: &ProjectKey, media: bool) -> CliResult {
    let coordinator = ctx.open(key).await?;
    let provider = Arc::clone(coordinator.provider());

    let _phase = provider.subscribe_phase(Box::new(|phase| println!("phase: {}", phase)));
    let _errors = provider.subscribe_errors(Box::new(|error| eprintln!("✗ {}", error)));
    let _elements = provider.subscribe_elements(|elements| println!("elements: {}", elements.len()));

    let media_sync = if media {
        start_media_sync(ctx, key)?
    } else {
        None
    };

    println!("Watching {}. Press Ctrl-C to stop.", key);
    wait_for_ctrl_c().await;

    if let Some(media_sync) = media_sync {
        media_sync.stop();
    }
    coordinator.disconnect();
    Ok(())
}

fn start_media_sync(ctx: &Context, key: &ProjectKey) -> CliResult<Option<MediaAutoSync>> {
    if ctx.mode != SyncMode::Server {
        println!("Media sync needs server mode; skipping.");
        return Ok(None);
    }
    let api = ctx.require_api()?;
    let root = ctx.config.resolved_data_dir()?.join("media");
    let deps = ctx.deps();
    let media_sync = MediaAutoSync::new(
        Arc::new(DirectoryMediaSync::new(api, root)),
        ctx.mode,
        ctx.config.websocket_url.clone(),
        deps.transport,
        deps.tokens,
        deps.connectivity,
        deps.timings,
    );
    media_sync.start_auto_sync(key.clone());
    Ok(Some(media_sync))
}
