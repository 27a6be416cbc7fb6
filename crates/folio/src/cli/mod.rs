/// Clap argument definitions
mod args;

/// Config command handlers
mod config;

/// HTTP project API and media sync
mod http;

/// Tree and metadata editing commands
mod project;

/// `sync-all`, `worker` and `watch`
mod sync;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use thiserror::Error;

use folio_core::auth::{AuthTokenSource, ConfigTokenSource, StaticTokenSource};
use folio_core::config::{Config, SyncMode};
use folio_core::coordinator::ProjectCoordinator;
use folio_core::crdt::{DocumentStore, SqliteStore};
use folio_core::error::FolioError;
use folio_core::project_key::ProjectKey;
use folio_core::provider::{ProviderDeps, ProviderFactory};

pub use args::Cli;
use args::Commands;
use http::HttpProjectApi;

/// File name of the durable store inside the data directory.
const STORE_FILE: &str = "folio.db";

/// Time given to the replication session to flush queued frames before a
/// one-shot command detaches.
const FLUSH_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] FolioError),

    #[error("{0}")]
    Usage(String),

    #[error("Could not open project: {0}")]
    Connect(String),
}

pub type CliResult<T = ()> = std::result::Result<T, CliError>;

/// Everything a command needs: configuration, mode and the local store.
pub struct Context {
    pub config: Config,
    pub config_path: Option<PathBuf>,
    pub mode: SyncMode,
    store: Arc<dyn DocumentStore>,
}

impl Context {
    fn load(config_path: Option<PathBuf>, offline: bool) -> CliResult<Self> {
        let config_path = config_path.or_else(Config::config_path);
        let config = match &config_path {
            Some(path) if path.exists() => Config::load_from(path)?,
            _ => Config::default(),
        };
        let mode = if offline {
            SyncMode::Local
        } else {
            config.effective_sync_mode()
        };

        let data_dir = config.resolved_data_dir()?;
        std::fs::create_dir_all(&data_dir).map_err(FolioError::from)?;
        let store = SqliteStore::open(data_dir.join(STORE_FILE))?;
        log::debug!("[folio] Store at {}, mode {}", data_dir.display(), mode);

        Ok(Self {
            config,
            config_path,
            mode,
            store: Arc::new(store),
        })
    }

    pub fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.store)
    }

    fn tokens(&self) -> Arc<dyn AuthTokenSource> {
        match &self.config_path {
            Some(path) if path.exists() => Arc::new(ConfigTokenSource::new(path)),
            _ => match &self.config.session_token {
                Some(token) => Arc::new(StaticTokenSource::new(token.clone())),
                None => Arc::new(StaticTokenSource::none()),
            },
        }
    }

    pub fn deps(&self) -> ProviderDeps {
        ProviderDeps::new(self.store()).with_tokens(self.tokens())
    }

    pub fn factory(&self) -> ProviderFactory {
        ProviderFactory::new(self.mode, self.config.websocket_url.clone(), self.deps())
    }

    /// The project API, when an API URL is configured.
    pub fn api(&self) -> Option<HttpProjectApi> {
        self.config
            .api_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .map(|url| HttpProjectApi::new(url, self.config.session_token.clone()))
    }

    pub fn require_api(&self) -> CliResult<HttpProjectApi> {
        self.api().ok_or_else(|| {
            CliError::Usage("No api_url configured. Run 'folio config set api_url <URL>'".into())
        })
    }

    /// Owner used for projects created from this machine.
    pub fn username(&self) -> CliResult<String> {
        self.config.username.clone().ok_or_else(|| {
            CliError::Usage("No username configured. Run 'folio config set username <NAME>'".into())
        })
    }

    /// A coordinator attached to `key`.
    pub async fn open(&self, key: &ProjectKey) -> CliResult<ProjectCoordinator> {
        let mut coordinator = ProjectCoordinator::from_factory(&self.factory());
        if self.mode == SyncMode::Server
            && let Some(api) = self.api()
        {
            coordinator = coordinator.with_api(Arc::new(api));
        }
        let result = coordinator.load_project(&key.owner, &key.slug).await;
        if !result.success {
            return Err(CliError::Connect(
                result.error.unwrap_or_else(|| "unknown error".to_string()),
            ));
        }
        log::info!("[folio] Opened {} ({})", key, coordinator.sync_phase());
        Ok(coordinator)
    }

    /// Detach after a one-shot command.
    pub async fn close(&self, coordinator: ProjectCoordinator) {
        if self.mode == SyncMode::Server {
            tokio::time::sleep(FLUSH_GRACE).await;
        }
        coordinator.disconnect();
    }
}

/// Main entry point for the CLI
pub fn run_cli() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("✗ Could not start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("✗ {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> CliResult {
    let Cli {
        config: config_path,
        offline,
        command,
    } = cli;
    let command = match command {
        // Config commands work without opening the store
        Commands::Config { command } => {
            return config::handle_config_command(command, config_path);
        }
        command => command,
    };

    let ctx = Context::load(config_path, offline)?;
    match command {
        Commands::Tree { project, json } => project::handle_tree(&ctx, &project, json).await,
        Commands::Add {
            project,
            element_type,
            name,
            parent,
            schema,
        } => project::handle_add(&ctx, &project, element_type, name, parent, schema).await,
        Commands::Rm { project, id } => project::handle_rm(&ctx, &project, &id).await,
        Commands::Mv {
            project,
            id,
            index,
            level,
        } => project::handle_mv(&ctx, &project, &id, index, level).await,
        Commands::Rename { project, id, name } => {
            project::handle_rename(&ctx, &project, &id, &name).await
        }
        Commands::Meta { project, set } => project::handle_meta(&ctx, &project, &set).await,
        Commands::New {
            slug,
            title,
            description,
            owner,
        } => project::handle_new(&ctx, slug, title, description, owner).await,
        Commands::SyncAll { projects } => sync::handle_sync_all(&ctx, projects).await,
        Commands::Worker { once } => sync::handle_worker(&ctx, once).await,
        Commands::Watch { project, media } => sync::handle_watch(&ctx, &project, media).await,
        Commands::Config { .. } => Ok(()),
    }
}
