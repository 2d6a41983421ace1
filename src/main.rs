use std::{process, sync::Arc};

use stashpoint::{
    agent::{Agent, AppError, EventOutcome, LifecycleEvent},
    cache::{CacheManager, CacheStorage, DiskStorage, MemoryStorage},
    config::{self, StorageSettings},
    infra::{error::InfraError, fetch::HttpFetcher, http, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()
        .map_err(|err| AppError::unexpected(format!("failed to load configuration: {err}")))?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging).map_err(AppError::from)?;

    let agent = Arc::new(build_agent(&settings)?);

    match command {
        config::Command::Serve(_) => run_serve(&settings, agent).await,
        config::Command::Install(_) => run_install(&agent).await,
        config::Command::Activate(_) => run_activate(&agent).await,
        config::Command::Sync(args) => run_sync(&agent, args.tag).await,
        config::Command::Caches(_) => run_caches(&agent).await,
    }
}

fn build_agent(settings: &config::Settings) -> Result<Agent, AppError> {
    let storage: Arc<dyn CacheStorage> = match &settings.cache.storage {
        StorageSettings::Disk { directory } => {
            Arc::new(DiskStorage::new(directory.clone()).map_err(InfraError::from)?)
        }
        StorageSettings::Memory => Arc::new(MemoryStorage::new()),
    };
    let fetcher = Arc::new(HttpFetcher::new(settings.cache.cache.scope.clone())?);
    let cache = Arc::new(CacheManager::new(
        settings.cache.cache.clone(),
        storage,
        fetcher,
    ));

    Ok(Agent::headless(cache, settings.notifications.clone()))
}

async fn run_serve(settings: &config::Settings, agent: Arc<Agent>) -> Result<(), AppError> {
    agent.dispatch(LifecycleEvent::Install).await?;
    agent.dispatch(LifecycleEvent::Activate).await?;

    let router = http::build_router(http::ProxyState::new(agent.clone()));
    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;

    info!(
        target = "stashpoint::serve",
        addr = %settings.server.addr,
        scope = %agent.cache().config().scope,
        version = %agent.cache().config().version,
        "proxy listening"
    );

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::unexpected(format!("server error: {err}")))?;

    match tokio::time::timeout(
        settings.server.graceful_shutdown,
        agent.cache().flush_pending_writes(),
    )
    .await
    {
        Ok(settled) => info!(
            target = "stashpoint::serve",
            settled, "flushed pending cache writes"
        ),
        Err(_) => warn!(
            target = "stashpoint::serve",
            timeout_secs = settings.server.graceful_shutdown.as_secs(),
            "gave up waiting for pending cache writes"
        ),
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(
            target = "stashpoint::serve",
            error = %err,
            "failed to listen for shutdown signal"
        );
        std::future::pending::<()>().await;
    }
    info!(target = "stashpoint::serve", "shutdown requested");
}

async fn run_install(agent: &Agent) -> Result<(), AppError> {
    match agent.dispatch(LifecycleEvent::Install).await? {
        EventOutcome::Installed { warm: Some(report) } => {
            info!(
                target = "stashpoint::install",
                version = %report.version,
                entries = report.entries,
                "install completed"
            );
            Ok(())
        }
        EventOutcome::Installed { warm: None } => Err(AppError::unexpected(
            "cache install failed; see the log for the failing resource",
        )),
        other => Err(AppError::unexpected(format!(
            "install produced unexpected outcome: {other:?}"
        ))),
    }
}

async fn run_activate(agent: &Agent) -> Result<(), AppError> {
    match agent.dispatch(LifecycleEvent::Activate).await? {
        EventOutcome::Activated(report) => {
            info!(
                target = "stashpoint::activate",
                deleted = ?report.deleted,
                failed = ?report.failed,
                "activate completed"
            );
            Ok(())
        }
        other => Err(AppError::unexpected(format!(
            "activate produced unexpected outcome: {other:?}"
        ))),
    }
}

async fn run_sync(agent: &Agent, tag: String) -> Result<(), AppError> {
    match agent.dispatch(LifecycleEvent::Sync { tag }).await? {
        EventOutcome::Synced(report) => {
            info!(
                target = "stashpoint::sync",
                ran = report.ran,
                refreshed = report.refreshed,
                unchanged = report.unchanged,
                failed = report.failed,
                "sync completed"
            );
            Ok(())
        }
        other => Err(AppError::unexpected(format!(
            "sync produced unexpected outcome: {other:?}"
        ))),
    }
}

async fn run_caches(agent: &Agent) -> Result<(), AppError> {
    let storage = agent.cache().storage();
    let active = &agent.cache().config().version;

    for name in storage.names().await? {
        let store = storage.open(&name).await?;
        let entries = store.len().await?;
        println!(
            "{marker} {name}\t{entries}",
            marker = if &name == active { "*" } else { " " }
        );
    }
    Ok(())
}
