use std::{future::IntoFuture, pin::pin, process, sync::Arc, time::Duration};

use datagate::{
    application::{error::AppError, gateway::TableGateway, monitor::MetricsCollector},
    cache::{CacheConfig, CacheStore, Connectivity, QueryCache, RedisBackend},
    config,
    domain::Filters,
    infra::{
        db::{PgChangeSource, PgStore},
        error::InfraError,
        http::{self, AppState},
        telemetry,
    },
    realtime::{
        ChangeFeedManager, ChangePipeline, ConnectionRegistry, RealtimeHub, SubscriptionHandlers,
    },
};
use sqlx::PgPool;
use tokio::{sync::oneshot, task::JoinHandle};
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

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Migrate(_) => run_migrate(settings).await,
    }
}

async fn run_migrate(settings: config::Settings) -> Result<(), AppError> {
    let pool = init_database(&settings).await?;
    info!(target = "datagate::migrate", "Migrations applied");
    pool.close().await;
    Ok(())
}

async fn run_serve(settings: config::Settings) -> Result<(), AppError> {
    let cache = Arc::new(init_cache(&settings.cache).await);
    let monitor = Arc::new(MetricsCollector::new((&settings.monitor).into()));
    let registry = Arc::new(
        ConnectionRegistry::new(settings.realtime.max_connections_per_user.get() as usize)
            .with_monitor(Arc::clone(&monitor)),
    );
    let cache_config = CacheConfig::from(&settings.cache);
    let queries = Arc::new(QueryCache::new(
        Arc::clone(&cache),
        cache_config.single_flight,
    ));

    let pool = match settings.database.url {
        Some(_) => Some(init_database(&settings).await?),
        None => {
            warn!(
                target = "datagate::serve",
                "No database configured; table routes and the change feed are disabled"
            );
            None
        }
    };

    let gateway = pool.as_ref().map(|pool| {
        Arc::new(TableGateway::new(
            Arc::new(PgStore::new(pool.clone())),
            Arc::clone(&queries),
            cache_config.clone(),
            Arc::clone(&monitor),
        ))
    });

    let feed = match pool.as_ref() {
        Some(pool) => Some(
            start_change_feed(
                &settings,
                pool.clone(),
                &cache,
                &registry,
                &monitor,
                cache_config.record_ttl,
            )
            .await,
        ),
        None => None,
    };

    let mut tasks = vec![spawn_reaper(
        Arc::clone(&registry),
        settings.realtime.reap_interval,
        settings.realtime.idle_threshold,
    )];
    if cache.is_enabled() {
        tasks.push(spawn_cache_probe(
            Arc::clone(&cache),
            settings.cache.probe_interval,
        ));
    }

    let state = AppState {
        gateway,
        cache,
        monitor,
        realtime: RealtimeHub {
            registry: Arc::clone(&registry),
            outbound_buffer: settings.realtime.outbound_buffer.get() as usize,
        },
        feed: feed.clone(),
    };

    let result = serve_http(&settings, state).await;

    for task in tasks {
        task.abort();
        let _ = task.await;
    }
    if let Some(feed) = feed {
        feed.shutdown();
    }
    let closed = registry.close_all();
    info!(target = "datagate::serve", closed, "Realtime connections closed");
    if let Some(pool) = pool {
        pool.close().await;
    }

    result
}

async fn init_cache(settings: &config::CacheSettings) -> CacheStore {
    let Some(url) = settings.redis_url.as_deref() else {
        info!(target = "datagate::cache", "No Redis URL configured; caching disabled");
        return CacheStore::disabled();
    };

    match RedisBackend::new(url, settings.operation_timeout) {
        Ok(backend) => {
            let store = CacheStore::new(Arc::new(backend));
            match store.probe().await {
                Connectivity::Connected => {
                    info!(target = "datagate::cache", "Redis cache ready");
                }
                connectivity => warn!(
                    target = "datagate::cache",
                    %connectivity,
                    "Redis unreachable at startup; serving uncached until a probe succeeds"
                ),
            }
            store
        }
        Err(err) => {
            warn!(
                target = "datagate::cache",
                error = %err,
                "Invalid Redis URL; caching disabled"
            );
            CacheStore::disabled()
        }
    }
}

async fn init_database(settings: &config::Settings) -> Result<PgPool, AppError> {
    let database_url = settings
        .database
        .url
        .as_ref()
        .ok_or_else(|| InfraError::configuration("database url is not configured"))
        .map_err(AppError::from)?;

    let pool = PgStore::connect(database_url, settings.database.max_connections.get())
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    PgStore::run_migrations(&pool)
        .await
        .map_err(|err| AppError::from(InfraError::database(err.to_string())))?;

    Ok(pool)
}

async fn start_change_feed(
    settings: &config::Settings,
    pool: PgPool,
    cache: &Arc<CacheStore>,
    registry: &Arc<ConnectionRegistry>,
    monitor: &Arc<MetricsCollector>,
    record_ttl: Duration,
) -> Arc<ChangeFeedManager> {
    let source = Arc::new(PgChangeSource::new(
        pool,
        settings.database.change_channel.clone(),
    ));
    let pipeline = Arc::new(
        ChangePipeline::new(Arc::clone(cache), record_ttl)
            .with_registry(Arc::clone(registry))
            .with_monitor(Arc::clone(monitor)),
    );
    let feed = Arc::new(ChangeFeedManager::new(
        source.clone(),
        pipeline,
        settings.realtime.feed_buffer.get() as usize,
    ));

    for table in &settings.realtime.watch_tables {
        if let Err(err) = source.watch_table(table).await {
            warn!(
                target = "datagate::feed",
                table = %table,
                error = %err,
                "Failed to install change trigger"
            );
        }
        let id = feed
            .subscribe(table, Filters::new(), SubscriptionHandlers::silent())
            .await;
        info!(
            target = "datagate::feed",
            table = %table,
            subscription = %id,
            state = ?feed.state(id),
            "Watching table"
        );
    }

    feed
}

fn spawn_reaper(
    registry: Arc<ConnectionRegistry>,
    every: Duration,
    idle_threshold: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await; // Skip the first immediate tick
        loop {
            interval.tick().await;
            let reaped = registry.reap_idle(idle_threshold);
            if reaped > 0 {
                info!(target = "datagate::realtime", reaped, "Reaped idle connections");
            }
        }
    })
}

fn spawn_cache_probe(cache: Arc<CacheStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            cache.probe().await;
        }
    })
}

async fn serve_http(settings: &config::Settings, state: AppState) -> Result<(), AppError> {
    let router = http::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.addr)
        .await
        .map_err(|err| AppError::from(InfraError::from(err)))?;
    info!(target = "datagate::serve", addr = %settings.server.addr, "Listening");

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(async move {
            let _ = stop_rx.await;
        })
        .into_future();
    let mut server = pin!(server);

    tokio::select! {
        result = &mut server => {
            return result.map_err(|err| AppError::unexpected(format!("server error: {err}")));
        }
        () = shutdown_signal() => {}
    }

    info!(
        target = "datagate::serve",
        grace_secs = settings.server.graceful_shutdown.as_secs(),
        "Shutdown requested; draining connections"
    );
    let _ = stop_tx.send(());
    match tokio::time::timeout(settings.server.graceful_shutdown, server).await {
        Ok(result) => result.map_err(|err| AppError::unexpected(format!("server error: {err}"))),
        Err(_) => {
            warn!(target = "datagate::serve", "Graceful shutdown timed out");
            Ok(())
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
