//! apkernel server entry point.
//!
//! Depending on `server.role` a process serves the inbox endpoints, runs the
//! queue workers, or both.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use apalis::prelude::*;
use apkernel_common::{Config, init_tracing, load_or_generate_rsa_keypair};
use apkernel_federation::cache::spawn_invalidator;
use apkernel_federation::client::ReqwestTransport;
use apkernel_federation::events::EventBus;
use apkernel_federation::handler::{InboxState, inbox_router};
use apkernel_federation::jobs::{AccountJobQueue, DeliveryQueue, InboxQueue};
use apkernel_federation::ld_signature::RsaLdSigner;
use apkernel_federation::signature::{RsaRequestSigner, RsaSignatureVerifier};
use apkernel_federation::store::{Domain, MemoryDomain, UserKeypair, UserStore};
use apkernel_federation::{FederationContext, FederationDeps};
use apkernel_queue::{
    DELETE_ACCOUNT_QUEUE, DELIVER_QUEUE, DeleteAccountProcessor, DeleteAccountWorker,
    DeliverProcessor, DeliverWorker, INBOX_QUEUE, InboxProcessor, InboxWorker,
    RedisAccountJobQueue, RedisDeliveryQueue, RedisEventRelay, RedisInboxQueue, RedisLeaseStore,
    RetryDriver, RetryPolicy, delete_account_worker, deliver_worker, inbox_worker, redis_storage,
};
use fred::interfaces::ClientLike;
use tokio::signal;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info, warn};
use url::Url;

/// Largest accepted inbox body.
const MAX_INBOX_BODY: usize = 1024 * 1024;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
///
/// On Unix systems, this listens for both SIGINT (Ctrl+C) and SIGTERM.
/// On Windows, this only listens for Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received SIGINT, initiating graceful shutdown...");
        },
        () = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load().context("failed to load configuration")?;
    init_tracing(&config.logging);

    info!(role = ?config.server.role, "Starting apkernel...");

    let origin = Url::parse(&config.server.url).context("invalid server.url")?;
    let prefix = config.redis.prefix.clone();

    // Domain store
    let store = Arc::new(MemoryDomain::new());
    let instance_actor = UserStore::instance_actor(store.as_ref()).await?;
    let keypair = load_or_generate_rsa_keypair(&config.server.instance_key_path)?;
    store
        .insert_keypair(UserKeypair {
            user_id: instance_actor.id.clone(),
            public_key_pem: keypair.public_key_pem,
            private_key_pem: keypair.private_key_pem,
        })
        .await;
    warn!("Using the in-memory domain store; state is lost on restart");

    // Redis: apalis storages
    info!("Connecting to Redis...");
    let redis_client = redis::Client::open(config.redis.url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client)
        .await
        .context("failed to connect to Redis")?;
    let deliver_storage = redis_storage(redis_conn.clone(), &prefix, DELIVER_QUEUE);
    let inbox_storage = redis_storage(redis_conn.clone(), &prefix, INBOX_QUEUE);
    let account_storage = redis_storage(redis_conn, &prefix, DELETE_ACCOUNT_QUEUE);
    info!("Connected to Redis job queue");

    // Redis: leases and Pub/Sub
    let fred_config = fred::types::config::Config::from_url(&config.redis.url)?;
    let fred_client = fred::clients::Client::new(fred_config, None, None, None);
    fred_client.init().await.context("failed to connect fred client")?;
    let lease_store = Arc::new(RedisLeaseStore::new(fred_client.clone(), prefix.clone()));

    let relay = RedisEventRelay::new(&config.redis.url, &prefix).await?;
    let events = EventBus::new().with_relay(Arc::new(relay.clone()));
    relay.start(events.clone()).await?;

    let delivery_queue = Arc::new(RedisDeliveryQueue::new(deliver_storage.clone()));
    let inbox_queue = Arc::new(RedisInboxQueue::new(inbox_storage.clone()));
    let account_queue = Arc::new(RedisAccountJobQueue::new(account_storage.clone()));

    let transport = ReqwestTransport::new(config.federation.request_timeout())?;
    let ctx = FederationContext::new(
        origin,
        config.federation.clone(),
        FederationDeps {
            domain: Domain::in_memory(&store),
            transport: Arc::new(transport),
            request_signer: Arc::new(RsaRequestSigner),
            ld_signer: Arc::new(RsaLdSigner),
            lease_store,
            delivery_queue: delivery_queue.clone(),
            account_jobs: account_queue.clone(),
            events: events.clone(),
        },
    );
    let invalidator = spawn_invalidator(&events, ctx.users_cache.clone(), ctx.keys_cache.clone());

    let role = config.server.role;
    let federation = &config.federation;

    let workers = if role.runs_workers() && federation.enabled {
        let deliver = DeliverWorker::new(
            DeliverProcessor::new(ctx.clone()),
            RetryDriver::new(DELIVER_QUEUE, RetryPolicy::new(federation.deliver_job_max_attempts)),
            delivery_queue as Arc<dyn DeliveryQueue>,
        );
        let inbox = InboxWorker::new(
            InboxProcessor::new(ctx.clone(), Arc::new(RsaSignatureVerifier), Arc::new(RsaLdSigner)),
            RetryDriver::new(INBOX_QUEUE, RetryPolicy::new(federation.inbox_job_max_attempts)),
            inbox_queue.clone() as Arc<dyn InboxQueue>,
        );
        let delete_account = DeleteAccountWorker::new(
            DeleteAccountProcessor::new(ctx.clone()),
            RetryDriver::new(DELETE_ACCOUNT_QUEUE, RetryPolicy::INBOX),
            account_queue as Arc<dyn AccountJobQueue>,
        );

        let monitor = Monitor::new()
            .register(
                WorkerBuilder::new(DELIVER_QUEUE)
                    .enable_tracing()
                    .concurrency(federation.deliver_concurrency)
                    .data(deliver)
                    .backend(deliver_storage)
                    .build_fn(deliver_worker),
            )
            .register(
                WorkerBuilder::new(INBOX_QUEUE)
                    .enable_tracing()
                    .concurrency(federation.inbox_concurrency)
                    .data(inbox)
                    .backend(inbox_storage)
                    .build_fn(inbox_worker),
            )
            .register(
                WorkerBuilder::new(DELETE_ACCOUNT_QUEUE)
                    .enable_tracing()
                    .data(delete_account)
                    .backend(account_storage)
                    .build_fn(delete_account_worker),
            );

        info!("Starting queue workers...");
        Some(tokio::spawn(async move {
            let shutdown = async {
                shutdown_signal().await;
                Ok(())
            };
            if let Err(e) = monitor.run_with_signal(shutdown).await {
                error!(error = %e, "Queue workers failed");
            }
        }))
    } else {
        None
    };

    if role.serves_http() {
        let mut app = axum::Router::new();
        if federation.enabled {
            app = app.merge(inbox_router(InboxState::new(inbox_queue)));
        } else {
            warn!("Federation is disabled; inbox endpoints are not mounted");
        }
        let app = app
            .layer(RequestBodyLimitLayer::new(MAX_INBOX_BODY))
            .layer(TraceLayer::new_for_http());

        let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
            .parse()
            .context("invalid listen address")?;
        info!("Listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    }

    if let Some(workers) = workers {
        if let Err(e) = workers.await {
            error!(error = %e, "Worker task panicked");
        }
    }

    info!("Waiting for background tasks...");
    ctx.tasks.drain().await;
    invalidator.abort();
    relay.shutdown().await?;
    fred_client.quit().await?;

    info!("Server shutdown complete");
    Ok(())
}
