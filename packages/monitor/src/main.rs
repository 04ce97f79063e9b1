//! WalletWatch Monitor
//!
//! Polls the chain for transactions touching registered wallets and notifies
//! their owners over Telegram.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use walletwatch_monitor::chain::{ChainReader, RpcChainReader};
use walletwatch_monitor::config::AppConfig;
use walletwatch_monitor::dispatcher::NotificationDispatcher;
use walletwatch_monitor::gate::{MembershipGate, OpenGate, TelegramGroupGate};
use walletwatch_monitor::monitor::{initial_cursor, MonitorLoop};
use walletwatch_monitor::notifier::{MessageFormat, TelegramNotifier};
use walletwatch_monitor::registry::AddressRegistry;
use walletwatch_monitor::service::SubscriptionService;
use walletwatch_monitor::store::RedisStore;

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = AppConfig::from_env().context("invalid configuration")?;
    init_tracing(config.log_json);

    info!("starting walletwatch monitor");

    let chain = Arc::new(RpcChainReader::connect_http(&config.rpc_url)?);
    let latest = chain
        .latest_height()
        .await
        .context("RPC endpoint unreachable")?;
    let chain_id = chain.chain_id().await?;
    info!(chain_id, latest, "connected to chain");

    let store = Arc::new(
        RedisStore::connect(&config.redis_url, config.redis_prefix.clone())
            .await
            .context("failed to connect to Redis")?,
    );
    let registry = Arc::new(AddressRegistry::load(store.clone()).await?);

    let format = MessageFormat::new(config.token_symbol.clone(), config.explorer_url.clone());
    let notifier = Arc::new(TelegramNotifier::new(config.bot_token.clone(), format.clone())?);
    let dispatcher = Arc::new(NotificationDispatcher::new(store.clone(), notifier));

    let gate: Arc<dyn MembershipGate> = match &config.group_chat_id {
        Some(group) => Arc::new(TelegramGroupGate::new(config.bot_token.clone(), group.clone())?),
        None => {
            info!("no GROUP_CHAT_ID set, registration is open to everyone");
            Arc::new(OpenGate)
        }
    };
    // Command handlers call into this
    let service = SubscriptionService::new(registry.clone(), store.clone(), gate, format);

    let cursor = initial_cursor(store.as_ref(), chain.as_ref()).await?;
    let monitor = MonitorLoop::new(
        config.monitor.clone(),
        chain,
        registry.clone(),
        dispatcher,
        store,
        cursor,
    );
    let handle = monitor.handle();

    info!(addresses = registry.len(), cursor, "monitor ready");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(monitor.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested, finishing in-flight block");
    shutdown_tx.send_replace(true);

    match task.await {
        Ok(cursor) => info!(
            cursor,
            addresses = service.registry().len(),
            state = %handle.state(),
            "shutdown complete"
        ),
        Err(e) => error!(error = %e, "monitor task failed"),
    }

    Ok(())
}
