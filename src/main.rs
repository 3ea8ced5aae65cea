use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::signal::ctrl_c;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use ocelot::chain::metadata::MetadataClient;
use ocelot::chain::rpc::{ChainReader, RpcReader};
use ocelot::chat::dispatch::{ChatDispatcher, ChatEvent};
use ocelot::chat::notify::{LogNotifier, Notifier};
use ocelot::chat::session::SessionMap;
use ocelot::config::Config;
use ocelot::signal::{SignalFeed, SignalFeedConfig};
use ocelot::store::{MemoryUserStore, UserStore};
use ocelot::trade::delta::{DeltaCalculator, DeltaSource};
use ocelot::trade::quote::{JupiterClient, QuoteSource};
use ocelot::trade::submit::{RelaySubmitter, TxSubmitter};
use ocelot::trade::TradePipeline;

struct ServiceOrchestrator {
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<Result<()>>>,
    /// Handed to the chat transport adapter; inbound messages and callbacks
    /// flow through here into the dispatcher.
    chat_tx: Option<mpsc::Sender<ChatEvent>>,
}

impl ServiceOrchestrator {
    fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(16);
        Self {
            shutdown_tx,
            tasks: Vec::new(),
            chat_tx: None,
        }
    }

    #[instrument(skip(self, config))]
    async fn start_all_services(&mut self, config: Config) -> Result<()> {
        info!("🚀 Starting trading assistant services");

        // Shared collaborators, opened once at process start.
        let chain: Arc<dyn ChainReader> = Arc::new(RpcReader::new(&config.rpc_url));
        let quotes: Arc<dyn QuoteSource> = Arc::new(JupiterClient::new(
            &config.jupiter_api_url,
            &config.jupiter_price_url,
        ));
        let submitter: Arc<dyn TxSubmitter> = Arc::new(RelaySubmitter::new(
            &config.rpc_url,
            &config.block_engine_url,
            config.confirm_timeout_secs,
            config.send_max_retries,
        ));
        let deltas: Arc<dyn DeltaSource> = Arc::new(DeltaCalculator::new(Arc::clone(&chain)));
        let store: Arc<dyn UserStore> = Arc::new(MemoryUserStore::new());
        let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
        let sessions = Arc::new(SessionMap::new());

        let pipeline = Arc::new(TradePipeline::new(
            Arc::clone(&chain),
            Arc::clone(&quotes),
            submitter,
            deltas,
            Arc::clone(&notifier),
            Arc::clone(&store),
            config.fanout_concurrency,
        ));

        // Chat dispatch service.
        let dispatcher = Arc::new(ChatDispatcher::new(
            Arc::clone(&store),
            Arc::clone(&notifier),
            Arc::clone(&chain),
            Arc::clone(&quotes),
            Some(Arc::new(MetadataClient::new())),
            Arc::clone(&pipeline),
            sessions,
        ));
        let (chat_tx, chat_rx) = mpsc::channel::<ChatEvent>(256);
        self.chat_tx = Some(chat_tx);
        let chat_shutdown = self.shutdown_tx.subscribe();
        let chat_task = tokio::spawn(async move {
            info!("💬 Chat dispatch service starting");
            let result = dispatcher.run(chat_rx, chat_shutdown).await;
            match &result {
                Ok(()) => info!("🛑 Chat dispatch shut down gracefully"),
                Err(e) => error!("Chat dispatch error: {}", e),
            }
            result
        });
        self.tasks.push(chat_task);

        // Signal feed service.
        let feed = SignalFeed::new(
            SignalFeedConfig {
                url: config.signal_feed_url.clone(),
                api_key: config.signal_api_key.clone(),
                max_reconnect_attempts: 10,
                reconnect_delay: Duration::from_secs(1),
            },
            store,
            notifier,
            chain,
            pipeline,
        );
        let feed_shutdown = self.shutdown_tx.subscribe();
        let feed_task = tokio::spawn(async move {
            info!("📡 Signal feed service starting");
            let result = feed.run(feed_shutdown).await;
            match &result {
                Ok(()) => info!("🛑 Signal feed shut down gracefully"),
                Err(e) => error!("Signal feed error: {}", e),
            }
            result
        });
        self.tasks.push(feed_task);

        info!("✅ All {} services started successfully", self.tasks.len());
        Ok(())
    }

    #[instrument(skip(self))]
    async fn shutdown_all(&mut self) -> Result<()> {
        info!("🛑 Shutting down all services");

        let _ = self.shutdown_tx.send(());
        self.chat_tx.take();

        for (i, task) in self.tasks.drain(..).enumerate() {
            match task.await {
                Ok(Ok(())) => info!("✅ Service {} shut down cleanly", i + 1),
                Ok(Err(e)) => warn!("⚠️  Service {} error during shutdown: {}", i + 1, e),
                Err(e) => error!("❌ Service {} task failed: {}", i + 1, e),
            }
        }

        info!("✅ All services shut down successfully");
        Ok(())
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_target(true)
        .with_level(true)
        .compact()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("🐆 Ocelot Trading Assistant");
    info!("===========================");

    let config = Config::from_env()?;
    info!(
        rpc_url = %config.rpc_url,
        jupiter = %config.jupiter_api_url,
        block_engine = %config.block_engine_url,
        fanout = config.fanout_concurrency,
        "configuration loaded"
    );

    let mut orchestrator = ServiceOrchestrator::new();
    match orchestrator.start_all_services(config).await {
        Ok(()) => {
            info!("🎯 Assistant is now serving conversations and signals");
            info!("Press Ctrl+C to shut down all services");
        }
        Err(e) => {
            error!("Failed to start services: {}", e);
            return Err(e);
        }
    }

    match ctrl_c().await {
        Ok(()) => info!("🛑 Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }

    orchestrator.shutdown_all().await?;

    info!("👋 Shutdown complete");
    Ok(())
}
