use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::chain::rpc::ChainReader;
use crate::chat::notify::{self, Notifier};
use crate::store::UserStore;
use crate::trade::TradePipeline;

/// Configuration for the external signal feed connection.
#[derive(Debug, Clone)]
pub struct SignalFeedConfig {
    /// WebSocket endpoint of the event stream.
    pub url: String,
    /// Credential appended to the connection request.
    pub api_key: String,
    /// Maximum reconnection attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Base delay between reconnection attempts.
    pub reconnect_delay: Duration,
}

impl Default for SignalFeedConfig {
    fn default() -> Self {
        Self {
            url: "wss://twitter-api.axsys.us/v1/events".to_string(),
            api_key: String::new(),
            max_reconnect_attempts: 10,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

/// First base58 run of mint-address length (43–44 chars) in an event
/// payload, or none.
pub fn extract_candidate_asset(text: &str) -> Option<String> {
    let is_base58 = |c: char| c.is_ascii_alphanumeric() && !matches!(c, '0' | 'O' | 'I' | 'l');
    let mut run_start = None;
    for (i, c) in text.char_indices() {
        if is_base58(c) {
            run_start.get_or_insert(i);
            continue;
        }
        if let Some(start) = run_start.take() {
            let run = &text[start..i];
            if (43..=44).contains(&run.len()) {
                return Some(run.to_string());
            }
        }
    }
    if let Some(start) = run_start {
        let run = &text[start..];
        if (43..=44).contains(&run.len()) {
            return Some(run.to_string());
        }
    }
    None
}

/// Consumes the external event stream and triggers the signal path: alert
/// messages for subscribed users and the auto-trade fan-out.
///
/// The task answers keep-alive pings so the feed does not drop the
/// connection; reconnection beyond a bounded retry loop is not its concern.
pub struct SignalFeed {
    config: SignalFeedConfig,
    store: Arc<dyn UserStore>,
    notifier: Arc<dyn Notifier>,
    chain: Arc<dyn ChainReader>,
    pipeline: Arc<TradePipeline>,
}

impl SignalFeed {
    pub fn new(
        config: SignalFeedConfig,
        store: Arc<dyn UserStore>,
        notifier: Arc<dyn Notifier>,
        chain: Arc<dyn ChainReader>,
        pipeline: Arc<TradePipeline>,
    ) -> Self {
        Self {
            config,
            store,
            notifier,
            chain,
            pipeline,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let url = format!("{}?authorization={}", self.config.url, self.config.api_key);
        Url::parse(&url).context("invalid signal feed URL")?;

        let mut attempts: u32 = 0;
        loop {
            match connect_async(url.as_str()).await {
                Ok((stream, _)) => {
                    info!("📡 signal feed connected");
                    attempts = 0;
                    if self.pump(stream, &mut shutdown).await {
                        info!("signal feed shutting down");
                        return Ok(());
                    }
                    warn!("signal feed disconnected");
                }
                Err(e) => {
                    warn!(error = %e, "signal feed connection failed");
                }
            }

            attempts += 1;
            if attempts >= self.config.max_reconnect_attempts {
                bail!("signal feed gave up after {attempts} reconnection attempts");
            }
            let backoff = self.config.reconnect_delay * attempts;
            debug!(attempt = attempts, ?backoff, "reconnecting to signal feed");
            tokio::select! {
                _ = sleep(backoff) => {}
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }

    /// Reads the stream until disconnect or shutdown. Returns true on
    /// shutdown.
    async fn pump<S>(
        &self,
        stream: tokio_tungstenite::WebSocketStream<S>,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> bool
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let (mut write, mut read) = stream.split();
        loop {
            tokio::select! {
                _ = shutdown.recv() => return true,
                message = read.next() => match message {
                    Some(Ok(Message::Ping(payload))) => {
                        // Liveness responder: an unanswered ping gets the
                        // connection dropped by the feed.
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            warn!(error = %e, "failed to answer keep-alive ping");
                            return false;
                        }
                    }
                    Some(Ok(Message::Text(payload))) => self.handle_event(&payload).await,
                    Some(Ok(Message::Close(_))) | None => return false,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "signal feed read error");
                        return false;
                    }
                },
            }
        }
    }

    #[instrument(skip(self, payload))]
    async fn handle_event(&self, payload: &str) {
        let Some(mint) = extract_candidate_asset(payload) else {
            return;
        };
        info!(mint = %mint, "🔔 candidate asset in signal event");

        // Only a real mint fans out; the feed text can contain arbitrary
        // base58 runs.
        let token = match self.chain.token_info(&mint).await {
            Ok(token) => token,
            Err(e) => {
                debug!(mint = %mint, error = %e, "signal candidate is not a tradable token");
                return;
            }
        };

        match self.store.alert_users().await {
            Ok(users) => {
                let text = notify::signal_alert_text(&mint);
                for user in users {
                    if let Err(e) = self.notifier.send_message(user.chat_id, &text).await {
                        error!(chat_id = user.chat_id, error = %e, "failed to deliver signal alert");
                    }
                }
            }
            Err(e) => error!(error = %e, "could not load alert subscribers"),
        }

        self.pipeline.execute_for_all_eligible(&token).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

    #[test]
    fn extracts_a_mint_address_from_event_text() {
        let tweet = format!("🚀 new gem just dropped {MINT} LFG");
        assert_eq!(extract_candidate_asset(&tweet).as_deref(), Some(MINT));
    }

    #[test]
    fn extracts_from_json_shaped_payloads() {
        let payload = format!("{{\"type\":\"tweet\",\"body\":{{\"text\":\"buy {MINT} now\"}}}}");
        assert_eq!(extract_candidate_asset(&payload).as_deref(), Some(MINT));
    }

    #[test]
    fn ignores_text_without_candidates() {
        assert_eq!(extract_candidate_asset("gm, no tokens today"), None);
        // A wallet-length run that is too short for a mint.
        assert_eq!(
            extract_candidate_asset("11111111111111111111111111111111"),
            None
        );
        // Base58 excludes 0, O, I and l.
        assert_eq!(
            extract_candidate_asset(&"0O".repeat(22)),
            None
        );
    }
}
