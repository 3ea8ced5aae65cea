use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Runtime configuration, read once from the environment at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Chain
    pub rpc_url: String,

    // Aggregator
    pub jupiter_api_url: String,
    pub jupiter_price_url: String,

    // Relay
    pub block_engine_url: String,

    // Signal feed
    pub signal_feed_url: String,
    pub signal_api_key: String,

    // Execution
    /// Upper bound on the confirmation wait per submission.
    pub confirm_timeout_secs: u64,
    /// Bounded retries at the broadcast step only.
    pub send_max_retries: usize,
    /// Worker-pool size for the signal fan-out.
    pub fanout_concurrency: usize,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|x| x.parse().ok())
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let rpc_url = std::env::var("OCELOT_RPC_URL")
            .unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".to_string());

        let jupiter_api_url = std::env::var("OCELOT_JUPITER_URL")
            .unwrap_or_else(|_| "https://quote-api.jup.ag/v6".to_string());
        let jupiter_price_url = std::env::var("OCELOT_JUPITER_PRICE_URL")
            .unwrap_or_else(|_| "https://api.jup.ag/price/v2".to_string());

        let block_engine_url = std::env::var("OCELOT_BLOCK_ENGINE_URL")
            .unwrap_or_else(|_| "https://frankfurt.mainnet.block-engine.jito.wtf".to_string());

        let signal_feed_url = std::env::var("OCELOT_SIGNAL_FEED_URL")
            .unwrap_or_else(|_| "wss://twitter-api.axsys.us/v1/events".to_string());
        let signal_api_key = std::env::var("OCELOT_SIGNAL_API_KEY").unwrap_or_default();

        let confirm_timeout_secs = env_parse::<u64>("OCELOT_CONFIRM_TIMEOUT_SECS").unwrap_or(30);
        let send_max_retries = env_parse::<usize>("OCELOT_SEND_MAX_RETRIES").unwrap_or(5);
        let fanout_concurrency = env_parse::<usize>("OCELOT_FANOUT_CONCURRENCY").unwrap_or(8);

        if confirm_timeout_secs == 0 {
            return Err(anyhow!("OCELOT_CONFIRM_TIMEOUT_SECS must be positive"));
        }
        if fanout_concurrency == 0 {
            return Err(anyhow!("OCELOT_FANOUT_CONCURRENCY must be positive"));
        }

        Ok(Self {
            rpc_url,
            jupiter_api_url,
            jupiter_price_url,
            block_engine_url,
            signal_feed_url,
            signal_api_key,
            confirm_timeout_secs,
            send_max_retries,
            fanout_concurrency,
        })
    }
}
