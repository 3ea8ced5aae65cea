use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tracing::debug;

/// Off-chain token metadata looked up when a token is selected.
#[derive(Debug, Clone)]
pub struct TokenMeta {
    pub name: String,
    pub symbol: String,
    pub price_usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct DexScreenerResponse {
    pairs: Option<Vec<DexScreenerPair>>,
}

#[derive(Debug, Deserialize)]
struct DexScreenerPair {
    #[serde(rename = "baseToken")]
    base_token: DexScreenerToken,
    #[serde(rename = "priceUsd")]
    price_usd: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DexScreenerToken {
    address: String,
    name: String,
    symbol: String,
}

/// DexScreener lookup for display metadata. Best-effort: a token without a
/// listed pair simply keeps its on-chain descriptor.
pub struct MetadataClient {
    client: reqwest::Client,
}

impl MetadataClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub async fn lookup(&self, mint: &str) -> Result<Option<TokenMeta>> {
        let url = format!("https://api.dexscreener.com/latest/dex/tokens/{mint}");
        let response = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        let data: DexScreenerResponse = response.json().await?;

        let Some(pairs) = data.pairs else {
            debug!(mint, "no listed pairs for token");
            return Ok(None);
        };
        let Some(pair) = pairs
            .into_iter()
            .find(|p| p.base_token.address.eq_ignore_ascii_case(mint))
        else {
            return Ok(None);
        };

        Ok(Some(TokenMeta {
            name: pair.base_token.name,
            symbol: pair.base_token.symbol,
            price_usd: pair.price_usd.and_then(|p| p.parse().ok()),
        }))
    }
}

impl Default for MetadataClient {
    fn default() -> Self {
        Self::new()
    }
}
