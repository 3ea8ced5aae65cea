use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::TradeError;

/// Jupiter v6 quote response: a priced route from one asset to another,
/// valid only briefly. The quoted amounts are advisory; executed amounts are
/// read back from the chain after confirmation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteResponse {
    pub input_mint: String,
    pub in_amount: String,
    pub output_mint: String,
    pub out_amount: String,
    pub other_amount_threshold: String,
    pub swap_mode: String,
    pub slippage_bps: u16,
    #[serde(default)]
    pub platform_fee: Option<Value>,
    pub price_impact_pct: String,
    #[serde(default)]
    pub route_plan: Vec<Value>,
    #[serde(default)]
    pub context_slot: u64,
    #[serde(default)]
    pub time_taken: f64,
}

/// Swap-assembly request: the aggregator builds the transaction server-side
/// around the quoted route.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SwapRequest<'a> {
    user_public_key: &'a str,
    quote_response: &'a QuoteResponse,
    wrap_and_unwrap_sol: bool,
    prioritization_fee_lamports: u64,
    dynamic_compute_unit_limit: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SwapResponse {
    swap_transaction: String,
    #[serde(default)]
    last_valid_block_height: u64,
}

/// Quote resolution seam consumed by the orchestrator.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    /// Resolves a route for the (input, output, amount) triple. One outbound
    /// call, no retry here; retry policy belongs to the caller.
    async fn get_quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<QuoteResponse, TradeError>;

    /// Base64-serialized unsigned swap transaction for a resolved route.
    async fn get_swap_transaction(
        &self,
        quote: &QuoteResponse,
        payer_public_key: &str,
        priority_fee_lamports: u64,
    ) -> Result<String, TradeError>;

    /// Current USD price of a token, when the aggregator knows one.
    async fn token_price(&self, mint: &str) -> Result<Option<f64>, TradeError>;
}

/// HTTP client against the Jupiter v6 aggregator.
pub struct JupiterClient {
    client: Client,
    api_url: String,
    price_url: String,
}

impl JupiterClient {
    pub fn new(api_url: &str, price_url: &str) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            price_url: price_url.to_string(),
        }
    }
}

#[async_trait]
impl QuoteSource for JupiterClient {
    async fn get_quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<QuoteResponse, TradeError> {
        debug!(input_mint, output_mint, amount, slippage_bps, "🔍 requesting quote");

        let url = format!("{}/quote", self.api_url);
        let amount_str = amount.to_string();
        let slippage_str = slippage_bps.to_string();
        let params = [
            ("inputMint", input_mint),
            ("outputMint", output_mint),
            ("amount", amount_str.as_str()),
            ("slippageBps", slippage_str.as_str()),
        ];

        let response = self
            .client
            .get(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| TradeError::QuoteUnavailable(e.to_string()))?;

        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| TradeError::QuoteUnavailable(e.to_string()))?;

        // The aggregator reports routing failures in the body, with or
        // without an error status.
        if let Some(error) = body.get("error").and_then(Value::as_str) {
            warn!(input_mint, output_mint, error, "quote rejected by aggregator");
            return Err(TradeError::QuoteUnavailable(error.to_string()));
        }
        if !status.is_success() {
            return Err(TradeError::QuoteUnavailable(format!("aggregator status {status}")));
        }

        let quote: QuoteResponse = serde_json::from_value(body)
            .map_err(|e| TradeError::QuoteUnavailable(format!("unreadable quote: {e}")))?;

        debug!(
            in_amount = %quote.in_amount,
            out_amount = %quote.out_amount,
            price_impact = %quote.price_impact_pct,
            "📊 quote received"
        );
        Ok(quote)
    }

    async fn get_swap_transaction(
        &self,
        quote: &QuoteResponse,
        payer_public_key: &str,
        priority_fee_lamports: u64,
    ) -> Result<String, TradeError> {
        let url = format!("{}/swap", self.api_url);
        let request = SwapRequest {
            user_public_key: payer_public_key,
            quote_response: quote,
            wrap_and_unwrap_sol: true,
            prioritization_fee_lamports: priority_fee_lamports,
            dynamic_compute_unit_limit: true,
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| TradeError::QuoteUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TradeError::QuoteUnavailable(format!(
                "swap assembly failed with status {status}: {text}"
            )));
        }

        let swap: SwapResponse = response
            .json()
            .await
            .map_err(|e| TradeError::QuoteUnavailable(format!("unreadable swap response: {e}")))?;
        debug!(
            last_valid_block_height = swap.last_valid_block_height,
            "📥 swap transaction received"
        );
        Ok(swap.swap_transaction)
    }

    async fn token_price(&self, mint: &str) -> Result<Option<f64>, TradeError> {
        let response = self
            .client
            .get(&self.price_url)
            .query(&[("ids", mint)])
            .send()
            .await
            .map_err(TradeError::rpc)?;

        let body: Value = response.json().await.map_err(TradeError::rpc)?;
        let price = &body["data"][mint]["price"];
        let price = price
            .as_str()
            .and_then(|p| p.parse::<f64>().ok())
            .or_else(|| price.as_f64());
        Ok(price)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_response_tolerates_missing_optional_fields() {
        let body = serde_json::json!({
            "inputMint": "So11111111111111111111111111111111111111112",
            "inAmount": "1000000000",
            "outputMint": "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v",
            "outAmount": "153220491",
            "otherAmountThreshold": "152454388",
            "swapMode": "ExactIn",
            "slippageBps": 50,
            "priceImpactPct": "0.001"
        });
        let quote: QuoteResponse = serde_json::from_value(body).unwrap();
        assert_eq!(quote.slippage_bps, 50);
        assert!(quote.route_plan.is_empty());
        assert_eq!(quote.context_slot, 0);
    }
}
