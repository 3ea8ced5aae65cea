use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Wrapped-SOL mint address, used as the native side of every swap route.
pub const SOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// Base units per SOL.
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

/// Native balance floor kept untouched by buys so the wallet stays
/// rent-exempt and can still pay fees.
pub const RENT_RESERVE_LAMPORTS: u64 = 20_000_000;

/// Reserve subtracted from a full native withdrawal to cover the
/// transaction fee of the withdrawal itself.
pub const FEE_RESERVE_LAMPORTS: u64 = 155_000;

/// Custodial wallet attached to a user record.
///
/// The private key is base58-encoded keypair material. It is owned
/// exclusively by the user record; the signer borrows it for the duration of
/// one call and it never appears in logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub public_key: String,
    pub private_key: String,
}

/// Per-user trading parameters, mutated through the settings flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingParams {
    /// Default buy size in lamports for the one-tap and signal fan-out paths.
    pub snipe_amount_lamports: u64,
    /// Priority fee budget in lamports, spread over the compute budget.
    pub priority_fee_lamports: u64,
    /// Maximum acceptable price movement between quote and execution.
    pub slippage_bps: u16,
    /// Tip paid to the relay when MEV protection is on.
    pub relay_tip_lamports: u64,
    /// Submit through the bundling relay instead of direct broadcast.
    pub mev_protect: bool,
    /// Execute signal-triggered buys automatically.
    pub auto_trade: bool,
    /// Receive signal alerts at all.
    pub bot_alerts: bool,
}

impl Default for TradingParams {
    fn default() -> Self {
        Self {
            snipe_amount_lamports: 0,
            priority_fee_lamports: 200_000,
            slippage_bps: 50,
            relay_tip_lamports: 1_000_000,
            mev_protect: false,
            auto_trade: false,
            bot_alerts: false,
        }
    }
}

/// External profile on the user's watch-list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchedProfile {
    pub id: String,
    pub handle: String,
    /// High-priority feeds are polled on the faster tier.
    pub priority: bool,
}

/// A chat user with a custodial wallet.
///
/// Created on first interaction, mutated by the settings flow and the state
/// machine, never deleted in-process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// Opaque chat-account id.
    pub chat_id: i64,
    pub username: String,
    pub wallet: Wallet,
    pub params: TradingParams,
    pub watched_profiles: Vec<WatchedProfile>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(chat_id: i64, username: &str, wallet: Wallet) -> Self {
        Self {
            chat_id,
            username: username.to_string(),
            wallet,
            params: TradingParams::default(),
            watched_profiles: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Immutable snapshot of a token selected for trading.
///
/// Fetched once per selection; a new selection refetches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenDescriptor {
    pub address: String,
    pub symbol: String,
    pub name: String,
    pub decimals: u8,
    /// 100 when the mint has a freeze authority, 50 when it only has a mint
    /// authority, 0 when both were revoked.
    pub risk: u8,
    pub price_usd: Option<f64>,
}

impl TokenDescriptor {
    /// Short label for chat messages when no symbol is known.
    pub fn label(&self) -> &str {
        if self.symbol.is_empty() {
            &self.address[..8.min(self.address.len())]
        } else {
            &self.symbol
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeDirection {
    Buy,
    Sell,
}

/// One fully-resolved trade request, alive for a single pipeline run.
#[derive(Debug, Clone)]
pub struct TradeIntent {
    pub direction: TradeDirection,
    pub input_mint: String,
    pub output_mint: String,
    /// Amount of the input asset, in base units.
    pub amount: u64,
    pub priority_fee_lamports: u64,
    pub slippage_bps: u16,
    pub relay_tip_lamports: u64,
    pub mev_protect: bool,
}

impl TradeIntent {
    pub fn buy(token: &TokenDescriptor, amount_lamports: u64, params: &TradingParams) -> Self {
        Self {
            direction: TradeDirection::Buy,
            input_mint: SOL_MINT.to_string(),
            output_mint: token.address.clone(),
            amount: amount_lamports,
            priority_fee_lamports: params.priority_fee_lamports,
            slippage_bps: params.slippage_bps,
            relay_tip_lamports: params.relay_tip_lamports,
            mev_protect: params.mev_protect,
        }
    }

    pub fn sell(token: &TokenDescriptor, amount_base_units: u64, params: &TradingParams) -> Self {
        Self {
            direction: TradeDirection::Sell,
            input_mint: token.address.clone(),
            output_mint: SOL_MINT.to_string(),
            amount: amount_base_units,
            priority_fee_lamports: params.priority_fee_lamports,
            slippage_bps: params.slippage_bps,
            relay_tip_lamports: params.relay_tip_lamports,
            mev_protect: params.mev_protect,
        }
    }
}

/// Executed amounts of both route legs, read back from the confirmed
/// transaction rather than from the advisory quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TradeDelta {
    pub amount_in: u64,
    pub amount_out: u64,
}

/// Terminal output of one pipeline run. Exactly one is produced per intent.
#[derive(Debug, Clone)]
pub struct TradeResult {
    pub success: bool,
    /// Transaction signature, empty when nothing reached the chain.
    pub signature: String,
    /// Human-readable failure description, empty on success.
    pub message: String,
    pub amount_in: u64,
    pub amount_out: u64,
}

impl TradeResult {
    pub fn failure(message: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            success: false,
            signature: signature.into(),
            message: message.into(),
            amount_in: 0,
            amount_out: 0,
        }
    }
}
