use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::core::types::{TokenDescriptor, User};

/// Chat transport collaborator.
///
/// The core formats text and hands it over; it never parses
/// transport-specific payloads.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()>;

    async fn edit_message(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()>;

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()>;
}

/// Stand-in transport that writes outbound messages to the log. Used when no
/// chat backend is wired up, and handy in development.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        info!(chat_id, text, "→ outbound message");
        Ok(())
    }

    async fn edit_message(&self, chat_id: i64, message_id: i64, text: &str) -> Result<()> {
        info!(chat_id, message_id, text, "→ outbound edit");
        Ok(())
    }

    async fn delete_message(&self, chat_id: i64, message_id: i64) -> Result<()> {
        info!(chat_id, message_id, "→ outbound delete");
        Ok(())
    }
}

/// Base units scaled into display units.
pub fn ui_amount(amount: u64, decimals: u8) -> f64 {
    amount as f64 / 10f64.powi(decimals as i32)
}

pub fn welcome_text(user: &User) -> String {
    format!(
        "🎉 @{}, welcome to the trading assistant.\n\
         💨 Paste a token address to start trading.",
        user.username
    )
}

pub fn wallet_text(user: &User) -> String {
    format!(
        "👋 @{}\n\n\
         ⚠ Keep your private key safe\n\
         💳 Public key: {}\n\
         🔑 Private key: {}",
        user.username, user.wallet.public_key, user.wallet.private_key
    )
}

pub fn token_overview_text(token: &TokenDescriptor) -> String {
    let price = token
        .price_usd
        .map(|p| format!("${p:.6}"))
        .unwrap_or_else(|| "unknown".to_string());
    format!(
        "💠 {} ({})\n\
         📬 {}\n\
         🔢 Decimals: {}\n\
         ⚠ Risk score: {}/100\n\
         💵 Price: {}\n\n\
         Choose an action below, or send an amount after picking one.",
        token.label(),
        if token.name.is_empty() { "?" } else { &token.name },
        token.address,
        token.decimals,
        token.risk,
        price
    )
}

pub fn buy_success_text(token: &TokenDescriptor, signature: &str, lamports_in: u64, tokens_out: u64) -> String {
    format!(
        "🟢 Bought {:.4} {} for {} SOL.\n\
         📝 https://solscan.io/tx/{}",
        ui_amount(tokens_out, token.decimals),
        token.label(),
        ui_amount(lamports_in, 9),
        signature
    )
}

pub fn sell_success_text(token: &TokenDescriptor, signature: &str, tokens_in: u64, lamports_out: u64) -> String {
    format!(
        "🟢 Sold {:.4} {} for {} SOL.\n\
         📝 https://solscan.io/tx/{}",
        ui_amount(tokens_in, token.decimals),
        token.label(),
        ui_amount(lamports_out, 9),
        signature
    )
}

pub fn transfer_success_text(amount_display: &str, destination: &str, signature: &str) -> String {
    format!(
        "🎉 {amount_display} successfully transferred to {destination}\n\
         📝 https://solscan.io/tx/{signature}"
    )
}

pub fn pending_text(amount_sol: f64) -> String {
    format!("Transaction is pending now ({amount_sol} SOL)")
}

pub fn settings_text(user: &User) -> String {
    let p = &user.params;
    format!(
        "⚙ Settings\n\
         • Default buy: {} SOL\n\
         • Priority fee: {} SOL\n\
         • Slippage: {} bps\n\
         • Relay tip: {} SOL\n\
         • MEV protection: {}\n\
         • Auto-trade: {}\n\
         • Alerts: {}",
        ui_amount(p.snipe_amount_lamports, 9),
        ui_amount(p.priority_fee_lamports, 9),
        p.slippage_bps,
        ui_amount(p.relay_tip_lamports, 9),
        if p.mev_protect { "on" } else { "off" },
        if p.auto_trade { "on" } else { "off" },
        if p.bot_alerts { "on" } else { "off" },
    )
}

pub fn signal_alert_text(mint: &str) -> String {
    format!(
        "🔔 Signal 🔔\n\
         💶 {mint}\n\
         📊 https://solscan.io/token/{mint} • https://dexscreener.com/solana/{mint}"
    )
}

pub fn help_text() -> String {
    "🚀 Trading assistant\n\n\
     • Paste a token address to open the trade menu\n\
     • /settings — trading parameters\n\
     • /profiles — watched signal profiles\n\
     • /help — this message"
        .to_string()
}

pub const NO_ACTIVE_TOKEN: &str = "Please enter a token address first.";
pub const UNRECOGNIZED_COMMAND: &str = "Unrecognized command. Send /help for the command list.";
pub const DEFAULT_AMOUNT_UNSET: &str =
    "You have not set a default trade amount. Configure it in /settings first.";
