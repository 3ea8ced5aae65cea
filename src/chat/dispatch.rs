use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, instrument, warn};

use crate::chain::metadata::MetadataClient;
use crate::chain::rpc::ChainReader;
use crate::chain::wallet::generate_wallet;
use crate::chat::notify::{self, Notifier};
use crate::chat::session::{
    PendingInput, SessionMap, SettingField, TransferKind, WatchAction,
};
use crate::core::types::{TokenDescriptor, User, LAMPORTS_PER_SOL};
use crate::error::TradeError;
use crate::signal::extract_candidate_asset;
use crate::store::UserStore;
use crate::trade::quote::QuoteSource;
use crate::trade::TradePipeline;

/// Inbound event extracted from the chat transport.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    Text {
        chat_id: i64,
        text: String,
    },
    Callback {
        chat_id: i64,
        message_id: i64,
        label: String,
    },
}

const USER_NOT_FOUND: &str = "I can't find you. Please enter /start and then try again.";
const SEND_TOKEN_ADDRESS: &str = "Send a token address to open the trade menu.";
const INVALID_NUMBER: &str = "Please enter a valid positive number.";
const INVALID_RATIO: &str = "Please enter a percentage between 1 and 100 (25 / 50 / 75 / 100).";
const INVALID_ADDRESS: &str = "That does not look like a valid address. Please try again.";
const MAX_WATCHED_PROFILES: usize = 10;

fn parse_positive_number(text: &str) -> Option<f64> {
    let value: f64 = text.trim().parse().ok()?;
    (value.is_finite() && value > 0.0).then_some(value)
}

/// Decimal user input scaled to base units, rounded down.
pub fn to_base_units(value: f64, decimals: u8) -> u64 {
    (value * 10f64.powi(decimals as i32)).floor() as u64
}

/// `floor(balance × ratio / 100)`, exact for whole and hundredth percents.
pub fn ratio_amount(balance: u64, ratio_percent: f64) -> u64 {
    let hundredths = (ratio_percent * 100.0).round() as u128;
    ((balance as u128 * hundredths) / 10_000) as u64
}

fn is_valid_wallet_address(text: &str) -> bool {
    text.trim().parse::<solana_sdk::pubkey::Pubkey>().is_ok()
}

/// Maps inbound chat events onto the session state machine and dispatches
/// trades, transfers, settings updates and watch-list mutations.
///
/// Single entry point per transport event; every terminal path sends the
/// user exactly one reply.
pub struct ChatDispatcher {
    store: Arc<dyn UserStore>,
    notifier: Arc<dyn Notifier>,
    chain: Arc<dyn ChainReader>,
    quotes: Arc<dyn QuoteSource>,
    metadata: Option<Arc<MetadataClient>>,
    pipeline: Arc<TradePipeline>,
    sessions: Arc<SessionMap>,
}

impl ChatDispatcher {
    pub fn new(
        store: Arc<dyn UserStore>,
        notifier: Arc<dyn Notifier>,
        chain: Arc<dyn ChainReader>,
        quotes: Arc<dyn QuoteSource>,
        metadata: Option<Arc<MetadataClient>>,
        pipeline: Arc<TradePipeline>,
        sessions: Arc<SessionMap>,
    ) -> Self {
        Self {
            store,
            notifier,
            chain,
            quotes,
            metadata,
            pipeline,
            sessions,
        }
    }

    /// Drains inbound transport events until shutdown, spawning one task per
    /// event so slow pipelines never block other conversations.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ChatEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return Ok(()),
                event = events.recv() => {
                    let Some(event) = event else { return Ok(()) };
                    let dispatcher = Arc::clone(&self);
                    tokio::spawn(async move {
                        match event {
                            ChatEvent::Text { chat_id, text } => {
                                dispatcher.handle_text(chat_id, &text).await;
                            }
                            ChatEvent::Callback { chat_id, message_id, label } => {
                                dispatcher.handle_callback(chat_id, message_id, &label).await;
                            }
                        }
                    });
                }
            }
        }
    }

    async fn reply(&self, chat_id: i64, text: &str) {
        if let Err(e) = self.notifier.send_message(chat_id, text).await {
            error!(chat_id, error = %e, "failed to send reply");
        }
    }

    /// Inbound free text. Commands reset the pending state; everything else
    /// is interpreted against it.
    #[instrument(skip(self, text))]
    pub async fn handle_text(&self, chat_id: i64, text: &str) {
        let text = text.trim();
        if let Some(command) = text.strip_prefix('/') {
            self.handle_command(chat_id, command).await;
            return;
        }

        let Some(user) = self.find_user(chat_id).await else {
            self.reply(chat_id, USER_NOT_FOUND).await;
            return;
        };

        let session = self.sessions.snapshot(chat_id);
        match session.pending {
            PendingInput::Idle => self.handle_token_selection(chat_id, text).await,
            PendingInput::BuyAmount => self.handle_buy_amount(chat_id, &user, text).await,
            PendingInput::SellAmount => self.handle_sell_amount(chat_id, &user, text).await,
            PendingInput::SellRatio => self.handle_sell_ratio(chat_id, &user, text).await,
            PendingInput::TransferAddress(kind) => {
                self.handle_transfer_address(chat_id, &user, kind, text).await
            }
            PendingInput::Setting(field) => self.handle_setting_value(chat_id, user, field, text).await,
            PendingInput::WatchProfile(action) => {
                self.handle_watch_profile(chat_id, user, action, text).await
            }
        }
    }

    async fn handle_command(&self, chat_id: i64, command: &str) {
        self.sessions.set_pending(chat_id, PendingInput::Idle);
        match command.split_whitespace().next().unwrap_or("") {
            "start" => self.handle_start(chat_id).await,
            "help" => self.reply(chat_id, &notify::help_text()).await,
            "settings" => match self.find_user(chat_id).await {
                Some(user) => self.reply(chat_id, &notify::settings_text(&user)).await,
                None => self.reply(chat_id, USER_NOT_FOUND).await,
            },
            "profiles" => match self.find_user(chat_id).await {
                Some(user) => self.reply(chat_id, &profiles_text(&user)).await,
                None => self.reply(chat_id, USER_NOT_FOUND).await,
            },
            other => {
                debug!(chat_id, command = other, "unrecognized command");
                self.reply(chat_id, notify::UNRECOGNIZED_COMMAND).await;
            }
        }
    }

    async fn handle_start(&self, chat_id: i64) {
        match self.store.find_user(chat_id).await {
            Ok(Some(user)) => self.reply(chat_id, &notify::welcome_text(&user)).await,
            Ok(None) => {
                let wallet = generate_wallet();
                match self.store.create_user(chat_id, "", wallet).await {
                    Ok(user) => {
                        info!(chat_id, "new user onboarded");
                        self.reply(chat_id, &notify::welcome_text(&user)).await;
                        self.reply(chat_id, &notify::wallet_text(&user)).await;
                    }
                    Err(e) => {
                        error!(chat_id, error = %e, "failed to create user");
                        self.reply(chat_id, "An error occurred while starting. Please try again later.")
                            .await;
                    }
                }
            }
            Err(e) => {
                error!(chat_id, error = %e, "user lookup failed");
                self.reply(chat_id, "An error occurred while starting. Please try again later.")
                    .await;
            }
        }
    }

    async fn find_user(&self, chat_id: i64) -> Option<User> {
        match self.store.find_user(chat_id).await {
            Ok(user) => user,
            Err(e) => {
                error!(chat_id, error = %e, "user lookup failed");
                None
            }
        }
    }

    /// Idle text: either a token selection or a nudge towards one.
    async fn handle_token_selection(&self, chat_id: i64, text: &str) {
        let Some(address) = extract_candidate_asset(text) else {
            self.reply(chat_id, SEND_TOKEN_ADDRESS).await;
            return;
        };

        let mut token = match self.chain.token_info(&address).await {
            Ok(token) => token,
            Err(TradeError::Validation(message)) => {
                self.reply(chat_id, &message).await;
                return;
            }
            Err(e) => {
                warn!(chat_id, address, error = %e, "token inspection failed");
                self.reply(chat_id, &e.to_string()).await;
                return;
            }
        };
        self.enrich_token(&mut token).await;

        self.sessions.set_active_token(chat_id, token.clone());
        self.reply(chat_id, &notify::token_overview_text(&token)).await;
    }

    /// Best-effort display metadata; a token without listings still trades.
    async fn enrich_token(&self, token: &mut TokenDescriptor) {
        if let Some(metadata) = &self.metadata {
            match metadata.lookup(&token.address).await {
                Ok(Some(meta)) => {
                    token.name = meta.name;
                    token.symbol = meta.symbol;
                    token.price_usd = meta.price_usd;
                }
                Ok(None) => {}
                Err(e) => debug!(address = %token.address, error = %e, "metadata lookup failed"),
            }
        }
        if token.price_usd.is_none() {
            token.price_usd = self.quotes.token_price(&token.address).await.unwrap_or(None);
        }
    }

    fn active_token(&self, chat_id: i64) -> Option<TokenDescriptor> {
        self.sessions.snapshot(chat_id).active_token
    }

    async fn handle_buy_amount(&self, chat_id: i64, user: &User, text: &str) {
        let Some(value) = parse_positive_number(text) else {
            self.reply(chat_id, INVALID_NUMBER).await;
            return;
        };
        let Some(token) = self.active_token(chat_id) else {
            self.sessions.set_pending(chat_id, PendingInput::Idle);
            self.reply(chat_id, notify::NO_ACTIVE_TOKEN).await;
            return;
        };
        self.sessions.set_pending(chat_id, PendingInput::Idle);

        let amount = to_base_units(value, 9);
        self.reply(chat_id, &notify::pending_text(value)).await;
        self.pipeline.execute_buy(user, &token, amount).await;
    }

    async fn handle_sell_amount(&self, chat_id: i64, user: &User, text: &str) {
        let Some(value) = parse_positive_number(text) else {
            self.reply(chat_id, INVALID_NUMBER).await;
            return;
        };
        let Some(token) = self.active_token(chat_id) else {
            self.sessions.set_pending(chat_id, PendingInput::Idle);
            self.reply(chat_id, notify::NO_ACTIVE_TOKEN).await;
            return;
        };
        self.sessions.set_pending(chat_id, PendingInput::Idle);

        let amount = to_base_units(value, token.decimals);
        self.reply(chat_id, &format!("Transaction is pending now ({value} {})", token.label()))
            .await;
        self.pipeline.execute_sell(user, &token, amount).await;
    }

    async fn handle_sell_ratio(&self, chat_id: i64, user: &User, text: &str) {
        let ratio = match parse_positive_number(text) {
            Some(r) if r <= 100.0 => r,
            _ => {
                // Re-prompt without advancing state; no dispatch happens.
                self.reply(chat_id, INVALID_RATIO).await;
                return;
            }
        };
        let Some(token) = self.active_token(chat_id) else {
            self.sessions.set_pending(chat_id, PendingInput::Idle);
            self.reply(chat_id, notify::NO_ACTIVE_TOKEN).await;
            return;
        };

        let balance = match self
            .chain
            .token_balance(&user.wallet.public_key, &token.address)
            .await
        {
            Ok(balance) => balance,
            Err(e) => {
                self.sessions.set_pending(chat_id, PendingInput::Idle);
                self.reply(chat_id, &e.to_string()).await;
                return;
            }
        };
        let amount = ratio_amount(balance, ratio);
        if amount == 0 {
            self.sessions.set_pending(chat_id, PendingInput::Idle);
            self.reply(chat_id, "🙅 Insufficient token balance.").await;
            return;
        }

        self.sessions.set_pending(chat_id, PendingInput::Idle);
        self.reply(chat_id, &format!("Transaction is pending now ({ratio}% of balance)"))
            .await;
        self.pipeline.execute_sell(user, &token, amount).await;
    }

    async fn handle_transfer_address(
        &self,
        chat_id: i64,
        user: &User,
        kind: TransferKind,
        text: &str,
    ) {
        if !is_valid_wallet_address(text) {
            self.reply(chat_id, INVALID_ADDRESS).await;
            return;
        }
        let destination = text.trim();

        match kind {
            TransferKind::Native => {
                self.sessions.set_pending(chat_id, PendingInput::Idle);
                self.reply(chat_id, "Transfer transaction is pending").await;
                self.pipeline.execute_native_transfer(user, destination).await;
            }
            TransferKind::Token => {
                let Some(token) = self.active_token(chat_id) else {
                    self.sessions.set_pending(chat_id, PendingInput::Idle);
                    self.reply(chat_id, notify::NO_ACTIVE_TOKEN).await;
                    return;
                };
                self.sessions.set_pending(chat_id, PendingInput::Idle);
                self.reply(chat_id, "Transfer transaction is pending").await;
                self.pipeline
                    .execute_token_transfer(user, &token, destination)
                    .await;
            }
        }
    }

    async fn handle_setting_value(
        &self,
        chat_id: i64,
        mut user: User,
        field: SettingField,
        text: &str,
    ) {
        let Some(value) = parse_positive_number(text) else {
            self.reply(chat_id, INVALID_NUMBER).await;
            return;
        };

        match field {
            SettingField::SnipeAmount => {
                user.params.snipe_amount_lamports = to_base_units(value, 9);
            }
            SettingField::PriorityFee => {
                user.params.priority_fee_lamports = to_base_units(value, 9);
            }
            SettingField::SlippageBps => {
                if value > 10_000.0 {
                    self.reply(chat_id, "Slippage must be at most 10000 bps.").await;
                    return;
                }
                user.params.slippage_bps = value as u16;
            }
            SettingField::RelayTip => {
                user.params.relay_tip_lamports = to_base_units(value, 9);
            }
        }

        self.sessions.set_pending(chat_id, PendingInput::Idle);
        if let Err(e) = self.store.save_user(&user).await {
            error!(chat_id, error = %e, "failed to save settings");
            self.reply(chat_id, "Could not save the setting. Please try again.").await;
            return;
        }
        self.reply(chat_id, &notify::settings_text(&user)).await;
    }

    async fn handle_watch_profile(
        &self,
        chat_id: i64,
        mut user: User,
        action: WatchAction,
        text: &str,
    ) {
        let mut parts = text.split_whitespace();
        let Some(handle) = parts.next() else {
            self.reply(chat_id, "Please enter a profile id or handle.").await;
            return;
        };

        match action {
            WatchAction::Add => {
                let priority = parts.next() == Some("1");
                user.watched_profiles.push(crate::core::types::WatchedProfile {
                    id: handle.to_string(),
                    handle: handle.to_string(),
                    priority,
                });
                if user.watched_profiles.len() > MAX_WATCHED_PROFILES {
                    user.watched_profiles.remove(0);
                }
            }
            WatchAction::Remove => {
                user.watched_profiles
                    .retain(|p| p.id != handle && p.handle != handle);
            }
        }

        self.sessions.set_pending(chat_id, PendingInput::Idle);
        if let Err(e) = self.store.save_user(&user).await {
            error!(chat_id, error = %e, "failed to save watch-list");
            self.reply(chat_id, "Could not update the watch-list. Please try again.").await;
            return;
        }
        self.reply(chat_id, &profiles_text(&user)).await;
    }

    /// Inbound callback label from an inline keyboard.
    #[instrument(skip(self))]
    pub async fn handle_callback(&self, chat_id: i64, message_id: i64, label: &str) {
        if label == "close" {
            if let Err(e) = self.notifier.delete_message(chat_id, message_id).await {
                debug!(chat_id, error = %e, "could not delete message");
            }
            return;
        }

        let Some(user) = self.find_user(chat_id).await else {
            self.sessions.set_pending(chat_id, PendingInput::Idle);
            self.reply(chat_id, USER_NOT_FOUND).await;
            return;
        };

        match label {
            "wallet" => self.reply(chat_id, &notify::wallet_text(&user)).await,
            "settings" => self.reply(chat_id, &notify::settings_text(&user)).await,

            "toggle alerts" | "toggle auto" | "toggle mev" => {
                self.toggle_flag(chat_id, message_id, user, label).await
            }

            "set snipe" => {
                self.prompt_setting(chat_id, SettingField::SnipeAmount, "✍ Enter the SOL amount to use for default buys.")
                    .await
            }
            "set priority" => {
                self.prompt_setting(chat_id, SettingField::PriorityFee, "✍ Enter the priority fee in SOL.")
                    .await
            }
            "set slippage" => {
                self.prompt_setting(chat_id, SettingField::SlippageBps, "✍ Enter the slippage in bps.")
                    .await
            }
            "set tip" => {
                self.prompt_setting(chat_id, SettingField::RelayTip, "✍ Enter the relay tip in SOL.")
                    .await
            }

            "profile add" => {
                self.sessions
                    .set_pending(chat_id, PendingInput::WatchProfile(WatchAction::Add));
                self.reply(chat_id, "Enter: profile_handle priority(0 or 1)\ne.g. vako_dev 1")
                    .await;
            }
            "profile remove" => {
                self.sessions
                    .set_pending(chat_id, PendingInput::WatchProfile(WatchAction::Remove));
                self.reply(chat_id, "Enter the id or handle of the profile to remove.")
                    .await;
            }

            "buy x" => {
                self.sessions.set_pending(chat_id, PendingInput::BuyAmount);
                self.reply(chat_id, "✍ Enter the amount you want to buy, in SOL.").await;
            }
            "sell x" => {
                self.sessions.set_pending(chat_id, PendingInput::SellAmount);
                self.reply(chat_id, "✍ Enter the token amount you want to sell.").await;
            }
            "sell ratio" => {
                self.sessions.set_pending(chat_id, PendingInput::SellRatio);
                self.reply(chat_id, "✍ Enter the percentage to sell: 25 / 50 / 75 / 100.")
                    .await;
            }
            "withdraw" => {
                self.sessions
                    .set_pending(chat_id, PendingInput::TransferAddress(TransferKind::Native));
                self.reply(chat_id, "✍ Enter the destination wallet address.").await;
            }
            "send token" => {
                self.sessions
                    .set_pending(chat_id, PendingInput::TransferAddress(TransferKind::Token));
                self.reply(chat_id, "✍ Enter the destination wallet address.").await;
            }

            "buy default" => self.handle_default_buy(chat_id, &user).await,
            label if label.starts_with("buy ") => self.handle_fixed_buy(chat_id, &user, label).await,

            other => {
                debug!(chat_id, label = other, "unrecognized callback");
                self.reply(chat_id, notify::UNRECOGNIZED_COMMAND).await;
            }
        }
    }

    async fn toggle_flag(&self, chat_id: i64, message_id: i64, mut user: User, label: &str) {
        match label {
            "toggle alerts" => user.params.bot_alerts = !user.params.bot_alerts,
            "toggle auto" => user.params.auto_trade = !user.params.auto_trade,
            _ => user.params.mev_protect = !user.params.mev_protect,
        }
        if let Err(e) = self.store.save_user(&user).await {
            error!(chat_id, error = %e, "failed to save settings toggle");
            self.reply(chat_id, "Could not save the setting. Please try again.").await;
            return;
        }
        let text = notify::settings_text(&user);
        if self
            .notifier
            .edit_message(chat_id, message_id, &text)
            .await
            .is_err()
        {
            self.reply(chat_id, &text).await;
        }
    }

    async fn prompt_setting(&self, chat_id: i64, field: SettingField, prompt: &str) {
        self.sessions.set_pending(chat_id, PendingInput::Setting(field));
        self.reply(chat_id, prompt).await;
    }

    /// One-tap buy with the configured default amount. A zero default is
    /// refused with a pointer to the settings, never a silent no-op.
    async fn handle_default_buy(&self, chat_id: i64, user: &User) {
        let Some(token) = self.active_token(chat_id) else {
            self.reply(chat_id, notify::NO_ACTIVE_TOKEN).await;
            return;
        };
        let amount = user.params.snipe_amount_lamports;
        if amount == 0 {
            self.reply(chat_id, notify::DEFAULT_AMOUNT_UNSET).await;
            return;
        }
        self.reply(chat_id, &notify::pending_text(amount as f64 / LAMPORTS_PER_SOL as f64))
            .await;
        self.pipeline.execute_buy(user, &token, amount).await;
    }

    /// "buy 0.5"-style labels with a literal SOL amount.
    async fn handle_fixed_buy(&self, chat_id: i64, user: &User, label: &str) {
        let Some(value) = label
            .strip_prefix("buy ")
            .and_then(parse_positive_number)
        else {
            self.reply(chat_id, notify::UNRECOGNIZED_COMMAND).await;
            return;
        };
        let Some(token) = self.active_token(chat_id) else {
            self.reply(chat_id, notify::NO_ACTIVE_TOKEN).await;
            return;
        };
        let amount = to_base_units(value, 9);
        self.reply(chat_id, &notify::pending_text(value)).await;
        self.pipeline.execute_buy(user, &token, amount).await;
    }
}

fn profiles_text(user: &User) -> String {
    if user.watched_profiles.is_empty() {
        return "No watched profiles yet. Use the profile menu to add one.".to_string();
    }
    let mut text = String::from("👁 Watched profiles:\n");
    for profile in &user.watched_profiles {
        text.push_str(&format!(
            "• {} ({})\n",
            profile.handle,
            if profile.priority { "priority" } else { "normal" }
        ));
    }
    text
}
