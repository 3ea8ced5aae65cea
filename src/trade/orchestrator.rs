use std::sync::Arc;
use std::time::Duration;

use solana_sdk::signature::Keypair;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::{debug, error, info, instrument, warn};

use crate::chain::rpc::ChainReader;
use crate::chain::wallet::{keypair_from_base58, sign_transaction};
use crate::chat::notify::{self, Notifier};
use crate::core::types::{
    TokenDescriptor, TradeDirection, TradeIntent, TradeResult, User, FEE_RESERVE_LAMPORTS,
    RENT_RESERVE_LAMPORTS,
};
use crate::error::TradeError;
use crate::store::UserStore;
use crate::trade::builder::{decode_swap_transaction, TransactionBuilder};
use crate::trade::delta::DeltaSource;
use crate::trade::quote::QuoteSource;
use crate::trade::submit::{SubmitStrategy, TxSubmitter};

/// Pipeline position of one trade run, used in logs and failure reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineStage {
    Idle,
    QuoteRequested,
    TransactionBuilt,
    Signed,
    Submitted,
    Confirmed,
    DeltaComputed,
    Done,
}

/// Settle window between confirmation and reading the transaction back.
const DELTA_SETTLE: Duration = Duration::from_millis(500);

/// Façade over the execution pipeline: quote, build, sign, submit, confirm,
/// delta. Used by the conversation state machine and by the signal fan-out.
///
/// The pipeline itself is pure with respect to the chat transport: each
/// `run_*` method returns exactly one `TradeResult`, and the `execute_*`
/// wrappers forward that single terminal outcome to the notifier.
pub struct TradePipeline {
    chain: Arc<dyn ChainReader>,
    quotes: Arc<dyn QuoteSource>,
    submitter: Arc<dyn TxSubmitter>,
    deltas: Arc<dyn DeltaSource>,
    builder: TransactionBuilder,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn UserStore>,
    fanout_limit: usize,
}

impl TradePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        chain: Arc<dyn ChainReader>,
        quotes: Arc<dyn QuoteSource>,
        submitter: Arc<dyn TxSubmitter>,
        deltas: Arc<dyn DeltaSource>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn UserStore>,
        fanout_limit: usize,
    ) -> Self {
        Self {
            builder: TransactionBuilder::new(Arc::clone(&chain)),
            chain,
            quotes,
            submitter,
            deltas,
            notifier,
            store,
            fanout_limit,
        }
    }

    /// Spendable balance of the intent's input side, read fresh.
    async fn spendable(&self, user: &User, intent: &TradeIntent) -> Result<u64, TradeError> {
        match intent.direction {
            TradeDirection::Buy => {
                let balance = self.chain.native_balance(&user.wallet.public_key).await?;
                Ok(balance.saturating_sub(RENT_RESERVE_LAMPORTS))
            }
            TradeDirection::Sell => {
                self.chain
                    .token_balance(&user.wallet.public_key, &intent.input_mint)
                    .await
            }
        }
    }

    fn submit_strategy(&self, user: &User, intent: &TradeIntent) -> Result<SubmitStrategy, TradeError> {
        if intent.mev_protect {
            let tip_payer: Keypair = keypair_from_base58(&user.wallet.private_key)?;
            Ok(SubmitStrategy::Bundle {
                tip_payer,
                tip_lamports: intent.relay_tip_lamports,
            })
        } else {
            Ok(SubmitStrategy::Direct)
        }
    }

    /// Runs one swap intent to its single terminal `TradeResult`.
    ///
    /// Any failure is converted, never propagated: the process is not allowed
    /// to die because one user's trade went wrong.
    #[instrument(skip(self, user, intent), fields(chat_id = user.chat_id, direction = ?intent.direction, amount = intent.amount))]
    pub async fn run_swap(&self, user: &User, intent: &TradeIntent) -> TradeResult {
        let mut stage = PipelineStage::Idle;

        if intent.amount == 0 {
            return TradeResult::failure(notify::DEFAULT_AMOUNT_UNSET, "");
        }

        // Fail fast on balance before any aggregator call is made.
        let spendable = match self.spendable(user, intent).await {
            Ok(spendable) => spendable,
            Err(e) => return self.abort(stage, e, ""),
        };
        if spendable < intent.amount {
            return self.abort(
                stage,
                TradeError::InsufficientBalance {
                    needed: intent.amount,
                    available: spendable,
                },
                "",
            );
        }

        stage = PipelineStage::QuoteRequested;
        let quote = match self
            .quotes
            .get_quote(
                &intent.input_mint,
                &intent.output_mint,
                intent.amount,
                intent.slippage_bps,
            )
            .await
        {
            Ok(quote) => quote,
            Err(e) => return self.abort(stage, e, ""),
        };

        stage = PipelineStage::TransactionBuilt;
        let swap_payload = match self
            .quotes
            .get_swap_transaction(&quote, &user.wallet.public_key, intent.priority_fee_lamports)
            .await
        {
            Ok(payload) => payload,
            Err(e) => return self.abort(stage, e, ""),
        };
        let mut transaction = match decode_swap_transaction(&swap_payload) {
            Ok(tx) => tx,
            Err(e) => return self.abort(stage, e, ""),
        };

        stage = PipelineStage::Signed;
        let keypair = match keypair_from_base58(&user.wallet.private_key) {
            Ok(keypair) => keypair,
            Err(e) => return self.abort(stage, e, ""),
        };
        sign_transaction(&mut transaction, &keypair);

        // Pipeline latency can span seconds; re-check the balance right
        // before anything reaches the chain.
        match self.spendable(user, intent).await {
            Ok(spendable) if spendable < intent.amount => {
                return self.abort(
                    stage,
                    TradeError::InsufficientBalance {
                        needed: intent.amount,
                        available: spendable,
                    },
                    "",
                );
            }
            Ok(_) => {}
            Err(e) => return self.abort(stage, e, ""),
        }

        stage = PipelineStage::Submitted;
        let strategy = match self.submit_strategy(user, intent) {
            Ok(strategy) => strategy,
            Err(e) => return self.abort(stage, e, ""),
        };
        let signature = match self.submitter.submit_and_confirm(transaction, strategy).await {
            Ok(signature) => signature.to_string(),
            Err(e) => return self.abort(stage, e, ""),
        };

        stage = PipelineStage::Confirmed;
        debug!(?stage, %signature, "letting the transaction settle before the delta read");
        sleep(DELTA_SETTLE).await;

        stage = PipelineStage::DeltaComputed;
        let delta = match self
            .deltas
            .compute_delta(&signature, &intent.input_mint, &intent.output_mint)
            .await
        {
            Ok(delta) => delta,
            Err(e) => return self.abort(stage, e, &signature),
        };

        info!(
            stage = ?PipelineStage::Done,
            signature = %signature,
            amount_in = delta.amount_in,
            amount_out = delta.amount_out,
            "✅ trade pipeline completed"
        );
        TradeResult {
            success: true,
            signature,
            message: String::new(),
            amount_in: delta.amount_in,
            amount_out: delta.amount_out,
        }
    }

    fn abort(&self, stage: PipelineStage, error: TradeError, signature: &str) -> TradeResult {
        warn!(?stage, error = %error, "trade pipeline aborted");
        TradeResult::failure(error.to_string(), signature)
    }

    /// Buys `amount` lamports worth of `token` and reports the single
    /// terminal outcome to the user.
    pub async fn execute_buy(&self, user: &User, token: &TokenDescriptor, amount: u64) -> TradeResult {
        let intent = TradeIntent::buy(token, amount, &user.params);
        let result = self.run_swap(user, &intent).await;
        self.notify_swap_outcome(user, token, &intent, &result).await;
        result
    }

    /// Sells `amount` base units of `token` back into the native asset.
    pub async fn execute_sell(&self, user: &User, token: &TokenDescriptor, amount: u64) -> TradeResult {
        let intent = TradeIntent::sell(token, amount, &user.params);
        let result = self.run_swap(user, &intent).await;
        self.notify_swap_outcome(user, token, &intent, &result).await;
        result
    }

    async fn notify_swap_outcome(
        &self,
        user: &User,
        token: &TokenDescriptor,
        intent: &TradeIntent,
        result: &TradeResult,
    ) {
        let text = if result.success {
            match intent.direction {
                TradeDirection::Buy => {
                    notify::buy_success_text(token, &result.signature, result.amount_in, result.amount_out)
                }
                TradeDirection::Sell => {
                    notify::sell_success_text(token, &result.signature, result.amount_in, result.amount_out)
                }
            }
        } else {
            result.message.clone()
        };
        if let Err(e) = self.notifier.send_message(user.chat_id, &text).await {
            error!(chat_id = user.chat_id, error = %e, "failed to deliver trade outcome");
        }
    }

    /// Transfers the user's full balance of `token` to `destination`.
    pub async fn execute_token_transfer(
        &self,
        user: &User,
        token: &TokenDescriptor,
        destination: &str,
    ) -> TradeResult {
        let result = self.token_transfer_inner(user, token, destination).await;
        let text = if result.success {
            let display = format!(
                "{:.4} {}",
                notify::ui_amount(result.amount_in, token.decimals),
                token.label()
            );
            notify::transfer_success_text(&display, destination, &result.signature)
        } else {
            result.message.clone()
        };
        if let Err(e) = self.notifier.send_message(user.chat_id, &text).await {
            error!(chat_id = user.chat_id, error = %e, "failed to deliver transfer outcome");
        }
        result
    }

    async fn token_transfer_inner(
        &self,
        user: &User,
        token: &TokenDescriptor,
        destination: &str,
    ) -> TradeResult {
        let balance = match self
            .chain
            .token_balance(&user.wallet.public_key, &token.address)
            .await
        {
            Ok(balance) => balance,
            Err(e) => return self.abort(PipelineStage::Idle, e, ""),
        };
        if balance == 0 {
            return self.abort(
                PipelineStage::Idle,
                TradeError::InsufficientBalance {
                    needed: 1,
                    available: 0,
                },
                "",
            );
        }

        let built = self
            .builder
            .build_token_transfer(
                &token.address,
                &user.wallet.public_key,
                destination,
                balance,
                user.params.priority_fee_lamports,
            )
            .await;
        let mut transaction = match built {
            Ok(tx) => tx,
            Err(e) => return self.abort(PipelineStage::TransactionBuilt, e, ""),
        };

        let keypair = match keypair_from_base58(&user.wallet.private_key) {
            Ok(keypair) => keypair,
            Err(e) => return self.abort(PipelineStage::Signed, e, ""),
        };
        sign_transaction(&mut transaction, &keypair);

        match self
            .submitter
            .submit_and_confirm(transaction, SubmitStrategy::Direct)
            .await
        {
            Ok(signature) => TradeResult {
                success: true,
                signature: signature.to_string(),
                message: String::new(),
                amount_in: balance,
                amount_out: 0,
            },
            Err(e) => self.abort(PipelineStage::Submitted, e, ""),
        }
    }

    /// Withdraws the full native balance, minus the fee reserve, to
    /// `destination`.
    pub async fn execute_native_transfer(&self, user: &User, destination: &str) -> TradeResult {
        let result = self.native_transfer_inner(user, destination).await;
        let text = if result.success {
            let display = format!("{} SOL", notify::ui_amount(result.amount_in, 9));
            notify::transfer_success_text(&display, destination, &result.signature)
        } else {
            result.message.clone()
        };
        if let Err(e) = self.notifier.send_message(user.chat_id, &text).await {
            error!(chat_id = user.chat_id, error = %e, "failed to deliver transfer outcome");
        }
        result
    }

    async fn native_transfer_inner(&self, user: &User, destination: &str) -> TradeResult {
        let balance = match self.chain.native_balance(&user.wallet.public_key).await {
            Ok(balance) => balance,
            Err(e) => return self.abort(PipelineStage::Idle, e, ""),
        };
        if balance <= FEE_RESERVE_LAMPORTS {
            return self.abort(
                PipelineStage::Idle,
                TradeError::InsufficientBalance {
                    needed: FEE_RESERVE_LAMPORTS + 1,
                    available: balance,
                },
                "",
            );
        }
        let lamports = balance - FEE_RESERVE_LAMPORTS;

        let built = self
            .builder
            .build_native_transfer(
                &user.wallet.public_key,
                destination,
                lamports,
                user.params.priority_fee_lamports,
            )
            .await;
        let mut transaction = match built {
            Ok(tx) => tx,
            Err(e) => return self.abort(PipelineStage::TransactionBuilt, e, ""),
        };

        let keypair = match keypair_from_base58(&user.wallet.private_key) {
            Ok(keypair) => keypair,
            Err(e) => return self.abort(PipelineStage::Signed, e, ""),
        };
        sign_transaction(&mut transaction, &keypair);

        match self
            .submitter
            .submit_and_confirm(transaction, SubmitStrategy::Direct)
            .await
        {
            Ok(signature) => TradeResult {
                success: true,
                signature: signature.to_string(),
                message: String::new(),
                amount_in: lamports,
                amount_out: 0,
            },
            Err(e) => self.abort(PipelineStage::Submitted, e, ""),
        }
    }

    /// Runs one independent buy pipeline per eligible user when the signal
    /// feed reports a candidate token.
    ///
    /// Eligibility: alerts on, auto-trade on, positive default amount. Each
    /// user's run is an isolated task inside a bounded worker pool; one
    /// user's failure never aborts or delays another's run.
    #[instrument(skip(self, token), fields(mint = %token.address))]
    pub async fn execute_for_all_eligible(self: &Arc<Self>, token: &TokenDescriptor) {
        let users = match self.store.auto_trade_users().await {
            Ok(users) => users,
            Err(e) => {
                error!(error = %e, "could not load eligible users for fan-out");
                return;
            }
        };
        if users.is_empty() {
            debug!("no eligible users for signal fan-out");
            return;
        }
        info!(users = users.len(), "⚡ fanning out signal trade");

        let semaphore = Arc::new(Semaphore::new(self.fanout_limit));
        let mut handles = Vec::with_capacity(users.len());
        for user in users {
            let pipeline = Arc::clone(self);
            let token = token.clone();
            let semaphore = Arc::clone(&semaphore);
            handles.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let amount = user.params.snipe_amount_lamports;
                pipeline.execute_buy(&user, &token, amount).await;
            }));
        }
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "fan-out task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine as _;
    use solana_sdk::hash::Hash;
    use solana_sdk::message::{v0, VersionedMessage};
    use solana_sdk::pubkey::Pubkey;
    use solana_sdk::signature::Signature;
    use solana_sdk::transaction::VersionedTransaction;
    use solana_transaction_status::EncodedConfirmedTransactionWithStatusMeta;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use crate::chain::wallet::generate_wallet;
    use crate::core::types::TradeDelta;
    use crate::store::MemoryUserStore;
    use crate::trade::quote::QuoteResponse;
    use crate::trade::submit::wait_for_terminal_status;

    struct FakeChain {
        native: u64,
        token: u64,
    }

    #[async_trait]
    impl ChainReader for FakeChain {
        async fn native_balance(&self, _owner: &str) -> Result<u64, TradeError> {
            Ok(self.native)
        }
        async fn token_balance(&self, _owner: &str, _mint: &str) -> Result<u64, TradeError> {
            Ok(self.token)
        }
        async fn token_info(&self, _mint: &str) -> Result<TokenDescriptor, TradeError> {
            unimplemented!()
        }
        async fn account_exists(&self, _address: &str) -> Result<bool, TradeError> {
            Ok(true)
        }
        async fn latest_blockhash(&self) -> Result<Hash, TradeError> {
            Ok(Hash::default())
        }
        async fn token_account_mint(&self, _address: &str) -> Result<Option<String>, TradeError> {
            Ok(None)
        }
        async fn parsed_transaction(
            &self,
            _signature: &str,
        ) -> Result<EncodedConfirmedTransactionWithStatusMeta, TradeError> {
            unimplemented!()
        }
    }

    /// Quote source that counts calls and can hand a broken payload to one
    /// specific payer.
    struct FakeQuotes {
        quote_calls: AtomicUsize,
        broken_payer: Option<String>,
    }

    impl FakeQuotes {
        fn new() -> Self {
            Self {
                quote_calls: AtomicUsize::new(0),
                broken_payer: None,
            }
        }

        fn broken_for(payer: &str) -> Self {
            Self {
                quote_calls: AtomicUsize::new(0),
                broken_payer: Some(payer.to_string()),
            }
        }

        fn quote(input_mint: &str, output_mint: &str, amount: u64) -> QuoteResponse {
            QuoteResponse {
                input_mint: input_mint.to_string(),
                in_amount: amount.to_string(),
                output_mint: output_mint.to_string(),
                out_amount: "1000".to_string(),
                other_amount_threshold: "990".to_string(),
                swap_mode: "ExactIn".to_string(),
                slippage_bps: 50,
                platform_fee: None,
                price_impact_pct: "0.01".to_string(),
                route_plan: vec![],
                context_slot: 0,
                time_taken: 0.0,
            }
        }
    }

    #[async_trait]
    impl QuoteSource for FakeQuotes {
        async fn get_quote(
            &self,
            input_mint: &str,
            output_mint: &str,
            amount: u64,
            _slippage_bps: u16,
        ) -> Result<QuoteResponse, TradeError> {
            self.quote_calls.fetch_add(1, Ordering::SeqCst);
            Ok(Self::quote(input_mint, output_mint, amount))
        }

        async fn get_swap_transaction(
            &self,
            _quote: &QuoteResponse,
            payer_public_key: &str,
            _priority_fee_lamports: u64,
        ) -> Result<String, TradeError> {
            if self.broken_payer.as_deref() == Some(payer_public_key) {
                return Ok("@@broken@@".to_string());
            }
            let payer = Pubkey::from_str(payer_public_key).unwrap();
            let message = v0::Message::try_compile(&payer, &[], &[], Hash::default()).unwrap();
            let tx = VersionedTransaction {
                signatures: vec![Signature::default()],
                message: VersionedMessage::V0(message),
            };
            Ok(BASE64.encode(bincode::serialize(&tx).unwrap()))
        }

        async fn token_price(&self, _mint: &str) -> Result<Option<f64>, TradeError> {
            Ok(None)
        }
    }

    struct FakeSubmitter {
        submissions: AtomicUsize,
    }

    #[async_trait]
    impl TxSubmitter for FakeSubmitter {
        async fn submit_and_confirm(
            &self,
            transaction: VersionedTransaction,
            _strategy: SubmitStrategy,
        ) -> Result<Signature, TradeError> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            Ok(transaction.signatures[0])
        }
    }

    /// Submitter whose confirmation never arrives inside a short bound.
    struct StalledSubmitter;

    #[async_trait]
    impl TxSubmitter for StalledSubmitter {
        async fn submit_and_confirm(
            &self,
            _transaction: VersionedTransaction,
            _strategy: SubmitStrategy,
        ) -> Result<Signature, TradeError> {
            wait_for_terminal_status(Duration::from_millis(50), || async { Ok(None) }).await?;
            unreachable!("status never arrives");
        }
    }

    struct FakeDeltas;

    #[async_trait]
    impl DeltaSource for FakeDeltas {
        async fn compute_delta(
            &self,
            _signature: &str,
            _input_mint: &str,
            _output_mint: &str,
        ) -> Result<TradeDelta, TradeError> {
            Ok(TradeDelta {
                amount_in: 1_000_000_000,
                amount_out: 250_000,
            })
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        messages: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_message(&self, chat_id: i64, text: &str) -> anyhow::Result<()> {
            self.messages.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }
        async fn edit_message(&self, _c: i64, _m: i64, _t: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn delete_message(&self, _c: i64, _m: i64) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn token() -> TokenDescriptor {
        TokenDescriptor {
            address: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".to_string(),
            symbol: "USDC".to_string(),
            name: "USD Coin".to_string(),
            decimals: 6,
            risk: 0,
            price_usd: Some(1.0),
        }
    }

    fn user_with_wallet(chat_id: i64) -> User {
        let mut user = User::new(chat_id, "tester", generate_wallet());
        user.params.snipe_amount_lamports = 100_000_000;
        user
    }

    struct Harness {
        pipeline: Arc<TradePipeline>,
        quotes: Arc<FakeQuotes>,
        notifier: Arc<RecordingNotifier>,
    }

    fn harness(chain: FakeChain, quotes: FakeQuotes, submitter: Arc<dyn TxSubmitter>) -> Harness {
        let quotes = Arc::new(quotes);
        let notifier = Arc::new(RecordingNotifier::default());
        let store = Arc::new(MemoryUserStore::new());
        let pipeline = Arc::new(TradePipeline::new(
            Arc::new(chain),
            Arc::clone(&quotes) as Arc<dyn QuoteSource>,
            submitter,
            Arc::new(FakeDeltas),
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            store as Arc<dyn UserStore>,
            4,
        ));
        Harness {
            pipeline,
            quotes,
            notifier,
        }
    }

    #[tokio::test]
    async fn insufficient_balance_aborts_with_zero_quote_calls() {
        let h = harness(
            FakeChain {
                native: 10_000_000, // below the rent reserve
                token: 0,
            },
            FakeQuotes::new(),
            Arc::new(FakeSubmitter {
                submissions: AtomicUsize::new(0),
            }),
        );
        let user = user_with_wallet(1);

        let result = h.pipeline.execute_buy(&user, &token(), 1_000_000_000).await;

        assert!(!result.success);
        assert!(result.signature.is_empty());
        assert_eq!(h.quotes.quote_calls.load(Ordering::SeqCst), 0);
        // Exactly one terminal message.
        assert_eq!(h.notifier.messages.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completed_buy_reports_one_success_with_signature() {
        let h = harness(
            FakeChain {
                native: 10_000_000_000,
                token: 0,
            },
            FakeQuotes::new(),
            Arc::new(FakeSubmitter {
                submissions: AtomicUsize::new(0),
            }),
        );
        let user = user_with_wallet(2);

        let result = h.pipeline.execute_buy(&user, &token(), 1_000_000_000).await;

        assert!(result.success);
        assert!(!result.signature.is_empty());
        assert_eq!(result.amount_out, 250_000);
        let messages = h.notifier.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.contains("🟢"));
    }

    #[tokio::test]
    async fn zero_amount_is_refused_without_any_external_call() {
        let h = harness(
            FakeChain {
                native: 10_000_000_000,
                token: 0,
            },
            FakeQuotes::new(),
            Arc::new(FakeSubmitter {
                submissions: AtomicUsize::new(0),
            }),
        );
        let mut user = user_with_wallet(3);
        user.params.snipe_amount_lamports = 0;

        let result = h.pipeline.execute_buy(&user, &token(), 0).await;

        assert!(!result.success);
        assert_eq!(h.quotes.quote_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stalled_confirmation_surfaces_a_timeout_not_a_hang() {
        let h = harness(
            FakeChain {
                native: 10_000_000_000,
                token: 0,
            },
            FakeQuotes::new(),
            Arc::new(StalledSubmitter),
        );
        let user = user_with_wallet(4);

        let result = h.pipeline.execute_buy(&user, &token(), 1_000_000_000).await;

        assert!(!result.success);
        assert!(result.message.contains("not confirmed"));
    }

    #[tokio::test]
    async fn one_failing_user_does_not_stop_the_fanout() {
        let store = Arc::new(MemoryUserStore::new());
        let mut broken_pubkey = String::new();
        for chat_id in 1..=5 {
            let mut user = user_with_wallet(chat_id);
            user.params.bot_alerts = true;
            user.params.auto_trade = true;
            if chat_id == 3 {
                broken_pubkey = user.wallet.public_key.clone();
            }
            store.save_user(&user).await.unwrap();
        }

        let quotes = Arc::new(FakeQuotes::broken_for(&broken_pubkey));
        let notifier = Arc::new(RecordingNotifier::default());
        let pipeline = Arc::new(TradePipeline::new(
            Arc::new(FakeChain {
                native: 10_000_000_000,
                token: 0,
            }),
            Arc::clone(&quotes) as Arc<dyn QuoteSource>,
            Arc::new(FakeSubmitter {
                submissions: AtomicUsize::new(0),
            }),
            Arc::new(FakeDeltas),
            Arc::clone(&notifier) as Arc<dyn Notifier>,
            Arc::clone(&store) as Arc<dyn UserStore>,
            4,
        ));

        pipeline.execute_for_all_eligible(&token()).await;

        let messages = notifier.messages.lock().unwrap();
        assert_eq!(messages.len(), 5);
        let successes = messages.iter().filter(|(_, t)| t.contains("🟢")).count();
        let failures = messages.iter().filter(|(_, t)| !t.contains("🟢")).count();
        assert_eq!(successes, 4);
        assert_eq!(failures, 1);
        // The failing user is chat 3 and got the build failure.
        let failed = messages.iter().find(|(_, t)| !t.contains("🟢")).unwrap();
        assert_eq!(failed.0, 3);
    }

    #[tokio::test]
    async fn native_withdrawal_keeps_the_fee_reserve() {
        let h = harness(
            FakeChain {
                native: 1_000_000_000,
                token: 0,
            },
            FakeQuotes::new(),
            Arc::new(FakeSubmitter {
                submissions: AtomicUsize::new(0),
            }),
        );
        let user = user_with_wallet(6);

        let result = h
            .pipeline
            .execute_native_transfer(&user, "Stake11111111111111111111111111111111111111")
            .await;

        assert!(result.success);
        assert_eq!(result.amount_in, 1_000_000_000 - FEE_RESERVE_LAMPORTS);
    }
}
