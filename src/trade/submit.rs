use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde_json::{json, Value};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_config::RpcSendTransactionConfig;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::message::{v0, VersionedMessage};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature, Signer};
use solana_sdk::system_instruction;
use solana_sdk::transaction::VersionedTransaction;
use solana_transaction_status::{TransactionConfirmationStatus, TransactionStatus};
use std::str::FromStr;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::TradeError;

/// How a signed transaction reaches the chain.
pub enum SubmitStrategy {
    /// Plain broadcast with bounded transport-level retries.
    Direct,
    /// Bundled through the block-engine relay with a tip transaction, for
    /// front-running protection.
    Bundle {
        tip_payer: Keypair,
        tip_lamports: u64,
    },
}

/// Submission seam consumed by the orchestrator.
///
/// Implementations submit the signed transaction and track it to a terminal
/// status inside a bounded window. A timeout is terminal for the pipeline:
/// blockhash and route data have expired, so the caller must re-run the whole
/// pipeline rather than resubmit.
#[async_trait]
pub trait TxSubmitter: Send + Sync {
    async fn submit_and_confirm(
        &self,
        transaction: VersionedTransaction,
        strategy: SubmitStrategy,
    ) -> Result<Signature, TradeError>;
}

/// Polls for a terminal status until `bound` elapses.
///
/// The wait is the pipeline's primary suspension point and must never block
/// other users' runs, hence the hard timeout instead of an open-ended
/// subscription.
pub(crate) async fn wait_for_terminal_status<F, Fut>(
    bound: Duration,
    mut poll: F,
) -> Result<(), TradeError>
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = Result<Option<TransactionStatus>, TradeError>> + Send,
{
    let wait = async {
        loop {
            if let Some(status) = poll().await? {
                if let Some(err) = status.err {
                    return Err(TradeError::OnChainError(err.to_string()));
                }
                if matches!(
                    status.confirmation_status,
                    Some(TransactionConfirmationStatus::Confirmed)
                        | Some(TransactionConfirmationStatus::Finalized)
                ) {
                    return Ok(());
                }
            }
            sleep(Duration::from_millis(500)).await;
        }
    };
    match timeout(bound, wait).await {
        Ok(result) => result,
        Err(_) => Err(TradeError::ConfirmationTimeout),
    }
}

/// Submits directly to an RPC node or through the block-engine relay, then
/// tracks confirmation.
pub struct RelaySubmitter {
    rpc: Arc<RpcClient>,
    http: reqwest::Client,
    block_engine_url: String,
    confirm_timeout: Duration,
    max_retries: usize,
}

impl RelaySubmitter {
    pub fn new(
        rpc_url: &str,
        block_engine_url: &str,
        confirm_timeout_secs: u64,
        max_retries: usize,
    ) -> Self {
        Self {
            rpc: Arc::new(RpcClient::new_with_commitment(
                rpc_url.to_string(),
                CommitmentConfig::confirmed(),
            )),
            http: reqwest::Client::new(),
            block_engine_url: block_engine_url.trim_end_matches('/').to_string(),
            confirm_timeout: Duration::from_secs(confirm_timeout_secs),
            max_retries,
        }
    }

    async fn block_engine_call(&self, method: &str, params: Value) -> Result<Value, TradeError> {
        let url = format!("{}/api/v1/bundles", self.block_engine_url);
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TradeError::SubmissionRejected(e.to_string()))?;
        let body: Value = response
            .json()
            .await
            .map_err(|e| TradeError::SubmissionRejected(e.to_string()))?;

        if let Some(error) = body.get("error") {
            let message = error["message"].as_str().unwrap_or("relay error");
            return Err(TradeError::SubmissionRejected(message.to_string()));
        }
        Ok(body["result"].clone())
    }

    async fn random_tip_account(&self) -> Result<Pubkey, TradeError> {
        let result = self.block_engine_call("getTipAccounts", json!([])).await?;
        let accounts: Vec<String> = serde_json::from_value(result)
            .map_err(|_| TradeError::SubmissionRejected("no tip accounts returned".to_string()))?;
        let picked = accounts
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| TradeError::SubmissionRejected("no tip accounts returned".to_string()))?;
        Pubkey::from_str(picked)
            .map_err(|_| TradeError::SubmissionRejected("malformed tip account".to_string()))
    }

    async fn build_tip_transaction(
        &self,
        tip_payer: &Keypair,
        tip_lamports: u64,
    ) -> Result<VersionedTransaction, TradeError> {
        let tip_account = self.random_tip_account().await?;
        let blockhash = self.rpc.get_latest_blockhash().await.map_err(TradeError::rpc)?;

        let transfer = system_instruction::transfer(&tip_payer.pubkey(), &tip_account, tip_lamports);
        let message = v0::Message::try_compile(&tip_payer.pubkey(), &[transfer], &[], blockhash)
            .map_err(|e| TradeError::SubmissionRejected(format!("tip assembly failed: {e}")))?;
        VersionedTransaction::try_new(VersionedMessage::V0(message), &[tip_payer])
            .map_err(|e| TradeError::SubmissionRejected(format!("tip signing failed: {e}")))
    }

    async fn send_bundle(
        &self,
        transactions: &[VersionedTransaction],
    ) -> Result<String, TradeError> {
        let encoded: Vec<String> = transactions
            .iter()
            .map(|tx| {
                bincode::serialize(tx)
                    .map(|bytes| bs58::encode(bytes).into_string())
                    .map_err(|e| TradeError::SubmissionRejected(e.to_string()))
            })
            .collect::<Result<_, _>>()?;

        let result = self.block_engine_call("sendBundle", json!([encoded])).await?;
        let bundle_id = result
            .as_str()
            .ok_or_else(|| TradeError::SubmissionRejected("relay returned no bundle id".to_string()))?
            .to_string();
        info!(bundle_id = %bundle_id, "📦 bundle accepted by relay");
        Ok(bundle_id)
    }

    async fn await_confirmation(&self, signature: Signature) -> Result<(), TradeError> {
        let rpc = Arc::clone(&self.rpc);
        wait_for_terminal_status(self.confirm_timeout, move || {
            let rpc = Arc::clone(&rpc);
            async move {
                let response = rpc
                    .get_signature_statuses(&[signature])
                    .await
                    .map_err(TradeError::rpc)?;
                Ok(response.value.into_iter().next().flatten())
            }
        })
        .await
    }
}

#[async_trait]
impl TxSubmitter for RelaySubmitter {
    async fn submit_and_confirm(
        &self,
        transaction: VersionedTransaction,
        strategy: SubmitStrategy,
    ) -> Result<Signature, TradeError> {
        let signature = transaction
            .signatures
            .first()
            .copied()
            .ok_or_else(|| TradeError::SubmissionRejected("unsigned transaction".to_string()))?;

        match strategy {
            SubmitStrategy::Direct => {
                debug!(%signature, "broadcasting directly");
                let config = RpcSendTransactionConfig {
                    skip_preflight: true,
                    max_retries: Some(self.max_retries),
                    ..RpcSendTransactionConfig::default()
                };
                self.rpc
                    .send_transaction_with_config(&transaction, config)
                    .await
                    .map_err(|e| TradeError::SubmissionRejected(e.to_string()))?;
            }
            SubmitStrategy::Bundle {
                tip_payer,
                tip_lamports,
            } => {
                debug!(%signature, tip_lamports, "submitting through relay");
                let tip = self.build_tip_transaction(&tip_payer, tip_lamports).await?;
                self.send_bundle(&[transaction, tip]).await?;
            }
        }

        match self.await_confirmation(signature).await {
            Ok(()) => {
                info!(%signature, "✅ transaction confirmed");
                Ok(signature)
            }
            Err(e) => {
                warn!(%signature, error = %e, "confirmation did not complete");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(
        err: Option<solana_sdk::transaction::TransactionError>,
        confirmation: Option<TransactionConfirmationStatus>,
    ) -> TransactionStatus {
        TransactionStatus {
            slot: 0,
            confirmations: Some(1),
            status: Ok(()),
            err,
            confirmation_status: confirmation,
        }
    }

    #[tokio::test]
    async fn times_out_when_no_terminal_status_arrives() {
        let result = wait_for_terminal_status(Duration::from_millis(50), || async {
            Ok(None)
        })
        .await;
        assert!(matches!(result, Err(TradeError::ConfirmationTimeout)));
    }

    #[tokio::test]
    async fn confirmed_status_terminates_the_wait() {
        let result = wait_for_terminal_status(Duration::from_secs(5), || async {
            Ok(Some(status(None, Some(TransactionConfirmationStatus::Confirmed))))
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn landed_but_reverted_is_an_on_chain_error() {
        let result = wait_for_terminal_status(Duration::from_secs(5), || async {
            Ok(Some(status(
                Some(solana_sdk::transaction::TransactionError::AccountNotFound),
                Some(TransactionConfirmationStatus::Confirmed),
            )))
        })
        .await;
        assert!(matches!(result, Err(TradeError::OnChainError(_))));
    }

    #[tokio::test]
    async fn processed_status_keeps_waiting_until_the_bound() {
        let result = wait_for_terminal_status(Duration::from_millis(50), || async {
            Ok(Some(status(None, Some(TransactionConfirmationStatus::Processed))))
        })
        .await;
        assert!(matches!(result, Err(TradeError::ConfirmationTimeout)));
    }
}
