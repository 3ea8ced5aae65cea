use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use solana_account_decoder::UiAccountData;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_request::TokenAccountsFilter;
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::hash::Hash;
use solana_sdk::program_pack::Pack;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_transaction_status::{EncodedConfirmedTransactionWithStatusMeta, UiTransactionEncoding};
use tracing::{debug, warn};

use crate::core::types::TokenDescriptor;
use crate::error::TradeError;

/// Read-side chain access used by the pipeline and the state machine.
///
/// Balances are always re-read at the moment of the check; nothing here is
/// cached across a pipeline run.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Native balance of a wallet, in lamports.
    async fn native_balance(&self, owner: &str) -> Result<u64, TradeError>;

    /// Balance of `mint` held by `owner`, in base units. A wallet without a
    /// token account for the mint holds zero.
    async fn token_balance(&self, owner: &str, mint: &str) -> Result<u64, TradeError>;

    /// Inspects a mint account: decimals plus the authority-derived risk
    /// score. Fails with a validation error when the address is not an SPL
    /// token mint.
    async fn token_info(&self, mint: &str) -> Result<TokenDescriptor, TradeError>;

    async fn account_exists(&self, address: &str) -> Result<bool, TradeError>;

    async fn latest_blockhash(&self) -> Result<Hash, TradeError>;

    /// Mint behind a token account, when the account still exists and parses
    /// as one.
    async fn token_account_mint(&self, address: &str) -> Result<Option<String>, TradeError>;

    /// Fetches a confirmed transaction in parsed encoding for delta
    /// computation.
    async fn parsed_transaction(
        &self,
        signature: &str,
    ) -> Result<EncodedConfirmedTransactionWithStatusMeta, TradeError>;
}

/// `ChainReader` over a JSON-RPC endpoint.
pub struct RpcReader {
    client: Arc<RpcClient>,
}

impl RpcReader {
    pub fn new(rpc_url: &str) -> Self {
        let client = RpcClient::new_with_commitment(rpc_url.to_string(), CommitmentConfig::confirmed());
        Self {
            client: Arc::new(client),
        }
    }

    fn parse_pubkey(address: &str) -> Result<Pubkey, TradeError> {
        Pubkey::from_str(address.trim())
            .map_err(|_| TradeError::validation(format!("Malformed address: {address}")))
    }
}

#[async_trait]
impl ChainReader for RpcReader {
    async fn native_balance(&self, owner: &str) -> Result<u64, TradeError> {
        let owner = Self::parse_pubkey(owner)?;
        self.client.get_balance(&owner).await.map_err(TradeError::rpc)
    }

    async fn token_balance(&self, owner: &str, mint: &str) -> Result<u64, TradeError> {
        let owner = Self::parse_pubkey(owner)?;
        let mint = Self::parse_pubkey(mint)?;

        let accounts = self
            .client
            .get_token_accounts_by_owner(&owner, TokenAccountsFilter::Mint(mint))
            .await
            .map_err(TradeError::rpc)?;

        let Some(keyed) = accounts.first() else {
            return Ok(0);
        };
        let UiAccountData::Json(parsed) = &keyed.account.data else {
            return Err(TradeError::Rpc("unexpected token account encoding".to_string()));
        };
        let amount = parsed.parsed["info"]["tokenAmount"]["amount"]
            .as_str()
            .and_then(|a| a.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(amount)
    }

    async fn token_info(&self, mint: &str) -> Result<TokenDescriptor, TradeError> {
        let mint_pubkey = Self::parse_pubkey(mint)?;
        let account = self
            .client
            .get_account_with_commitment(&mint_pubkey, CommitmentConfig::confirmed())
            .await
            .map_err(TradeError::rpc)?
            .value
            .ok_or_else(|| TradeError::validation("Token mint account not found"))?;

        if account.owner != spl_token::id() {
            return Err(TradeError::validation("Address is not an SPL token mint"));
        }
        let state = spl_token::state::Mint::unpack(&account.data)
            .map_err(|e| TradeError::validation(format!("Unreadable mint account: {e}")))?;

        let risk = if state.freeze_authority.is_some() {
            100
        } else if state.mint_authority.is_some() {
            50
        } else {
            0
        };
        debug!(mint, decimals = state.decimals, risk, "inspected token mint");

        Ok(TokenDescriptor {
            address: mint_pubkey.to_string(),
            symbol: String::new(),
            name: String::new(),
            decimals: state.decimals,
            risk,
            price_usd: None,
        })
    }

    async fn account_exists(&self, address: &str) -> Result<bool, TradeError> {
        let pubkey = Self::parse_pubkey(address)?;
        let response = self
            .client
            .get_account_with_commitment(&pubkey, CommitmentConfig::confirmed())
            .await
            .map_err(TradeError::rpc)?;
        Ok(response.value.is_some())
    }

    async fn latest_blockhash(&self) -> Result<Hash, TradeError> {
        self.client.get_latest_blockhash().await.map_err(TradeError::rpc)
    }

    async fn token_account_mint(&self, address: &str) -> Result<Option<String>, TradeError> {
        let pubkey = Self::parse_pubkey(address)?;
        let response = self
            .client
            .get_account_with_commitment(&pubkey, CommitmentConfig::confirmed())
            .await
            .map_err(TradeError::rpc)?;

        let Some(account) = response.value else {
            return Ok(None);
        };
        match spl_token::state::Account::unpack(&account.data) {
            Ok(token_account) => Ok(Some(token_account.mint.to_string())),
            Err(_) => {
                warn!(address, "account exists but does not parse as a token account");
                Ok(None)
            }
        }
    }

    async fn parsed_transaction(
        &self,
        signature: &str,
    ) -> Result<EncodedConfirmedTransactionWithStatusMeta, TradeError> {
        let signature = Signature::from_str(signature)
            .map_err(|_| TradeError::validation(format!("Malformed signature: {signature}")))?;
        self.client
            .get_transaction_with_config(
                &signature,
                solana_client::rpc_config::RpcTransactionConfig {
                    encoding: Some(UiTransactionEncoding::JsonParsed),
                    commitment: Some(CommitmentConfig::confirmed()),
                    max_supported_transaction_version: Some(0),
                },
            )
            .await
            .map_err(TradeError::rpc)
    }
}
