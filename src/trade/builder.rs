use std::str::FromStr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use solana_sdk::compute_budget::ComputeBudgetInstruction;
use solana_sdk::instruction::Instruction;
use solana_sdk::message::{v0, VersionedMessage};
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use solana_sdk::system_instruction;
use solana_sdk::transaction::VersionedTransaction;
use spl_associated_token_account::get_associated_token_address;
use spl_associated_token_account::instruction::create_associated_token_account;
use tracing::debug;

use crate::chain::rpc::ChainReader;
use crate::error::TradeError;

/// Compute units budgeted per instruction when sizing the priority fee.
const COMPUTE_UNITS_PER_IX: u64 = 200_000;

/// Deserializes the aggregator's base64 swap payload into an unsigned
/// transaction.
pub fn decode_swap_transaction(swap_b64: &str) -> Result<VersionedTransaction, TradeError> {
    let bytes = BASE64
        .decode(swap_b64)
        .map_err(|e| TradeError::BuildError(format!("undecodable swap payload: {e}")))?;
    bincode::deserialize(&bytes)
        .map_err(|e| TradeError::BuildError(format!("unreadable swap transaction: {e}")))
}

/// Micro-lamport price per compute unit such that the total priority fee
/// stays bounded by the user's budget as the instruction count grows.
fn priority_fee_price(priority_fee_lamports: u64, instruction_count: usize) -> u64 {
    let budgeted_units = instruction_count as u64 * COMPUTE_UNITS_PER_IX * 2;
    priority_fee_lamports.saturating_mul(1_000_000) / budgeted_units.max(1)
}

/// Assembles transfer transactions. Swap transactions are assembled by the
/// aggregator; this builder only covers the flows the bot constructs itself.
pub struct TransactionBuilder {
    chain: Arc<dyn ChainReader>,
}

impl TransactionBuilder {
    pub fn new(chain: Arc<dyn ChainReader>) -> Self {
        Self { chain }
    }

    fn parse_pubkey(address: &str) -> Result<Pubkey, TradeError> {
        Pubkey::from_str(address.trim())
            .map_err(|_| TradeError::BuildError(format!("malformed address: {address}")))
    }

    fn compile(
        payer: &Pubkey,
        instructions: &[Instruction],
        blockhash: solana_sdk::hash::Hash,
    ) -> Result<VersionedTransaction, TradeError> {
        let message = v0::Message::try_compile(payer, instructions, &[], blockhash)
            .map_err(|e| TradeError::BuildError(e.to_string()))?;
        Ok(VersionedTransaction {
            signatures: vec![Signature::default()],
            message: VersionedMessage::V0(message),
        })
    }

    /// Builds a token transfer, creating the recipient's associated token
    /// account first when it does not exist yet.
    pub async fn build_token_transfer(
        &self,
        mint: &str,
        from: &str,
        to: &str,
        amount: u64,
        priority_fee_lamports: u64,
    ) -> Result<VersionedTransaction, TradeError> {
        if amount == 0 {
            return Err(TradeError::BuildError("zero transfer amount".to_string()));
        }
        let mint = Self::parse_pubkey(mint)?;
        let payer = Self::parse_pubkey(from)?;
        let destination = Self::parse_pubkey(to)?;

        let source_ata = get_associated_token_address(&payer, &mint);
        let destination_ata = get_associated_token_address(&destination, &mint);

        let mut instructions = Vec::new();
        if !self.chain.account_exists(&destination_ata.to_string()).await? {
            debug!(%destination_ata, "recipient token account missing, prepending creation");
            instructions.push(create_associated_token_account(
                &payer,
                &destination,
                &mint,
                &spl_token::id(),
            ));
        }
        instructions.push(
            spl_token::instruction::transfer(
                &spl_token::id(),
                &source_ata,
                &destination_ata,
                &payer,
                &[],
                amount,
            )
            .map_err(|e| TradeError::BuildError(e.to_string()))?,
        );

        let price = priority_fee_price(priority_fee_lamports, instructions.len());
        instructions.insert(0, ComputeBudgetInstruction::set_compute_unit_price(price));

        let blockhash = self.chain.latest_blockhash().await?;
        Self::compile(&payer, &instructions, blockhash)
    }

    /// Builds a native transfer. The caller has already subtracted the fee
    /// reserve from `lamports`.
    pub async fn build_native_transfer(
        &self,
        from: &str,
        to: &str,
        lamports: u64,
        priority_fee_lamports: u64,
    ) -> Result<VersionedTransaction, TradeError> {
        if lamports == 0 {
            return Err(TradeError::BuildError("zero transfer amount".to_string()));
        }
        let payer = Self::parse_pubkey(from)?;
        let destination = Self::parse_pubkey(to)?;

        let transfer = system_instruction::transfer(&payer, &destination, lamports);
        let price = priority_fee_price(priority_fee_lamports, 1);
        let instructions = vec![
            ComputeBudgetInstruction::set_compute_unit_limit(500),
            ComputeBudgetInstruction::set_compute_unit_price(price),
            transfer,
        ];

        let blockhash = self.chain.latest_blockhash().await?;
        Self::compile(&payer, &instructions, blockhash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use solana_sdk::hash::Hash;
    use solana_transaction_status::EncodedConfirmedTransactionWithStatusMeta;

    use crate::core::types::TokenDescriptor;

    struct FakeChain {
        recipient_ata_exists: bool,
    }

    #[async_trait]
    impl ChainReader for FakeChain {
        async fn native_balance(&self, _owner: &str) -> Result<u64, TradeError> {
            Ok(0)
        }
        async fn token_balance(&self, _owner: &str, _mint: &str) -> Result<u64, TradeError> {
            Ok(0)
        }
        async fn token_info(&self, _mint: &str) -> Result<TokenDescriptor, TradeError> {
            unimplemented!()
        }
        async fn account_exists(&self, _address: &str) -> Result<bool, TradeError> {
            Ok(self.recipient_ata_exists)
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

    const MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";
    const FROM: &str = "Vote111111111111111111111111111111111111111";
    const TO: &str = "Stake11111111111111111111111111111111111111";

    fn builder(recipient_ata_exists: bool) -> TransactionBuilder {
        TransactionBuilder::new(Arc::new(FakeChain { recipient_ata_exists }))
    }

    fn instruction_count(tx: &VersionedTransaction) -> usize {
        match &tx.message {
            VersionedMessage::V0(m) => m.instructions.len(),
            VersionedMessage::Legacy(m) => m.instructions.len(),
        }
    }

    #[tokio::test]
    async fn token_transfer_prepends_account_creation_when_missing() {
        let tx = builder(false)
            .build_token_transfer(MINT, FROM, TO, 1_000, 200_000)
            .await
            .unwrap();
        // compute price + create ATA + transfer
        assert_eq!(instruction_count(&tx), 3);

        let tx = builder(true)
            .build_token_transfer(MINT, FROM, TO, 1_000, 200_000)
            .await
            .unwrap();
        // compute price + transfer
        assert_eq!(instruction_count(&tx), 2);
    }

    #[tokio::test]
    async fn rejects_zero_amounts_and_malformed_addresses() {
        let err = builder(true)
            .build_token_transfer(MINT, FROM, TO, 0, 200_000)
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::BuildError(_)));

        let err = builder(true)
            .build_token_transfer("not-a-mint", FROM, TO, 1, 200_000)
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::BuildError(_)));

        let err = builder(true)
            .build_native_transfer(FROM, "!!", 1, 200_000)
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::BuildError(_)));
    }

    #[test]
    fn fee_per_unit_scales_inversely_with_instruction_count() {
        let one = priority_fee_price(200_000, 1);
        let two = priority_fee_price(200_000, 2);
        let three = priority_fee_price(200_000, 3);
        assert!(one > two && two > three);
        // Total fee stays bounded by the budget regardless of count.
        assert!(two * 2 * COMPUTE_UNITS_PER_IX * 2 / 1_000_000 <= 200_000);
    }

    #[test]
    fn swap_payload_round_trips_and_garbage_is_rejected() {
        let payer = Pubkey::from_str(FROM).unwrap();
        let message =
            v0::Message::try_compile(&payer, &[], &[], Hash::default()).unwrap();
        let tx = VersionedTransaction {
            signatures: vec![Signature::default()],
            message: VersionedMessage::V0(message),
        };
        let encoded = BASE64.encode(bincode::serialize(&tx).unwrap());

        let decoded = decode_swap_transaction(&encoded).unwrap();
        assert_eq!(decoded.message.recent_blockhash(), &Hash::default());

        assert!(matches!(
            decode_swap_transaction("@@not base64@@"),
            Err(TradeError::BuildError(_))
        ));
        assert!(matches!(
            decode_swap_transaction(&BASE64.encode(b"junk")),
            Err(TradeError::BuildError(_))
        ));
    }
}
