use std::sync::Arc;

use async_trait::async_trait;
use solana_transaction_status::option_serializer::OptionSerializer;
use solana_transaction_status::{
    EncodedTransaction, UiInnerInstructions, UiInstruction, UiMessage, UiParsedInstruction,
};
use tracing::debug;

use crate::chain::rpc::ChainReader;
use crate::core::types::TradeDelta;
use crate::error::TradeError;

/// Jupiter v6 aggregator program. Transfers attributed to the route are the
/// inner instructions at or before this program's top-level instruction.
const AGGREGATOR_PROGRAM: &str = "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4";

/// One token transfer observed inside the confirmed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLeg {
    pub amount: u64,
    pub source: String,
    pub destination: String,
}

/// Index of the aggregator instruction in the top-level message, if any.
fn aggregator_boundary(instructions: &[UiInstruction]) -> Option<usize> {
    instructions.iter().position(|ix| match ix {
        UiInstruction::Parsed(UiParsedInstruction::Parsed(p)) => p.program_id == AGGREGATOR_PROGRAM,
        UiInstruction::Parsed(UiParsedInstruction::PartiallyDecoded(p)) => {
            p.program_id == AGGREGATOR_PROGRAM
        }
        UiInstruction::Compiled(_) => false,
    })
}

/// Collects the token-transfer legs attributable to the route: parsed
/// `transfer`/`transferChecked` inner instructions whose top-level index is
/// at or before the aggregator boundary. Native lamport moves carry no
/// `amount` field and are excluded here; the native side of a route shows up
/// as wrapped-token transfers.
fn collect_route_transfers(inner: &[UiInnerInstructions], boundary: usize) -> Vec<TransferLeg> {
    let mut legs = Vec::new();
    for group in inner {
        if group.index as usize > boundary {
            continue;
        }
        for ix in &group.instructions {
            let UiInstruction::Parsed(UiParsedInstruction::Parsed(parsed)) = ix else {
                continue;
            };
            let info = &parsed.parsed["info"];
            let amount = match parsed.parsed["type"].as_str() {
                Some("transfer") => info["amount"].as_str(),
                Some("transferChecked") => info["tokenAmount"]["amount"].as_str(),
                _ => None,
            };
            let Some(amount) = amount.and_then(|a| a.parse::<u64>().ok()) else {
                continue;
            };
            let (Some(source), Some(destination)) =
                (info["source"].as_str(), info["destination"].as_str())
            else {
                continue;
            };
            legs.push(TransferLeg {
                amount,
                source: source.to_string(),
                destination: destination.to_string(),
            });
        }
    }
    legs
}

/// Computes the executed amounts of a confirmed swap.
#[async_trait]
pub trait DeltaSource: Send + Sync {
    /// Reads the first and last route legs of the confirmed transaction and
    /// reports how much of each side actually moved. Deterministic for a
    /// given confirmed signature.
    async fn compute_delta(
        &self,
        signature: &str,
        input_mint: &str,
        output_mint: &str,
    ) -> Result<TradeDelta, TradeError>;
}

pub struct DeltaCalculator {
    chain: Arc<dyn ChainReader>,
}

impl DeltaCalculator {
    pub fn new(chain: Arc<dyn ChainReader>) -> Self {
        Self { chain }
    }

    /// Resolves the mint behind a leg. The source account may already be
    /// closed by the time we look; fall back to the destination.
    async fn leg_mint(&self, leg: &TransferLeg) -> Result<Option<String>, TradeError> {
        if let Some(mint) = self.chain.token_account_mint(&leg.source).await? {
            return Ok(Some(mint));
        }
        self.chain.token_account_mint(&leg.destination).await
    }
}

#[async_trait]
impl DeltaSource for DeltaCalculator {
    async fn compute_delta(
        &self,
        signature: &str,
        input_mint: &str,
        output_mint: &str,
    ) -> Result<TradeDelta, TradeError> {
        let confirmed = self.chain.parsed_transaction(signature).await?;

        let EncodedTransaction::Json(transaction) = &confirmed.transaction.transaction else {
            return Err(TradeError::Rpc("unexpected transaction encoding".to_string()));
        };
        let UiMessage::Parsed(message) = &transaction.message else {
            return Err(TradeError::Rpc("unexpected message encoding".to_string()));
        };

        let Some(boundary) = aggregator_boundary(&message.instructions) else {
            debug!(signature, "no aggregator instruction in transaction");
            return Err(TradeError::AmbiguousTransfer);
        };

        let meta = confirmed
            .transaction
            .meta
            .as_ref()
            .ok_or_else(|| TradeError::Rpc("transaction meta missing".to_string()))?;
        let inner = match &meta.inner_instructions {
            OptionSerializer::Some(inner) => inner.as_slice(),
            _ => return Err(TradeError::AmbiguousTransfer),
        };

        let legs = collect_route_transfers(inner, boundary);
        if legs.len() < 2 {
            return Err(TradeError::AmbiguousTransfer);
        }
        let first = &legs[0];
        let last = &legs[legs.len() - 1];

        let (amount_in, amount_out) = match self.leg_mint(first).await? {
            Some(mint) if mint == input_mint => (first.amount, last.amount),
            Some(mint) if mint == output_mint => (last.amount, first.amount),
            _ => match self.leg_mint(last).await? {
                Some(mint) if mint == output_mint => (first.amount, last.amount),
                Some(mint) if mint == input_mint => (last.amount, first.amount),
                _ => return Err(TradeError::AmbiguousTransfer),
            },
        };

        debug!(signature, amount_in, amount_out, "computed executed amounts");
        Ok(TradeDelta {
            amount_in,
            amount_out,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn top_level_instructions() -> Vec<UiInstruction> {
        serde_json::from_value(json!([
            {
                "program": "spl-memo",
                "programId": "MemoSq4gqABAXKb96qnH8TysNcWxMyWCqXgDLGmfcHr",
                "parsed": "hello"
            },
            {
                "programId": AGGREGATOR_PROGRAM,
                "accounts": [],
                "data": "3Bxs4h24hBtQy9rw"
            },
            {
                "programId": "ComputeBudget111111111111111111111111111111",
                "accounts": [],
                "data": "Fj2Eoy"
            }
        ]))
        .unwrap()
    }

    fn inner_instructions() -> Vec<UiInnerInstructions> {
        serde_json::from_value(json!([
            {
                "index": 1,
                "instructions": [
                    {
                        "program": "system",
                        "programId": "11111111111111111111111111111111",
                        "parsed": {
                            "type": "transfer",
                            "info": {
                                "source": "walletA",
                                "destination": "walletB",
                                "lamports": 5000
                            }
                        }
                    },
                    {
                        "program": "spl-token",
                        "programId": "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA",
                        "parsed": {
                            "type": "transfer",
                            "info": {
                                "source": "userSolAccount",
                                "destination": "poolSolAccount",
                                "amount": "1000000000",
                                "authority": "user"
                            }
                        }
                    },
                    {
                        "program": "spl-token",
                        "programId": "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA",
                        "parsed": {
                            "type": "transferChecked",
                            "info": {
                                "source": "poolHopAccount",
                                "destination": "hopAccount",
                                "tokenAmount": { "amount": "42", "decimals": 6 },
                                "authority": "pool"
                            }
                        }
                    },
                    {
                        "program": "spl-token",
                        "programId": "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA",
                        "parsed": {
                            "type": "transfer",
                            "info": {
                                "source": "poolTokenAccount",
                                "destination": "userTokenAccount",
                                "amount": "250000",
                                "authority": "pool"
                            }
                        }
                    }
                ]
            },
            {
                "index": 2,
                "instructions": [
                    {
                        "program": "spl-token",
                        "programId": "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA",
                        "parsed": {
                            "type": "transfer",
                            "info": {
                                "source": "afterBoundary",
                                "destination": "elsewhere",
                                "amount": "999",
                                "authority": "someone"
                            }
                        }
                    }
                ]
            }
        ]))
        .unwrap()
    }

    #[test]
    fn finds_the_aggregator_boundary() {
        assert_eq!(aggregator_boundary(&top_level_instructions()), Some(1));
        assert_eq!(aggregator_boundary(&top_level_instructions()[..1]), None);
    }

    #[test]
    fn collects_only_attributable_token_transfers() {
        let legs = collect_route_transfers(&inner_instructions(), 1);

        // The native lamport move has no token amount and the transfer past
        // the boundary is not part of the route.
        assert_eq!(legs.len(), 3);
        assert_eq!(legs[0].amount, 1_000_000_000);
        assert_eq!(legs[0].source, "userSolAccount");
        assert_eq!(legs[1].amount, 42);
        assert_eq!(legs[2].amount, 250_000);
        assert_eq!(legs[2].destination, "userTokenAccount");
    }

    #[test]
    fn extraction_is_deterministic() {
        let once = collect_route_transfers(&inner_instructions(), 1);
        let twice = collect_route_transfers(&inner_instructions(), 1);
        assert_eq!(once, twice);
    }
}
