use solana_sdk::signature::{Keypair, Signer};
use solana_sdk::transaction::VersionedTransaction;
use tracing::info;

use crate::core::types::Wallet;
use crate::error::TradeError;

/// Generates a fresh custodial wallet for a new user.
///
/// Key-generation collaborator: invoked exactly once at user-creation time.
pub fn generate_wallet() -> Wallet {
    let keypair = Keypair::new();
    let wallet = Wallet {
        public_key: keypair.pubkey().to_string(),
        private_key: bs58::encode(keypair.to_bytes()).into_string(),
    };
    info!(public_key = %wallet.public_key, "generated custodial wallet");
    wallet
}

/// Decodes base58 custodial key material into a signing keypair.
///
/// The material is never logged and the keypair lives only as long as the
/// caller's signing scope.
pub fn keypair_from_base58(private_key: &str) -> Result<Keypair, TradeError> {
    let bytes = bs58::decode(private_key)
        .into_vec()
        .map_err(|_| TradeError::validation("Malformed private key material"))?;
    Keypair::from_bytes(&bytes)
        .map_err(|_| TradeError::validation("Private key material is not a valid keypair"))
}

/// Signs a transaction in place with the payer keypair.
///
/// Pure and synchronous: no network access, no retained key material.
pub fn sign_transaction(transaction: &mut VersionedTransaction, keypair: &Keypair) {
    let message_bytes = transaction.message.serialize();
    let signature = keypair.sign_message(&message_bytes);
    if transaction.signatures.is_empty() {
        transaction.signatures = vec![signature];
    } else {
        transaction.signatures[0] = signature;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_wallet_round_trips_through_base58() {
        let wallet = generate_wallet();
        let keypair = keypair_from_base58(&wallet.private_key).unwrap();
        assert_eq!(keypair.pubkey().to_string(), wallet.public_key);
    }

    #[test]
    fn rejects_garbage_key_material() {
        assert!(keypair_from_base58("not-base58-0OIl").is_err());
        assert!(keypair_from_base58("abc").is_err());
    }
}
