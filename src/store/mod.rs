use anyhow::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use tracing::info;

use crate::core::types::{User, Wallet};

/// Persistence collaborator for user records.
///
/// The core never manages the backing store's connection lifecycle; it only
/// issues these calls. Records are addressed by a stable chat id and
/// concurrent updates to the same user are last-write-wins.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user(&self, chat_id: i64) -> Result<Option<User>>;

    async fn create_user(&self, chat_id: i64, username: &str, wallet: Wallet) -> Result<User>;

    async fn save_user(&self, user: &User) -> Result<()>;

    /// Users eligible for the signal fan-out: alerts on, auto-trade on and a
    /// positive default amount configured.
    async fn auto_trade_users(&self) -> Result<Vec<User>>;

    /// Users who want signal notifications, regardless of auto-trade.
    async fn alert_users(&self) -> Result<Vec<User>>;
}

/// In-memory user store keyed by chat id.
#[derive(Default)]
pub struct MemoryUserStore {
    users: DashMap<i64, User>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn find_user(&self, chat_id: i64) -> Result<Option<User>> {
        Ok(self.users.get(&chat_id).map(|u| u.value().clone()))
    }

    async fn create_user(&self, chat_id: i64, username: &str, wallet: Wallet) -> Result<User> {
        let user = User::new(chat_id, username, wallet);
        self.users.insert(chat_id, user.clone());
        info!(chat_id, username, "created user record");
        Ok(user)
    }

    async fn save_user(&self, user: &User) -> Result<()> {
        self.users.insert(user.chat_id, user.clone());
        Ok(())
    }

    async fn auto_trade_users(&self) -> Result<Vec<User>> {
        Ok(self
            .users
            .iter()
            .filter(|u| {
                u.params.bot_alerts && u.params.auto_trade && u.params.snipe_amount_lamports > 0
            })
            .map(|u| u.value().clone())
            .collect())
    }

    async fn alert_users(&self) -> Result<Vec<User>> {
        Ok(self
            .users
            .iter()
            .filter(|u| u.params.bot_alerts)
            .map(|u| u.value().clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet() -> Wallet {
        Wallet {
            public_key: "11111111111111111111111111111112".to_string(),
            private_key: String::new(),
        }
    }

    #[tokio::test]
    async fn create_then_find() {
        let store = MemoryUserStore::new();
        store.create_user(7, "alice", wallet()).await.unwrap();

        let found = store.find_user(7).await.unwrap().unwrap();
        assert_eq!(found.chat_id, 7);
        assert_eq!(found.username, "alice");
        assert!(store.find_user(8).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn auto_trade_filter_requires_all_three_flags() {
        let store = MemoryUserStore::new();

        let mut eligible = store.create_user(1, "a", wallet()).await.unwrap();
        eligible.params.bot_alerts = true;
        eligible.params.auto_trade = true;
        eligible.params.snipe_amount_lamports = 50_000_000;
        store.save_user(&eligible).await.unwrap();

        let mut zero_amount = store.create_user(2, "b", wallet()).await.unwrap();
        zero_amount.params.bot_alerts = true;
        zero_amount.params.auto_trade = true;
        store.save_user(&zero_amount).await.unwrap();

        let mut alerts_only = store.create_user(3, "c", wallet()).await.unwrap();
        alerts_only.params.bot_alerts = true;
        alerts_only.params.snipe_amount_lamports = 50_000_000;
        store.save_user(&alerts_only).await.unwrap();

        let traders = store.auto_trade_users().await.unwrap();
        assert_eq!(traders.len(), 1);
        assert_eq!(traders[0].chat_id, 1);

        let alerted = store.alert_users().await.unwrap();
        assert_eq!(alerted.len(), 3);
    }
}
