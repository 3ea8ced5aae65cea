use dashmap::DashMap;

use crate::core::types::TokenDescriptor;

/// Numeric settings a user can change through the settings flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingField {
    SnipeAmount,
    PriorityFee,
    SlippageBps,
    RelayTip,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Native,
    Token,
}

/// What free-text input the conversation expects next.
///
/// One variant per feature domain; new features add variants here instead of
/// new string constants, and every consumer matches exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PendingInput {
    #[default]
    Idle,
    /// Buy amount in SOL.
    BuyAmount,
    /// Sell amount in token units.
    SellAmount,
    /// Sell ratio as a percentage of the held balance.
    SellRatio,
    /// Destination address for a withdrawal or token transfer.
    TransferAddress(TransferKind),
    /// New value for a numeric setting.
    Setting(SettingField),
    /// Profile id/handle for a watch-list mutation.
    WatchProfile(WatchAction),
}

/// Ephemeral per-conversation state.
///
/// Losing a session only forces the user to reselect a token; it never
/// corrupts a trade.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub pending: PendingInput,
    pub active_token: Option<TokenDescriptor>,
}

/// Session registry keyed by chat id.
pub struct SessionMap {
    sessions: DashMap<i64, Session>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Current session snapshot, creating an idle one on first contact.
    pub fn snapshot(&self, chat_id: i64) -> Session {
        self.sessions.entry(chat_id).or_default().value().clone()
    }

    pub fn update(&self, chat_id: i64, mutate: impl FnOnce(&mut Session)) {
        let mut entry = self.sessions.entry(chat_id).or_default();
        mutate(&mut entry);
    }

    pub fn set_pending(&self, chat_id: i64, pending: PendingInput) {
        self.update(chat_id, |s| s.pending = pending);
    }

    pub fn set_active_token(&self, chat_id: i64, token: TokenDescriptor) {
        self.update(chat_id, |s| s.active_token = Some(token));
    }
}

impl Default for SessionMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sessions_start_idle_and_survive_updates() {
        let sessions = SessionMap::new();
        assert_eq!(sessions.snapshot(1).pending, PendingInput::Idle);

        sessions.set_pending(1, PendingInput::SellRatio);
        assert_eq!(sessions.snapshot(1).pending, PendingInput::SellRatio);
        // Other chats are unaffected.
        assert_eq!(sessions.snapshot(2).pending, PendingInput::Idle);
    }
}
