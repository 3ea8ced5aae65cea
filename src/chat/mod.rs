pub mod dispatch;
pub mod notify;
pub mod session;

pub use dispatch::ChatDispatcher;
pub use notify::Notifier;
pub use session::{PendingInput, Session, SessionMap};
