pub mod metadata;
pub mod rpc;
pub mod wallet;

pub use rpc::{ChainReader, RpcReader};
