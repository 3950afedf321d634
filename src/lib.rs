pub mod authority;
pub mod budget;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod models;
pub mod node;
pub mod retry;
pub mod store;
pub mod token;

pub use authority::Authority;
pub use config::QuorumConfig;
pub use coordinator::{quorum_threshold, LockHandle, QuorumCoordinator};
pub use error::{Error, Result};
pub use store::KeyStore;
pub use token::FencingToken;
