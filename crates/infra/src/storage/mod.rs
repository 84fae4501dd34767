//! Durable token persistence
//!
//! The only state the client keeps across restarts is the session's
//! [`TokenSet`](fleetbook_common::auth::TokenSet), stored as one JSON value
//! in the system keyring.

pub mod keychain;

pub use keychain::{KeychainTokenStore, DEFAULT_ACCOUNT, DEFAULT_SERVICE};
