//! Session tokens and coordinated refresh
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │ TokenCoordinator │  single-flight refresh, 401 recovery
//! └────────┬─────────┘
//!          │
//!          ├──► TokenStore      (durable storage, keychain in production)
//!          └──► TokenRefresher  (refresh endpoint call)
//! ```
//!
//! Both seams are traits so the coordinator can be exercised with the
//! in-memory doubles from `testing`.

pub mod coordinator;
pub mod error;
pub mod traits;
pub mod types;

pub use coordinator::{TokenCoordinator, DEFAULT_REFRESH_MARGIN};
pub use error::{AuthError, RefreshError, TokenStoreError};
pub use traits::{TokenRefresher, TokenStore};
pub use types::TokenSet;
