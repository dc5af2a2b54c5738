pub mod config;
pub mod error;
pub mod hlc;
pub mod provider;
pub mod retry;
pub mod types;

pub use config::{CacheSettings, LecternConfig, SyncSettings, MAX_BATCH_SIZE};
pub use error::{Error, Result};
pub use hlc::{HlcTimestamp, HybridClock};
pub use retry::RetryPolicy;
pub use types::*;
