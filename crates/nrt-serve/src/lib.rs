//! Read path for the near-real-time record store.
//!
//! # Architecture
//!
//! - **ReadContext**: store handle and record cache, built once at startup
//! - **Holdings**: stream pattern + window → ordered record keys
//! - **Cache**: record key → bytes, single-flight over the store
//!
//! A typical request runs a holdings search, then resolves each key through
//! the cache.

pub mod cache;
pub mod holdings;
mod state;

pub use self::cache::{CacheConfig, CacheStats, RecordCache, RecordLoader};
pub use self::holdings::{DataSearch, HoldingsIndex, PatternSyntax, holdings_search};
pub use self::state::{Config, ReadContext};
