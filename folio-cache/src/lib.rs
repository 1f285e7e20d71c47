//! Folio Cache - Server-State Cache and Fetch Coordination
//!
//! This crate keeps server data fetched by the client consistent:
//!
//! - [`CacheStore`]: entries keyed by [`folio_core::Fingerprint`], plus the
//!   observer registry and reset generations
//! - [`QueryClient`]: deduplicated fetches, typed reads, observers and
//!   invalidation
//! - [`InvalidationBus`]: pattern-based change notifications
//! - [`MutationExecutor`]: run a side effect once, then apply its cache effects
//! - [`spawn_sweeper`]: background eviction of unobserved entries
//!
//! # Example
//!
//! ```ignore
//! let client = QueryClient::with_defaults();
//! let books = Fingerprint::builder("book").param("isApproved", false).build()?;
//! let observer = client.watch(&books, fetch_books, client.default_options()).await;
//! let snapshot = observer.snapshot::<Vec<Book>>()?;
//! ```

pub mod bus;
pub mod client;
pub mod config;
pub mod entry;
pub mod fetcher;
pub mod freshness;
pub mod generation;
pub mod mutation;
pub mod retry;
pub mod store;
pub mod sweeper;

pub use bus::{ChangeCallback, ChangeEvent, ChangeKind, InvalidationBus, Subscription};
pub use client::{QueryClient, QueryObserver};
pub use config::CacheConfig;
pub use entry::{CacheEntry, CacheStats, EntryPatch, QueryStatus};
pub use fetcher::{ErrorCallback, QueryFn, QueryOptions, SharedQueryFn};
pub use freshness::{Freshness, QuerySnapshot};
pub use generation::{Generation, GenerationJournal};
pub use mutation::{MutationEffects, MutationExecutor};
pub use retry::{with_retry, RetryPolicy};
pub use store::CacheStore;
pub use sweeper::{spawn_sweeper, sweep_task};
