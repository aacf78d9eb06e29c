//! Ordered, resumable change feeds on top of a transactional table.
//!
//! Writers append rows in either of two modes: the **outbox** mode
//! inserts without coordination and lets a background sweeper assign
//! logical order later, while the **blocking** mode serializes writers
//! on a per-shard lock and assigns order at commit time. Readers page
//! through a shard with an opaque [`cursor::Cursor`] and can block on
//! [`longpoll::longpoll`] until new rows land.
//!
//! Two backends implement the same [`store::ChangefeedStore`] trait:
//! [`store::memory::MemoryStore`] for dev and tests and
//! [`store::postgres::PostgresStore`] for production. The coordination
//! drivers ([`sweep`], [`lock`], [`longpoll`]) are written against the
//! trait and behave identically on both.

pub mod config;
pub mod cursor;
pub mod lock;
pub mod longpoll;
pub mod model;
pub mod store;
pub mod sweep;
pub mod ulid;

pub use config::{PgfeedConfig, PostgresConfig, StorageBackend};
pub use cursor::Cursor;
pub use longpoll::longpoll;
pub use model::{
    FeedEvent, FeedId, FeedOptions, FeedPage, LongpollOutcome, ShardId, ShardSweepStats,
    SignalOutcome, SweepGroup, SweepTotals, TransactionOptions, SEQUENCE_BASE,
};
pub use store::{ChangefeedStore, FeedError, FeedResult, FeedTransaction, StoreConfig, SweepGuard};
pub use sweep::{sweep, sweep_loop, SweepLoopOptions};
pub use ulid::ChangeUlid;
