//! Impls - adapters behind the ports.
//!
//! - In-memory broker and record store for tests and development
//! - Redis broker (feature `redis`) and PostgreSQL record store (feature `postgres`)
//! - Executors shipped with the core

pub mod executors;
pub mod inmem_broker;
pub mod inmem_store;
#[cfg(feature = "postgres")]
pub mod pg_store;
#[cfg(feature = "redis")]
pub mod redis_broker;

pub use self::executors::{DoubleExecutor, FaultInjector, JsonExecutor};
pub use self::inmem_broker::InMemoryBroker;
pub use self::inmem_store::InMemoryRecordStore;
#[cfg(feature = "postgres")]
pub use self::pg_store::PgRecordStore;
#[cfg(feature = "redis")]
pub use self::redis_broker::RedisBroker;
