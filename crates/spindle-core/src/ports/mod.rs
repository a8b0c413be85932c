//! Ports - the seams between the worker core and the outside world.
//!
//! - Broker: hand-off queue of runnable entries (Redis in production)
//! - RecordStore: source of truth for task records (PostgreSQL in production)
//! - Executor: per-type work function supplied by the application
//! - Clock: time source, swappable in tests

pub mod broker;
pub mod clock;
pub mod executor;
pub mod record_store;

pub use self::broker::Broker;
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::Executor;
pub use self::record_store::RecordStore;
