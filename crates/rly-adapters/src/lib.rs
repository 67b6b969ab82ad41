//! Relay Adapter Implementations
//!
//! This crate provides adapter implementations for the ports defined in
//! rly-ports:
//! - PostgreSQL durable store (`process_work_batch` as one transaction)
//! - In-memory durable store for embedded mode and tests
//! - NATS JetStream transport
//! - In-process channel transport
//!
//! Both stores share the claim-planning rules in `rly-domain::claim`; the
//! SQL mirrors them clause-for-clause.

pub mod config;
pub mod inprocess;
pub mod memory;
pub mod nats;
pub mod postgres;

pub use config::*;
pub use inprocess::InProcessTransport;
pub use memory::InMemoryWorkStore;
pub use nats::{NatsConfig, NatsTransport};
pub use postgres::PostgresWorkStore;
