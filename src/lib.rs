//! Leads API Library
//!
//! Credit-metered B2B lead discovery: searches a maps provider for businesses
//! by niche and location, resolves each to its CNPJ, charges one credit per
//! new lead, and enriches leads with registry and ownership data through a
//! single-consumer request queue.
//!
//! # Modules
//!
//! - `config`: Configuration management.
//! - `db`: Database connection pool and migrations.
//! - `errors`: Error handling types.
//! - `models`: Persisted records and API views.
//! - `documents`: CPF/CNPJ and phone helpers.
//! - `normalize`: Niche and location normalization.
//! - `store`: Storage traits.
//! - `pg_store`: Postgres storage.
//! - `memory_store`: In-memory storage for tests and local runs.
//! - `ledger`: Credit ledger.
//! - `queue`: External request queue.
//! - `leads`: Lead store, access tracking and sanitization.
//! - `cache_index`: (niche, location) cache index.
//! - `search`: Search orchestration and direct lookups.
//! - `services`: External service clients (Serper, Viper).
//! - `circuit_breaker`: Circuit breaker implementation.
//! - `credentials`: Partner session credentials.
//! - `worker`: Queue consumer.
//! - `payments`: Payment gateways and settlement.
//! - `handlers`: HTTP request handlers.

pub mod cache_index;
pub mod circuit_breaker;
pub mod config;
pub mod credentials;
pub mod db;
pub mod documents;
pub mod errors;
pub mod handlers;
pub mod leads;
pub mod ledger;
pub mod memory_store;
pub mod models;
pub mod normalize;
pub mod payments;
pub mod pg_store;
pub mod queue;
pub mod search;
pub mod services;
pub mod store;
pub mod worker;
