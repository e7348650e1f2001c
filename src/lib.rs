pub mod adapter;
pub mod config;
pub mod dispatcher;
pub mod docs;
pub mod envelope;
pub mod error;
pub mod extension;
pub mod facade;
pub mod host;
pub mod logger;
pub mod provenance;
pub mod router;
pub mod scheduler;
pub mod schema;
pub mod signature;
pub mod watcher;
