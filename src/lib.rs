pub mod aggregator;
pub mod attribution;
pub mod command_resolver;
pub mod config;
pub mod exec;
pub mod fleet;
pub mod gpu;
pub mod otel_tracing;
pub mod routes;
pub mod service;
