//! Version information for the connector.

/// Connector version from Cargo.toml
pub const CONNECTOR_VERSION: &str = env!("CARGO_PKG_VERSION");
