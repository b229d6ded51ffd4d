//! Application configuration
//!
//! Configuration lives in an optional TOML file. Every section carries
//! `#[serde(default)]`, so partial files are fine.

mod schema;
mod store;

pub use schema::{
    AppConfig, IceConfig, MediaConfig, RelayConfig, SessionConfig, SignalingConfig, TurnServer,
};
pub use store::ConfigStore;
