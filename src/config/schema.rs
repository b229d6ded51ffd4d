use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Signaling relay server settings
    pub relay: RelayConfig,
    /// Signaling client settings
    pub signaling: SignalingConfig,
    /// ICE servers handed to every peer connection
    pub ice: IceConfig,
    /// Call session timing
    pub session: SessionConfig,
    /// Local media constraints
    pub media: MediaConfig,
}

impl AppConfig {
    /// Reject configurations that can never work
    pub fn validate(&self) -> Result<()> {
        if self.signaling.url.trim().is_empty() {
            return Err(AppError::Config("signaling.url must not be empty".into()));
        }
        if self.relay.port == 0 {
            return Err(AppError::Config("relay.port must not be 0".into()));
        }
        if self.relay.room_capacity == 0 {
            return Err(AppError::Config("relay.room_capacity must be at least 1".into()));
        }
        let (min, max) = self.session.join_jitter_ms;
        if min > max {
            return Err(AppError::Config(format!(
                "session.join_jitter_ms range is inverted: {} > {}",
                min, max
            )));
        }
        Ok(())
    }
}

/// Signaling relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Listen address
    pub bind_address: String,
    /// Listen port
    pub port: u16,
    /// Maximum connections per room
    pub room_capacity: usize,
    /// WebSocket heartbeat interval in seconds
    pub heartbeat_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8787,
            room_capacity: 64,
            heartbeat_secs: 30,
        }
    }
}

/// Signaling client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalingConfig {
    /// Relay base URL (ws:// or wss://)
    pub url: String,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8787".to_string(),
        }
    }
}

/// ICE server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IceConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            turn_servers: vec![],
        }
    }
}

impl IceConfig {
    /// No STUN/TURN, host candidates only
    pub fn host_only() -> Self {
        Self {
            stun_servers: vec![],
            turn_servers: vec![],
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnServer {
    /// TURN server URLs (e.g., ["turn:turn.example.com:3478?transport=udp"])
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

impl TurnServer {
    /// Create a TurnServer with a single URL
    pub fn new(url: String, username: String, credential: String) -> Self {
        Self {
            urls: vec![url],
            username,
            credential,
        }
    }
}

/// Call session timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Random delay range (ms) before subscribing to the room channel
    pub join_jitter_ms: (u64, u64),
    /// Delay (ms) between subscription confirmation and the `join` announcement
    pub announce_delay_ms: u64,
    /// Delay (ms) before re-acquiring the camera after it was turned off
    pub camera_reacquire_delay_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            join_jitter_ms: (200, 400),
            announce_delay_ms: 100,
            camera_reacquire_delay_ms: 300,
        }
    }
}

impl SessionConfig {
    /// No artificial delays
    pub fn immediate() -> Self {
        Self {
            join_jitter_ms: (0, 0),
            announce_delay_ms: 0,
            camera_reacquire_delay_ms: 0,
        }
    }
}

/// Local media constraints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MediaConfig {
    /// Capture width
    pub width: u32,
    /// Capture height
    pub height: u32,
    /// Capture microphone
    pub audio: bool,
    /// Capture camera
    pub video: bool,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            audio: true,
            video: true,
        }
    }
}
