// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Agent and client configuration.
//!
//! Every struct has usable defaults and can be loaded from TOML; missing
//! keys fall back to the defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, XrceError};
use crate::protocol::{MAX_MESSAGE_HEADER_SIZE, SUBMESSAGE_HEADER_SIZE};

/// Smallest MTU that still leaves room for a fragment carrying data.
pub const MIN_MTU: usize = MAX_MESSAGE_HEADER_SIZE + 2 * SUBMESSAGE_HEADER_SIZE + 8;

// ---------------------------------------------------------------------------
// Reliability
// ---------------------------------------------------------------------------

/// Retransmission timing for reliable output streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReliabilityConfig {
    /// Initial heartbeat/retransmit interval in milliseconds (default: 200).
    #[serde(default = "default_heartbeat_period_ms")]
    pub heartbeat_period_ms: u64,

    /// Back-off ceiling in milliseconds (default: 3200). The interval
    /// doubles after each unanswered heartbeat up to this value.
    #[serde(default = "default_max_heartbeat_period_ms")]
    pub max_heartbeat_period_ms: u64,

    /// Heartbeats sent without progress before the stream is declared
    /// failed. 0 means retry forever.
    #[serde(default)]
    pub max_retries: u32,
}

fn default_heartbeat_period_ms() -> u64 {
    200
}

fn default_max_heartbeat_period_ms() -> u64 {
    3200
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            heartbeat_period_ms: default_heartbeat_period_ms(),
            max_heartbeat_period_ms: default_max_heartbeat_period_ms(),
            max_retries: 0,
        }
    }
}

impl ReliabilityConfig {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.heartbeat_period_ms)
    }

    pub fn max_heartbeat_period(&self) -> Duration {
        Duration::from_millis(self.max_heartbeat_period_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_period_ms == 0 {
            return Err(XrceError::Config("heartbeat_period_ms must be > 0".into()));
        }
        if self.max_heartbeat_period_ms < self.heartbeat_period_ms {
            return Err(XrceError::Config(
                "max_heartbeat_period_ms must be >= heartbeat_period_ms".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Configuration for the XRCE agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XrceAgentConfig {
    /// UDP listen port (default: 2019, the XRCE standard port).
    #[serde(default = "default_udp_port")]
    pub udp_port: u16,

    /// Optional TCP listen port. If set, TCP transport is enabled.
    #[serde(default)]
    pub tcp_port: Option<u16>,

    /// Optional serial device path (e.g. "/dev/ttyUSB0"). Line settings
    /// such as the baud rate are left to the OS (`stty`).
    #[serde(default)]
    pub serial_device: Option<String>,

    /// Maximum concurrent clients (default: 128).
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Liveliness window in milliseconds (default: 30000). A client silent
    /// for longer is evicted.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Largest reassembled message in bytes (default: 8192).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Largest datagram the agent emits (default: 512, typical MCU limit).
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// History depth of agent-side reliable output streams (default: 16).
    #[serde(default = "default_stream_history")]
    pub stream_history: usize,

    /// Entity limit per client (default: 256).
    #[serde(default = "default_max_objects_per_client")]
    pub max_objects_per_client: usize,

    /// Receive timeout of one agent tick in milliseconds (default: 10).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default)]
    pub reliability: ReliabilityConfig,
}

fn default_udp_port() -> u16 {
    2019
}

fn default_max_clients() -> usize {
    128
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_max_message_size() -> usize {
    8192
}

fn default_mtu() -> usize {
    512
}

fn default_stream_history() -> usize {
    16
}

fn default_max_objects_per_client() -> usize {
    256
}

fn default_poll_interval_ms() -> u64 {
    10
}

impl Default for XrceAgentConfig {
    fn default() -> Self {
        Self {
            udp_port: default_udp_port(),
            tcp_port: None,
            serial_device: None,
            max_clients: default_max_clients(),
            session_timeout_ms: default_session_timeout_ms(),
            max_message_size: default_max_message_size(),
            mtu: default_mtu(),
            stream_history: default_stream_history(),
            max_objects_per_client: default_max_objects_per_client(),
            poll_interval_ms: default_poll_interval_ms(),
            reliability: ReliabilityConfig::default(),
        }
    }
}

impl XrceAgentConfig {
    /// Load and validate a configuration file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| XrceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Validate configuration. Returns Ok(()) if valid.
    pub fn validate(&self) -> Result<()> {
        if self.max_clients == 0 {
            return Err(XrceError::Config("max_clients must be > 0".into()));
        }
        // session_id is u8 so max 255 clients
        if self.max_clients > 255 {
            return Err(XrceError::Config(
                "max_clients must be <= 255 (session_id is u8)".into(),
            ));
        }
        if self.session_timeout_ms == 0 {
            return Err(XrceError::Config("session_timeout_ms must be > 0".into()));
        }
        if self.mtu < MIN_MTU {
            return Err(XrceError::Config(format!("mtu must be >= {}", MIN_MTU)));
        }
        if self.max_message_size < self.mtu {
            return Err(XrceError::Config("max_message_size must be >= mtu".into()));
        }
        if self.stream_history == 0 {
            return Err(XrceError::Config("stream_history must be > 0".into()));
        }
        if self.max_objects_per_client == 0 {
            return Err(XrceError::Config(
                "max_objects_per_client must be > 0".into(),
            ));
        }
        if self.serial_device.as_deref() == Some("") {
            return Err(XrceError::Config("serial_device must not be empty".into()));
        }
        self.reliability.validate()
    }
}

// ---------------------------------------------------------------------------
// Client session
// ---------------------------------------------------------------------------

/// Configuration for a client [`Session`](crate::session::Session).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Session id; values below 0x80 put the client key in every header
    /// (default: 0x81).
    #[serde(default = "default_session_id")]
    pub session_id: u8,

    /// Largest datagram the client emits (default: 512).
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Largest reassembled inbound message (default: 8192).
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    #[serde(default)]
    pub reliability: ReliabilityConfig,
}

fn default_session_id() -> u8 {
    0x81
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_id: default_session_id(),
            mtu: default_mtu(),
            max_message_size: default_max_message_size(),
            reliability: ReliabilityConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mtu < MIN_MTU || self.mtu > usize::from(u16::MAX) {
            return Err(XrceError::Config(format!(
                "mtu must be within {}..={}",
                MIN_MTU,
                u16::MAX
            )));
        }
        if self.max_message_size < self.mtu {
            return Err(XrceError::Config("max_message_size must be >= mtu".into()));
        }
        self.reliability.validate()
    }
}
