// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! DDS-XRCE style pub/sub bridge: client sessions and the agent that
//! proxies them into a middleware.
//!
//! Resource-constrained clients (MCUs, sensors, embedded Linux) talk a
//! compact message protocol to an agent, which creates and drives the real
//! middleware entities on their behalf.
//!
//! # Architecture
//!
//! ```text
//! Session (client)                 XrceAgent                       Middleware
//!        |                                |                            |
//!        |--- CREATE_CLIENT ------------>|                            |
//!        |<-- STATUS(client) ------------|                            |
//!        |--- CREATE(participant) ------>|--- create_entity --------->|
//!        |--- WRITE_DATA(payload) ------>|--- write_data ------------>|
//!        |--- READ_DATA(reader) -------->|                            |
//!        |<-- DATA(payload) -------------|<-- read_data --------------|
//!        |--- DELETE(client) ----------->|--- delete_entity (all) --->|
//! ```
//!
//! # Key Features
//!
//! - **Transport-agnostic**: UDP, TCP, serial (UART) and in-process links
//! - **Middleware-agnostic**: plug any pub/sub layer in via [`ProxyBridge`]
//! - **Reliable streams**: history windows, ACKNACK retransmission and
//!   heartbeat back-off
//! - **Fragmentation**: oversized submessages are split and reassembled
//!   transparently
//! - **Object graph**: REUSE/REPLACE creation semantics and cascading delete
//!
//! # Transports
//!
//! | Transport | Use Case | MTU |
//! |-----------|----------|-----|
//! | [`UdpTransport`] | WiFi / Ethernet MCUs | 1500 |
//! | [`SerialTransport`] | UART / RS-485 / HC-12 | 64-256 |
//! | [`TcpTransport`] | Cloud / NAT traversal | 4096 |
//! | [`MemoryAgentTransport`] | In-process tests | any |

pub mod agent;
pub mod config;
pub mod correlator;
pub mod error;
pub mod fragment;
pub mod graph;
pub mod protocol;
pub mod proxy;
pub mod session;
pub mod stream;
pub mod transport;

// Re-exports for convenience.
pub use agent::XrceAgent;
pub use config::{ReliabilityConfig, SessionConfig, XrceAgentConfig};
pub use correlator::{StatusCallback, TopicCallback};
pub use error::{Result, XrceError};
pub use graph::{Entity, ObjectGraph};
pub use protocol::{
    // Identifiers
    ClientKey, ObjectId, ObjectKind, RequestId, SeqNum, StreamDirection, StreamId, StreamKind,
    // Message types
    MessageHeader, Submessage, SubmessageHeader, XrceMessage,
    // Payload types
    AcknackPayload, CreateClientPayload, CreatePayload, DataPayload, DeletePayload,
    FragmentPayload, HeartbeatPayload, ReadDataPayload, StatusPayload, WriteDataPayload,
    // Enums
    CreationMode, Representation, StatusCode,
    // Functions
    parse_message, parse_submessage, serialize_message, serialize_submessage,
    OBJECTID_CLIENT,
};
pub use proxy::{EntityHandle, NullBridge, Parent, ProxyBridge};
pub use session::{CloseHandle, Session};
pub use transport::{
    ClientTransport, MemoryAgentTransport, MemoryClientTransport, SerialTransport,
    TcpClientTransport, TcpTransport, TransportAddr, UdpClientTransport, UdpTransport,
    XrceTransport,
};

#[cfg(test)]
mod test_util;
#[cfg(test)]
mod tests;
