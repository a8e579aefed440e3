// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// ProxyBridge trait - bridges the XRCE agent to the pub/sub middleware.
//
// Middleware-agnostic: the agent only needs create/write/read/delete.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::Result;
use crate::protocol::{ObjectKind, Representation};

/// Opaque middleware handle for one created entity.
pub type EntityHandle = u32;

/// What a new entity hangs off on the middleware side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parent {
    /// Participants are created in a domain.
    Domain(u16),
    /// Everything else has a parent entity.
    Entity(EntityHandle),
    /// Free-standing objects (application, QoS profile).
    None,
}

/// Bridge between the XRCE agent and the middleware that moves the data.
///
/// Implementations must be callable from several agent workers at once.
pub trait ProxyBridge: Send + Sync {
    /// Create a middleware entity described by `representation`.
    /// Returns a unique entity handle.
    fn create_entity(
        &self,
        kind: ObjectKind,
        parent: Parent,
        representation: &Representation,
    ) -> Result<EntityHandle>;

    /// Delete an entity. Children are always deleted first by the agent.
    fn delete_entity(&self, handle: EntityHandle) -> Result<()>;

    /// Write serialized data through the given writer.
    fn write_data(&self, writer: EntityHandle, data: &[u8]) -> Result<()>;

    /// Take one sample from the given reader.
    /// Returns `None` if no data is available.
    fn read_data(&self, reader: EntityHandle) -> Result<Option<Vec<u8>>>;
}

// ---------------------------------------------------------------------------
// Null bridge (for testing)
// ---------------------------------------------------------------------------

/// A no-op bridge that always succeeds and never produces data. Useful for
/// protocol-level testing without a middleware.
#[derive(Debug, Default)]
pub struct NullBridge {
    next_handle: AtomicU32,
}

impl NullBridge {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProxyBridge for NullBridge {
    fn create_entity(
        &self,
        _kind: ObjectKind,
        _parent: Parent,
        _representation: &Representation,
    ) -> Result<EntityHandle> {
        Ok(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn delete_entity(&self, _handle: EntityHandle) -> Result<()> {
        Ok(())
    }

    fn write_data(&self, _writer: EntityHandle, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn read_data(&self, _reader: EntityHandle) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}
