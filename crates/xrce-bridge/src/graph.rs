// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-client object graph.
//!
//! Entities live in an id-indexed arena; children name their parent by
//! [`ObjectId`]. Every entity is created after its parent, so the creation
//! order reversed is always a valid child-before-parent deletion order.

use std::collections::HashMap;

use crate::protocol::{CreationMode, ObjectId, ObjectKind, Representation, StatusCode};
use crate::proxy::{EntityHandle, Parent, ProxyBridge};

/// Outcome of a graph operation. The error side is the STATUS code that
/// goes back to the requester.
pub type EntityResult<T> = std::result::Result<T, StatusCode>;

/// One agent-side proxy entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entity {
    pub id: ObjectId,
    pub kind: ObjectKind,
    pub representation: Representation,
    /// Parent entity; `None` for participants and free-standing objects.
    pub parent: Option<ObjectId>,
    pub handle: EntityHandle,
    creation_seq: u64,
}

#[derive(Debug)]
pub struct ObjectGraph {
    entities: HashMap<ObjectId, Entity>,
    next_creation: u64,
    max_objects: usize,
}

impl ObjectGraph {
    pub fn new(max_objects: usize) -> Self {
        Self {
            entities: HashMap::new(),
            next_creation: 0,
            max_objects,
        }
    }

    pub fn get(&self, id: ObjectId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    /// Handle of `id` if it exists and is of `kind`.
    pub fn handle_of(&self, id: ObjectId, kind: ObjectKind) -> Option<EntityHandle> {
        self.entities
            .get(&id)
            .filter(|e| e.kind == kind)
            .map(|e| e.handle)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Create (or reuse, or replace) the entity `object_id`.
    ///
    /// `parent` is the domain id for a participant and the raw parent
    /// object id otherwise. Returns `Ok` for a new entity and `OkMatched`
    /// when an equal one was reused.
    pub fn create(
        &mut self,
        object_id: ObjectId,
        representation: &Representation,
        parent: u16,
        mode: CreationMode,
        bridge: &dyn ProxyBridge,
    ) -> EntityResult<StatusCode> {
        let kind = match object_id.kind() {
            Ok(ObjectKind::Client) | Err(_) => return Err(StatusCode::ErrInvalidData),
            Ok(kind) => kind,
        };
        if !is_well_formed(representation) {
            return Err(StatusCode::ErrInvalidData);
        }
        let (parent_id, bridge_parent) = self.resolve_parent(kind, parent)?;

        if let Some(existing) = self.entities.get(&object_id) {
            let equal = existing.representation == *representation && existing.parent == parent_id;
            if mode.reuse && equal {
                return Ok(StatusCode::OkMatched);
            }
            if !mode.replace {
                return Err(StatusCode::ErrAlreadyExists);
            }
            log::debug!("[XRCE] replacing object {}", object_id);
            self.delete(object_id, bridge)?;
        }

        if self.entities.len() >= self.max_objects {
            log::warn!(
                "[XRCE] object table full ({} entries), rejecting {}",
                self.max_objects,
                object_id
            );
            return Err(StatusCode::ErrResources);
        }

        let handle = bridge
            .create_entity(kind, bridge_parent, representation)
            .map_err(|e| {
                log::warn!("[XRCE] middleware refused object {}: {}", object_id, e);
                StatusCode::ErrDdsError
            })?;

        self.next_creation += 1;
        self.entities.insert(
            object_id,
            Entity {
                id: object_id,
                kind,
                representation: representation.clone(),
                parent: parent_id,
                handle,
                creation_seq: self.next_creation,
            },
        );
        Ok(StatusCode::Ok)
    }

    fn resolve_parent(
        &self,
        kind: ObjectKind,
        parent: u16,
    ) -> EntityResult<(Option<ObjectId>, Parent)> {
        match kind.parent_kind() {
            Some(expected) => {
                let parent_id = ObjectId::from_raw(parent);
                let handle = self
                    .handle_of(parent_id, expected)
                    .ok_or(StatusCode::ErrInvalidData)?;
                Ok((Some(parent_id), Parent::Entity(handle)))
            }
            None if kind == ObjectKind::Participant => Ok((None, Parent::Domain(parent))),
            None => Ok((None, Parent::None)),
        }
    }

    /// Delete `object_id` and all its descendants, deepest first.
    /// Returns the removed ids in deletion order.
    pub fn delete(
        &mut self,
        object_id: ObjectId,
        bridge: &dyn ProxyBridge,
    ) -> EntityResult<Vec<ObjectId>> {
        if !self.entities.contains_key(&object_id) {
            return Err(StatusCode::ErrUnknownReference);
        }

        let mut subtree = vec![object_id];
        let mut i = 0;
        while i < subtree.len() {
            let current = subtree[i];
            subtree.extend(
                self.entities
                    .values()
                    .filter(|e| e.parent == Some(current))
                    .map(|e| e.id),
            );
            i += 1;
        }
        Ok(self.remove_all(subtree, bridge))
    }

    /// Delete every entity (session teardown). Returns the removed ids in
    /// deletion order.
    pub fn clear(&mut self, bridge: &dyn ProxyBridge) -> Vec<ObjectId> {
        let all = self.entities.keys().copied().collect();
        self.remove_all(all, bridge)
    }

    fn remove_all(&mut self, mut ids: Vec<ObjectId>, bridge: &dyn ProxyBridge) -> Vec<ObjectId> {
        ids.sort_by_key(|id| {
            std::cmp::Reverse(self.entities.get(id).map_or(0, |e| e.creation_seq))
        });
        for id in &ids {
            if let Some(entity) = self.entities.remove(id) {
                if let Err(e) = bridge.delete_entity(entity.handle) {
                    log::warn!("[XRCE] middleware failed to delete {}: {}", id, e);
                }
            }
        }
        ids
    }
}

fn is_well_formed(representation: &Representation) -> bool {
    match representation {
        Representation::Reference(s) | Representation::Xml(s) => !s.is_empty(),
        Representation::Binary(b) => !b.is_empty(),
    }
}
