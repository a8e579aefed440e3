// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request/status correlation.
//!
//! Every request the client emits gets a fresh [`RequestId`]; STATUS and DATA
//! replies carry it back. The correlator records the outcome per id and
//! forwards replies to the user callbacks.

use std::collections::HashMap;
use std::fmt;

use crate::protocol::{ObjectId, RequestId, StatusCode, StreamId};

/// Requests tracked at once. Past it, everything but the newest half is
/// dropped.
pub const MAX_TRACKED_REQUESTS: u16 = 512;

/// Called for every STATUS: (object id, request id, status).
pub type StatusCallback = Box<dyn FnMut(ObjectId, RequestId, StatusCode) + Send>;

/// Called for every DATA: (object id, request id, input stream, payload).
pub type TopicCallback = Box<dyn FnMut(ObjectId, RequestId, StreamId, &[u8]) + Send>;

#[derive(Default)]
pub struct Correlator {
    last_request: u16,
    /// Registered requests and their outcome once known.
    pending: HashMap<RequestId, Option<StatusCode>>,
    on_status: Option<StatusCallback>,
    on_topic: Option<TopicCallback>,
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("last_request", &self.last_request)
            .field("tracked", &self.tracked())
            .finish_non_exhaustive()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status_callback(&mut self, cb: StatusCallback) {
        self.on_status = Some(cb);
    }

    pub fn set_topic_callback(&mut self, cb: TopicCallback) {
        self.on_topic = Some(cb);
    }

    /// Next request id. Wraps around and never yields [`RequestId::INVALID`].
    pub fn next_request_id(&mut self) -> RequestId {
        self.last_request = self.last_request.wrapping_add(1);
        if self.last_request == RequestId::INVALID.0 {
            self.last_request = 1;
        }
        RequestId(self.last_request)
    }

    /// Start waiting for `request_id`; a previous outcome is forgotten.
    pub fn register(&mut self, request_id: RequestId) {
        self.pending.insert(request_id, None);
        if self.pending.len() > usize::from(MAX_TRACKED_REQUESTS) {
            let newest = self.last_request;
            let before = self.pending.len();
            self.pending
                .retain(|id, _| newest.wrapping_sub(id.0) < MAX_TRACKED_REQUESTS / 2);
            log::debug!(
                "[XRCE] dropped {} requests older than the last {}",
                before - self.pending.len(),
                MAX_TRACKED_REQUESTS / 2
            );
        }
    }

    /// Drop every tracked request (the session was re-established).
    pub fn reset(&mut self) {
        self.pending.clear();
    }

    pub fn tracked(&self) -> usize {
        self.pending.len()
    }

    pub fn on_status(&mut self, object_id: ObjectId, request_id: RequestId, status: StatusCode) {
        match self.pending.get_mut(&request_id) {
            Some(slot) => *slot = Some(status),
            None => log::debug!(
                "[XRCE] STATUS for unregistered request {} (object {})",
                request_id.0,
                object_id
            ),
        }
        if let Some(cb) = self.on_status.as_mut() {
            cb(object_id, request_id, status);
        }
    }

    /// A DATA answering a registered READ_DATA resolves it as OK.
    pub fn on_data(
        &mut self,
        object_id: ObjectId,
        request_id: RequestId,
        stream_id: StreamId,
        payload: &[u8],
    ) {
        if let Some(slot) = self.pending.get_mut(&request_id) {
            slot.get_or_insert(StatusCode::Ok);
        }
        if let Some(cb) = self.on_topic.as_mut() {
            cb(object_id, request_id, stream_id, payload);
        }
    }

    pub fn status_of(&self, request_id: RequestId) -> Option<StatusCode> {
        self.pending.get(&request_id).copied().flatten()
    }

    pub fn is_resolved(&self, request_id: RequestId) -> bool {
        self.status_of(request_id).is_some()
    }

    pub fn all_resolved(&self, request_ids: &[RequestId]) -> bool {
        request_ids.iter().all(|&id| self.is_resolved(id))
    }

    /// Per-id outcome, `None` where no reply arrived. Resolved ids are
    /// handed out once and stop being tracked.
    pub fn take_statuses(&mut self, request_ids: &[RequestId]) -> Vec<Option<StatusCode>> {
        request_ids
            .iter()
            .map(|id| match self.pending.get(id) {
                Some(Some(status)) => {
                    let status = *status;
                    self.pending.remove(id);
                    Some(status)
                }
                _ => None,
            })
            .collect()
    }
}
