// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Fragmentation codec.
//!
//! A submessage too large for one stream slot is carried as a run of
//! FRAGMENT submessages, one per sequence number. Reliable streams hand
//! fragments up in order, so reassembly only ever appends.

use std::collections::HashMap;

use crate::error::{Result, XrceError};
use crate::protocol::{
    self, ClientKey, FragmentHeader, FragmentPayload, MessageHeader, Submessage,
    FRAGMENT_HEADER_SIZE, SUBMESSAGE_HEADER_SIZE,
};

/// Bytes a FRAGMENT submessage adds around its chunk.
pub const FRAGMENT_OVERHEAD: usize = SUBMESSAGE_HEADER_SIZE + FRAGMENT_HEADER_SIZE;

/// Split `payload` into FRAGMENT submessages whose serialized size is at
/// most `max_submessage_size` bytes each.
pub fn fragment_submessage(payload: &[u8], max_submessage_size: usize) -> Result<Vec<Submessage>> {
    let chunk = max_submessage_size.saturating_sub(FRAGMENT_OVERHEAD);
    if chunk == 0 {
        return Err(XrceError::FragmentError(format!(
            "slot of {} bytes cannot hold a fragment",
            max_submessage_size
        )));
    }
    let count = payload.len().div_ceil(chunk).max(1);
    let total_fragments = u16::try_from(count).map_err(|_| XrceError::ExceedsMaxMessageSize {
        size: payload.len(),
        max: chunk * usize::from(u16::MAX),
    })?;

    let mut out = Vec::with_capacity(count);
    for nr in 0..total_fragments {
        let start = usize::from(nr) * chunk;
        let end = (start + chunk).min(payload.len());
        out.push(Submessage::Fragment(FragmentPayload {
            header: FragmentHeader {
                fragment_nr: nr,
                total_fragments,
            },
            more: nr + 1 < total_fragments,
            data: payload[start..end].to_vec(),
        }));
    }
    Ok(out)
}

/// Split `payload` into complete datagrams of at most `mtu` bytes.
///
/// Every frame repeats `header` with the sequence number advanced by one per
/// frame, starting at `header.sequence_nr`.
pub fn fragment(header: &MessageHeader, payload: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>> {
    let slot = mtu.saturating_sub(header.size());
    let keyed = header.client_key.is_some();
    let pieces = fragment_submessage(payload, slot)?;

    let mut frames = Vec::with_capacity(pieces.len());
    let mut hdr = *header;
    for piece in &pieces {
        let mut frame = hdr.to_bytes();
        protocol::write_submessage(piece, keyed, &mut frame)?;
        frames.push(frame);
        hdr.sequence_nr = hdr.sequence_nr.wrapping_add(1);
    }
    Ok(frames)
}

// ---------------------------------------------------------------------------
// Reassembly
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Partial {
    data: Vec<u8>,
    next_fragment: u16,
    total_fragments: u16,
}

/// In-progress reassemblies keyed by (client key, stream raw id).
#[derive(Debug)]
pub struct Reassembler {
    partials: HashMap<(ClientKey, u8), Partial>,
    max_message_size: usize,
}

impl Reassembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            partials: HashMap::new(),
            max_message_size,
        }
    }

    /// Feed one fragment. Returns the complete payload once the terminal
    /// fragment arrives.
    ///
    /// Any error discards the reassembly it concerns.
    pub fn push(
        &mut self,
        client_key: ClientKey,
        stream_id: u8,
        frag: &FragmentPayload,
    ) -> Result<Option<Vec<u8>>> {
        let key = (client_key, stream_id);
        let nr = frag.header.fragment_nr;

        if nr == 0 {
            if self.partials.remove(&key).is_some() {
                log::warn!(
                    "[XRCE] client {} stream 0x{:02x}: new fragment run abandons the previous one",
                    client_key,
                    stream_id
                );
            }
            self.partials.insert(
                key,
                Partial {
                    data: Vec::new(),
                    next_fragment: 0,
                    total_fragments: frag.header.total_fragments,
                },
            );
        }

        let in_order = self.partials.get(&key).map(|p| {
            p.next_fragment == nr && p.total_fragments == frag.header.total_fragments
        });
        if in_order == Some(false) {
            self.partials.remove(&key);
        }
        let partial = match (in_order, self.partials.get_mut(&key)) {
            (Some(true), Some(p)) => p,
            _ => return Err(XrceError::FragmentOutOfSession { fragment_nr: nr }),
        };

        let size = partial.data.len() + frag.data.len();
        if size > self.max_message_size {
            self.partials.remove(&key);
            return Err(XrceError::ExceedsMaxMessageSize {
                size,
                max: self.max_message_size,
            });
        }
        partial.data.extend_from_slice(&frag.data);
        partial.next_fragment = nr.wrapping_add(1);

        if frag.more {
            if partial.next_fragment >= partial.total_fragments {
                self.partials.remove(&key);
                return Err(XrceError::FragmentError(format!(
                    "fragment {} of {} claims more follow",
                    nr, frag.header.total_fragments
                )));
            }
            return Ok(None);
        }
        if partial.next_fragment != partial.total_fragments {
            self.partials.remove(&key);
            return Err(XrceError::FragmentError(format!(
                "fragment {} of {} claims to be the last",
                nr, frag.header.total_fragments
            )));
        }
        Ok(self.partials.remove(&key).map(|p| p.data))
    }

    /// Feed one raw datagram carrying a single FRAGMENT submessage.
    pub fn reassemble(&mut self, frame: &[u8]) -> Result<Option<Vec<u8>>> {
        let (header, body) = protocol::split_message(frame)?;
        let (submsg, consumed) = protocol::parse_submessage(body)?;
        if consumed != body.len() {
            return Err(XrceError::PayloadLengthMismatch);
        }
        match submsg {
            Submessage::Fragment(frag) => self.push(
                header.client_key.unwrap_or_default(),
                header.stream_id,
                &frag,
            ),
            other => Err(XrceError::FragmentError(format!(
                "expected FRAGMENT, got submessage 0x{:02x}",
                other.id()
            ))),
        }
    }

    /// Drop all partial payloads of one client.
    pub fn forget_client(&mut self, client_key: ClientKey) {
        self.partials.retain(|(k, _), _| *k != client_key);
    }

    pub fn in_progress(&self) -> usize {
        self.partials.len()
    }
}
