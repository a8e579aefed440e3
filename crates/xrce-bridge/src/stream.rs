// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Stream channels.
//!
//! One channel owns one direction of one logical stream:
//!
//! - [`OutputBestEffort`]: packs submessages into a single buffer, sent once.
//! - [`OutputReliable`]: history window of sequenced slots, resent on ACKNACK
//!   until acknowledged, with HEARTBEAT back-off.
//! - [`InputBestEffort`]: hands every arrival up as-is.
//! - [`InputReliable`]: reorder buffer delivering the contiguous prefix
//!   exactly once, and ACKNACK generation for the gaps.
//!
//! [`StreamSet`] groups the channels of one session (client or agent side).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::ReliabilityConfig;
use crate::error::{Result, XrceError};
use crate::fragment;
use crate::protocol::{
    self, AcknackPayload, HeartbeatPayload, SeqNum, StreamDirection, StreamId, StreamKind,
    Submessage,
};

/// Widest ACKNACK bitmap on the wire.
pub const MAX_NACK_BITS: usize = 16;

/// Submessages carried by one received message.
pub type Batch = Vec<Submessage>;

fn encode(submsg: &Submessage, keyed: bool) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    protocol::write_submessage(submsg, keyed, &mut body)?;
    Ok(body)
}

// ---------------------------------------------------------------------------
// Best-effort output
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct OutputBestEffort {
    id: StreamId,
    capacity: usize,
    keyed: bool,
    buffer: Vec<u8>,
    next_seq: SeqNum,
}

impl OutputBestEffort {
    pub fn new(id: StreamId, capacity: usize, keyed: bool) -> Self {
        Self {
            id,
            capacity,
            keyed,
            buffer: Vec::with_capacity(capacity),
            next_seq: SeqNum::default(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Append a submessage to the pending buffer. Returns the sequence
    /// number the buffer will carry.
    pub fn write(&mut self, submsg: &Submessage) -> Result<SeqNum> {
        let body = encode(submsg, self.keyed)?;
        if body.len() > self.capacity {
            return Err(XrceError::ExceedsMaxMessageSize {
                size: body.len(),
                max: self.capacity,
            });
        }
        if self.buffer.len() + body.len() > self.capacity {
            return Err(XrceError::BufferExhausted);
        }
        self.buffer.extend_from_slice(&body);
        Ok(self.next_seq)
    }

    /// Take the pending buffer, if any. Never retransmitted.
    pub fn pop_for_send(&mut self) -> Option<(SeqNum, Vec<u8>)> {
        if self.buffer.is_empty() {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq = seq.wrapping_add(1);
        Some((seq, std::mem::take(&mut self.buffer)))
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Reliable output
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Written, never sent.
    Pending,
    /// Sent, awaiting acknowledgement.
    Unacked,
    /// Named by an ACKNACK; goes out again on the next pass.
    RetransmitPending,
}

#[derive(Debug)]
struct Slot {
    seq: SeqNum,
    body: Vec<u8>,
    state: SlotState,
}

/// Reliable output channel.
///
/// Holds at most `history` unacknowledged slots; a slot leaves the window
/// only when an ACKNACK base moves past it.
#[derive(Debug)]
pub struct OutputReliable {
    id: StreamId,
    slot_size: usize,
    history: usize,
    keyed: bool,
    window: VecDeque<Slot>,
    next_seq: SeqNum,
    reliability: ReliabilityConfig,
    interval: Duration,
    next_heartbeat: Option<Instant>,
    /// Heartbeats sent since the last ACKNACK.
    retries: u32,
    failed: bool,
}

impl OutputReliable {
    pub fn new(
        id: StreamId,
        slot_size: usize,
        history: usize,
        keyed: bool,
        reliability: ReliabilityConfig,
    ) -> Self {
        let interval = reliability.heartbeat_period();
        Self {
            id,
            slot_size,
            history,
            keyed,
            window: VecDeque::with_capacity(history),
            next_seq: SeqNum::default(),
            reliability,
            interval,
            next_heartbeat: None,
            retries: 0,
            failed: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn history(&self) -> usize {
        self.history
    }

    /// Slots currently held (sent or not).
    pub fn in_flight(&self) -> usize {
        self.window.len()
    }

    pub fn is_fully_acked(&self) -> bool {
        self.window.is_empty()
    }

    /// The peer stopped answering heartbeats for `max_retries` rounds.
    /// Cleared by the next ACKNACK or write.
    pub fn has_failed(&self) -> bool {
        self.failed
    }

    fn rearm(&mut self, now: Option<Instant>) {
        self.failed = false;
        self.retries = 0;
        self.interval = self.reliability.heartbeat_period();
        self.next_heartbeat = now.map(|t| t + self.interval);
    }

    /// Queue a submessage. Oversized submessages are split into FRAGMENT
    /// slots; either every piece fits in the window or none is queued.
    ///
    /// Returns the sequence number of the first slot used.
    pub fn write(&mut self, submsg: &Submessage) -> Result<SeqNum> {
        let body = encode(submsg, self.keyed)?;
        if self.failed {
            log::info!(
                "[XRCE] stream 0x{:02x}: new write, heartbeats resume",
                self.id.raw()
            );
            self.rearm(None);
        }
        if body.len() <= self.slot_size {
            if self.window.len() >= self.history {
                return Err(XrceError::BufferExhausted);
            }
            return Ok(self.push_slot(body));
        }

        let pieces = fragment::fragment_submessage(&body, self.slot_size)?;
        if pieces.len() > self.history {
            return Err(XrceError::ExceedsMaxMessageSize {
                size: body.len(),
                max: self.history * (self.slot_size - fragment::FRAGMENT_OVERHEAD),
            });
        }
        if self.window.len() + pieces.len() > self.history {
            return Err(XrceError::BufferExhausted);
        }
        let bodies = pieces
            .iter()
            .map(|piece| encode(piece, self.keyed))
            .collect::<Result<Vec<_>>>()?;
        let first = self.next_seq;
        for body in bodies {
            self.push_slot(body);
        }
        Ok(first)
    }

    fn push_slot(&mut self, body: Vec<u8>) -> SeqNum {
        let seq = self.next_seq;
        self.next_seq = seq.wrapping_add(1);
        self.window.push_back(Slot {
            seq,
            body,
            state: SlotState::Pending,
        });
        seq
    }

    /// Slots to put on the wire now: first transmissions and requested
    /// retransmissions, in sequence order.
    pub fn take_sendable(&mut self, now: Instant) -> Vec<(SeqNum, Vec<u8>)> {
        let mut out = Vec::new();
        for slot in self.window.iter_mut() {
            if slot.state != SlotState::Unacked {
                slot.state = SlotState::Unacked;
                out.push((slot.seq, slot.body.clone()));
            }
        }
        if !out.is_empty() && self.next_heartbeat.is_none() {
            self.next_heartbeat = Some(now + self.interval);
        }
        out
    }

    /// HEARTBEAT restating the unacknowledged range, when one is due.
    pub fn heartbeat(&mut self, now: Instant) -> Option<HeartbeatPayload> {
        if self.failed {
            return None;
        }
        let first = self.window.front()?.seq;
        let last = self
            .window
            .iter()
            .rev()
            .find(|s| s.state != SlotState::Pending)?
            .seq;
        if self.next_heartbeat.is_some_and(|t| now < t) {
            return None;
        }

        let max_retries = self.reliability.max_retries;
        if max_retries > 0 && self.retries >= max_retries {
            self.failed = true;
            log::warn!(
                "[XRCE] stream 0x{:02x}: no ACKNACK after {} heartbeats, giving up",
                self.id.raw(),
                self.retries
            );
            return None;
        }
        self.retries += 1;
        self.interval = (self.interval * 2).min(self.reliability.max_heartbeat_period());
        self.next_heartbeat = Some(now + self.interval);

        Some(HeartbeatPayload {
            first_unacked_seq: first.0,
            last_unacked_seq: last.0,
            stream_id: self.id.raw(),
        })
    }

    /// Apply an ACKNACK: evict everything below its base and mark the
    /// still-held named slots for retransmission. Returns how many were
    /// marked.
    pub fn on_acknack(&mut self, ack: &AcknackPayload, now: Instant) -> usize {
        let base = SeqNum(ack.first_unacked_seq);
        if base.delta(self.next_seq) > 0 {
            log::warn!(
                "[XRCE] stream 0x{:02x}: ACKNACK base {} is past last written {}",
                self.id.raw(),
                base,
                self.next_seq.wrapping_sub(1)
            );
            return 0;
        }
        if self.failed {
            log::info!(
                "[XRCE] stream 0x{:02x}: peer answered after giving up, resuming",
                self.id.raw()
            );
            self.rearm(Some(now));
        }
        self.retries = 0;

        let mut evicted = 0;
        while self.window.front().is_some_and(|s| s.seq.precedes(base)) {
            self.window.pop_front();
            evicted += 1;
        }
        if evicted > 0 {
            self.interval = self.reliability.heartbeat_period();
            self.next_heartbeat = if self.window.is_empty() {
                None
            } else {
                Some(now + self.interval)
            };
        }

        let Some(front) = self.window.front().map(|s| s.seq) else {
            return 0;
        };
        let mut marked = 0;
        for bit in 0..MAX_NACK_BITS as u16 {
            if ack.nack_bitmap & (1 << bit) == 0 {
                continue;
            }
            let idx = base.wrapping_add(bit).delta(front);
            if idx < 0 {
                // Already evicted.
                continue;
            }
            if let Some(slot) = self.window.get_mut(idx as usize) {
                if slot.state == SlotState::Unacked {
                    slot.state = SlotState::RetransmitPending;
                    marked += 1;
                }
            }
        }
        marked
    }
}

// ---------------------------------------------------------------------------
// Best-effort input
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct InputBestEffort {
    id: StreamId,
    last_seq: Option<SeqNum>,
}

impl InputBestEffort {
    pub fn new(id: StreamId) -> Self {
        Self { id, last_seq: None }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    /// Every arrival is delivered, late and repeated ones included.
    pub fn receive(&mut self, seq: SeqNum, batch: Batch) -> Batch {
        if self.last_seq.is_some_and(|last| !last.precedes(seq)) {
            log::trace!(
                "[XRCE] best-effort stream 0x{:02x}: seq {} arrived out of order",
                self.id.raw(),
                seq
            );
        }
        self.last_seq = Some(seq);
        batch
    }
}

// ---------------------------------------------------------------------------
// Reliable input
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct InputReliable {
    id: StreamId,
    history: usize,
    next_expected: SeqNum,
    /// Highest sequence number known to exist (received or announced).
    highest_known: SeqNum,
    pending: HashMap<u16, Batch>,
    acknack_due: bool,
}

impl InputReliable {
    pub fn new(id: StreamId, history: usize) -> Self {
        let next_expected = SeqNum::default();
        Self {
            id,
            history,
            next_expected,
            highest_known: next_expected.wrapping_sub(1),
            pending: HashMap::new(),
            acknack_due: false,
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn next_expected(&self) -> SeqNum {
        self.next_expected
    }

    /// An ACKNACK should go out on the next pass.
    pub fn acknack_due(&self) -> bool {
        self.acknack_due
    }

    fn note_known(&mut self, seq: SeqNum) {
        if self.highest_known.precedes(seq) {
            self.highest_known = seq;
        }
    }

    fn drain_contiguous(&mut self, out: &mut Vec<Batch>) {
        while let Some(batch) = self.pending.remove(&self.next_expected.0) {
            out.push(batch);
            self.next_expected = self.next_expected.wrapping_add(1);
        }
    }

    /// Accept one message. Returns the batches now deliverable, in order.
    pub fn receive(&mut self, seq: SeqNum, batch: Batch) -> Vec<Batch> {
        let d = seq.delta(self.next_expected);
        if d < 0 {
            log::trace!(
                "[XRCE] reliable stream 0x{:02x}: duplicate seq {}",
                self.id.raw(),
                seq
            );
            return Vec::new();
        }
        if d as usize >= self.history {
            log::debug!(
                "[XRCE] reliable stream 0x{:02x}: seq {} beyond window (expecting {})",
                self.id.raw(),
                seq,
                self.next_expected
            );
            self.acknack_due = true;
            return Vec::new();
        }
        self.note_known(seq);

        if d > 0 {
            self.pending.entry(seq.0).or_insert(batch);
            self.acknack_due = true;
            return Vec::new();
        }

        let mut out = vec![batch];
        self.next_expected = self.next_expected.wrapping_add(1);
        self.drain_contiguous(&mut out);
        out
    }

    /// Apply a HEARTBEAT. If the sender no longer holds what we are waiting
    /// for, skip ahead to its first unacknowledged number.
    pub fn on_heartbeat(&mut self, hb: &HeartbeatPayload) -> Vec<Batch> {
        let first = SeqNum(hb.first_unacked_seq);
        self.note_known(SeqNum(hb.last_unacked_seq));
        self.acknack_due = true;

        let mut out = Vec::new();
        if self.next_expected.precedes(first) {
            log::warn!(
                "[XRCE] reliable stream 0x{:02x}: sender moved on to {}, skipping from {}",
                self.id.raw(),
                first,
                self.next_expected
            );
            self.pending.retain(|&s, _| !SeqNum(s).precedes(first));
            self.next_expected = first;
            self.drain_contiguous(&mut out);
        }
        out
    }

    /// ACKNACK naming the missing numbers above the delivered prefix.
    pub fn make_acknack(&mut self) -> AcknackPayload {
        let span = self.history.min(MAX_NACK_BITS);
        let mut nack_bitmap = 0u16;
        for i in 0..span {
            let seq = self.next_expected.wrapping_add(i as u16);
            if self.highest_known.precedes(seq) {
                break;
            }
            if !self.pending.contains_key(&seq.0) {
                nack_bitmap |= 1 << i;
            }
        }
        self.acknack_due = false;
        AcknackPayload {
            first_unacked_seq: self.next_expected.0,
            nack_bitmap,
            stream_id: self.id.raw(),
        }
    }
}

// ---------------------------------------------------------------------------
// StreamSet
// ---------------------------------------------------------------------------

/// Everything one pass of a session has to put on the wire.
#[derive(Debug, Default)]
pub struct Outgoing {
    /// (stream raw id, sequence number, body)
    pub messages: Vec<(u8, SeqNum, Vec<u8>)>,
}

impl Outgoing {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// All stream channels of one session, keyed by raw stream id.
#[derive(Debug)]
pub struct StreamSet {
    keyed: bool,
    slot_size: usize,
    default_history: usize,
    reliability: ReliabilityConfig,
    out_best_effort: BTreeMap<u8, OutputBestEffort>,
    out_reliable: BTreeMap<u8, OutputReliable>,
    in_best_effort: BTreeMap<u8, InputBestEffort>,
    in_reliable: BTreeMap<u8, InputReliable>,
    /// Unsequenced bodies queued for the none stream.
    control: Vec<Vec<u8>>,
}

impl StreamSet {
    /// `slot_size` is the largest message body one datagram can carry.
    pub fn new(
        keyed: bool,
        slot_size: usize,
        default_history: usize,
        reliability: ReliabilityConfig,
    ) -> Self {
        Self {
            keyed,
            slot_size,
            default_history,
            reliability,
            out_best_effort: BTreeMap::new(),
            out_reliable: BTreeMap::new(),
            in_best_effort: BTreeMap::new(),
            in_reliable: BTreeMap::new(),
            control: Vec::new(),
        }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Restart every channel at its initial sequence number, keeping ids
    /// and sizes. Queued and unacknowledged traffic is dropped.
    pub fn reset(&mut self) {
        let keyed = self.keyed;
        for ch in self.out_best_effort.values_mut() {
            *ch = OutputBestEffort::new(ch.id, ch.capacity, keyed);
        }
        for ch in self.out_reliable.values_mut() {
            *ch = OutputReliable::new(
                ch.id,
                ch.slot_size,
                ch.history,
                keyed,
                self.reliability.clone(),
            );
        }
        for ch in self.in_best_effort.values_mut() {
            *ch = InputBestEffort::new(ch.id);
        }
        for ch in self.in_reliable.values_mut() {
            *ch = InputReliable::new(ch.id, ch.history);
        }
        self.control.clear();
    }

    fn next_index(count: usize, kind: StreamKind) -> Result<u8> {
        let max = match kind {
            StreamKind::BestEffort => StreamId::MAX_BEST_EFFORT_INDEX,
            StreamKind::Reliable => StreamId::MAX_RELIABLE_INDEX,
            StreamKind::None => {
                return Err(XrceError::InvalidRequest(
                    "the none stream is built in".into(),
                ))
            }
        };
        u8::try_from(count)
            .ok()
            .filter(|&i| i <= max)
            .ok_or_else(|| XrceError::InvalidRequest("stream ids exhausted".into()))
    }

    /// Create the next output stream of `kind`.
    ///
    /// A best-effort stream packs up to `buffer_size` bytes per message; a
    /// reliable one splits `buffer_size` into `history` slots.
    pub fn create_output(
        &mut self,
        kind: StreamKind,
        buffer_size: usize,
        history: usize,
    ) -> Result<StreamId> {
        let count = match kind {
            StreamKind::Reliable => self.out_reliable.len(),
            _ => self.out_best_effort.len(),
        };
        let id = StreamId::new(
            Self::next_index(count, kind)?,
            kind,
            StreamDirection::Output,
        );
        match kind {
            StreamKind::BestEffort => {
                let capacity = buffer_size.min(self.slot_size);
                self.out_best_effort
                    .insert(id.raw(), OutputBestEffort::new(id, capacity, self.keyed));
            }
            _ => {
                if history == 0 {
                    return Err(XrceError::InvalidRequest("history must be > 0".into()));
                }
                let slot = (buffer_size / history).min(self.slot_size);
                if slot <= fragment::FRAGMENT_OVERHEAD {
                    return Err(XrceError::InvalidRequest(format!(
                        "slot of {} bytes is too small",
                        slot
                    )));
                }
                self.out_reliable.insert(
                    id.raw(),
                    OutputReliable::new(id, slot, history, self.keyed, self.reliability.clone()),
                );
            }
        }
        Ok(id)
    }

    /// Create the next input stream of `kind`.
    pub fn create_input(&mut self, kind: StreamKind, history: usize) -> Result<StreamId> {
        let count = match kind {
            StreamKind::Reliable => self.in_reliable.len(),
            _ => self.in_best_effort.len(),
        };
        let id = StreamId::new(Self::next_index(count, kind)?, kind, StreamDirection::Input);
        match kind {
            StreamKind::BestEffort => {
                self.in_best_effort.insert(id.raw(), InputBestEffort::new(id));
            }
            _ => {
                if history == 0 {
                    return Err(XrceError::InvalidRequest("history must be > 0".into()));
                }
                self.in_reliable
                    .insert(id.raw(), InputReliable::new(id, history));
            }
        }
        Ok(id)
    }

    /// Make sure input and output channels exist for `raw`, creating them
    /// with the default history (agent side: streams follow the client).
    pub fn ensure(&mut self, raw: u8) {
        let out = StreamId::from_raw(raw, StreamDirection::Output);
        let input = out.peer();
        match out.kind {
            StreamKind::None => {}
            StreamKind::BestEffort => {
                let (keyed, slot) = (self.keyed, self.slot_size);
                self.out_best_effort
                    .entry(raw)
                    .or_insert_with(|| OutputBestEffort::new(out, slot, keyed));
                self.in_best_effort
                    .entry(raw)
                    .or_insert_with(|| InputBestEffort::new(input));
            }
            StreamKind::Reliable => {
                let (keyed, slot, history) = (self.keyed, self.slot_size, self.default_history);
                let reliability = &self.reliability;
                self.out_reliable.entry(raw).or_insert_with(|| {
                    OutputReliable::new(out, slot, history, keyed, reliability.clone())
                });
                self.in_reliable
                    .entry(raw)
                    .or_insert_with(|| InputReliable::new(input, history));
            }
        }
    }

    /// Queue a submessage on output stream `raw` (0 = unsequenced control).
    pub fn write(&mut self, raw: u8, submsg: &Submessage) -> Result<SeqNum> {
        match StreamId::from_raw(raw, StreamDirection::Output).kind {
            StreamKind::None => {
                let body = encode(submsg, self.keyed)?;
                if body.len() > self.slot_size {
                    return Err(XrceError::ExceedsMaxMessageSize {
                        size: body.len(),
                        max: self.slot_size,
                    });
                }
                self.control.push(body);
                Ok(SeqNum::default())
            }
            StreamKind::BestEffort => self
                .out_best_effort
                .get_mut(&raw)
                .ok_or(XrceError::UnknownStream(raw))?
                .write(submsg),
            StreamKind::Reliable => self
                .out_reliable
                .get_mut(&raw)
                .ok_or(XrceError::UnknownStream(raw))?
                .write(submsg),
        }
    }

    /// Feed one received message into input stream `raw`. Returns the
    /// batches now deliverable, in order.
    pub fn receive(&mut self, raw: u8, seq: SeqNum, batch: Batch) -> Result<Vec<Batch>> {
        match StreamId::from_raw(raw, StreamDirection::Input).kind {
            StreamKind::None => Ok(vec![batch]),
            StreamKind::BestEffort => Ok(vec![self
                .in_best_effort
                .get_mut(&raw)
                .ok_or(XrceError::UnknownStream(raw))?
                .receive(seq, batch)]),
            StreamKind::Reliable => Ok(self
                .in_reliable
                .get_mut(&raw)
                .ok_or(XrceError::UnknownStream(raw))?
                .receive(seq, batch)),
        }
    }

    pub fn on_heartbeat(&mut self, hb: &HeartbeatPayload) -> Result<Vec<Batch>> {
        Ok(self
            .in_reliable
            .get_mut(&hb.stream_id)
            .ok_or(XrceError::UnknownStream(hb.stream_id))?
            .on_heartbeat(hb))
    }

    pub fn on_acknack(&mut self, ack: &AcknackPayload, now: Instant) -> Result<usize> {
        Ok(self
            .out_reliable
            .get_mut(&ack.stream_id)
            .ok_or(XrceError::UnknownStream(ack.stream_id))?
            .on_acknack(ack, now))
    }

    /// Collect everything due for transmission: control traffic, ACKNACKs,
    /// best-effort buffers, reliable (re)sends and heartbeats.
    pub fn outgoing(&mut self, now: Instant) -> Outgoing {
        let mut out = Outgoing::default();
        let none = SeqNum::default();

        for body in self.control.drain(..) {
            out.messages.push((0, none, body));
        }
        for stream in self.in_reliable.values_mut() {
            if stream.acknack_due() {
                let ack = Submessage::Acknack(stream.make_acknack());
                // Fixed-size control submessages always encode.
                if let Ok(body) = encode(&ack, self.keyed) {
                    out.messages.push((0, none, body));
                }
            }
        }
        for (&raw, stream) in self.out_best_effort.iter_mut() {
            if let Some((seq, body)) = stream.pop_for_send() {
                out.messages.push((raw, seq, body));
            }
        }
        for (&raw, stream) in self.out_reliable.iter_mut() {
            for (seq, body) in stream.take_sendable(now) {
                out.messages.push((raw, seq, body));
            }
            if let Some(hb) = stream.heartbeat(now) {
                if let Ok(body) = encode(&Submessage::Heartbeat(hb), self.keyed) {
                    out.messages.push((0, none, body));
                }
            }
        }
        out
    }

    /// No reliable output stream holds unacknowledged data.
    pub fn all_acked(&self) -> bool {
        self.out_reliable.values().all(OutputReliable::is_fully_acked)
    }

    /// First reliable output stream that gave up on its peer.
    pub fn failed_stream(&self) -> Option<u8> {
        self.out_reliable
            .iter()
            .find(|(_, s)| s.has_failed())
            .map(|(&raw, _)| raw)
    }

    /// Messages output stream `raw` can take right now without failing.
    pub fn free_slots(&self, raw: u8) -> usize {
        if raw == 0 {
            return usize::MAX;
        }
        if let Some(stream) = self.out_reliable.get(&raw) {
            return stream.history() - stream.in_flight();
        }
        match self.out_best_effort.get(&raw) {
            Some(stream) if stream.is_empty() => 1,
            _ => 0,
        }
    }

    pub fn output_reliable(&self, raw: u8) -> Option<&OutputReliable> {
        self.out_reliable.get(&raw)
    }

    pub fn has_input(&self, raw: u8) -> bool {
        raw == 0 || self.in_best_effort.contains_key(&raw) || self.in_reliable.contains_key(&raw)
    }
}
