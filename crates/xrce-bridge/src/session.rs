// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client-side XRCE session.
//!
//! A [`Session`] owns its streams, the fragment reassembler and the request
//! correlator. It never spawns threads: all I/O happens inside [`Session::run`]
//! and the `run_until*` helpers built on it, so an embedded main loop keeps
//! full control of when the radio/socket is touched.
//!
//! ```text
//! create_session -> create_*_stream -> create_participant/... (buffered)
//!                -> run_until_all_status (flush + receive + dispatch)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::SessionConfig;
use crate::correlator::{Correlator, StatusCallback, TopicCallback};
use crate::error::{Result, XrceError};
use crate::fragment::Reassembler;
use crate::protocol::{
    self, ClientKey, CreateClientPayload, CreatePayload, CreationMode, DeletePayload,
    MessageHeader, ObjectId, ObjectKind, ReadDataPayload, Representation, RequestId, SeqNum,
    StatusCode, StreamDirection, StreamId, StreamKind, Submessage, WriteDataPayload,
    MAX_SAMPLES_UNLIMITED, OBJECTID_CLIENT, SESSION_ID_WITHOUT_CLIENT_KEY,
};
use crate::stream::{Batch, StreamSet};
use crate::transport::ClientTransport;

/// Longest a single blocking receive waits before re-checking the close flag.
const RECV_SLICE: Duration = Duration::from_millis(20);

/// Shareable flag that makes a session stop running.
#[derive(Debug, Clone, Default)]
pub struct CloseHandle(Arc<AtomicBool>);

impl CloseHandle {
    pub fn close(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// One client session with an agent.
pub struct Session<T: ClientTransport> {
    transport: T,
    config: SessionConfig,
    client_key: ClientKey,
    streams: StreamSet,
    reassembler: Reassembler,
    correlator: Correlator,
    /// Reply to the last CREATE_CLIENT.
    session_status: Option<StatusCode>,
    established: bool,
    closed: CloseHandle,
    mtu: usize,
    rx_buf: Vec<u8>,
}

impl<T: ClientTransport> Session<T> {
    pub fn new(transport: T, client_key: ClientKey, config: SessionConfig) -> Result<Self> {
        config.validate()?;
        let mtu = config.mtu.min(transport.mtu());
        let keyed = config.session_id < SESSION_ID_WITHOUT_CLIENT_KEY;
        let header = MessageHeader::new(config.session_id, 0, 0, client_key).size();
        let slot_size = mtu.checked_sub(header).ok_or_else(|| {
            XrceError::Config(format!("transport MTU {} leaves no room for data", mtu))
        })?;
        Ok(Self {
            streams: StreamSet::new(keyed, slot_size, 1, config.reliability.clone()),
            reassembler: Reassembler::new(config.max_message_size),
            correlator: Correlator::new(),
            session_status: None,
            established: false,
            closed: CloseHandle::default(),
            rx_buf: vec![0u8; config.max_message_size.max(mtu)],
            transport,
            config,
            client_key,
            mtu,
        })
    }

    pub fn client_key(&self) -> ClientKey {
        self.client_key
    }

    pub fn session_id(&self) -> u8 {
        self.config.session_id
    }

    /// The agent accepted the session and it has not been deleted.
    pub fn is_established(&self) -> bool {
        self.established && !self.closed.is_closed()
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.closed.clone()
    }

    /// Mark the session not runnable. Pending `run` calls return promptly.
    pub fn close(&self) {
        self.closed.close();
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Give the transport back, e.g. to open a new session over the same
    /// link after a restart.
    pub fn into_transport(self) -> T {
        self.transport
    }

    pub fn streams(&self) -> &StreamSet {
        &self.streams
    }

    pub fn set_status_callback(&mut self, cb: StatusCallback) {
        self.correlator.set_status_callback(cb);
    }

    pub fn set_topic_callback(&mut self, cb: TopicCallback) {
        self.correlator.set_topic_callback(cb);
    }

    pub fn status_of(&self, request_id: RequestId) -> Option<StatusCode> {
        self.correlator.status_of(request_id)
    }

    fn ensure_runnable(&self) -> Result<()> {
        if self.closed.is_closed() {
            return Err(XrceError::SessionClosed);
        }
        Ok(())
    }

    fn header(&self, stream_id: u8, seq: SeqNum) -> MessageHeader {
        MessageHeader::new(self.config.session_id, stream_id, seq.0, self.client_key)
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    /// Open the session, resending CREATE_CLIENT every heartbeat period until
    /// the agent answers or `timeout` elapses.
    pub fn create_session(&mut self, timeout: Duration) -> Result<StatusCode> {
        self.ensure_runnable()?;
        self.session_status = None;
        let deadline = Instant::now() + timeout;
        let retry = self.config.reliability.heartbeat_period();

        loop {
            self.send_create_client()?;
            let attempt_end = (Instant::now() + retry).min(deadline);
            let answered = self.run_until(
                |s| s.session_status.is_some(),
                attempt_end.saturating_duration_since(Instant::now()),
            );
            match answered {
                Ok(()) => break,
                Err(XrceError::TimedOut) if Instant::now() < deadline => {
                    log::debug!("[XRCE] CREATE_CLIENT unanswered, retrying");
                }
                Err(e) => return Err(e),
            }
        }

        let status = self.session_status.unwrap_or(StatusCode::ErrDdsError);
        self.established = status.is_ok();
        if self.established {
            // The agent restarted its side of every stream; so do we.
            self.streams.reset();
            self.reassembler = Reassembler::new(self.config.max_message_size);
            self.correlator.reset();
            log::info!(
                "[XRCE] session 0x{:02x} established (client {})",
                self.config.session_id,
                self.client_key
            );
        } else {
            log::warn!("[XRCE] agent refused session: {:?}", status);
        }
        Ok(status)
    }

    fn send_create_client(&mut self) -> Result<()> {
        let mtu = u16::try_from(self.mtu).unwrap_or(u16::MAX);
        let submsg = Submessage::CreateClient(CreateClientPayload::new(
            self.client_key,
            self.config.session_id,
            mtu,
        ));
        let header = self.header(0, SeqNum::default());
        let mut frame = header.to_bytes();
        protocol::write_submessage(&submsg, header.client_key.is_some(), &mut frame)?;
        self.transport.send(&frame)?;
        Ok(())
    }

    /// Close the session on the agent (every entity is deleted) and mark it
    /// not runnable. The session is closed even if the agent never answers.
    pub fn delete_session(&mut self, timeout: Duration) -> Result<StatusCode> {
        self.ensure_runnable()?;
        let request_id = self.correlator.next_request_id();
        self.streams.write(
            0,
            &Submessage::Delete(DeletePayload {
                request_id,
                object_id: OBJECTID_CLIENT,
            }),
        )?;
        self.correlator.register(request_id);
        let waited = self.run_until(|s| s.correlator.is_resolved(request_id), timeout);
        self.established = false;
        self.close();
        waited?;
        Ok(self
            .correlator
            .take_statuses(&[request_id])
            .into_iter()
            .flatten()
            .next()
            .unwrap_or(StatusCode::ErrDdsError))
    }

    // -----------------------------------------------------------------------
    // Streams
    // -----------------------------------------------------------------------

    /// Create an output stream. `buffer_size` is the pending-byte budget:
    /// one message for best-effort, `history` slots for reliable.
    pub fn create_output_stream(
        &mut self,
        kind: StreamKind,
        buffer_size: usize,
        history: usize,
    ) -> Result<StreamId> {
        self.streams.create_output(kind, buffer_size, history)
    }

    pub fn create_input_stream(&mut self, kind: StreamKind, history: usize) -> Result<StreamId> {
        self.streams.create_input(kind, history)
    }

    // -----------------------------------------------------------------------
    // Requests (buffered until the next flush)
    // -----------------------------------------------------------------------

    fn output_raw(stream: StreamId) -> Result<u8> {
        if stream.direction != StreamDirection::Output {
            return Err(XrceError::InvalidStreamId(stream.raw()));
        }
        Ok(stream.raw())
    }

    /// Buffer a request and register its id once it is queued.
    fn submit(
        &mut self,
        stream: StreamId,
        build: impl FnOnce(RequestId) -> Submessage,
        track: bool,
    ) -> Result<RequestId> {
        let raw = Self::output_raw(stream)?;
        let request_id = self.correlator.next_request_id();
        self.streams.write(raw, &build(request_id))?;
        if track {
            self.correlator.register(request_id);
        }
        Ok(request_id)
    }

    /// CREATE for any object kind. `parent` is the domain id for a
    /// participant and the raw parent object id otherwise.
    pub fn create_entity(
        &mut self,
        stream: StreamId,
        object_id: ObjectId,
        parent: u16,
        representation: Representation,
        mode: CreationMode,
    ) -> Result<RequestId> {
        self.submit(
            stream,
            |request_id| {
                Submessage::Create(CreatePayload {
                    request_id,
                    object_id,
                    representation,
                    parent,
                    mode,
                })
            },
            true,
        )
    }

    fn create_kind(
        &mut self,
        kind: ObjectKind,
        stream: StreamId,
        object_id: ObjectId,
        parent: u16,
        representation: Representation,
        mode: CreationMode,
    ) -> Result<RequestId> {
        if object_id.kind()? != kind {
            return Err(XrceError::InvalidRequest(format!(
                "object {} is not a {:?}",
                object_id, kind
            )));
        }
        self.create_entity(stream, object_id, parent, representation, mode)
    }

    pub fn create_participant(
        &mut self,
        stream: StreamId,
        object_id: ObjectId,
        domain_id: u16,
        representation: Representation,
        mode: CreationMode,
    ) -> Result<RequestId> {
        self.create_kind(
            ObjectKind::Participant,
            stream,
            object_id,
            domain_id,
            representation,
            mode,
        )
    }

    pub fn create_topic(
        &mut self,
        stream: StreamId,
        object_id: ObjectId,
        participant: ObjectId,
        representation: Representation,
        mode: CreationMode,
    ) -> Result<RequestId> {
        self.create_kind(
            ObjectKind::Topic,
            stream,
            object_id,
            participant.raw(),
            representation,
            mode,
        )
    }

    pub fn create_publisher(
        &mut self,
        stream: StreamId,
        object_id: ObjectId,
        participant: ObjectId,
        representation: Representation,
        mode: CreationMode,
    ) -> Result<RequestId> {
        self.create_kind(
            ObjectKind::Publisher,
            stream,
            object_id,
            participant.raw(),
            representation,
            mode,
        )
    }

    pub fn create_subscriber(
        &mut self,
        stream: StreamId,
        object_id: ObjectId,
        participant: ObjectId,
        representation: Representation,
        mode: CreationMode,
    ) -> Result<RequestId> {
        self.create_kind(
            ObjectKind::Subscriber,
            stream,
            object_id,
            participant.raw(),
            representation,
            mode,
        )
    }

    pub fn create_datawriter(
        &mut self,
        stream: StreamId,
        object_id: ObjectId,
        publisher: ObjectId,
        representation: Representation,
        mode: CreationMode,
    ) -> Result<RequestId> {
        self.create_kind(
            ObjectKind::DataWriter,
            stream,
            object_id,
            publisher.raw(),
            representation,
            mode,
        )
    }

    pub fn create_datareader(
        &mut self,
        stream: StreamId,
        object_id: ObjectId,
        subscriber: ObjectId,
        representation: Representation,
        mode: CreationMode,
    ) -> Result<RequestId> {
        self.create_kind(
            ObjectKind::DataReader,
            stream,
            object_id,
            subscriber.raw(),
            representation,
            mode,
        )
    }

    /// DELETE `object_id` and everything below it on the agent.
    pub fn delete_entity(&mut self, stream: StreamId, object_id: ObjectId) -> Result<RequestId> {
        self.submit(
            stream,
            |request_id| Submessage::Delete(DeletePayload {
                request_id,
                object_id,
            }),
            true,
        )
    }

    /// WRITE_DATA through `writer`. The agent only answers on failure, so
    /// the returned id is not tracked by the correlator.
    pub fn write(
        &mut self,
        stream: StreamId,
        writer: ObjectId,
        payload: &[u8],
    ) -> Result<RequestId> {
        self.submit(
            stream,
            |request_id| {
                Submessage::WriteData(WriteDataPayload {
                    request_id,
                    object_id: writer,
                    data: payload.to_vec(),
                })
            },
            false,
        )
    }

    /// READ_DATA: ask the agent to push samples of `reader` on
    /// `input_stream`, at most `max_samples` (`None` = no limit).
    pub fn request_data(
        &mut self,
        stream: StreamId,
        reader: ObjectId,
        input_stream: StreamId,
        max_samples: Option<u16>,
    ) -> Result<RequestId> {
        if input_stream.direction != StreamDirection::Input {
            return Err(XrceError::InvalidStreamId(input_stream.raw()));
        }
        if !self.streams.has_input(input_stream.raw()) {
            return Err(XrceError::UnknownStream(input_stream.raw()));
        }
        let max_samples = max_samples
            .map(|n| n.min(MAX_SAMPLES_UNLIMITED - 1))
            .unwrap_or(MAX_SAMPLES_UNLIMITED);
        self.submit(
            stream,
            |request_id| {
                Submessage::ReadData(ReadDataPayload {
                    request_id,
                    object_id: reader,
                    stream_id: input_stream.raw(),
                    max_samples,
                })
            },
            true,
        )
    }

    // -----------------------------------------------------------------------
    // I/O
    // -----------------------------------------------------------------------

    /// Send everything due: buffered best-effort data, reliable data in
    /// the window, ACKNACKs and heartbeats. Returns the bytes sent.
    ///
    /// Send failures are logged; reliable data is recovered by the
    /// heartbeat/ACKNACK loop.
    pub fn flush(&mut self) -> Result<usize> {
        self.ensure_runnable()?;
        let outgoing = self.streams.outgoing(Instant::now());
        let mut sent = 0;
        for (raw, seq, body) in outgoing.messages {
            let frame = protocol::frame_message(&self.header(raw, seq), &body);
            match self.transport.send(&frame) {
                Ok(n) => sent += n,
                Err(e) => log::warn!(
                    "[XRCE] send on stream 0x{:02x} seq {} failed: {}",
                    raw,
                    seq,
                    e
                ),
            }
        }
        Ok(sent)
    }

    /// One cooperative pass: flush, wait up to `timeout` for traffic, then
    /// process every datagram already queued and flush the replies.
    ///
    /// Returns whether anything was sent or received.
    pub fn run(&mut self, timeout: Duration) -> Result<bool> {
        let mut did_work = self.flush()? > 0;

        let deadline = Instant::now() + timeout;
        let mut wait = true;
        loop {
            self.ensure_runnable()?;
            let slice = if wait {
                deadline
                    .saturating_duration_since(Instant::now())
                    .min(RECV_SLICE)
            } else {
                Duration::ZERO
            };
            let received = match self.transport.receive(&mut self.rx_buf, slice) {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("[XRCE] receive failed: {}", e);
                    None
                }
            };
            match received {
                Some(n) => {
                    did_work = true;
                    wait = false;
                    let datagram = self.rx_buf[..n].to_vec();
                    self.handle_datagram(&datagram);
                }
                None if wait && Instant::now() < deadline => continue,
                None => break,
            }
        }

        did_work |= self.flush()? > 0;
        Ok(did_work)
    }

    /// Run until `done` holds or `timeout` elapses (`TimedOut`). Each pass
    /// is bounded by the remaining time and the heartbeat period.
    pub fn run_until<F>(&mut self, mut done: F, timeout: Duration) -> Result<()>
    where
        F: FnMut(&Self) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let period = self.config.reliability.heartbeat_period();
        loop {
            if done(&*self) {
                return Ok(());
            }
            self.ensure_runnable()?;
            let now = Instant::now();
            if now >= deadline {
                return Err(XrceError::TimedOut);
            }
            self.run((deadline - now).min(period))?;
        }
    }

    /// Run until every request in `request_ids` has a reply. The returned
    /// statuses are handed over: the requests are no longer tracked.
    pub fn run_until_all_status(
        &mut self,
        request_ids: &[RequestId],
        timeout: Duration,
    ) -> Result<Vec<StatusCode>> {
        self.run_until(|s| s.correlator.all_resolved(request_ids), timeout)?;
        Ok(self
            .correlator
            .take_statuses(request_ids)
            .into_iter()
            .flatten()
            .collect())
    }

    /// Run until every reliable output stream is fully acknowledged.
    ///
    /// Fails with `StreamFailed` once a stream exhausts its heartbeat
    /// retries. The unacknowledged data stays queued; a later write or a
    /// late ACKNACK resumes the stream.
    pub fn run_until_confirm_delivery(&mut self, timeout: Duration) -> Result<()> {
        self.run_until(
            |s| s.streams.all_acked() || s.streams.failed_stream().is_some(),
            timeout,
        )?;
        match self.streams.failed_stream() {
            Some(raw) if !self.streams.all_acked() => Err(XrceError::StreamFailed(raw)),
            _ => Ok(()),
        }
    }

    /// Keep running for `duration` regardless of traffic.
    pub fn run_for(&mut self, duration: Duration) -> Result<()> {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            self.run(deadline - now)?;
        }
    }

    // -----------------------------------------------------------------------
    // Inbound
    // -----------------------------------------------------------------------

    /// Process one datagram. Malformed datagrams are dropped whole before
    /// any stream state changes.
    fn handle_datagram(&mut self, datagram: &[u8]) {
        let parsed = protocol::split_message(datagram)
            .and_then(|(header, body)| Ok((header, protocol::parse_submessages(body)?)));
        let (header, batch) = match parsed {
            Ok(p) => p,
            Err(e) => {
                log::warn!("[XRCE] dropping malformed datagram: {}", e);
                return;
            }
        };
        if header.session_id != self.config.session_id {
            log::debug!(
                "[XRCE] dropping datagram for session 0x{:02x}",
                header.session_id
            );
            return;
        }

        let stream = StreamId::from_raw(header.stream_id, StreamDirection::Input);
        match self
            .streams
            .receive(header.stream_id, SeqNum(header.sequence_nr), batch)
        {
            Ok(delivered) => {
                for batch in delivered {
                    self.dispatch(stream, batch);
                }
            }
            Err(e) => log::warn!("[XRCE] dropping datagram: {}", e),
        }
    }

    fn dispatch(&mut self, stream: StreamId, batch: Batch) {
        for submsg in batch {
            match submsg {
                Submessage::Status(p)
                    if p.object_id == OBJECTID_CLIENT && !p.request_id.is_valid() =>
                {
                    self.session_status = Some(p.status);
                }
                Submessage::Status(p) => {
                    self.correlator.on_status(p.object_id, p.request_id, p.status)
                }
                Submessage::Data(p) => {
                    self.correlator
                        .on_data(p.object_id, p.request_id, stream, &p.data)
                }
                Submessage::Heartbeat(hb) => match self.streams.on_heartbeat(&hb) {
                    Ok(delivered) => {
                        let target = StreamId::from_raw(hb.stream_id, StreamDirection::Input);
                        for batch in delivered {
                            self.dispatch(target, batch);
                        }
                    }
                    Err(e) => log::debug!("[XRCE] HEARTBEAT ignored: {}", e),
                },
                Submessage::Acknack(ack) => {
                    if let Err(e) = self.streams.on_acknack(&ack, Instant::now()) {
                        log::debug!("[XRCE] ACKNACK ignored: {}", e);
                    }
                }
                Submessage::Fragment(frag) => {
                    match self.reassembler.push(self.client_key, stream.raw(), &frag) {
                        Ok(Some(payload)) => match protocol::parse_submessages(&payload) {
                            Ok(inner) => self.dispatch(stream, inner),
                            Err(e) => log::warn!("[XRCE] reassembled message invalid: {}", e),
                        },
                        Ok(None) => {}
                        Err(e) => log::warn!("[XRCE] fragment dropped: {}", e),
                    }
                }
                other => log::debug!(
                    "[XRCE] unexpected submessage 0x{:02x} from agent",
                    other.id()
                ),
            }
        }
    }
}
