// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// XRCE agent.
//
// Accepts clients over any transport, keeps one proxy per client key
// (object graph, streams, reassembler, data subscriptions) and bridges
// entity operations to the middleware via ProxyBridge.
//
// Locking: the client table lock may be held while taking a client lock,
// never the other way round. The address map is only taken after the
// client table.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::config::{XrceAgentConfig, MIN_MTU};
use crate::error::{Result, XrceError};
use crate::fragment::Reassembler;
use crate::graph::ObjectGraph;
use crate::protocol::{
    self, ClientKey, CreateClientPayload, DataPayload, MessageHeader, ObjectId, ObjectKind,
    ReadDataPayload, RequestId, SeqNum, StatusCode, StatusPayload, StreamDirection, StreamId,
    StreamKind, Submessage, MAX_SAMPLES_UNLIMITED, OBJECTID_CLIENT, SESSION_ID_WITHOUT_CLIENT_KEY,
    XRCE_COOKIE, XRCE_VERSION,
};
use crate::proxy::ProxyBridge;
use crate::stream::{Batch, StreamSet};
use crate::transport::{self, TransportAddr, XrceTransport};

/// Datagrams handled per tick before the periodic work runs.
const MAX_DATAGRAMS_PER_TICK: usize = 64;

/// Frames to put on the wire, with their destination.
pub type Replies = Vec<(TransportAddr, Vec<u8>)>;

// ---------------------------------------------------------------------------
// Proxy client
// ---------------------------------------------------------------------------

/// An open READ_DATA request.
#[derive(Debug)]
struct Subscription {
    request_id: RequestId,
    reader: ObjectId,
    /// Stream DATA goes out on.
    stream_raw: u8,
    /// Stream the request came in on (error STATUS goes there).
    reply_raw: u8,
    /// `None` = unlimited.
    remaining: Option<u16>,
    /// Sample taken from the middleware that did not fit the window yet.
    pending: Option<Vec<u8>>,
}

/// Agent-side state of one client.
#[derive(Debug)]
struct ProxyClient {
    key: ClientKey,
    session_id: u8,
    addr: TransportAddr,
    graph: ObjectGraph,
    streams: StreamSet,
    reassembler: Reassembler,
    subscriptions: Vec<Subscription>,
    last_activity: Instant,
    /// Framed datagrams waiting for the transport.
    frames: Vec<Vec<u8>>,
    /// DELETE of the client object was processed.
    closing: bool,
}

impl ProxyClient {
    fn new(
        key: ClientKey,
        session_id: u8,
        addr: TransportAddr,
        mtu: usize,
        config: &XrceAgentConfig,
        now: Instant,
    ) -> Self {
        let header = MessageHeader::new(session_id, 0, 0, key).size();
        let keyed = session_id < SESSION_ID_WITHOUT_CLIENT_KEY;
        Self {
            key,
            session_id,
            addr,
            graph: ObjectGraph::new(config.max_objects_per_client),
            streams: StreamSet::new(
                keyed,
                mtu - header,
                config.stream_history,
                config.reliability.clone(),
            ),
            reassembler: Reassembler::new(config.max_message_size),
            subscriptions: Vec::new(),
            last_activity: now,
            frames: Vec::new(),
            closing: false,
        }
    }

    fn header(&self, stream_id: u8, seq: SeqNum) -> MessageHeader {
        MessageHeader::new(self.session_id, stream_id, seq.0, self.key)
    }

    /// Start the session over on a repeated CREATE_CLIENT: fresh streams,
    /// reassembly and subscriptions. The object graph is kept.
    fn restart(&mut self, mtu: usize, config: &XrceAgentConfig, now: Instant) {
        let header = MessageHeader::new(self.session_id, 0, 0, self.key).size();
        let keyed = self.session_id < SESSION_ID_WITHOUT_CLIENT_KEY;
        self.streams = StreamSet::new(
            keyed,
            mtu - header,
            config.stream_history,
            config.reliability.clone(),
        );
        self.reassembler = Reassembler::new(config.max_message_size);
        self.subscriptions.clear();
        self.frames.clear();
        self.closing = false;
        self.last_activity = now;
    }

    /// Run one received message through its input stream and dispatch
    /// whatever became deliverable.
    fn handle(&mut self, header: &MessageHeader, batch: Batch, bridge: &dyn ProxyBridge, now: Instant) {
        let raw = header.stream_id;
        self.streams.ensure(raw);
        match self.streams.receive(raw, SeqNum(header.sequence_nr), batch) {
            Ok(delivered) => {
                for batch in delivered {
                    self.dispatch(raw, batch, bridge, now);
                }
            }
            Err(e) => log::warn!("[XRCE] client {}: dropping message: {}", self.key, e),
        }
    }

    fn dispatch(&mut self, raw: u8, batch: Batch, bridge: &dyn ProxyBridge, now: Instant) {
        for submsg in batch {
            match submsg {
                Submessage::Create(p) => {
                    let status = self
                        .graph
                        .create(p.object_id, &p.representation, p.parent, p.mode, bridge)
                        .unwrap_or_else(|code| code);
                    log::debug!(
                        "[XRCE] client {}: CREATE {} -> {:?}",
                        self.key,
                        p.object_id,
                        status
                    );
                    self.reply_status(raw, p.request_id, p.object_id, status, now);
                }
                Submessage::Delete(p) if p.object_id == OBJECTID_CLIENT => {
                    let removed = self.graph.clear(bridge);
                    self.subscriptions.clear();
                    log::info!(
                        "[XRCE] client {} closed its session ({} objects deleted)",
                        self.key,
                        removed.len()
                    );
                    self.reply_status(raw, p.request_id, p.object_id, StatusCode::Ok, now);
                    self.closing = true;
                }
                Submessage::Delete(p) => match self.graph.delete(p.object_id, bridge) {
                    Ok(removed) => {
                        self.subscriptions
                            .retain(|s| !removed.contains(&s.reader));
                        for id in removed {
                            self.reply_status(raw, p.request_id, id, StatusCode::Ok, now);
                        }
                    }
                    Err(code) => self.reply_status(raw, p.request_id, p.object_id, code, now),
                },
                Submessage::WriteData(p) => {
                    let status = match self.graph.handle_of(p.object_id, ObjectKind::DataWriter) {
                        None => Some(StatusCode::ErrUnknownReference),
                        Some(handle) => match bridge.write_data(handle, &p.data) {
                            Ok(()) => None,
                            Err(e) => {
                                log::warn!(
                                    "[XRCE] client {}: write through {} failed: {}",
                                    self.key,
                                    p.object_id,
                                    e
                                );
                                Some(StatusCode::ErrDdsError)
                            }
                        },
                    };
                    if let Some(status) = status {
                        self.reply_status(raw, p.request_id, p.object_id, status, now);
                    }
                }
                Submessage::ReadData(p) => self.open_subscription(raw, &p, now),
                Submessage::Heartbeat(hb) => match self.streams.on_heartbeat(&hb) {
                    Ok(delivered) => {
                        for batch in delivered {
                            self.dispatch(hb.stream_id, batch, bridge, now);
                        }
                    }
                    Err(e) => log::debug!("[XRCE] HEARTBEAT ignored: {}", e),
                },
                Submessage::Acknack(ack) => {
                    if let Err(e) = self.streams.on_acknack(&ack, now) {
                        log::debug!("[XRCE] ACKNACK ignored: {}", e);
                    }
                }
                Submessage::Fragment(frag) => {
                    match self.reassembler.push(self.key, raw, &frag) {
                        Ok(Some(payload)) => match protocol::parse_submessages(&payload) {
                            Ok(inner) => self.dispatch(raw, inner, bridge, now),
                            Err(e) => log::warn!("[XRCE] reassembled message invalid: {}", e),
                        },
                        Ok(None) => {}
                        Err(e) => log::warn!("[XRCE] client {}: fragment dropped: {}", self.key, e),
                    }
                }
                other => log::debug!(
                    "[XRCE] client {}: unexpected submessage 0x{:02x}",
                    self.key,
                    other.id()
                ),
            }
        }
    }

    fn open_subscription(&mut self, raw: u8, p: &ReadDataPayload, now: Instant) {
        if self
            .graph
            .handle_of(p.object_id, ObjectKind::DataReader)
            .is_none()
        {
            self.reply_status(raw, p.request_id, p.object_id, StatusCode::ErrUnknownReference, now);
            return;
        }
        if p.max_samples == 0 {
            self.reply_status(raw, p.request_id, p.object_id, StatusCode::Ok, now);
            return;
        }
        self.streams.ensure(p.stream_id);
        // One live request per reader; a new READ_DATA supersedes the old.
        self.subscriptions.retain(|s| s.reader != p.object_id);
        self.subscriptions.push(Subscription {
            request_id: p.request_id,
            reader: p.object_id,
            stream_raw: p.stream_id,
            reply_raw: raw,
            remaining: (p.max_samples != MAX_SAMPLES_UNLIMITED).then_some(p.max_samples),
            pending: None,
        });
        log::debug!(
            "[XRCE] client {}: READ_DATA on {} -> stream 0x{:02x}, max {}",
            self.key,
            p.object_id,
            p.stream_id,
            p.max_samples
        );
    }

    /// Move middleware samples into the output streams while they have
    /// room. Finished or orphaned subscriptions are dropped.
    fn pump_subscriptions(&mut self, bridge: &dyn ProxyBridge, now: Instant) {
        let mut subscriptions = std::mem::take(&mut self.subscriptions);
        subscriptions.retain_mut(|sub| self.pump(sub, bridge, now));
        self.subscriptions = subscriptions;
    }

    /// Returns whether the subscription stays open.
    fn pump(&mut self, sub: &mut Subscription, bridge: &dyn ProxyBridge, now: Instant) -> bool {
        let Some(handle) = self.graph.handle_of(sub.reader, ObjectKind::DataReader) else {
            return false;
        };
        let reliable = StreamId::from_raw(sub.stream_raw, StreamDirection::Output).kind
            == StreamKind::Reliable;
        loop {
            if sub.remaining == Some(0) {
                return false;
            }
            if reliable && self.streams.free_slots(sub.stream_raw) == 0 {
                return true;
            }
            let data = match sub.pending.take() {
                Some(data) => data,
                None => match bridge.read_data(handle) {
                    Ok(Some(data)) => data,
                    Ok(None) => return true,
                    Err(e) => {
                        log::warn!(
                            "[XRCE] client {}: read from {} failed: {}",
                            self.key,
                            sub.reader,
                            e
                        );
                        self.reply_status(
                            sub.reply_raw,
                            sub.request_id,
                            sub.reader,
                            StatusCode::ErrDdsError,
                            now,
                        );
                        return false;
                    }
                },
            };
            let submsg = Submessage::Data(DataPayload {
                request_id: sub.request_id,
                object_id: sub.reader,
                data,
            });
            match self.write(sub.stream_raw, &submsg, now) {
                Ok(()) => {
                    if let Some(n) = sub.remaining.as_mut() {
                        *n -= 1;
                    }
                }
                Err(XrceError::BufferExhausted) => {
                    if let Submessage::Data(p) = submsg {
                        sub.pending = Some(p.data);
                    }
                    return true;
                }
                Err(e) => log::warn!(
                    "[XRCE] client {}: sample of {} dropped: {}",
                    self.key,
                    sub.reader,
                    e
                ),
            }
        }
    }

    /// Queue a submessage on output stream `raw`. A full best-effort buffer
    /// is framed first so the write can start a new one.
    fn write(&mut self, raw: u8, submsg: &Submessage, now: Instant) -> Result<()> {
        match self.streams.write(raw, submsg) {
            Err(XrceError::BufferExhausted)
                if StreamId::from_raw(raw, StreamDirection::Output).kind
                    == StreamKind::BestEffort =>
            {
                self.drain(now);
                self.streams.write(raw, submsg).map(|_| ())
            }
            other => other.map(|_| ()),
        }
    }

    fn reply_status(
        &mut self,
        raw: u8,
        request_id: RequestId,
        object_id: ObjectId,
        status: StatusCode,
        now: Instant,
    ) {
        let submsg = Submessage::Status(StatusPayload {
            request_id,
            object_id,
            status,
            implementation_status: 0,
        });
        if let Err(e) = self.write(raw, &submsg, now) {
            log::warn!(
                "[XRCE] client {}: STATUS for request {} lost: {}",
                self.key,
                request_id.0,
                e
            );
        }
    }

    fn drain(&mut self, now: Instant) {
        for (raw, seq, body) in self.streams.outgoing(now).messages {
            let frame = protocol::frame_message(&self.header(raw, seq), &body);
            self.frames.push(frame);
        }
    }

    fn take_frames(&mut self, now: Instant) -> Vec<Vec<u8>> {
        self.drain(now);
        std::mem::take(&mut self.frames)
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// The XRCE agent. Bridges resource-constrained clients to the middleware.
///
/// All entry points take `&self`; one agent can be shared between the
/// threads serving different transports.
pub struct XrceAgent {
    config: XrceAgentConfig,
    bridge: Arc<dyn ProxyBridge>,
    clients: RwLock<HashMap<ClientKey, Arc<Mutex<ProxyClient>>>>,
    /// Routes unkeyed messages (session id >= 0x80) to their client.
    addr_map: RwLock<HashMap<TransportAddr, ClientKey>>,
}

impl XrceAgent {
    /// Create a new agent with the given configuration and bridge.
    pub fn new(config: XrceAgentConfig, bridge: Arc<dyn ProxyBridge>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            bridge,
            clients: RwLock::new(HashMap::new()),
            addr_map: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &XrceAgentConfig {
        &self.config
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    pub fn has_client(&self, key: ClientKey) -> bool {
        self.clients.read().contains_key(&key)
    }

    /// Number of live entities of a client.
    pub fn object_count(&self, key: ClientKey) -> Option<usize> {
        let client = self.clients.read().get(&key).cloned()?;
        let count = client.lock().graph.len();
        Some(count)
    }

    /// Process one inbound datagram. Returns the frames to send back.
    pub fn process_incoming(&self, from: &TransportAddr, data: &[u8]) -> Replies {
        self.process_at(from, data, Instant::now())
    }

    fn process_at(&self, from: &TransportAddr, data: &[u8], now: Instant) -> Replies {
        let parsed = protocol::split_message(data)
            .and_then(|(header, body)| Ok((header, protocol::parse_submessages(body)?)));
        let (header, batch) = match parsed {
            Ok(p) => p,
            Err(e) => {
                log::warn!("[XRCE] dropping malformed datagram from {:?}: {}", from, e);
                return Vec::new();
            }
        };

        if let Some(Submessage::CreateClient(payload)) = batch.first() {
            if batch.len() > 1 {
                log::debug!("[XRCE] ignoring submessages after CREATE_CLIENT");
            }
            return self
                .handle_create_client(from, payload, now)
                .map(|reply| vec![(from.clone(), reply)])
                .unwrap_or_default();
        }

        let key = match header.client_key {
            Some(key) => key,
            None => match self.addr_map.read().get(from) {
                Some(key) => *key,
                None => {
                    log::debug!("[XRCE] datagram from unknown peer {:?}", from);
                    return Vec::new();
                }
            },
        };
        let Some(client) = self.clients.read().get(&key).cloned() else {
            log::debug!("[XRCE] datagram for unknown client {}", key);
            return Vec::new();
        };

        let (frames, addr, closing) = {
            let mut c = client.lock();
            if c.session_id != header.session_id {
                log::debug!(
                    "[XRCE] client {}: dropping datagram for session 0x{:02x}",
                    key,
                    header.session_id
                );
                return Vec::new();
            }
            c.last_activity = now;
            c.handle(&header, batch, &*self.bridge, now);
            (c.take_frames(now), c.addr.clone(), c.closing)
        };
        if closing {
            self.remove_client(key);
        }
        frames.into_iter().map(|f| (addr.clone(), f)).collect()
    }

    fn handle_create_client(
        &self,
        from: &TransportAddr,
        payload: &CreateClientPayload,
        now: Instant,
    ) -> Option<Vec<u8>> {
        let status = self.admit(from, payload, now);
        let reply = Submessage::Status(StatusPayload {
            request_id: RequestId::INVALID,
            object_id: OBJECTID_CLIENT,
            status,
            implementation_status: 0,
        });
        let header = MessageHeader::new(payload.session_id, 0, 0, payload.client_key);
        let mut frame = header.to_bytes();
        match protocol::write_submessage(&reply, header.client_key.is_some(), &mut frame) {
            Ok(()) => Some(frame),
            Err(e) => {
                log::error!("[XRCE] cannot encode CREATE_CLIENT reply: {}", e);
                None
            }
        }
    }

    /// Decide a CREATE_CLIENT and install the proxy on success.
    fn admit(&self, from: &TransportAddr, payload: &CreateClientPayload, now: Instant) -> StatusCode {
        let key = payload.client_key;
        if payload.cookie != XRCE_COOKIE || payload.version[0] != XRCE_VERSION[0] {
            log::warn!(
                "[XRCE] client {} speaks an incompatible protocol {:?}/{:?}",
                key,
                payload.cookie,
                payload.version
            );
            return StatusCode::ErrIncompatible;
        }
        let mtu = usize::from(payload.mtu);
        if mtu < MIN_MTU {
            log::warn!("[XRCE] client {} announced unusable MTU {}", key, mtu);
            return StatusCode::ErrInvalidData;
        }

        let mut clients = self.clients.write();
        let reset = match clients.get(&key) {
            Some(existing) => {
                let mut c = existing.lock();
                if c.addr != *from {
                    log::warn!(
                        "[XRCE] client key {} already in use by {:?}, denying {:?}",
                        key,
                        c.addr,
                        from
                    );
                    return StatusCode::ErrDenied;
                }
                c.last_activity = now;
                if c.session_id == payload.session_id {
                    c.restart(mtu.min(self.config.mtu), &self.config, now);
                    log::info!(
                        "[XRCE] client {} restarted session 0x{:02x}, {} objects kept",
                        key,
                        payload.session_id,
                        c.graph.len()
                    );
                    return StatusCode::Ok;
                }
                c.graph.clear(&*self.bridge);
                true
            }
            None => {
                if clients.len() >= self.config.max_clients {
                    log::warn!(
                        "[XRCE] client table full ({}), rejecting {}",
                        self.config.max_clients,
                        key
                    );
                    return StatusCode::ErrResources;
                }
                false
            }
        };

        let client = ProxyClient::new(
            key,
            payload.session_id,
            from.clone(),
            mtu.min(self.config.mtu),
            &self.config,
            now,
        );
        clients.insert(key, Arc::new(Mutex::new(client)));
        drop(clients);
        self.addr_map.write().insert(from.clone(), key);

        log::info!(
            "[XRCE] client {} {} (session 0x{:02x}, {:?})",
            key,
            if reset { "reset its session" } else { "connected" },
            payload.session_id,
            from
        );
        StatusCode::Ok
    }

    fn remove_client(&self, key: ClientKey) {
        let removed = self.clients.write().remove(&key);
        self.addr_map.write().retain(|_, k| *k != key);
        if let Some(client) = removed {
            let mut c = client.lock();
            c.graph.clear(&*self.bridge);
            c.reassembler.forget_client(key);
        }
    }

    /// Remove every client silent for longer than the session timeout,
    /// deleting its middleware entities. Returns the evicted keys.
    pub fn evict_expired(&self, now: Instant) -> Vec<ClientKey> {
        let timeout = self.config.session_timeout();
        let expired: Vec<ClientKey> = self
            .clients
            .read()
            .iter()
            .filter(|(_, c)| now.saturating_duration_since(c.lock().last_activity) > timeout)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            log::info!("[XRCE] client {} timed out", key);
            self.remove_client(*key);
        }
        expired
    }

    /// Periodic work: liveliness eviction, subscription delivery,
    /// retransmissions and heartbeats. Returns the frames to send.
    pub fn service(&self, now: Instant) -> Replies {
        self.evict_expired(now);
        let clients: Vec<_> = self.clients.read().values().cloned().collect();
        let mut out = Vec::new();
        for client in clients {
            let mut c = client.lock();
            c.pump_subscriptions(&*self.bridge, now);
            let addr = c.addr.clone();
            out.extend(c.take_frames(now).into_iter().map(|f| (addr.clone(), f)));
        }
        out
    }

    /// One pass of the agent loop: wait up to the poll interval for traffic,
    /// handle what arrived, then run the periodic work.
    pub fn tick(&self, transport: &mut dyn XrceTransport) -> Result<()> {
        let mut buf = vec![0u8; self.config.max_message_size.max(transport.mtu())];
        let mut wait = self.config.poll_interval();
        for _ in 0..MAX_DATAGRAMS_PER_TICK {
            match transport.recv(&mut buf, wait) {
                Ok(Some((n, from))) => {
                    let replies = self.process_incoming(&from, &buf[..n]);
                    send_all(transport, replies);
                    wait = Duration::ZERO;
                }
                Ok(None) => break,
                Err(XrceError::TransportClosed) => return Err(XrceError::TransportClosed),
                Err(e) => {
                    log::warn!("[XRCE] receive failed: {}", e);
                    // Errors may repeat immediately; keep the loop from spinning.
                    std::thread::sleep(self.config.poll_interval());
                    break;
                }
            }
        }
        send_all(transport, self.service(Instant::now()));
        Ok(())
    }

    /// Run [`tick`](Self::tick) until `stop` is raised. Only a closed
    /// transport ends the loop early.
    pub fn serve(&self, transport: &mut dyn XrceTransport, stop: &AtomicBool) -> Result<()> {
        log::info!("[XRCE] agent serving (mtu {})", transport.mtu());
        while !stop.load(Ordering::Acquire) {
            if let Err(e) = self.tick(transport) {
                log::error!("[XRCE] transport lost: {}", e);
                return Err(e);
            }
        }
        log::info!("[XRCE] agent stopped with {} clients", self.client_count());
        Ok(())
    }

    /// Open the transports the configuration enables and serve each on its
    /// own thread until `stop` is raised. Returns the first error of any
    /// loop once all of them have ended.
    pub fn serve_configured(&self, stop: &AtomicBool) -> Result<()> {
        let transports = transport::open_configured(&self.config)?;
        std::thread::scope(|scope| {
            let loops: Vec<_> = transports
                .into_iter()
                .map(|mut t| scope.spawn(move || self.serve(&mut *t, stop)))
                .collect();
            let results: Vec<Result<()>> = loops
                .into_iter()
                .map(|h| {
                    h.join()
                        .unwrap_or_else(|_| Err(XrceError::Io("serve thread panicked".into())))
                })
                .collect();
            results.into_iter().collect()
        })
    }
}

fn send_all(transport: &mut dyn XrceTransport, replies: Replies) {
    for (addr, data) in replies {
        if let Err(e) = transport.send(&addr, &data) {
            log::warn!("[XRCE] failed to send to {:?}: {}", addr, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        CreatePayload, CreationMode, DeletePayload, Representation, WriteDataPayload,
    };
    use crate::proxy::NullBridge;

    const KEY: ClientKey = ClientKey([0xAA, 0xBB, 0xCC, 0xDD]);
    const SID: u8 = 0x81;
    const BE: u8 = 0x01;

    fn addr(n: u32) -> TransportAddr {
        TransportAddr::Memory(n)
    }

    fn agent_with(config: XrceAgentConfig) -> XrceAgent {
        XrceAgent::new(config, Arc::new(NullBridge::new())).unwrap()
    }

    fn agent() -> XrceAgent {
        agent_with(XrceAgentConfig::default())
    }

    fn frame(session_id: u8, key: ClientKey, raw: u8, seq: u16, subs: &[Submessage]) -> Vec<u8> {
        let header = MessageHeader::new(session_id, raw, seq, key);
        let mut f = header.to_bytes();
        for s in subs {
            protocol::write_submessage(s, header.client_key.is_some(), &mut f).unwrap();
        }
        f
    }

    fn connect(agent: &XrceAgent, from: u32, key: ClientKey, session_id: u8) -> StatusCode {
        let hello = Submessage::CreateClient(CreateClientPayload::new(key, session_id, 512));
        let replies = agent.process_incoming(&addr(from), &frame(session_id, key, 0, 0, &[hello]));
        assert_eq!(replies.len(), 1);
        statuses(&replies)[0].status
    }

    fn statuses(replies: &Replies) -> Vec<StatusPayload> {
        replies
            .iter()
            .flat_map(|(_, f)| protocol::parse_message(f).unwrap().submessages)
            .filter_map(|s| match s {
                Submessage::Status(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    fn participant(request: u16, id: u16, mode: CreationMode) -> Submessage {
        Submessage::Create(CreatePayload {
            request_id: RequestId(request),
            object_id: ObjectId::new(id, ObjectKind::Participant),
            representation: Representation::Reference("default_participant".into()),
            parent: 0,
            mode,
        })
    }

    #[test]
    fn test_create_client_replies_on_none_stream() {
        let agent = agent();
        let hello = Submessage::CreateClient(CreateClientPayload::new(KEY, SID, 512));
        let replies = agent.process_incoming(&addr(1), &frame(SID, KEY, 0, 0, &[hello]));
        let msg = protocol::parse_message(&replies[0].1).unwrap();
        assert_eq!(msg.header.session_id, SID);
        assert_eq!(msg.header.stream_id, 0);
        let status = statuses(&replies)[0];
        assert_eq!(status.object_id, OBJECTID_CLIENT);
        assert!(!status.request_id.is_valid());
        assert_eq!(status.status, StatusCode::Ok);
        assert!(agent.has_client(KEY));
    }

    #[test]
    fn test_create_client_key_collision_is_denied() {
        let agent = agent();
        assert_eq!(connect(&agent, 1, KEY, SID), StatusCode::Ok);
        assert_eq!(connect(&agent, 2, KEY, SID), StatusCode::ErrDenied);
        assert_eq!(agent.client_count(), 1);
    }

    #[test]
    fn test_create_client_rejects_foreign_cookie() {
        let agent = agent();
        let mut hello = CreateClientPayload::new(KEY, SID, 512);
        hello.cookie = *b"DDS!";
        let f = frame(SID, KEY, 0, 0, &[Submessage::CreateClient(hello)]);
        let replies = agent.process_incoming(&addr(1), &f);
        assert_eq!(statuses(&replies)[0].status, StatusCode::ErrIncompatible);
        assert!(!agent.has_client(KEY));
    }

    #[test]
    fn test_client_table_full() {
        let agent = agent_with(XrceAgentConfig {
            max_clients: 1,
            ..Default::default()
        });
        assert_eq!(connect(&agent, 1, KEY, SID), StatusCode::Ok);
        assert_eq!(
            connect(&agent, 2, ClientKey([1, 1, 1, 1]), SID),
            StatusCode::ErrResources
        );
    }

    #[test]
    fn test_create_twice_without_flags_already_exists() {
        let agent = agent();
        connect(&agent, 1, KEY, SID);
        let first = frame(SID, KEY, BE, 0, &[participant(1, 1, CreationMode::default())]);
        let replies = agent.process_incoming(&addr(1), &first);
        let s = statuses(&replies);
        assert_eq!(s[0].request_id, RequestId(1));
        assert_eq!(s[0].status, StatusCode::Ok);
        assert_eq!(replies[0].0, addr(1));

        let second = frame(SID, KEY, BE, 1, &[participant(2, 1, CreationMode::default())]);
        let replies = agent.process_incoming(&addr(1), &second);
        assert_eq!(statuses(&replies)[0].status, StatusCode::ErrAlreadyExists);
        assert_eq!(agent.object_count(KEY), Some(1));
    }

    #[test]
    fn test_keyed_session_routes_by_key() {
        let agent = agent();
        connect(&agent, 1, KEY, 0x01);
        let f = frame(0x01, KEY, BE, 0, &[participant(1, 1, CreationMode::default())]);
        let replies = agent.process_incoming(&addr(1), &f);
        let msg = protocol::parse_message(&replies[0].1).unwrap();
        assert_eq!(msg.header.client_key, Some(KEY));
        assert_eq!(statuses(&replies)[0].status, StatusCode::Ok);
    }

    #[test]
    fn test_wrong_session_id_is_dropped() {
        let agent = agent();
        connect(&agent, 1, KEY, SID);
        let f = frame(0x82, KEY, BE, 0, &[participant(1, 1, CreationMode::default())]);
        assert!(agent.process_incoming(&addr(1), &f).is_empty());
        assert_eq!(agent.object_count(KEY), Some(0));
    }

    #[test]
    fn test_write_to_unknown_writer_reports_unknown_reference() {
        let agent = agent();
        connect(&agent, 1, KEY, SID);
        let write = Submessage::WriteData(WriteDataPayload {
            request_id: RequestId(7),
            object_id: ObjectId::new(9, ObjectKind::DataWriter),
            data: vec![1, 2, 3],
        });
        let replies = agent.process_incoming(&addr(1), &frame(SID, KEY, BE, 0, &[write]));
        let s = statuses(&replies);
        assert_eq!(s[0].request_id, RequestId(7));
        assert_eq!(s[0].status, StatusCode::ErrUnknownReference);
    }

    #[test]
    fn test_reconnect_same_session_keeps_objects() {
        let agent = agent();
        connect(&agent, 1, KEY, SID);
        let f = frame(SID, KEY, BE, 0, &[participant(1, 1, CreationMode::default())]);
        agent.process_incoming(&addr(1), &f);

        assert_eq!(connect(&agent, 1, KEY, SID), StatusCode::Ok);
        assert_eq!(agent.object_count(KEY), Some(1));

        assert_eq!(connect(&agent, 1, KEY, 0x82), StatusCode::Ok);
        assert_eq!(agent.object_count(KEY), Some(0));
    }

    #[test]
    fn test_reconnect_restarts_reliable_streams() {
        let agent = agent();
        connect(&agent, 1, KEY, SID);
        let first = frame(SID, KEY, 0x80, 0, &[participant(1, 1, CreationMode::default())]);
        assert_eq!(statuses(&agent.process_incoming(&addr(1), &first))[0].status, StatusCode::Ok);

        // A rebooted client numbers its reliable stream from zero again.
        assert_eq!(connect(&agent, 1, KEY, SID), StatusCode::Ok);
        let again = frame(SID, KEY, 0x80, 0, &[participant(2, 2, CreationMode::default())]);
        let s = statuses(&agent.process_incoming(&addr(1), &again));
        assert_eq!(s.len(), 1);
        assert_eq!(s[0].request_id, RequestId(2));
        assert_eq!(s[0].status, StatusCode::Ok);
        assert_eq!(agent.object_count(KEY), Some(2));
    }

    #[test]
    fn test_delete_client_object_closes_session() {
        let agent = agent();
        connect(&agent, 1, KEY, SID);
        let bye = Submessage::Delete(DeletePayload {
            request_id: RequestId(3),
            object_id: OBJECTID_CLIENT,
        });
        let replies = agent.process_incoming(&addr(1), &frame(SID, KEY, 0, 0, &[bye]));
        assert_eq!(statuses(&replies)[0].status, StatusCode::Ok);
        assert!(!agent.has_client(KEY));
    }

    #[test]
    fn test_silent_client_is_evicted() {
        let agent = agent_with(XrceAgentConfig {
            session_timeout_ms: 50,
            ..Default::default()
        });
        connect(&agent, 1, KEY, SID);
        let now = Instant::now();
        assert!(agent.evict_expired(now).is_empty());
        let evicted = agent.evict_expired(now + Duration::from_millis(500));
        assert_eq!(evicted, vec![KEY]);
        assert_eq!(agent.client_count(), 0);
    }

    #[test]
    fn test_malformed_datagram_is_dropped() {
        let agent = agent();
        assert!(agent.process_incoming(&addr(1), &[0x81, 0x01]).is_empty());
    }

    /// Replays canned receive results, then reports the link closed.
    struct ScriptedTransport {
        script: std::collections::VecDeque<Result<Option<(usize, TransportAddr)>>>,
    }

    impl XrceTransport for ScriptedTransport {
        fn recv(
            &mut self,
            _buf: &mut [u8],
            _timeout: Duration,
        ) -> Result<Option<(usize, TransportAddr)>> {
            self.script
                .pop_front()
                .unwrap_or(Err(XrceError::TransportClosed))
        }

        fn send(&mut self, _addr: &TransportAddr, _data: &[u8]) -> Result<()> {
            Ok(())
        }

        fn mtu(&self) -> usize {
            512
        }
    }

    #[test]
    fn test_receive_errors_do_not_stop_the_agent() {
        let agent = agent_with(XrceAgentConfig {
            poll_interval_ms: 1,
            ..Default::default()
        });
        let mut link = ScriptedTransport {
            script: vec![
                Err(XrceError::Io("connection reset by peer".into())),
                Ok(None),
            ]
            .into(),
        };
        agent.tick(&mut link).unwrap();
        agent.tick(&mut link).unwrap();
        assert_eq!(agent.tick(&mut link).unwrap_err(), XrceError::TransportClosed);
    }

    #[test]
    fn test_closed_transport_ends_serve() {
        let agent = agent();
        let mut link = ScriptedTransport {
            script: vec![Err(XrceError::Io("transient".into()))].into(),
        };
        let stop = AtomicBool::new(false);
        assert_eq!(
            agent.serve(&mut link, &stop).unwrap_err(),
            XrceError::TransportClosed
        );
    }

    #[test]
    fn test_serve_configured_until_stopped() {
        let agent = agent_with(XrceAgentConfig {
            udp_port: 0,
            tcp_port: Some(0),
            ..Default::default()
        });
        let stop = AtomicBool::new(false);
        let result = std::thread::scope(|scope| {
            let server = scope.spawn(|| agent.serve_configured(&stop));
            std::thread::sleep(Duration::from_millis(100));
            stop.store(true, Ordering::Release);
            server.join().unwrap()
        });
        assert!(result.is_ok(), "{:?}", result);
    }
}
