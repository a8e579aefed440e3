// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

// Fixtures shared by the scenario tests: an impaired client link, a
// loopback middleware and an agent running on its own thread.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::agent::XrceAgent;
use crate::config::{ReliabilityConfig, SessionConfig, XrceAgentConfig};
use crate::error::{Result, XrceError};
use crate::protocol::{ObjectKind, Representation};
use crate::proxy::{EntityHandle, Parent, ProxyBridge};
use crate::transport::{ClientTransport, MemoryAgentTransport, MemoryClientTransport};

/// Short timers so retransmission tests finish quickly.
pub fn fast_reliability() -> ReliabilityConfig {
    ReliabilityConfig {
        heartbeat_period_ms: 20,
        max_heartbeat_period_ms: 160,
        max_retries: 0,
    }
}

pub fn fast_agent_config() -> XrceAgentConfig {
    XrceAgentConfig {
        poll_interval_ms: 2,
        reliability: fast_reliability(),
        ..Default::default()
    }
}

pub fn fast_session_config() -> SessionConfig {
    SessionConfig {
        reliability: fast_reliability(),
        ..Default::default()
    }
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

// ---------------------------------------------------------------------------
// Impaired link
// ---------------------------------------------------------------------------

/// Client link that drops, duplicates and reorders datagrams in both
/// directions, driven by a seeded RNG so failures replay.
pub struct LossyLink<T> {
    inner: T,
    rng: fastrand::Rng,
    enabled: bool,
    loss: f64,
    duplicate: f64,
    reorder: f64,
    /// Outbound datagram held back to be sent after the next one.
    held: Option<Vec<u8>>,
    /// Inbound datagram to hand up a second time.
    replay: Option<Vec<u8>>,
}

impl<T: ClientTransport> LossyLink<T> {
    pub fn new(inner: T, seed: u64, loss: f64, duplicate: f64, reorder: f64) -> Self {
        Self {
            inner,
            rng: fastrand::Rng::with_seed(seed),
            enabled: false,
            loss,
            duplicate,
            reorder,
            held: None,
            replay: None,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn set_loss(&mut self, loss: f64) {
        self.loss = loss;
    }

    fn release_held(&mut self) -> Result<()> {
        if let Some(held) = self.held.take() {
            self.inner.send(&held)?;
        }
        Ok(())
    }
}

impl<T: ClientTransport> ClientTransport for LossyLink<T> {
    fn send(&mut self, data: &[u8]) -> Result<usize> {
        if !self.enabled {
            self.release_held()?;
            return self.inner.send(data);
        }
        if self.rng.f64() < self.loss {
            return Ok(data.len());
        }
        if self.held.is_none() && self.rng.f64() < self.reorder {
            self.held = Some(data.to_vec());
            return Ok(data.len());
        }
        self.inner.send(data)?;
        if self.rng.f64() < self.duplicate {
            self.inner.send(data)?;
        }
        self.release_held()?;
        Ok(data.len())
    }

    fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<Option<usize>> {
        self.release_held()?;
        if let Some(data) = self.replay.take() {
            let n = data.len().min(buf.len());
            buf[..n].copy_from_slice(&data[..n]);
            return Ok(Some(n));
        }
        let Some(n) = self.inner.receive(buf, timeout)? else {
            return Ok(None);
        };
        if self.enabled {
            if self.rng.f64() < self.loss {
                return Ok(None);
            }
            if self.rng.f64() < self.duplicate {
                self.replay = Some(buf[..n].to_vec());
            }
        }
        Ok(Some(n))
    }

    fn mtu(&self) -> usize {
        self.inner.mtu()
    }
}

// ---------------------------------------------------------------------------
// Loopback middleware
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LoopbackState {
    next_handle: EntityHandle,
    live: HashMap<EntityHandle, ObjectKind>,
    deleted: Vec<EntityHandle>,
    written: Vec<Vec<u8>>,
    queues: HashMap<EntityHandle, VecDeque<Vec<u8>>>,
}

/// In-memory middleware: every write is recorded and fanned out to every
/// live reader.
#[derive(Debug, Default)]
pub struct LoopbackBridge {
    state: Mutex<LoopbackState>,
}

impl LoopbackBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish a sample from outside (as if a remote writer sent it).
    pub fn inject(&self, sample: &[u8]) {
        let mut state = self.state.lock();
        for queue in state.queues.values_mut() {
            queue.push_back(sample.to_vec());
        }
    }

    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    pub fn deleted(&self) -> Vec<EntityHandle> {
        self.state.lock().deleted.clone()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn live_of(&self, kind: ObjectKind) -> usize {
        self.state.lock().live.values().filter(|k| **k == kind).count()
    }

    /// Samples still queued on readers.
    pub fn queued(&self) -> usize {
        self.state.lock().queues.values().map(VecDeque::len).sum()
    }
}

impl ProxyBridge for LoopbackBridge {
    fn create_entity(
        &self,
        kind: ObjectKind,
        _parent: Parent,
        _representation: &Representation,
    ) -> Result<EntityHandle> {
        let mut state = self.state.lock();
        state.next_handle += 1;
        let handle = state.next_handle;
        state.live.insert(handle, kind);
        if kind == ObjectKind::DataReader {
            state.queues.insert(handle, VecDeque::new());
        }
        Ok(handle)
    }

    fn delete_entity(&self, handle: EntityHandle) -> Result<()> {
        let mut state = self.state.lock();
        if state.live.remove(&handle).is_none() {
            return Err(XrceError::Bridge(format!("no entity {}", handle)));
        }
        state.queues.remove(&handle);
        state.deleted.push(handle);
        Ok(())
    }

    fn write_data(&self, writer: EntityHandle, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.live.get(&writer) != Some(&ObjectKind::DataWriter) {
            return Err(XrceError::Bridge(format!("{} is not a writer", writer)));
        }
        state.written.push(data.to_vec());
        for queue in state.queues.values_mut() {
            queue.push_back(data.to_vec());
        }
        Ok(())
    }

    fn read_data(&self, reader: EntityHandle) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        match state.queues.get_mut(&reader) {
            Some(queue) => Ok(queue.pop_front()),
            None => Err(XrceError::Bridge(format!("{} is not a reader", reader))),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent thread
// ---------------------------------------------------------------------------

/// An agent serving an in-process transport on a background thread.
/// Stopped and joined on drop.
pub struct AgentThread {
    pub agent: Arc<XrceAgent>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl AgentThread {
    /// Start an agent and attach `clients` in-process links to it.
    pub fn start(
        config: XrceAgentConfig,
        bridge: Arc<dyn ProxyBridge>,
        clients: usize,
    ) -> (Self, Vec<MemoryClientTransport>) {
        let mut transport = MemoryAgentTransport::new(config.mtu);
        let links = (0..clients).map(|_| transport.connect()).collect();
        let agent = Arc::new(XrceAgent::new(config, bridge).unwrap());
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let agent = Arc::clone(&agent);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                agent.serve(&mut transport, &stop).unwrap();
            })
        };
        (
            Self {
                agent,
                stop,
                handle: Some(handle),
            },
            links,
        )
    }
}

impl Drop for AgentThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
