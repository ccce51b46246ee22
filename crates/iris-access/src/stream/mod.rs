// SPDX-License-Identifier: AGPL-3.0-only

//! Streaming firmware access over the shared ring buffer.
//!
//! The richest access strategy: a reliable, flow-controlled byte channel
//! multiplexed over a fixed shared buffer split into TX and RX halves
//! (layout in [`iris_chip::regs::channel`]), plus a fixed-slot API
//! sub-channel for single-word calls that bypass the ring entirely.
//!
//! Three worker threads own the three roles:
//!
//! - **TX** pops queued transactions and pushes their framed bytes through
//!   the TX half, respecting the peer's read index for flow control.
//! - **RX** consumes the RX half, reassembles length-prefixed frames and
//!   resolves the pending request matching the embedded correlation id.
//! - **API** drives the fixed-slot exchange for `ApiRead`/`ApiWrite`.
//!
//! Each worker observes the shared stop flag at every wait point, so
//! shutdown joins all three within one poll slice.

mod ring;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use iris_chip::frame::{self, ApiCommand, Frame, LEN_PREFIX_SIZE};
use iris_chip::regs::{api, channel};

use crate::dispatch::{Dispatcher, RegIo};
use crate::error::{AccessError, Result};
use crate::queue::WorkQueue;
use crate::request::{FwRequest, FwRequestKind, RequestState};
use crate::store::ResultStore;

use ring::RingHalf;

/// Configuration of the streaming strategy.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Base address of the shared buffer; the TX half starts here and the
    /// RX half at `buffer_base + buffer_size / 2`.
    pub buffer_base: u32,
    /// Total size of the shared buffer, split evenly between the halves.
    pub buffer_size: u32,
    /// Base address of the API sub-channel register block.
    pub api_base: u32,
    /// Bound on queued submissions (per queue) before submitters block.
    pub max_request_num: usize,
    /// Status polls tolerated on the API slot before a call is declared
    /// lost.
    pub max_wait_packets: u32,
    /// Delay between flow-control and handshake re-polls.
    pub poll_interval: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            buffer_base: 0x1000,
            buffer_size: 2 * (1024 + channel::HEADER_SIZE),
            api_base: 0x40,
            max_request_num: 100,
            max_wait_packets: 50,
            poll_interval: Duration::from_millis(2),
        }
    }
}

/// One framed transfer queued for the TX worker.
struct TxTransaction {
    req: FwRequest,
    bytes: Vec<u8>,
    sent: usize,
    deadline: Instant,
}

/// One single-word call queued for the API worker.
struct ApiCall {
    req: FwRequest,
    deadline: Instant,
}

/// A buffer read sent out, awaiting its reply frame on the RX half.
struct Pending {
    req: FwRequest,
    deadline: Instant,
}

struct Shared {
    cfg: StreamConfig,
    tx: RingHalf,
    rx: RingHalf,
    stop: Arc<AtomicBool>,
    io: RegIo,
    tx_queue: WorkQueue<TxTransaction>,
    api_queue: WorkQueue<ApiCall>,
    pending: Mutex<HashMap<u32, Pending>>,
    store: Arc<ResultStore<FwRequest>>,
}

/// Firmware access strategy over the shared ring buffer.
pub struct StreamAccess {
    dispatcher: Arc<Dispatcher>,
    store: Arc<ResultStore<FwRequest>>,
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for StreamAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamAccess")
            .field(
                "buffer_base",
                &format_args!("{:#x}", self.shared.cfg.buffer_base),
            )
            .field("running", &!self.workers.is_empty())
            .finish()
    }
}

impl StreamAccess {
    /// Create the strategy; call [`StreamAccess::start`] before submitting.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::InvalidParameters`] if the buffer is too
    /// small to split into two usable halves.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        store: Arc<ResultStore<FwRequest>>,
        cfg: StreamConfig,
    ) -> Result<Self> {
        let shared = build_shared(&dispatcher, &store, cfg)?;
        Ok(Self {
            dispatcher,
            store,
            shared,
            workers: Vec::new(),
        })
    }

    /// Spawn the TX, RX and API worker threads.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Fatal`] if already started or a thread fails
    /// to spawn.
    pub fn start(&mut self) -> Result<()> {
        if !self.workers.is_empty() {
            return Err(AccessError::fatal("stream access already started"));
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        for (name, role) in [
            ("iris-tx", Role::Tx),
            ("iris-rx", Role::Rx),
            ("iris-api", Role::Api),
        ] {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(name.into())
                .spawn(move || match role {
                    Role::Tx => tx_loop(&shared),
                    Role::Rx => rx_loop(&shared),
                    Role::Api => api_loop(&shared),
                })
                .map_err(|e| AccessError::fatal(format!("spawn failed: {e}")))?;
            self.workers.push(handle);
        }
        Ok(())
    }

    /// Stop and join all workers; everything still queued or pending is
    /// failed as NoAnswer.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.tx_queue.notify_all();
        self.shared.api_queue.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        for txn in self.shared.tx_queue.drain() {
            abandon(&self.shared.store, txn.req);
        }
        for call in self.shared.api_queue.drain() {
            abandon(&self.shared.store, call.req);
        }
        let pending: Vec<Pending> = self
            .shared
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain()
            .map(|(_, p)| p)
            .collect();
        for p in pending {
            abandon(&self.shared.store, p.req);
        }
    }

    /// Stop the workers, replace the configuration and restart (if they
    /// were running). All channel state restarts from `FW_IS_RESET`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`StreamAccess::new`] and
    /// [`StreamAccess::start`].
    pub fn reconfigure(&mut self, cfg: StreamConfig) -> Result<()> {
        let restart = !self.workers.is_empty();
        self.stop();
        self.shared = build_shared(&self.dispatcher, &self.store, cfg)?;
        if restart {
            self.start()?;
        }
        Ok(())
    }

    /// Queue a firmware request; blocks while the target queue is full.
    ///
    /// Buffer kinds travel through the ring channel, API kinds through the
    /// fixed-slot sub-channel.
    ///
    /// # Errors
    ///
    /// [`AccessError::InvalidParameters`] for malformed requests,
    /// [`AccessError::NotInitialized`] when the workers are not running.
    pub fn post(&self, req: FwRequest) -> Result<u32> {
        req.validate()?;
        if self.workers.is_empty() || self.shared.stop.load(Ordering::SeqCst) {
            return Err(AccessError::NotInitialized);
        }
        let id = req.id;
        let deadline = Instant::now() + Duration::from_millis(req.timeout_ms);
        match req.kind {
            FwRequestKind::ApiRead | FwRequestKind::ApiWrite => {
                self.shared
                    .api_queue
                    .push_blocking(ApiCall { req, deadline }, &self.shared.stop)?;
            }
            FwRequestKind::BufferRead | FwRequestKind::BufferWrite => {
                let frame = Frame {
                    id,
                    section: req.section,
                    command: req.command,
                    kind: req.kind.frame_kind(),
                    value: req.value,
                    status: 0,
                    payload: if req.kind == FwRequestKind::BufferWrite {
                        req.buffer.clone()
                    } else {
                        Vec::new()
                    },
                };
                let bytes = frame.encode();
                self.shared.tx_queue.push_blocking(
                    TxTransaction {
                        req,
                        bytes,
                        sent: 0,
                        deadline,
                    },
                    &self.shared.stop,
                )?;
            }
        }
        Ok(id)
    }

    /// Number of buffer transfers awaiting a reply frame.
    pub fn pending_replies(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

impl Drop for StreamAccess {
    fn drop(&mut self) {
        self.stop();
    }
}

enum Role {
    Tx,
    Rx,
    Api,
}

fn build_shared(
    dispatcher: &Arc<Dispatcher>,
    store: &Arc<ResultStore<FwRequest>>,
    cfg: StreamConfig,
) -> Result<Arc<Shared>> {
    let half_size = cfg.buffer_size / 2;
    let tx = RingHalf::new(cfg.buffer_base, half_size)?;
    let rx = RingHalf::new(cfg.buffer_base + half_size, half_size)?;
    let stop = Arc::new(AtomicBool::new(false));
    let io = RegIo::new(Arc::clone(dispatcher), Arc::clone(&stop));
    Ok(Arc::new(Shared {
        tx_queue: WorkQueue::new(cfg.max_request_num),
        api_queue: WorkQueue::new(cfg.max_request_num),
        pending: Mutex::new(HashMap::new()),
        cfg,
        tx,
        rx,
        stop,
        io,
        store: Arc::clone(store),
    }))
}

fn abandon(store: &ResultStore<FwRequest>, mut req: FwRequest) {
    req.state = RequestState::NoAnswer;
    store.push(req);
}

/// Deadline for a worker's own register traffic, unrelated to any request
/// deadline. Register exchanges are expected to complete within a poll or
/// two; a second guards against a wedged transport.
fn io_deadline() -> Instant {
    Instant::now() + Duration::from_secs(1)
}

/// Write `data` into the ring at `index`, splitting at the wrap point.
fn write_ring(
    io: &RegIo,
    half: &RingHalf,
    index: u32,
    data: &[u8],
    id: u32,
    deadline: Instant,
) -> Result<()> {
    let first = (half.run_to_wrap(index) as usize).min(data.len());
    io.write_bytes(half.data_addr(index), data[..first].to_vec(), id, deadline)?;
    if first < data.len() {
        io.write_bytes(half.data_addr(0), data[first..].to_vec(), id, deadline)?;
    }
    Ok(())
}

/// Read `len` bytes from the ring at `index`, splitting at the wrap point.
fn read_ring(
    io: &RegIo,
    half: &RingHalf,
    index: u32,
    len: usize,
    id: u32,
    deadline: Instant,
) -> Result<Vec<u8>> {
    let first = (half.run_to_wrap(index) as usize).min(len);
    let mut out = io.read_bytes(half.data_addr(index), first, id, deadline)?;
    if first < len {
        out.extend(io.read_bytes(half.data_addr(0), len - first, id, deadline)?);
    }
    Ok(out)
}

// ── TX worker ────────────────────────────────────────────────────────────────

fn tx_loop(shared: &Shared) {
    tracing::debug!("tx worker up");
    let mut established = false;
    let mut write_index = 0u32;
    while !shared.stop.load(Ordering::SeqCst) {
        let Some(mut txn) = shared.tx_queue.pop(&shared.stop) else {
            continue;
        };
        if Instant::now() >= txn.deadline {
            // Expired while queued; the transport was never touched.
            abandon(&shared.store, txn.req);
            continue;
        }
        let is_read = txn.req.kind == FwRequestKind::BufferRead;
        if is_read {
            // Park the reply slot before the first byte goes out: the peer
            // can answer the moment the last chunk lands, and the RX worker
            // must find a matching id by then.
            shared
                .pending
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .insert(
                    txn.req.id,
                    Pending {
                        req: txn.req.clone(),
                        deadline: txn.deadline,
                    },
                );
        }
        match send_transaction(shared, &mut txn, &mut established, &mut write_index) {
            Ok(()) => resolve_sent(shared, txn),
            Err(err) => {
                tracing::warn!("fw request {} failed in tx: {err}", txn.req.id);
                // An abandoned transfer may leave a truncated frame in the
                // ring; only a fresh handshake realigns both indices.
                established = false;
                let state = match err {
                    // A deadline hit mid-transfer means the peer never
                    // drained our bytes, not that a reply was late; the
                    // same applies when shutdown interrupts the transfer.
                    AccessError::Timeout { .. }
                    | AccessError::NoAnswer { .. }
                    | AccessError::Fatal { .. } => RequestState::NoAnswer,
                    _ => RequestState::Fail,
                };
                let req = if is_read {
                    // Reclaim the parked slot; if the RX worker already
                    // resolved it, the result is final.
                    shared
                        .pending
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .remove(&txn.req.id)
                        .map(|p| p.req)
                } else {
                    Some(txn.req)
                };
                if let Some(mut req) = req {
                    req.state = state;
                    shared.store.push(req);
                }
            }
        }
    }
    tracing::debug!("tx worker down");
}

/// Push one framed transaction through the TX half.
///
/// Establishes the channel first when needed; then writes `min(free,
/// remaining)` bytes per pass, advancing `write_index` and flagging
/// `WRITE_REGISTER_UPDATED` after each chunk.
fn send_transaction(
    shared: &Shared,
    txn: &mut TxTransaction,
    established: &mut bool,
    write_index: &mut u32,
) -> Result<()> {
    let io = &shared.io;
    let half = &shared.tx;
    let id = txn.req.id;

    if !*established {
        *write_index = 0;
        io.write32(half.write_index_addr(), 0, id, txn.deadline)?;
        io.write32(
            half.state_addr(),
            channel::state::CHANNEL_REQUESTED,
            id,
            txn.deadline,
        )?;
        loop {
            if shared.stop.load(Ordering::SeqCst) {
                return Err(AccessError::fatal("stopped during channel reset"));
            }
            let state = io.read32(half.state_addr(), id, txn.deadline)?;
            if state != channel::state::FW_IS_RESET && state != channel::state::CHANNEL_REQUESTED {
                break;
            }
            if Instant::now() >= txn.deadline {
                return Err(AccessError::NoAnswer { id });
            }
            thread::sleep(shared.cfg.poll_interval);
        }
        *established = true;
        tracing::debug!("tx channel established");
    }

    while txn.sent < txn.bytes.len() {
        if shared.stop.load(Ordering::SeqCst) {
            return Err(AccessError::fatal("stopped mid-transfer"));
        }
        let state = io.read32(half.state_addr(), id, txn.deadline)?;
        if state == channel::state::FW_IS_RESET {
            *established = false;
            return Err(AccessError::device_error("peer reset during transfer"));
        }
        let read_index = io.read32(half.read_index_addr(), id, txn.deadline)?;
        let free = half.free_space(*write_index, read_index);
        if free == 0 {
            if Instant::now() >= txn.deadline {
                return Err(AccessError::NoAnswer { id });
            }
            thread::sleep(shared.cfg.poll_interval);
            continue;
        }
        #[allow(clippy::cast_possible_truncation)] // frames bounded by MAX_FRAME_SIZE
        let remaining = (txn.bytes.len() - txn.sent) as u32;
        let chunk = free.min(remaining);
        write_ring(
            io,
            half,
            *write_index,
            &txn.bytes[txn.sent..txn.sent + chunk as usize],
            id,
            txn.deadline,
        )?;
        *write_index = half.advance(*write_index, chunk);
        io.write32(half.write_index_addr(), *write_index, id, txn.deadline)?;
        io.write32(
            half.state_addr(),
            channel::state::WRITE_REGISTER_UPDATED,
            id,
            txn.deadline,
        )?;
        txn.sent += chunk as usize;
    }
    Ok(())
}

/// A transaction left the TX half completely: writes are done, reads were
/// parked in the pending map before transmission and await their reply.
fn resolve_sent(shared: &Shared, txn: TxTransaction) {
    let mut req = txn.req;
    if req.kind != FwRequestKind::BufferRead {
        req.state = RequestState::Success;
        shared.store.push(req);
    }
}

// ── RX worker ────────────────────────────────────────────────────────────────

fn rx_loop(shared: &Shared) {
    tracing::debug!("rx worker up");
    let mut established = false;
    let mut read_index = 0u32;
    while !shared.stop.load(Ordering::SeqCst) {
        sweep_pending(shared);
        if let Err(err) = rx_step(shared, &mut established, &mut read_index) {
            if matches!(err, AccessError::Fatal { .. }) {
                break;
            }
            tracing::warn!("rx worker error: {err}");
            established = false;
        }
    }
    tracing::debug!("rx worker down");
}

/// One pass of the RX machine: establish the channel if needed, then
/// consume at most one complete frame.
fn rx_step(shared: &Shared, established: &mut bool, read_index: &mut u32) -> Result<()> {
    let io = &shared.io;
    let half = &shared.rx;

    if !*established {
        *read_index = 0;
        io.write32(half.read_index_addr(), 0, 0, io_deadline())?;
        io.write32(
            half.state_addr(),
            channel::state::CHANNEL_REQUESTED,
            0,
            io_deadline(),
        )?;
        loop {
            if shared.stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            sweep_pending(shared);
            let state = io.read32(half.state_addr(), 0, io_deadline())?;
            if state != channel::state::FW_IS_RESET && state != channel::state::CHANNEL_REQUESTED {
                break;
            }
            thread::sleep(shared.cfg.poll_interval);
        }
        *established = true;
        tracing::debug!("rx channel established");
    }

    let state = io.read32(half.state_addr(), 0, io_deadline())?;
    if state == channel::state::FW_IS_RESET {
        *established = false;
        return Err(AccessError::device_error("peer reset rx channel"));
    }
    let write_index = io.read32(half.write_index_addr(), 0, io_deadline())?;
    #[allow(clippy::cast_possible_truncation)]
    let prefix_len = LEN_PREFIX_SIZE as u32;
    if half.used_space(write_index, *read_index) < prefix_len {
        thread::sleep(shared.cfg.poll_interval);
        return Ok(());
    }

    let prefix = read_ring(io, half, *read_index, LEN_PREFIX_SIZE, 0, io_deadline())?;
    let len_word = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    let body_len = match frame::validate_len_prefix(len_word) {
        Ok(len) => len,
        Err(err) => {
            // Channel corruption: resynchronize with a fresh handshake
            // rather than guessing at frame boundaries.
            tracing::error!("corrupt length prefix on rx channel: {err}");
            *established = false;
            return Ok(());
        }
    };
    *read_index = half.advance(*read_index, prefix_len);
    io.write32(half.read_index_addr(), *read_index, 0, io_deadline())?;
    io.write32(
        half.state_addr(),
        channel::state::READ_REGISTER_UPDATED,
        0,
        io_deadline(),
    )?;

    let mut body = Vec::with_capacity(body_len);
    while body.len() < body_len {
        if shared.stop.load(Ordering::SeqCst) {
            return Ok(());
        }
        let write_index = io.read32(half.write_index_addr(), 0, io_deadline())?;
        let used = half.used_space(write_index, *read_index);
        if used == 0 {
            sweep_pending(shared);
            thread::sleep(shared.cfg.poll_interval);
            continue;
        }
        let take = (used as usize).min(body_len - body.len());
        let bytes = read_ring(io, half, *read_index, take, 0, io_deadline())?;
        body.extend_from_slice(&bytes);
        #[allow(clippy::cast_possible_truncation)] // take bounded by the region size
        {
            *read_index = half.advance(*read_index, take as u32);
        }
        io.write32(half.read_index_addr(), *read_index, 0, io_deadline())?;
        io.write32(
            half.state_addr(),
            channel::state::READ_REGISTER_UPDATED,
            0,
            io_deadline(),
        )?;
    }
    deliver(shared, &body);
    Ok(())
}

/// Match a reassembled frame to its pending request and resolve it.
fn deliver(shared: &Shared, body: &[u8]) {
    let frame = match Frame::decode(body) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::error!("dropping undecodable frame: {err}");
            return;
        }
    };
    let pending = shared
        .pending
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .remove(&frame.id);
    match pending {
        Some(mut p) => {
            p.req.value = frame.value;
            p.req.status = frame.status;
            if p.req.kind.is_read() {
                p.req.buffer = frame.payload;
            }
            p.req.state = RequestState::Success;
            shared.store.push(p.req);
        }
        None => tracing::warn!("reply with unmatched id {} dropped", frame.id),
    }
}

/// Fail pending replies whose deadline has passed.
fn sweep_pending(shared: &Shared) {
    let now = Instant::now();
    let expired: Vec<FwRequest> = {
        let mut pending = shared
            .pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let ids: Vec<u32> = pending
            .iter()
            .filter(|(_, p)| now >= p.deadline)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| pending.remove(&id))
            .map(|p| p.req)
            .collect()
    };
    for mut req in expired {
        tracing::warn!("fw request {} expired awaiting its reply", req.id);
        req.state = RequestState::Timeout;
        shared.store.push(req);
    }
}

// ── API worker ───────────────────────────────────────────────────────────────

fn api_loop(shared: &Shared) {
    tracing::debug!("api worker up");
    while !shared.stop.load(Ordering::SeqCst) {
        let Some(call) = shared.api_queue.pop(&shared.stop) else {
            continue;
        };
        run_api_call(shared, call);
    }
    tracing::debug!("api worker down");
}

fn run_api_call(shared: &Shared, call: ApiCall) {
    let ApiCall { mut req, deadline } = call;
    if Instant::now() >= deadline {
        abandon(&shared.store, req);
        return;
    }
    match exchange_api(shared, &mut req, deadline) {
        Ok(()) => req.state = RequestState::Success,
        Err(err) => {
            tracing::warn!("api call {} failed: {err}", req.id);
            req.state = match err {
                AccessError::Timeout { .. } => RequestState::Timeout,
                AccessError::NoAnswer { .. } => RequestState::NoAnswer,
                _ => RequestState::Fail,
            };
        }
    }
    shared.store.push(req);
}

/// One fixed-slot exchange: stage the command, trigger it via the TX
/// status byte, then poll the RX block for the matching reply.
fn exchange_api(shared: &Shared, req: &mut FwRequest, deadline: Instant) -> Result<()> {
    let io = &shared.io;
    let base = shared.cfg.api_base;
    let id = req.id;
    let write = req.kind == FwRequestKind::ApiWrite;

    let mut polls = 0u32;
    loop {
        let status = io.read8(base + api::TX_STATUS, id, deadline)?;
        if status == api::state::RESET {
            break;
        }
        polls += 1;
        if polls >= shared.cfg.max_wait_packets {
            return Err(AccessError::Timeout {
                duration_ms: req.timeout_ms,
            });
        }
        thread::sleep(shared.cfg.poll_interval);
    }

    let cmd = ApiCommand {
        id,
        value: req.value,
        section: req.section,
        command: req.command,
        write,
    };
    io.write_bytes(base + api::TX_COMMAND, cmd.encode().to_vec(), id, deadline)?;
    let trigger = if write {
        api::state::WRITE
    } else {
        api::state::READ
    };
    io.write8(base + api::TX_STATUS, trigger, id, deadline)?;

    polls = 0;
    loop {
        let status = io.read8(base + api::RX_STATUS, id, deadline)?;
        if status == trigger {
            let reply_id = io.read32(base + api::RX_ID, id, deadline)?;
            if reply_id == id {
                break;
            }
            // Stale reply from an abandoned exchange; consume and re-poll.
            tracing::warn!("api reply for unexpected id {reply_id} discarded");
            io.write8(base + api::RX_STATUS, api::state::RESET, id, deadline)?;
        }
        polls += 1;
        if polls >= shared.cfg.max_wait_packets {
            return Err(AccessError::Timeout {
                duration_ms: req.timeout_ms,
            });
        }
        thread::sleep(shared.cfg.poll_interval);
    }

    req.value = io.read32(base + api::RX_VALUE, id, deadline)?;
    let code = io.read32(base + api::RX_STATUS_CODE, id, deadline)?;
    #[allow(clippy::cast_possible_truncation)]
    {
        req.status = code as u16;
    }
    io.write8(base + api::RX_STATUS, api::state::RESET, id, deadline)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::MemTransport;
    use std::sync::atomic::AtomicU32;

    fn stack(cfg: StreamConfig) -> (StreamAccess, Arc<ResultStore<FwRequest>>) {
        let dispatcher = Arc::new(Dispatcher::new(Box::new(MemTransport::new(0x4000))));
        dispatcher.open().unwrap();
        let store = Arc::new(ResultStore::default());
        let access = StreamAccess::new(dispatcher, Arc::clone(&store), cfg).unwrap();
        (access, store)
    }

    /// Stack whose peer acknowledges TX channel requests (counting them in
    /// `resets`) and, while `drain` is set, consumes every written byte.
    fn acking_stack(
        cfg: StreamConfig,
        drain: Arc<AtomicBool>,
        resets: Arc<AtomicU32>,
    ) -> (StreamAccess, Arc<ResultStore<FwRequest>>) {
        let transport = MemTransport::new(0x4000);
        let base = cfg.buffer_base as usize;
        transport.set_write_hook(move |addr, mem| {
            if addr as usize != base + channel::STATE as usize {
                return;
            }
            let word = u32::from_le_bytes(mem[base..base + 4].try_into().unwrap());
            if word == channel::state::CHANNEL_REQUESTED {
                resets.fetch_add(1, Ordering::SeqCst);
                let read = base + channel::READ_INDEX as usize;
                mem[read..read + 4].copy_from_slice(&0u32.to_le_bytes());
                mem[base..base + 4]
                    .copy_from_slice(&channel::state::CHANNEL_ACKNOWLEDGE.to_le_bytes());
            } else if word == channel::state::WRITE_REGISTER_UPDATED && drain.load(Ordering::SeqCst)
            {
                let write = base + channel::WRITE_INDEX as usize;
                let read = base + channel::READ_INDEX as usize;
                let index: [u8; 4] = mem[write..write + 4].try_into().unwrap();
                mem[read..read + 4].copy_from_slice(&index);
            }
        });
        let dispatcher = Arc::new(Dispatcher::new(Box::new(transport)));
        dispatcher.open().unwrap();
        let store = Arc::new(ResultStore::default());
        let access = StreamAccess::new(dispatcher, Arc::clone(&store), cfg).unwrap();
        (access, store)
    }

    /// 16-byte data region per half, small enough to stall any frame.
    fn tiny_ring() -> StreamConfig {
        StreamConfig {
            buffer_size: 2 * (16 + channel::HEADER_SIZE),
            poll_interval: Duration::from_millis(1),
            ..StreamConfig::default()
        }
    }

    #[test]
    fn undersized_buffer_rejected() {
        let dispatcher = Arc::new(Dispatcher::new(Box::new(MemTransport::new(0x100))));
        let store = Arc::new(ResultStore::default());
        let cfg = StreamConfig {
            buffer_size: 2 * channel::HEADER_SIZE,
            ..StreamConfig::default()
        };
        assert!(StreamAccess::new(dispatcher, store, cfg).is_err());
    }

    #[test]
    fn post_before_start_is_rejected() {
        let (access, _store) = stack(StreamConfig::default());
        let err = access.post(FwRequest::api_read(0, 1)).unwrap_err();
        assert!(matches!(err, AccessError::NotInitialized));
    }

    #[test]
    fn unanswered_handshake_fails_as_no_answer() {
        // No peer ever acknowledges the channel request.
        let (mut access, store) = stack(StreamConfig {
            poll_interval: Duration::from_millis(1),
            ..StreamConfig::default()
        });
        access.start().unwrap();
        let req = FwRequest::buffer_write(1, 2, vec![0xAA; 16]).with_timeout(40);
        let id = access.post(req).unwrap();
        let done = store.get(id, 2_000).unwrap();
        assert_eq!(done.state, RequestState::NoAnswer);
    }

    #[test]
    fn silent_api_slot_times_out() {
        let (mut access, store) = stack(StreamConfig {
            poll_interval: Duration::from_millis(1),
            max_wait_packets: 3,
            ..StreamConfig::default()
        });
        access.start().unwrap();
        // TX slot reads back RESET so the command is staged, but no reply
        // ever lands in the RX block.
        let id = access.post(FwRequest::api_read(1, 0x20)).unwrap();
        let done = store.get(id, 2_000).unwrap();
        assert_eq!(done.state, RequestState::Timeout);
    }

    #[test]
    fn stop_fails_queued_requests() {
        let (mut access, store) = stack(StreamConfig::default());
        access.start().unwrap();
        let id = access.post(FwRequest::buffer_write(0, 0, vec![1])).unwrap();
        access.stop();
        let done = store.get(id, 2_000).unwrap();
        assert_eq!(done.state, RequestState::NoAnswer);
    }

    #[test]
    fn double_start_is_reported() {
        let (mut access, _store) = stack(StreamConfig::default());
        access.start().unwrap();
        assert!(access.start().is_err());
    }

    #[test]
    fn buffer_read_is_parked_before_transmission_completes() {
        // The peer acks the channel but never drains, so the read frame
        // stalls mid-transfer; its reply slot must already be registered.
        let drain = Arc::new(AtomicBool::new(false));
        let resets = Arc::new(AtomicU32::new(0));
        let (mut access, store) = acking_stack(tiny_ring(), drain, resets);
        access.start().unwrap();
        let req = FwRequest::buffer_read(0, 1, 64).with_timeout(10_000);
        let id = access.post(req).unwrap();
        for _ in 0..500 {
            if access.pending_replies() == 1 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(access.pending_replies(), 1);
        access.stop();
        let done = store.get(id, 2_000).unwrap();
        assert_eq!(done.state, RequestState::NoAnswer);
        assert_eq!(access.pending_replies(), 0);
    }

    #[test]
    fn channel_resyncs_after_mid_transfer_abandonment() {
        let drain = Arc::new(AtomicBool::new(false));
        let resets = Arc::new(AtomicU32::new(0));
        let (mut access, store) =
            acking_stack(tiny_ring(), Arc::clone(&drain), Arc::clone(&resets));
        access.start().unwrap();

        // First transfer dies mid-flight with a partial frame in the ring.
        let stuck = FwRequest::buffer_write(0, 0, vec![0xAA; 40]).with_timeout(80);
        let id = access.post(stuck).unwrap();
        let done = store.get(id, 2_000).unwrap();
        assert_eq!(done.state, RequestState::NoAnswer);

        // Once the peer drains, the next transfer must start from a fresh
        // handshake instead of appending to the dead frame.
        drain.store(true, Ordering::SeqCst);
        let id = access.post(FwRequest::buffer_write(0, 0, vec![0x55; 8])).unwrap();
        let done = store.get(id, 2_000).unwrap();
        assert_eq!(done.state, RequestState::Success);
        assert_eq!(resets.load(Ordering::SeqCst), 2);
    }
}
