//! Firmware API calls emulated over the debug register bank.
//!
//! When the device exposes no shared buffer, a full firmware call is
//! performed by writing successive control fields into a small bank of
//! debug registers and polling a completion flag. One worker thread drives
//! a private state machine; each state issues exactly one packet and
//! transitions only after that packet's completion is observed:
//!
//! ```text
//! WaitRequest → Reset → SetType → SetId → SetDir → SetValue → Run → (poll) → Done
//!                                             └ BufSize → BufData → BufApply ┘
//! ```
//!
//! Only one request is in flight through this path at a time; submissions
//! queue (bounded) and block the submitter when the queue is full.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use iris_chip::regs::debug as bank;

use crate::dispatch::{Dispatcher, RegIo};
use crate::error::{AccessError, Result};
use crate::queue::WorkQueue;
use crate::request::{FwRequest, FwRequestKind, RequestState};
use crate::store::ResultStore;

/// Configuration of the debug-register strategy.
#[derive(Debug, Clone)]
pub struct DebugConfig {
    /// Base address of the debug register bank.
    pub base: u32,
    /// Bound on queued submissions before submitters block.
    pub max_request_num: usize,
    /// Status-read retries before a running call is declared lost.
    pub max_wait_packets: u32,
    /// Delay between consecutive status polls.
    pub poll_interval: Duration,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            base: 0,
            max_request_num: 100,
            max_wait_packets: 50,
            poll_interval: Duration::from_millis(2),
        }
    }
}

/// States of the debug-bank call machine.
///
/// `WaitRequest` is the worker's queue pop; every other state maps to one
/// issued packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DebugState {
    Reset,
    SetType,
    SetId,
    SetDir,
    SetValue,
    BufSize,
    BufData,
    BufApply,
    Run,
    Poll,
    Done,
}

struct Shared {
    cfg: DebugConfig,
    queue: WorkQueue<FwRequest>,
    stop: Arc<AtomicBool>,
    io: RegIo,
    store: Arc<ResultStore<FwRequest>>,
}

/// Firmware access strategy over primitive register reads/writes.
pub struct DebugRegisterAccess {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for DebugRegisterAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebugRegisterAccess")
            .field("base", &format_args!("{:#x}", self.shared.cfg.base))
            .field("running", &self.worker.is_some())
            .finish()
    }
}

impl DebugRegisterAccess {
    /// Create the strategy; call [`DebugRegisterAccess::start`] before
    /// submitting.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        store: Arc<ResultStore<FwRequest>>,
        cfg: DebugConfig,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let io = RegIo::new(dispatcher, Arc::clone(&stop));
        let queue = WorkQueue::new(cfg.max_request_num);
        Self {
            shared: Arc::new(Shared {
                cfg,
                queue,
                stop,
                io,
                store,
            }),
            worker: None,
        }
    }

    /// Spawn the worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::Fatal`] if already started.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Err(AccessError::fatal("debug access already started"));
        }
        self.shared.stop.store(false, Ordering::SeqCst);
        let shared = Arc::clone(&self.shared);
        self.worker = Some(
            thread::Builder::new()
                .name("iris-debug".into())
                .spawn(move || worker_loop(&shared))
                .map_err(|e| AccessError::fatal(format!("spawn failed: {e}")))?,
        );
        Ok(())
    }

    /// Stop the worker and join it; queued requests are failed as NoAnswer.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.queue.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        for mut req in self.shared.queue.drain() {
            req.state = RequestState::NoAnswer;
            self.shared.store.push(req);
        }
    }

    /// Queue a firmware request; blocks while the queue is full.
    ///
    /// # Errors
    ///
    /// [`AccessError::InvalidParameters`] for malformed requests,
    /// [`AccessError::NotInitialized`] when the worker is not running.
    pub fn submit(&self, req: FwRequest) -> Result<u32> {
        req.validate()?;
        if self.worker.is_none() || self.shared.stop.load(Ordering::SeqCst) {
            return Err(AccessError::NotInitialized);
        }
        let id = req.id;
        self.shared.queue.push_blocking(req, &self.shared.stop)?;
        Ok(id)
    }

    /// Number of queued, not yet started requests.
    pub fn queued(&self) -> usize {
        self.shared.queue.len()
    }
}

impl Drop for DebugRegisterAccess {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &Shared) {
    tracing::debug!("debug-bank worker up, base {:#x}", shared.cfg.base);
    while !shared.stop.load(Ordering::SeqCst) {
        if let Some(req) = shared.queue.pop(&shared.stop) {
            run_call(shared, req);
        }
    }
    tracing::debug!("debug-bank worker down");
}

/// Drive one firmware call through the bank, always returning the machine
/// to WaitRequest with the request pushed in a terminal state.
fn run_call(shared: &Shared, mut req: FwRequest) {
    let deadline = Instant::now() + Duration::from_millis(req.timeout_ms);
    match drive_machine(shared, &mut req, deadline) {
        Ok(()) => req.state = RequestState::Success,
        Err(err) => {
            tracing::warn!("fw request {} failed on debug bank: {err}", req.id);
            req.state = match err {
                AccessError::Timeout { .. } => RequestState::Timeout,
                AccessError::NoAnswer { .. } => RequestState::NoAnswer,
                _ => RequestState::Fail,
            };
        }
    }
    shared.store.push(req);
}

#[allow(clippy::too_many_lines)]
fn drive_machine(shared: &Shared, req: &mut FwRequest, deadline: Instant) -> Result<()> {
    let base = shared.cfg.base;
    let io = &shared.io;
    let id = req.id;
    let is_read = req.kind.is_read();
    let buffer_len = match req.kind {
        FwRequestKind::BufferWrite => req.buffer.len(),
        FwRequestKind::BufferRead => req.value as usize,
        _ => 0,
    };

    let mut state = DebugState::Reset;
    let mut polls = 0u32;
    let mut word = 0usize;
    loop {
        state = match state {
            DebugState::Reset => {
                io.write32(base + bank::RESET, 1, id, deadline)?;
                DebugState::SetType
            }
            DebugState::SetType => {
                io.write32(base + bank::TYPE, u32::from(req.section), id, deadline)?;
                DebugState::SetId
            }
            DebugState::SetId => {
                io.write32(base + bank::ID, u32::from(req.command), id, deadline)?;
                DebugState::SetDir
            }
            DebugState::SetDir => {
                let dir = if is_read {
                    bank::DIR_READ
                } else {
                    bank::DIR_WRITE
                };
                io.write32(base + bank::DIR, dir, id, deadline)?;
                DebugState::SetValue
            }
            DebugState::SetValue => {
                io.write32(base + bank::VALUE, req.value, id, deadline)?;
                if req.kind.is_buffer() {
                    DebugState::BufSize
                } else {
                    DebugState::Run
                }
            }
            DebugState::BufSize => {
                #[allow(clippy::cast_possible_truncation)]
                io.write32(base + bank::BUF_SIZE, buffer_len as u32, id, deadline)?;
                if req.kind == FwRequestKind::BufferWrite {
                    word = 0;
                    DebugState::BufData
                } else {
                    DebugState::Run
                }
            }
            DebugState::BufData => {
                // One staged word per state step; firmware auto-increments.
                let offset = word * 4;
                let mut bytes = [0u8; 4];
                let take = 4.min(buffer_len - offset);
                bytes[..take].copy_from_slice(&req.buffer[offset..offset + take]);
                io.write32(base + bank::BUF_DATA, u32::from_le_bytes(bytes), id, deadline)?;
                word += 1;
                if word * 4 >= buffer_len {
                    DebugState::BufApply
                } else {
                    DebugState::BufData
                }
            }
            DebugState::BufApply => {
                io.write32(base + bank::BUF_APPLY, 1, id, deadline)?;
                DebugState::Run
            }
            DebugState::Run => {
                io.write32(base + bank::RUN, bank::run::START, id, deadline)?;
                polls = 0;
                DebugState::Poll
            }
            DebugState::Poll => {
                let status = io.read32(base + bank::RUN, id, deadline)?;
                if status & bank::run::ERROR != 0 {
                    let code = io.read32(base + bank::STATUS_CODE, id, deadline)?;
                    #[allow(clippy::cast_possible_truncation)]
                    {
                        req.status = code as u16;
                    }
                    return Err(AccessError::device_error(format!(
                        "firmware reported error, status {code:#x}"
                    )));
                }
                if status & bank::run::DONE != 0 {
                    DebugState::Done
                } else {
                    polls += 1;
                    if polls >= shared.cfg.max_wait_packets {
                        return Err(AccessError::Timeout {
                            duration_ms: req.timeout_ms,
                        });
                    }
                    thread::sleep(shared.cfg.poll_interval);
                    DebugState::Poll
                }
            }
            DebugState::Done => {
                if is_read {
                    req.value = io.read32(base + bank::VALUE, id, deadline)?;
                }
                let code = io.read32(base + bank::STATUS_CODE, id, deadline)?;
                #[allow(clippy::cast_possible_truncation)]
                {
                    req.status = code as u16;
                }
                if req.kind == FwRequestKind::BufferRead {
                    let words = buffer_len.div_ceil(4);
                    let mut data = Vec::with_capacity(words * 4);
                    for _ in 0..words {
                        let value = io.read32(base + bank::BUF_DATA, id, deadline)?;
                        data.extend_from_slice(&value.to_le_bytes());
                    }
                    data.truncate(buffer_len);
                    req.buffer = data;
                }
                return Ok(());
            }
        };
    }
}
