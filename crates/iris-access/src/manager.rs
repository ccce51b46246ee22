//! Configuration-time facade over the access strategies.
//!
//! The manager is told once, at construction, which strategy backs
//! hardware-register access and which backs firmware access, then exposes
//! one uniform submit/await surface. Strategy threads and the underlying
//! transport are started by [`AccessManager::open`] and stopped by
//! [`AccessManager::close`] or [`AccessManager::terminate`].

use std::sync::Arc;
use std::time::Duration;

use crate::debug::{DebugConfig, DebugRegisterAccess};
use crate::direct::{RegisterDirectAccess, DEFAULT_MAX_PACKET_SIZE};
use crate::dispatch::{Dispatcher, Transport};
use crate::error::{AccessError, Result};
use crate::request::{FwRequest, RegRequest};
use crate::store::ResultStore;
use crate::stream::{StreamAccess, StreamConfig};

/// Strategy backing hardware-register requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwMode {
    /// Split into packets and sent straight to the transport.
    Direct,
    /// Register access disabled.
    None,
}

/// Strategy backing firmware requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwMode {
    /// Emulated over the debug register bank.
    Direct,
    /// Streamed through the shared ring buffer.
    Stream,
    /// Delegated to a hardware mailbox. Reserved; not implemented.
    Hw,
    /// Firmware access disabled.
    None,
}

/// Full configuration of an [`AccessManager`].
#[derive(Debug, Clone)]
pub struct AccessConfig {
    /// Hardware-register strategy.
    pub hw_mode: HwMode,
    /// Firmware strategy.
    pub fw_mode: FwMode,
    /// Base address of the debug register bank (`FwMode::Direct`).
    pub debug_base: u32,
    /// Base address of the shared buffer (`FwMode::Stream`).
    pub buffer_base: u32,
    /// Total size of the shared buffer (`FwMode::Stream`).
    pub buffer_size: u32,
    /// Base address of the API sub-channel (`FwMode::Stream`).
    pub api_base: u32,
    /// Largest packet payload the register path produces.
    pub max_packet_size: usize,
    /// Bound on queued firmware submissions before submitters block.
    pub max_request_num: usize,
    /// Status polls tolerated before a firmware call is declared lost.
    pub max_wait_packets: u32,
    /// Delay between consecutive status polls.
    pub poll_interval: Duration,
}

impl Default for AccessConfig {
    fn default() -> Self {
        let stream = StreamConfig::default();
        let debug = DebugConfig::default();
        Self {
            hw_mode: HwMode::Direct,
            fw_mode: FwMode::Direct,
            debug_base: debug.base,
            buffer_base: stream.buffer_base,
            buffer_size: stream.buffer_size,
            api_base: stream.api_base,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            max_request_num: debug.max_request_num,
            max_wait_packets: debug.max_wait_packets,
            poll_interval: debug.poll_interval,
        }
    }
}

/// Facade routing requests to the configured access strategies.
pub struct AccessManager {
    cfg: AccessConfig,
    dispatcher: Arc<Dispatcher>,
    reg_store: Arc<ResultStore<RegRequest>>,
    fw_store: Arc<ResultStore<FwRequest>>,
    direct: Option<RegisterDirectAccess>,
    debug: Option<DebugRegisterAccess>,
    stream: Option<StreamAccess>,
    opened: bool,
}

impl std::fmt::Debug for AccessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccessManager")
            .field("hw_mode", &self.cfg.hw_mode)
            .field("fw_mode", &self.cfg.fw_mode)
            .field("transport", &self.dispatcher.transport_name())
            .field("opened", &self.opened)
            .finish()
    }
}

impl AccessManager {
    /// Build the manager and its configured strategies around `transport`.
    ///
    /// Nothing is started; call [`AccessManager::open`] first.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::InvalidParameters`] when the stream
    /// configuration is unusable (buffer too small for two halves).
    pub fn new(transport: Box<dyn Transport>, cfg: AccessConfig) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher::new(transport));
        let reg_store = Arc::new(ResultStore::default());
        let fw_store = Arc::new(ResultStore::default());

        let direct = match cfg.hw_mode {
            HwMode::Direct => Some(RegisterDirectAccess::new(
                Arc::clone(&dispatcher),
                Arc::clone(&reg_store),
                cfg.max_packet_size,
            )),
            HwMode::None => None,
        };

        let mut debug = None;
        let mut stream = None;
        match cfg.fw_mode {
            FwMode::Direct => {
                debug = Some(DebugRegisterAccess::new(
                    Arc::clone(&dispatcher),
                    Arc::clone(&fw_store),
                    DebugConfig {
                        base: cfg.debug_base,
                        max_request_num: cfg.max_request_num,
                        max_wait_packets: cfg.max_wait_packets,
                        poll_interval: cfg.poll_interval,
                    },
                ));
            }
            FwMode::Stream => {
                stream = Some(StreamAccess::new(
                    Arc::clone(&dispatcher),
                    Arc::clone(&fw_store),
                    StreamConfig {
                        buffer_base: cfg.buffer_base,
                        buffer_size: cfg.buffer_size,
                        api_base: cfg.api_base,
                        max_request_num: cfg.max_request_num,
                        max_wait_packets: cfg.max_wait_packets,
                        poll_interval: cfg.poll_interval,
                    },
                )?);
            }
            FwMode::Hw | FwMode::None => {}
        }

        Ok(Self {
            cfg,
            dispatcher,
            reg_store,
            fw_store,
            direct,
            debug,
            stream,
            opened: false,
        })
    }

    /// Open the transport and start the configured strategy threads.
    ///
    /// # Errors
    ///
    /// Double-open is reported as [`AccessError::Fatal`]; transport and
    /// spawn errors pass through, leaving everything stopped.
    pub fn open(&mut self) -> Result<()> {
        if self.opened {
            return Err(AccessError::fatal("access manager already open"));
        }
        self.dispatcher.open()?;
        if let Some(debug) = &mut self.debug {
            if let Err(err) = debug.start() {
                let _ = self.dispatcher.close();
                return Err(err);
            }
        }
        if let Some(stream) = &mut self.stream {
            if let Err(err) = stream.start() {
                if let Some(debug) = &mut self.debug {
                    debug.stop();
                }
                let _ = self.dispatcher.close();
                return Err(err);
            }
        }
        self.opened = true;
        tracing::info!(
            "access manager open: hw {:?}, fw {:?}",
            self.cfg.hw_mode,
            self.cfg.fw_mode
        );
        Ok(())
    }

    /// Stop the strategy threads, then close the transport.
    ///
    /// # Errors
    ///
    /// Double-close is reported as [`AccessError::Fatal`]; transport errors
    /// pass through.
    pub fn close(&mut self) -> Result<()> {
        if !self.opened {
            return Err(AccessError::fatal("access manager already closed"));
        }
        if let Some(stream) = &mut self.stream {
            stream.stop();
        }
        if let Some(debug) = &mut self.debug {
            debug.stop();
        }
        self.opened = false;
        self.dispatcher.close()
    }

    /// Unconditional shutdown: stop everything that is running and swallow
    /// transport errors. Safe to call in any state.
    pub fn terminate(&mut self) {
        if let Some(stream) = &mut self.stream {
            stream.stop();
        }
        if let Some(debug) = &mut self.debug {
            debug.stop();
        }
        if self.dispatcher.is_open() {
            let _ = self.dispatcher.close();
        }
        self.opened = false;
    }

    /// True between a successful `open` and the matching `close`.
    pub fn is_open(&self) -> bool {
        self.opened
    }

    /// Name of the underlying transport driver.
    pub fn transport_name(&self) -> &'static str {
        self.dispatcher.transport_name()
    }

    /// Configured hardware-register strategy.
    pub fn hw_mode(&self) -> HwMode {
        self.cfg.hw_mode
    }

    /// Configured firmware strategy.
    pub fn fw_mode(&self) -> FwMode {
        self.cfg.fw_mode
    }

    /// Submit a register request to the configured hardware strategy.
    ///
    /// # Errors
    ///
    /// [`AccessError::NotInitialized`] before `open`,
    /// [`AccessError::Unsupported`] with `HwMode::None`, plus whatever the
    /// strategy reports.
    pub fn post_reg_request(&self, req: RegRequest) -> Result<u32> {
        if !self.opened {
            return Err(AccessError::NotInitialized);
        }
        match &self.direct {
            Some(direct) => direct.post_reg_request(req),
            None => Err(AccessError::unsupported("register access disabled")),
        }
    }

    /// Submit a firmware request to the configured firmware strategy.
    ///
    /// # Errors
    ///
    /// [`AccessError::NotInitialized`] before `open`,
    /// [`AccessError::Unsupported`] with `FwMode::None`,
    /// [`AccessError::NotImplemented`] with `FwMode::Hw`, plus whatever the
    /// strategy reports.
    pub fn post_fw_request(&self, req: FwRequest) -> Result<u32> {
        if !self.opened {
            return Err(AccessError::NotInitialized);
        }
        if let Some(debug) = &self.debug {
            return debug.submit(req);
        }
        if let Some(stream) = &self.stream {
            return stream.post(req);
        }
        match self.cfg.fw_mode {
            FwMode::Hw => Err(AccessError::not_implemented("hardware firmware access")),
            _ => Err(AccessError::unsupported("firmware access disabled")),
        }
    }

    /// Await the result of a register request.
    ///
    /// # Errors
    ///
    /// [`AccessError::Timeout`] when nothing arrives under `id` in time.
    pub fn get_reg_result(&self, id: u32, timeout_ms: u64) -> Result<RegRequest> {
        self.reg_store.get(id, timeout_ms)
    }

    /// Await the result of a firmware request.
    ///
    /// # Errors
    ///
    /// [`AccessError::Timeout`] when nothing arrives under `id` in time.
    pub fn get_fw_result(&self, id: u32, timeout_ms: u64) -> Result<FwRequest> {
        self.fw_store.get(id, timeout_ms)
    }
}

impl Drop for AccessManager {
    fn drop(&mut self) {
        self.terminate();
    }
}
