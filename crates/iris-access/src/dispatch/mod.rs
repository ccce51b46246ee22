//! Transport contract and the thin dispatch layer in front of it.
//!
//! A [`Transport`] is a leaf driver (serial bus, memory-mapped device file,
//! character device, socket). Its only obligation toward the protocol stack
//! is the packet contract: accept a [`Packet`], perform the exchange, and
//! call [`Packet::complete`] exactly once — synchronously or from its own
//! receiver thread.
//!
//! The [`Dispatcher`] owns the active transport and forwards packets to it;
//! [`RegIo`] layers a blocking register read/write API on top, used by the
//! protocol worker threads.

pub mod mem;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::{AccessError, Result};
use crate::packet::{Packet, PacketState};

pub use mem::MemTransport;

/// Contract a physical transport driver must implement.
pub trait Transport: Send + Sync {
    /// Short driver name for logs.
    fn name(&self) -> &'static str;

    /// Bring the physical link up.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying device cannot be opened.
    fn open(&self) -> Result<()>;

    /// Tear the physical link down.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying device cannot be closed.
    fn close(&self) -> Result<()>;

    /// Accept a packet for transfer.
    ///
    /// The transport must call [`Packet::complete`] exactly once, with the
    /// final state and (for reads) the data filled in.
    ///
    /// # Errors
    ///
    /// Returns an error only when the packet was not accepted at all; in
    /// that case it must NOT be completed by the transport.
    fn post(&self, packet: Packet) -> Result<()>;
}

/// Owns the active transport and forwards packets to it.
pub struct Dispatcher {
    transport: Box<dyn Transport>,
    opened: AtomicBool,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("transport", &self.transport.name())
            .field("opened", &self.is_open())
            .finish()
    }
}

impl Dispatcher {
    /// Wrap a transport; the dispatcher starts closed.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            opened: AtomicBool::new(false),
        }
    }

    /// Open the underlying transport.
    ///
    /// # Errors
    ///
    /// Double-open is reported as [`AccessError::Fatal`]; transport errors
    /// pass through.
    pub fn open(&self) -> Result<()> {
        if self.opened.swap(true, Ordering::SeqCst) {
            return Err(AccessError::fatal("dispatcher already open"));
        }
        tracing::info!("opening transport {}", self.transport.name());
        self.transport.open().inspect_err(|_| {
            self.opened.store(false, Ordering::SeqCst);
        })
    }

    /// Close the underlying transport.
    ///
    /// # Errors
    ///
    /// Double-close is reported as [`AccessError::Fatal`]; transport errors
    /// pass through.
    pub fn close(&self) -> Result<()> {
        if !self.opened.swap(false, Ordering::SeqCst) {
            return Err(AccessError::fatal("dispatcher already closed"));
        }
        tracing::info!("closing transport {}", self.transport.name());
        self.transport.close()
    }

    /// True between a successful `open` and the matching `close`.
    pub fn is_open(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// Forward a packet to the active transport.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::NotInitialized`] while closed; transport
    /// errors pass through. On error the packet was not completed.
    pub fn post(&self, packet: Packet) -> Result<()> {
        if !self.is_open() {
            return Err(AccessError::NotInitialized);
        }
        self.transport.post(packet)
    }

    /// Name of the wrapped transport.
    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }
}

/// Blocking register I/O over the dispatcher.
///
/// Issues one packet per call and parks on a one-shot channel until the
/// transport completes it, re-checking the stop flag at every poll interval
/// so worker shutdown is never delayed by a stuck device.
#[derive(Clone)]
pub struct RegIo {
    dispatcher: Arc<Dispatcher>,
    stop: Arc<AtomicBool>,
    poll: Duration,
}

impl RegIo {
    /// Poll granularity bounding every internal wait.
    pub const POLL: Duration = Duration::from_millis(100);

    /// Create a register I/O helper observing `stop`.
    pub fn new(dispatcher: Arc<Dispatcher>, stop: Arc<AtomicBool>) -> Self {
        Self {
            dispatcher,
            stop,
            poll: Self::POLL,
        }
    }

    /// Read `len` bytes at `addr`, blocking until `deadline`.
    ///
    /// # Errors
    ///
    /// [`AccessError::DeviceError`] / [`AccessError::NoAnswer`] for
    /// transport-reported failures, [`AccessError::Timeout`] past the
    /// deadline, [`AccessError::Fatal`] when stopped mid-wait.
    pub fn read_bytes(
        &self,
        addr: u32,
        len: usize,
        reg_id: u32,
        deadline: Instant,
    ) -> Result<Vec<u8>> {
        self.transfer(Packet::read(addr, len, reg_id), deadline)
    }

    /// Write `data` at `addr`, blocking until `deadline`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`RegIo::read_bytes`].
    pub fn write_bytes(
        &self,
        addr: u32,
        data: Vec<u8>,
        reg_id: u32,
        deadline: Instant,
    ) -> Result<()> {
        self.transfer(Packet::write(addr, data, reg_id), deadline)
            .map(|_| ())
    }

    /// Read a 32-bit little-endian register.
    ///
    /// # Errors
    ///
    /// Same conditions as [`RegIo::read_bytes`].
    pub fn read32(&self, addr: u32, reg_id: u32, deadline: Instant) -> Result<u32> {
        let bytes = self.read_bytes(addr, 4, reg_id, deadline)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Write a 32-bit little-endian register.
    ///
    /// # Errors
    ///
    /// Same conditions as [`RegIo::read_bytes`].
    pub fn write32(&self, addr: u32, value: u32, reg_id: u32, deadline: Instant) -> Result<()> {
        self.write_bytes(addr, value.to_le_bytes().to_vec(), reg_id, deadline)
    }

    /// Read a single byte register.
    ///
    /// # Errors
    ///
    /// Same conditions as [`RegIo::read_bytes`].
    pub fn read8(&self, addr: u32, reg_id: u32, deadline: Instant) -> Result<u8> {
        Ok(self.read_bytes(addr, 1, reg_id, deadline)?[0])
    }

    /// Write a single byte register.
    ///
    /// # Errors
    ///
    /// Same conditions as [`RegIo::read_bytes`].
    pub fn write8(&self, addr: u32, value: u8, reg_id: u32, deadline: Instant) -> Result<()> {
        self.write_bytes(addr, vec![value], reg_id, deadline)
    }

    fn transfer(&self, mut packet: Packet, deadline: Instant) -> Result<Vec<u8>> {
        let reg_id = packet.reg_id;
        let started = Instant::now();
        let (done_tx, done_rx) = mpsc::sync_channel::<(PacketState, Vec<u8>)>(1);
        packet.add_listener(move |p| {
            // Receiver may have given up on the deadline already.
            let _ = done_tx.send((p.state, p.data.clone()));
        });
        self.dispatcher.post(packet)?;

        loop {
            match done_rx.recv_timeout(self.poll) {
                Ok((PacketState::Success, data)) => return Ok(data),
                Ok((PacketState::NoAnswer, _)) => {
                    return Err(AccessError::NoAnswer { id: reg_id })
                }
                Ok((PacketState::Invalid, _)) => {
                    return Err(AccessError::invalid_parameters("packet rejected"))
                }
                Ok((state, _)) => {
                    return Err(AccessError::device_error(format!(
                        "packet completed as {state:?}"
                    )))
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if self.stop.load(Ordering::SeqCst) {
                        return Err(AccessError::fatal("stopped while awaiting completion"));
                    }
                    if Instant::now() >= deadline {
                        #[allow(clippy::cast_possible_truncation)]
                        return Err(AccessError::Timeout {
                            duration_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(AccessError::fatal("transport dropped packet completion"));
                }
            }
        }
    }
}
