//! Firmware- and register-level request objects.
//!
//! Requests are created by callers, mutated only by the access strategy that
//! owns them, and destroyed when the caller consumes them from the
//! [`ResultStore`](crate::store::ResultStore). Each carries a process-wide
//! unique correlation id from a monotonic counter.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{AccessError, Result};
use crate::store::Correlated;

/// Default per-request timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 1_000;

static NEXT_ID: AtomicU32 = AtomicU32::new(1);

/// Allocate the next correlation id.
pub(crate) fn next_id() -> u32 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Terminal and transient states of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Submitted but not yet resolved.
    Processing,
    /// Completed successfully.
    Success,
    /// The remote side explicitly reported that it has no response.
    NoAnswer,
    /// No reply arrived within the request's deadline.
    Timeout,
    /// The transport or firmware reported a failure.
    Fail,
}

/// Kind of a firmware-level request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwRequestKind {
    /// Single-word firmware read.
    ApiRead,
    /// Single-word firmware write.
    ApiWrite,
    /// Buffer transfer, device to host.
    BufferRead,
    /// Buffer transfer, host to device.
    BufferWrite,
}

impl FwRequestKind {
    /// True for the buffer-transfer kinds.
    pub fn is_buffer(self) -> bool {
        matches!(self, Self::BufferRead | Self::BufferWrite)
    }

    /// True for the kinds that read data back from the firmware.
    pub fn is_read(self) -> bool {
        matches!(self, Self::ApiRead | Self::BufferRead)
    }

    /// Frame kind byte for the streaming channel.
    pub fn frame_kind(self) -> u8 {
        match self {
            Self::ApiRead => iris_chip::frame::kind::API_READ,
            Self::ApiWrite => iris_chip::frame::kind::API_WRITE,
            Self::BufferRead => iris_chip::frame::kind::BUFFER_READ,
            Self::BufferWrite => iris_chip::frame::kind::BUFFER_WRITE,
        }
    }
}

/// One firmware API call or buffer transfer.
#[derive(Debug, Clone)]
pub struct FwRequest {
    /// Unique correlation id.
    pub id: u32,
    /// Request kind.
    pub kind: FwRequestKind,
    /// Command-type / section selector.
    pub section: u8,
    /// Command selector within the section.
    pub command: u8,
    /// Input value for writes; result value after a completed read.
    pub value: u32,
    /// 16-bit status code returned by the firmware.
    pub status: u16,
    /// Payload for buffer kinds (outbound for writes, filled for reads).
    pub buffer: Vec<u8>,
    /// Current request state.
    pub state: RequestState,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl FwRequest {
    /// Build a single-word firmware read.
    pub fn api_read(section: u8, command: u8) -> Self {
        Self::new(FwRequestKind::ApiRead, section, command, 0, Vec::new())
    }

    /// Build a single-word firmware write of `value`.
    pub fn api_write(section: u8, command: u8, value: u32) -> Self {
        Self::new(FwRequestKind::ApiWrite, section, command, value, Vec::new())
    }

    /// Build a buffer read of `len` bytes.
    pub fn buffer_read(section: u8, command: u8, len: usize) -> Self {
        let mut req = Self::new(FwRequestKind::BufferRead, section, command, 0, Vec::new());
        #[allow(clippy::cast_possible_truncation)]
        {
            req.value = len as u32;
        }
        req
    }

    /// Build a buffer write carrying `data`.
    pub fn buffer_write(section: u8, command: u8, data: Vec<u8>) -> Self {
        Self::new(FwRequestKind::BufferWrite, section, command, 0, data)
    }

    /// Override the default timeout.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    fn new(kind: FwRequestKind, section: u8, command: u8, value: u32, buffer: Vec<u8>) -> Self {
        Self {
            id: next_id(),
            kind,
            section,
            command,
            value,
            status: 0,
            buffer,
            state: RequestState::Processing,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Validate the request before it touches a strategy.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::InvalidParameters`] for a zero-length buffer
    /// transfer.
    pub fn validate(&self) -> Result<()> {
        match self.kind {
            FwRequestKind::BufferWrite if self.buffer.is_empty() => Err(
                AccessError::invalid_parameters("zero-length buffer write"),
            ),
            FwRequestKind::BufferRead if self.value == 0 => {
                Err(AccessError::invalid_parameters("zero-length buffer read"))
            }
            _ => Ok(()),
        }
    }
}

impl Correlated for FwRequest {
    fn id(&self) -> u32 {
        self.id
    }
}

/// Kind of a register-level request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegRequestKind {
    /// Register read.
    RegRead,
    /// Register write (optionally masked).
    RegWrite,
    /// Lookup-table read.
    LutRead,
    /// Lookup-table write (optionally masked).
    LutWrite,
}

impl RegRequestKind {
    /// True for the kinds that write toward the device.
    pub fn is_write(self) -> bool {
        matches!(self, Self::RegWrite | Self::LutWrite)
    }
}

/// One register or lookup-table access.
#[derive(Debug, Clone)]
pub struct RegRequest {
    /// Unique correlation id.
    pub id: u32,
    /// Request kind.
    pub kind: RegRequestKind,
    /// Target address on the device.
    pub address: u32,
    /// Data to write, or a buffer sized for the read.
    pub data: Vec<u8>,
    /// Optional write mask; only masked bits are applied.
    pub mask: Option<Vec<u8>>,
    /// Current request state.
    pub state: RequestState,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
}

impl RegRequest {
    /// Build a register read of `len` bytes at `address`.
    pub fn read(address: u32, len: usize) -> Self {
        Self::new(RegRequestKind::RegRead, address, vec![0; len], None)
    }

    /// Build a register write of `data` at `address`.
    pub fn write(address: u32, data: Vec<u8>) -> Self {
        Self::new(RegRequestKind::RegWrite, address, data, None)
    }

    /// Build a masked register write; only bits set in `mask` are applied.
    pub fn write_masked(address: u32, data: Vec<u8>, mask: Vec<u8>) -> Self {
        Self::new(RegRequestKind::RegWrite, address, data, Some(mask))
    }

    /// Build a lookup-table read of `len` bytes at `address`.
    pub fn lut_read(address: u32, len: usize) -> Self {
        Self::new(RegRequestKind::LutRead, address, vec![0; len], None)
    }

    /// Build a lookup-table write of `data` at `address`.
    pub fn lut_write(address: u32, data: Vec<u8>) -> Self {
        Self::new(RegRequestKind::LutWrite, address, data, None)
    }

    /// Override the default timeout.
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    fn new(kind: RegRequestKind, address: u32, data: Vec<u8>, mask: Option<Vec<u8>>) -> Self {
        Self {
            id: next_id(),
            kind,
            address,
            data,
            mask,
            state: RequestState::Processing,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    /// Validate the request before it touches a strategy.
    ///
    /// # Errors
    ///
    /// Returns [`AccessError::InvalidParameters`] for zero-length data or a
    /// mask whose length disagrees with the data.
    pub fn validate(&self) -> Result<()> {
        if self.data.is_empty() {
            return Err(AccessError::invalid_parameters("zero-length request"));
        }
        if let Some(mask) = &self.mask {
            if mask.len() != self.data.len() {
                return Err(AccessError::invalid_parameters(format!(
                    "mask length {} does not match data length {}",
                    mask.len(),
                    self.data.len()
                )));
            }
            if !self.kind.is_write() {
                return Err(AccessError::invalid_parameters("mask on a read request"));
            }
        }
        Ok(())
    }
}

impl Correlated for RegRequest {
    fn id(&self) -> u32 {
        self.id
    }
}
