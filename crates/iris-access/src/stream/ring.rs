//! Addressing and index arithmetic for one half of the shared ring buffer.
//!
//! Each half starts with the 12-byte header described in
//! [`iris_chip::regs::channel`] and is followed by a circular data region.
//! One slot is always reserved so `write_index == read_index` can only mean
//! empty; the arithmetic here is the authoritative form of that rule and
//! must stay bit-for-bit compatible with the firmware's own.

use iris_chip::regs::channel;

use crate::error::{AccessError, Result};

/// One half (TX or RX) of the shared buffer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RingHalf {
    base: u32,
    size: u32,
}

impl RingHalf {
    /// Describe a half starting at `base` and spanning `half_size` bytes
    /// (header included).
    ///
    /// # Errors
    ///
    /// Rejects a half too small to hold the header plus a usable data
    /// region (the reserved slot leaves `half_size - 13` usable bytes).
    pub fn new(base: u32, half_size: u32) -> Result<Self> {
        if half_size <= channel::HEADER_SIZE + 1 {
            return Err(AccessError::invalid_parameters(format!(
                "ring half of {half_size} bytes leaves no data region"
            )));
        }
        Ok(Self {
            base,
            size: half_size - channel::HEADER_SIZE,
        })
    }

    /// Size of the circular data region in bytes.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Address of the channel state word.
    pub fn state_addr(&self) -> u32 {
        self.base + channel::STATE
    }

    /// Address of the producer index word.
    pub fn write_index_addr(&self) -> u32 {
        self.base + channel::WRITE_INDEX
    }

    /// Address of the consumer index word.
    pub fn read_index_addr(&self) -> u32 {
        self.base + channel::READ_INDEX
    }

    /// Address of byte `index` of the data region.
    pub fn data_addr(&self, index: u32) -> u32 {
        self.base + channel::DATA + (index % self.size)
    }

    /// Bytes the producer may still write. One slot stays reserved, so the
    /// result never reaches `size`.
    pub fn free_space(&self, write_index: u32, read_index: u32) -> u32 {
        (read_index + self.size - write_index - 1) % self.size
    }

    /// Bytes the consumer may read.
    pub fn used_space(&self, write_index: u32, read_index: u32) -> u32 {
        (write_index + self.size - read_index) % self.size
    }

    /// Advance an index by `by` bytes, wrapping at the region size.
    pub fn advance(&self, index: u32, by: u32) -> u32 {
        (index + by) % self.size
    }

    /// Contiguous bytes available from `index` up to the wrap point.
    pub fn run_to_wrap(&self, index: u32) -> u32 {
        self.size - (index % self.size)
    }
}
