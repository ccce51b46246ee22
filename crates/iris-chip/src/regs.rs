//! Register-level layout of the Iris host/firmware interface.
//!
//! Three independent register groups are described here:
//!
//! 1. The **debug bank** — a small fixed set of 32-bit registers through
//!    which a full firmware API call can be emulated using nothing but
//!    primitive register reads and writes.
//! 2. The **ring-buffer channel** — each half (TX and RX) of the shared
//!    buffer starts with a 12-byte header (`state`, `write_index`,
//!    `read_index`) followed by a circular data region.
//! 3. The **API sub-channel** — a fixed-slot TX/RX register pair for
//!    single-word firmware calls that bypass the ring buffer.
//!
//! All offsets are relative to a configured base address; the bases
//! themselves are part of the `AccessManager` configuration, not of the
//! chip description.

// ── Debug register bank ──────────────────────────────────────────────────────
//
// One firmware call is performed by writing the control fields one by one
// and then polling RUN until the firmware reports completion. Only one call
// can be in flight; the bank has no queueing of its own.

/// Debug bank register offsets (relative to the configured debug base).
pub mod debug {
    /// Write 1 to reset the bank before a new call.
    pub const RESET: u32 = 0x00;
    /// Command-type / section selector (low byte significant).
    pub const TYPE: u32 = 0x04;
    /// Command selector within the section (low byte significant).
    pub const ID: u32 = 0x08;
    /// Transfer direction: [`DIR_READ`] or [`DIR_WRITE`].
    pub const DIR: u32 = 0x0C;
    /// Input value for writes; holds the result after a completed read.
    pub const VALUE: u32 = 0x10;
    /// Write [`run::START`] to launch; read back for [`run`] status bits.
    pub const RUN: u32 = 0x14;
    /// 16-bit status code reported by the firmware (low half significant).
    pub const STATUS_CODE: u32 = 0x18;
    /// Byte length of a buffer transfer.
    pub const BUF_SIZE: u32 = 0x1C;
    /// Buffer data window; the firmware auto-increments behind this register.
    pub const BUF_DATA: u32 = 0x20;
    /// Write 1 to commit a staged buffer before RUN.
    pub const BUF_APPLY: u32 = 0x24;

    /// DIR value for a firmware read.
    pub const DIR_READ: u32 = 0;
    /// DIR value for a firmware write.
    pub const DIR_WRITE: u32 = 1;

    /// RUN register values and status bits.
    pub mod run {
        /// Written by the host to launch the staged call.
        pub const START: u32 = 1;
        /// Firmware is still processing.
        pub const BUSY: u32 = 1 << 1;
        /// Call completed; VALUE / STATUS_CODE are valid.
        pub const DONE: u32 = 1 << 2;
        /// Call failed; STATUS_CODE holds the firmware error.
        pub const ERROR: u32 = 1 << 3;
    }
}

// ── Ring-buffer channel ──────────────────────────────────────────────────────

/// Ring-buffer half header layout and channel handshake words.
pub mod channel {
    /// Channel state word (see the `state::*` constants).
    pub const STATE: u32 = 0x0;
    /// Producer index into the data region, modulo the region size.
    pub const WRITE_INDEX: u32 = 0x4;
    /// Consumer index into the data region, modulo the region size.
    pub const READ_INDEX: u32 = 0x8;
    /// First byte of the circular data region.
    pub const DATA: u32 = 0xC;
    /// Total header size preceding the data region.
    pub const HEADER_SIZE: u32 = 12;

    /// Channel state words, shared vocabulary for both halves.
    ///
    /// The host never writes the firmware-owned words and vice versa; each
    /// side polls the word to observe the peer's progress.
    pub mod state {
        /// Firmware (re)booted; all channel state is void.
        pub const FW_IS_RESET: u32 = 0;
        /// Host asked for the channel to be established.
        pub const CHANNEL_REQUESTED: u32 = 1;
        /// Firmware accepted the channel request.
        pub const CHANNEL_ACKNOWLEDGE: u32 = 2;
        /// Producer advanced its write index.
        pub const WRITE_REGISTER_UPDATED: u32 = 3;
        /// Consumer advanced its read index.
        pub const READ_REGISTER_UPDATED: u32 = 4;
    }
}

// ── API sub-channel ──────────────────────────────────────────────────────────
//
// A fixed-slot exchange for single-word calls. The host stages one command
// block, triggers it by writing the TX status byte, then polls the RX block
// for the matching reply.

/// API sub-channel register offsets (relative to the configured API base).
pub mod api {
    /// TX status byte; [`state::RESET`] means the slot is free.
    pub const TX_STATUS: u32 = 0x00;
    /// TX command block ([`super::super::frame::ApiCommand`], 12 bytes).
    pub const TX_COMMAND: u32 = 0x04;
    /// RX status byte; mirrors the command kind once a reply is staged.
    pub const RX_STATUS: u32 = 0x10;
    /// Correlation id of the staged reply.
    pub const RX_ID: u32 = 0x14;
    /// Result value of the staged reply.
    pub const RX_VALUE: u32 = 0x18;
    /// 16-bit firmware status code of the staged reply.
    pub const RX_STATUS_CODE: u32 = 0x1C;

    /// API slot state bytes.
    pub mod state {
        /// Slot is idle / consumed.
        pub const RESET: u8 = 0;
        /// A read command (TX) or read reply (RX) is staged.
        pub const READ: u8 = 1;
        /// A write command (TX) or write reply (RX) is staged.
        pub const WRITE: u8 = 2;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_bank_offsets_non_overlapping() {
        let offsets = [
            debug::RESET,
            debug::TYPE,
            debug::ID,
            debug::DIR,
            debug::VALUE,
            debug::RUN,
            debug::STATUS_CODE,
            debug::BUF_SIZE,
            debug::BUF_DATA,
            debug::BUF_APPLY,
        ];
        for (i, a) in offsets.iter().enumerate() {
            for b in &offsets[i + 1..] {
                assert_ne!(a, b, "overlapping debug registers");
            }
        }
    }

    #[test]
    fn channel_header_is_twelve_bytes() {
        assert_eq!(channel::HEADER_SIZE, 12);
        assert_eq!(channel::DATA, channel::READ_INDEX + 4);
    }

    #[test]
    fn channel_states_distinct() {
        use channel::state as s;
        let words = [
            s::FW_IS_RESET,
            s::CHANNEL_REQUESTED,
            s::CHANNEL_ACKNOWLEDGE,
            s::WRITE_REGISTER_UPDATED,
            s::READ_REGISTER_UPDATED,
        ];
        for (i, a) in words.iter().enumerate() {
            for b in &words[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn api_blocks_do_not_overlap() {
        // TX command block is 12 bytes; RX block starts after it.
        assert!(api::TX_COMMAND + 12 <= api::RX_STATUS);
    }
}
