//! Hardware description of the Iris image signal processor.
//!
//! This crate carries no I/O and spawns no threads. It is the single source
//! of truth for:
//!
//! - the debug-register bank layout used to emulate firmware API calls over
//!   primitive register reads/writes ([`regs::debug`]),
//! - the shared ring-buffer header layout and channel handshake words
//!   ([`regs::channel`]),
//! - the fixed-slot API sub-channel register block ([`regs::api`]),
//! - the transaction frame codec used on the streaming channel ([`frame`]).
//!
//! Everything that performs actual transfers lives in `iris-access`.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod frame;
pub mod regs;

pub use frame::{ApiCommand, Frame, FrameError, FRAME_HEADER_SIZE, LEN_PREFIX_SIZE};
