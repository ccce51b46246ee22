//! Access-manager / transport protocol stack for the Iris image processor.
//!
//! The crate lets a host application issue register-level and firmware-API
//! requests to the remote chip across interchangeable physical transports,
//! with correlated, timeout-bounded responses:
//!
//! - [`packet`] / [`request`] — the request/response data model.
//! - [`store`] — the [`ResultStore`] turning asynchronous completions into
//!   blocking "await result by id" calls.
//! - [`dispatch`] — the [`Transport`] contract, the dispatcher in front of
//!   it, and the in-memory transport used for hardware-free testing.
//! - [`direct`] — register access with packet splitting and reassembly.
//! - [`debug`] — firmware calls emulated over the debug register bank.
//! - [`stream`] — the flow-controlled ring-buffer channel with its TX, RX
//!   and API worker threads.
//! - [`manager`] — the [`AccessManager`] facade selecting the strategies.
//!
//! ```no_run
//! use iris_access::{AccessConfig, AccessManager, MemTransport, RegRequest};
//!
//! # fn main() -> iris_access::Result<()> {
//! let mut manager = AccessManager::new(
//!     Box::new(MemTransport::new(0x4000)),
//!     AccessConfig::default(),
//! )?;
//! manager.open()?;
//! let id = manager.post_reg_request(RegRequest::write(0x2000, vec![0xA5; 4]))?;
//! let _done = manager.get_reg_result(id, 1_000)?;
//! manager.close()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]

pub mod debug;
pub mod direct;
pub mod dispatch;
pub mod error;
pub mod manager;
pub mod packet;
pub mod request;
pub mod store;
pub mod stream;

mod queue;

pub use debug::{DebugConfig, DebugRegisterAccess};
pub use direct::RegisterDirectAccess;
pub use dispatch::{Dispatcher, MemTransport, Transport};
pub use error::{AccessError, Result};
pub use manager::{AccessConfig, AccessManager, FwMode, HwMode};
pub use packet::{NotifyPolicy, Packet, PacketCommand, PacketState};
pub use request::{FwRequest, FwRequestKind, RegRequest, RegRequestKind, RequestState};
pub use store::ResultStore;
pub use stream::{StreamAccess, StreamConfig};
