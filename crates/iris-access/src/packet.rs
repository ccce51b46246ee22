//! Transport-level packet: the atomic unit exchanged with a driver.
//!
//! A `Packet` is handed to the [`Dispatcher`](crate::dispatch::Dispatcher)
//! by an access strategy and travels to the active transport, which performs
//! the physical I/O and then calls [`Packet::complete`] exactly once. The
//! completion drains the registered listeners, so each listener fires at
//! most once for a given packet.

use std::fmt;

/// Transport command carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketCommand {
    /// Read `data.len()` bytes at `address`.
    Read,
    /// Write `data` (honoring `mask`) at `address`.
    Write,
    /// Opaque framed byte stream; replies arrive with the same framing.
    Transaction,
}

/// When completion listeners should be invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyPolicy {
    /// Invoke on every completion.
    Always,
    /// Invoke only when the packet did not succeed.
    OnError,
    /// Invoke only for read packets.
    OnRead,
    /// Invoke only for write packets.
    OnWrite,
}

/// Completion state of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketState {
    /// Issued but not yet completed.
    Processing,
    /// The transport performed the exchange.
    Success,
    /// The transport reported a failure.
    Fail,
    /// The packet was rejected before touching the device.
    Invalid,
    /// The device explicitly returned no response.
    NoAnswer,
}

type Listener = Box<dyn FnOnce(&Packet) + Send>;

/// One transport-level read/write/transaction exchange.
pub struct Packet {
    /// Target address on the device.
    pub address: u32,
    /// Payload buffer (filled in place by read completions).
    pub data: Vec<u8>,
    /// Optional write mask; only masked bits are applied.
    pub mask: Option<Vec<u8>>,
    /// Transport command.
    pub command: PacketCommand,
    /// Listener notification policy.
    pub notify: NotifyPolicy,
    /// Completion state, final once `complete` ran.
    pub state: PacketState,
    /// Correlation id set by the issuing access strategy; opaque to the
    /// transport.
    pub reg_id: u32,
    listeners: Vec<Listener>,
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("address", &format_args!("{:#x}", self.address))
            .field("len", &self.data.len())
            .field("command", &self.command)
            .field("state", &self.state)
            .field("reg_id", &self.reg_id)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Packet {
    /// Build a read packet for `len` bytes at `address`.
    pub fn read(address: u32, len: usize, reg_id: u32) -> Self {
        Self::new(address, vec![0; len], None, PacketCommand::Read, reg_id)
    }

    /// Build a write packet.
    pub fn write(address: u32, data: Vec<u8>, reg_id: u32) -> Self {
        Self::new(address, data, None, PacketCommand::Write, reg_id)
    }

    /// Build a masked write packet.
    pub fn write_masked(address: u32, data: Vec<u8>, mask: Vec<u8>, reg_id: u32) -> Self {
        Self::new(address, data, Some(mask), PacketCommand::Write, reg_id)
    }

    /// Build a transaction packet carrying an already-framed byte stream.
    pub fn transaction(data: Vec<u8>, reg_id: u32) -> Self {
        Self::new(0, data, None, PacketCommand::Transaction, reg_id)
    }

    fn new(
        address: u32,
        data: Vec<u8>,
        mask: Option<Vec<u8>>,
        command: PacketCommand,
        reg_id: u32,
    ) -> Self {
        Self {
            address,
            data,
            mask,
            command,
            notify: NotifyPolicy::Always,
            state: PacketState::Processing,
            reg_id,
            listeners: Vec::new(),
        }
    }

    /// Override the notification policy.
    pub fn with_notify(mut self, notify: NotifyPolicy) -> Self {
        self.notify = notify;
        self
    }

    /// Register a completion listener.
    ///
    /// Listeners run on whichever thread the transport completes the packet
    /// from, after the final state and data are in place.
    pub fn add_listener(&mut self, listener: impl FnOnce(&Packet) + Send + 'static) {
        self.listeners.push(Box::new(listener));
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Finish the packet with `state` and fire the listeners.
    ///
    /// Consumes the packet; a transport must call this exactly once per
    /// packet it accepted, after any read data has been written into `data`.
    pub fn complete(mut self, state: PacketState) {
        self.state = state;
        let listeners = std::mem::take(&mut self.listeners);
        if !self.should_notify() {
            return;
        }
        for listener in listeners {
            listener(&self);
        }
    }

    fn should_notify(&self) -> bool {
        match self.notify {
            NotifyPolicy::Always => true,
            NotifyPolicy::OnError => self.state != PacketState::Success,
            NotifyPolicy::OnRead => self.command == PacketCommand::Read,
            NotifyPolicy::OnWrite => self.command == PacketCommand::Write,
        }
    }
}
