// SPDX-License-Identifier: AGPL-3.0-only

//! Memory-backed transport for tests and hardware-free CI.
//!
//! Plays the same role the software backend plays in a driver stack: the
//! full protocol machinery runs against a plain byte array standing in for
//! the device's register space. Test harnesses attach hooks that run while
//! the memory lock is held, which is how a firmware peer (debug bank,
//! ring-buffer consumer, API responder) is emulated without a device.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::dispatch::Transport;
use crate::error::{AccessError, Result};
use crate::packet::{Packet, PacketCommand, PacketState};

/// Hook invoked with the accessed address and the full register space.
///
/// Write hooks run after the write has been applied; read hooks run before
/// the data is copied out, so a hook can stage fresh bytes for the read.
pub type MemHook = Box<dyn FnMut(u32, &mut Vec<u8>) + Send>;

/// Transport over an in-process byte array.
pub struct MemTransport {
    mem: Arc<Mutex<Vec<u8>>>,
    fail_addrs: Mutex<HashSet<u32>>,
    write_hook: Mutex<Option<MemHook>>,
    read_hook: Mutex<Option<MemHook>>,
    opened: AtomicBool,
}

impl std::fmt::Debug for MemTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemTransport")
            .field("size", &self.mem.lock().map(|m| m.len()).unwrap_or(0))
            .field("opened", &self.opened.load(Ordering::SeqCst))
            .finish()
    }
}

impl MemTransport {
    /// Create a transport backed by `size` bytes of zeroed register space.
    pub fn new(size: usize) -> Self {
        Self {
            mem: Arc::new(Mutex::new(vec![0; size])),
            fail_addrs: Mutex::new(HashSet::new()),
            write_hook: Mutex::new(None),
            read_hook: Mutex::new(None),
            opened: AtomicBool::new(false),
        }
    }

    /// Handle to the backing register space.
    pub fn memory(&self) -> Arc<Mutex<Vec<u8>>> {
        Arc::clone(&self.mem)
    }

    /// Fail every packet addressed at `addr` with [`PacketState::Fail`].
    pub fn fail_at(&self, addr: u32) {
        self.fail_addrs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(addr);
    }

    /// Install a hook observing completed writes.
    pub fn set_write_hook(&self, hook: impl FnMut(u32, &mut Vec<u8>) + Send + 'static) {
        *self
            .write_hook
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Box::new(hook));
    }

    /// Install a hook running ahead of every read.
    pub fn set_read_hook(&self, hook: impl FnMut(u32, &mut Vec<u8>) + Send + 'static) {
        *self
            .read_hook
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Box::new(hook));
    }

    fn should_fail(&self, addr: u32) -> bool {
        self.fail_addrs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&addr)
    }

    fn complete_read(&self, mut packet: Packet) {
        let mut mem = self.mem.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(hook) = self
            .read_hook
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_mut()
        {
            hook(packet.address, &mut mem);
        }
        let start = packet.address as usize;
        let end = start + packet.data.len();
        if end > mem.len() {
            drop(mem);
            packet.complete(PacketState::Invalid);
            return;
        }
        packet.data.copy_from_slice(&mem[start..end]);
        drop(mem);
        packet.complete(PacketState::Success);
    }

    fn complete_write(&self, packet: Packet) {
        let mut mem = self.mem.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let start = packet.address as usize;
        let end = start + packet.data.len();
        if end > mem.len() {
            drop(mem);
            packet.complete(PacketState::Invalid);
            return;
        }
        match &packet.mask {
            None => mem[start..end].copy_from_slice(&packet.data),
            Some(mask) => {
                for (i, (byte, m)) in packet.data.iter().zip(mask.iter()).enumerate() {
                    mem[start + i] = (mem[start + i] & !m) | (byte & m);
                }
            }
        }
        if let Some(hook) = self
            .write_hook
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_mut()
        {
            hook(packet.address, &mut mem);
        }
        drop(mem);
        packet.complete(PacketState::Success);
    }
}

impl Transport for MemTransport {
    fn name(&self) -> &'static str {
        "mem"
    }

    fn open(&self) -> Result<()> {
        if self.opened.swap(true, Ordering::SeqCst) {
            return Err(AccessError::fatal("mem transport already open"));
        }
        tracing::debug!("mem transport open");
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if !self.opened.swap(false, Ordering::SeqCst) {
            return Err(AccessError::fatal("mem transport already closed"));
        }
        tracing::debug!("mem transport closed");
        Ok(())
    }

    fn post(&self, packet: Packet) -> Result<()> {
        if self.should_fail(packet.address) {
            packet.complete(PacketState::Fail);
            return Ok(());
        }
        match packet.command {
            PacketCommand::Read => self.complete_read(packet),
            PacketCommand::Write => self.complete_write(packet),
            // Framed streams are consumed whole; a real message-oriented
            // transport would ship them to its peer here.
            PacketCommand::Transaction => packet.complete(PacketState::Success),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_write_touches_only_masked_bits() {
        let transport = MemTransport::new(16);
        {
            let mem = transport.memory();
            mem.lock().unwrap()[0] = 0b1010_1010;
        }
        let packet = Packet::write_masked(0, vec![0b0101_0101], vec![0b0000_1111], 1);
        transport.post(packet).unwrap();
        assert_eq!(transport.memory().lock().unwrap()[0], 0b1010_0101);
    }

    #[test]
    fn out_of_bounds_read_is_invalid() {
        let transport = MemTransport::new(8);
        let mut packet = Packet::read(6, 4, 1);
        let seen = std::sync::Arc::new(Mutex::new(None));
        let sink = std::sync::Arc::clone(&seen);
        packet.add_listener(move |p| {
            *sink.lock().unwrap() = Some(p.state);
        });
        transport.post(packet).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(PacketState::Invalid));
    }

    #[test]
    fn transaction_packets_are_consumed() {
        let transport = MemTransport::new(16);
        let mut packet = Packet::transaction(vec![1, 2, 3, 4], 5);
        let seen = std::sync::Arc::new(Mutex::new(None));
        let sink = std::sync::Arc::clone(&seen);
        packet.add_listener(move |p| {
            *sink.lock().unwrap() = Some(p.state);
        });
        transport.post(packet).unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(PacketState::Success));
    }

    #[test]
    fn write_hook_sees_applied_bytes() {
        let transport = MemTransport::new(16);
        let observed = std::sync::Arc::new(Mutex::new(0u8));
        let sink = std::sync::Arc::clone(&observed);
        transport.set_write_hook(move |addr, mem| {
            if addr == 4 {
                *sink.lock().unwrap() = mem[4];
            }
        });
        transport.post(Packet::write(4, vec![0xAB], 1)).unwrap();
        assert_eq!(*observed.lock().unwrap(), 0xAB);
    }
}
