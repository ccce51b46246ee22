//! End-to-end exercises of the streaming channel against an emulated
//! firmware peer.
//!
//! The peer runs as its own thread over the same byte array the in-memory
//! transport serves, playing the firmware side of the protocol: it
//! acknowledges channel requests, drains the TX half, replies to buffer
//! reads through the RX half and answers the fixed-slot API exchange.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use iris_chip::frame::{kind, ApiCommand, Frame, API_COMMAND_SIZE};
use iris_chip::regs::{api, channel};

use iris_access::{
    AccessConfig, AccessManager, FwMode, FwRequest, HwMode, MemTransport, RegRequest, RequestState,
};

const BUFFER_BASE: u32 = 0x1000;
const REGION: u32 = 1024;
const HALF: u32 = REGION + channel::HEADER_SIZE;
const API_BASE: u32 = 0x40;
const MEM_SIZE: usize = 0x4000;

const TX_BASE: u32 = BUFFER_BASE;
const RX_BASE: u32 = BUFFER_BASE + HALF;

fn rd32(mem: &[u8], addr: u32) -> u32 {
    let at = addr as usize;
    u32::from_le_bytes([mem[at], mem[at + 1], mem[at + 2], mem[at + 3]])
}

fn wr32(mem: &mut [u8], addr: u32, value: u32) {
    let at = addr as usize;
    mem[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Deterministic payload the peer serves for buffer reads.
fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

/// The firmware side of the shared buffer, driven by its own thread.
struct Peer {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
    /// Payloads of buffer writes the peer has fully reassembled.
    received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl Peer {
    fn spawn(mem: Arc<Mutex<Vec<u8>>>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let received = Arc::new(Mutex::new(Vec::new()));
        let thread_stop = Arc::clone(&stop);
        let thread_received = Arc::clone(&received);
        let handle = thread::spawn(move || {
            let mut acc: Vec<u8> = Vec::new();
            let mut expecting: Option<usize> = None;
            let mut outgoing: VecDeque<u8> = VecDeque::new();
            while !thread_stop.load(Ordering::SeqCst) {
                {
                    let mut mem = mem.lock().unwrap();
                    drain_tx(&mut mem, &mut acc);
                    parse_frames(&mut acc, &mut expecting, &mut outgoing, &thread_received);
                    feed_rx(&mut mem, &mut outgoing);
                    answer_api(&mut mem);
                }
                thread::sleep(Duration::from_micros(200));
            }
        });
        Self {
            stop,
            handle: Some(handle),
            received,
        }
    }

    fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Acknowledge the TX half and consume everything the host has written.
fn drain_tx(mem: &mut [u8], acc: &mut Vec<u8>) {
    let state = rd32(mem, TX_BASE + channel::STATE);
    if state == channel::state::FW_IS_RESET {
        return;
    }
    if state == channel::state::CHANNEL_REQUESTED {
        wr32(mem, TX_BASE + channel::READ_INDEX, 0);
        wr32(mem, TX_BASE + channel::STATE, channel::state::CHANNEL_ACKNOWLEDGE);
        return;
    }
    let write_index = rd32(mem, TX_BASE + channel::WRITE_INDEX);
    let mut read_index = rd32(mem, TX_BASE + channel::READ_INDEX);
    let used = (write_index + REGION - read_index) % REGION;
    if used == 0 {
        return;
    }
    for _ in 0..used {
        acc.push(mem[(TX_BASE + channel::DATA + read_index) as usize]);
        read_index = (read_index + 1) % REGION;
    }
    wr32(mem, TX_BASE + channel::READ_INDEX, read_index);
    wr32(mem, TX_BASE + channel::STATE, channel::state::READ_REGISTER_UPDATED);
}

/// Split the accumulated byte stream into frames and handle each one.
fn parse_frames(
    acc: &mut Vec<u8>,
    expecting: &mut Option<usize>,
    outgoing: &mut VecDeque<u8>,
    received: &Mutex<Vec<Vec<u8>>>,
) {
    loop {
        if expecting.is_none() && acc.len() >= 4 {
            let len = u32::from_le_bytes([acc[0], acc[1], acc[2], acc[3]]) as usize;
            acc.drain(..4);
            *expecting = Some(len);
        }
        match *expecting {
            Some(len) if acc.len() >= len => {
                let body: Vec<u8> = acc.drain(..len).collect();
                *expecting = None;
                let frame = Frame::decode(&body).expect("host sent an undecodable frame");
                match frame.kind {
                    kind::BUFFER_WRITE => received.lock().unwrap().push(frame.payload),
                    kind::BUFFER_READ => {
                        let reply = Frame {
                            id: frame.id,
                            section: frame.section,
                            command: frame.command,
                            kind: kind::BUFFER_READ,
                            value: frame.value,
                            status: 0x00A5,
                            payload: pattern(frame.value as usize),
                        };
                        outgoing.extend(reply.encode());
                    }
                    other => panic!("unexpected frame kind {other} on the ring"),
                }
            }
            _ => break,
        }
    }
}

/// Acknowledge the RX half and stage queued reply bytes into it.
fn feed_rx(mem: &mut [u8], outgoing: &mut VecDeque<u8>) {
    let state = rd32(mem, RX_BASE + channel::STATE);
    if state == channel::state::FW_IS_RESET {
        return;
    }
    if state == channel::state::CHANNEL_REQUESTED {
        wr32(mem, RX_BASE + channel::WRITE_INDEX, 0);
        wr32(mem, RX_BASE + channel::STATE, channel::state::CHANNEL_ACKNOWLEDGE);
        return;
    }
    if outgoing.is_empty() {
        return;
    }
    let mut write_index = rd32(mem, RX_BASE + channel::WRITE_INDEX);
    let read_index = rd32(mem, RX_BASE + channel::READ_INDEX);
    let free = (read_index + REGION - write_index - 1) % REGION;
    let take = (free as usize).min(outgoing.len());
    if take == 0 {
        return;
    }
    for _ in 0..take {
        if let Some(byte) = outgoing.pop_front() {
            mem[(RX_BASE + channel::DATA + write_index) as usize] = byte;
            write_index = (write_index + 1) % REGION;
        }
    }
    wr32(mem, RX_BASE + channel::WRITE_INDEX, write_index);
    wr32(mem, RX_BASE + channel::STATE, channel::state::WRITE_REGISTER_UPDATED);
}

/// Answer a staged command on the fixed-slot API sub-channel.
fn answer_api(mem: &mut [u8]) {
    let tx_status = mem[(API_BASE + api::TX_STATUS) as usize];
    if tx_status != api::state::READ && tx_status != api::state::WRITE {
        return;
    }
    if mem[(API_BASE + api::RX_STATUS) as usize] != api::state::RESET {
        // Previous reply not consumed yet.
        return;
    }
    let at = (API_BASE + api::TX_COMMAND) as usize;
    let cmd = ApiCommand::decode(&mem[at..at + API_COMMAND_SIZE]).expect("short command block");
    wr32(mem, API_BASE + api::RX_ID, cmd.id);
    let value = if cmd.write {
        0
    } else {
        0x9000 + u32::from(cmd.section) * 0x100 + u32::from(cmd.command)
    };
    wr32(mem, API_BASE + api::RX_VALUE, value);
    wr32(mem, API_BASE + api::RX_STATUS_CODE, 0x005A);
    mem[(API_BASE + api::RX_STATUS) as usize] = tx_status;
    mem[(API_BASE + api::TX_STATUS) as usize] = api::state::RESET;
}

struct Harness {
    manager: AccessManager,
    peer: Peer,
    /// Host writes of `WRITE_REGISTER_UPDATED` into the TX state word.
    chunks: Arc<AtomicU32>,
    /// Host writes of `CHANNEL_REQUESTED` into the TX state word.
    resets: Arc<AtomicU32>,
}

fn harness() -> Harness {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let transport = MemTransport::new(MEM_SIZE);
    let mem = transport.memory();

    let chunks = Arc::new(AtomicU32::new(0));
    let resets = Arc::new(AtomicU32::new(0));
    let chunk_counter = Arc::clone(&chunks);
    let reset_counter = Arc::clone(&resets);
    transport.set_write_hook(move |addr, mem| {
        if addr == TX_BASE + channel::STATE {
            match rd32(mem, addr) {
                channel::state::WRITE_REGISTER_UPDATED => {
                    chunk_counter.fetch_add(1, Ordering::SeqCst);
                }
                channel::state::CHANNEL_REQUESTED => {
                    reset_counter.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
        }
    });

    let peer = Peer::spawn(mem);
    let mut manager = AccessManager::new(
        Box::new(transport),
        AccessConfig {
            hw_mode: HwMode::Direct,
            fw_mode: FwMode::Stream,
            buffer_base: BUFFER_BASE,
            buffer_size: 2 * HALF,
            api_base: API_BASE,
            poll_interval: Duration::from_millis(1),
            ..AccessConfig::default()
        },
    )
    .unwrap();
    manager.open().unwrap();
    Harness {
        manager,
        peer,
        chunks,
        resets,
    }
}

#[test]
fn buffer_write_crosses_ring_in_five_chunks() {
    let hx = harness();
    let payload = pattern(5_000);
    let req = FwRequest::buffer_write(3, 0x10, payload.clone()).with_timeout(10_000);
    let id = hx.manager.post_fw_request(req).unwrap();
    let done = hx.manager.get_fw_result(id, 10_000).unwrap();
    assert_eq!(done.state, RequestState::Success);

    // 5,024 framed bytes through a 1,024-byte region with one reserved
    // slot: four full 1,023-byte chunks plus the remainder.
    assert_eq!(hx.resets.load(Ordering::SeqCst), 1);
    assert_eq!(hx.chunks.load(Ordering::SeqCst), 5);

    let received = hx.peer.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0], payload);
}

#[test]
fn buffer_read_roundtrips_across_wraparound() {
    let hx = harness();
    for len in [1usize, 100, 1_023, 1_024, 3_000] {
        let req = FwRequest::buffer_read(2, 0x20, len).with_timeout(10_000);
        let id = hx.manager.post_fw_request(req).unwrap();
        let done = hx.manager.get_fw_result(id, 10_000).unwrap();
        assert_eq!(done.state, RequestState::Success, "len {len}");
        assert_eq!(done.buffer, pattern(len), "len {len}");
        assert_eq!(done.status, 0x00A5);
    }
}

#[test]
fn api_calls_roundtrip_through_fixed_slot() {
    let hx = harness();
    let id = hx
        .manager
        .post_fw_request(FwRequest::api_read(2, 0x31).with_timeout(5_000))
        .unwrap();
    let done = hx.manager.get_fw_result(id, 5_000).unwrap();
    assert_eq!(done.state, RequestState::Success);
    assert_eq!(done.value, 0x9000 + 0x200 + 0x31);
    assert_eq!(done.status, 0x005A);

    let id = hx
        .manager
        .post_fw_request(FwRequest::api_write(1, 0x08, 0xBEEF).with_timeout(5_000))
        .unwrap();
    let done = hx.manager.get_fw_result(id, 5_000).unwrap();
    assert_eq!(done.state, RequestState::Success);
}

#[test]
fn expired_queued_request_does_not_block_successors() {
    let hx = harness();
    // Deadline already passed when the TX worker picks it up.
    let dead = FwRequest::buffer_write(0, 0, vec![0xEE; 64]).with_timeout(0);
    let dead_id = hx.manager.post_fw_request(dead).unwrap();

    let live = FwRequest::buffer_write(0, 0, vec![0x11; 64]).with_timeout(10_000);
    let live_id = hx.manager.post_fw_request(live).unwrap();

    let dead = hx.manager.get_fw_result(dead_id, 10_000).unwrap();
    assert_eq!(dead.state, RequestState::NoAnswer);
    let live = hx.manager.get_fw_result(live_id, 10_000).unwrap();
    assert_eq!(live.state, RequestState::Success);
}

#[test]
fn register_and_stream_traffic_interleave() {
    let hx = harness();
    let fw = FwRequest::buffer_read(1, 0x02, 2_500).with_timeout(10_000);
    let fw_id = hx.manager.post_fw_request(fw).unwrap();

    let reg_id = hx
        .manager
        .post_reg_request(RegRequest::write(0x3000, vec![0x77; 16]))
        .unwrap();
    let reg_done = hx.manager.get_reg_result(reg_id, 5_000).unwrap();
    assert_eq!(reg_done.state, RequestState::Success);

    let back_id = hx.manager.post_reg_request(RegRequest::read(0x3000, 16)).unwrap();
    let back = hx.manager.get_reg_result(back_id, 5_000).unwrap();
    assert_eq!(back.data, vec![0x77; 16]);

    let fw_done = hx.manager.get_fw_result(fw_id, 10_000).unwrap();
    assert_eq!(fw_done.state, RequestState::Success);
    assert_eq!(fw_done.buffer, pattern(2_500));
}
