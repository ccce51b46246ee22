//! Direct register access: oversized requests split across packets.
//!
//! Each submitted [`RegRequest`] becomes one `Transaction` owning
//! `ceil(len / max_packet_size)` packets. Packets complete independently on
//! the transport's thread; when the last one lands the transaction resolves
//! the request — merging read data back in original chunk order — and pushes
//! it into the register [`ResultStore`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::packet::{Packet, PacketState};
use crate::request::{RegRequest, RequestState};
use crate::store::ResultStore;

/// Default largest packet payload the register path produces.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 256;

struct Chunk {
    offset: usize,
    len: usize,
    data: Option<Vec<u8>>,
}

struct Transaction {
    req: RegRequest,
    chunks: Vec<Chunk>,
    remaining: usize,
    failed: bool,
    deadline: Instant,
}

impl Transaction {
    fn resolve(mut self, store: &ResultStore<RegRequest>) {
        if self.failed {
            self.req.state = RequestState::Fail;
        } else {
            if !self.req.kind.is_write() {
                for chunk in &self.chunks {
                    if let Some(data) = &chunk.data {
                        self.req.data[chunk.offset..chunk.offset + chunk.len]
                            .copy_from_slice(data);
                    }
                }
            }
            self.req.state = RequestState::Success;
        }
        store.push(self.req);
    }
}

/// Register access strategy built on plain read/write packets.
pub struct RegisterDirectAccess {
    dispatcher: Arc<Dispatcher>,
    store: Arc<ResultStore<RegRequest>>,
    max_packet_size: usize,
    transactions: Arc<Mutex<HashMap<u32, Transaction>>>,
}

impl std::fmt::Debug for RegisterDirectAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisterDirectAccess")
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}

impl RegisterDirectAccess {
    /// Create the strategy around a dispatcher and the register store.
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        store: Arc<ResultStore<RegRequest>>,
        max_packet_size: usize,
    ) -> Self {
        Self {
            dispatcher,
            store,
            max_packet_size: max_packet_size.max(1),
            transactions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Submit a register request; the result arrives in the register store
    /// under the returned id.
    ///
    /// # Errors
    ///
    /// Fails fast with [`AccessError::InvalidParameters`] for malformed
    /// requests (the transport is never touched) and propagates dispatcher
    /// rejection.
    ///
    /// [`AccessError::InvalidParameters`]: crate::error::AccessError
    pub fn post_reg_request(&self, req: RegRequest) -> Result<u32> {
        req.validate()?;
        self.sweep_expired();

        let id = req.id;
        let deadline = Instant::now() + Duration::from_millis(req.timeout_ms);
        let total = req.data.len();
        let chunk_count = total.div_ceil(self.max_packet_size);

        let mut chunks = Vec::with_capacity(chunk_count);
        let mut packets = Vec::with_capacity(chunk_count);
        for index in 0..chunk_count {
            let offset = index * self.max_packet_size;
            let len = self.max_packet_size.min(total - offset);
            #[allow(clippy::cast_possible_truncation)]
            let address = req.address + offset as u32;

            let packet = if req.kind.is_write() {
                let slice = req.data[offset..offset + len].to_vec();
                match &req.mask {
                    // Proportional slice of the request mask.
                    Some(mask) => Packet::write_masked(
                        address,
                        slice,
                        mask[offset..offset + len].to_vec(),
                        id,
                    ),
                    None => Packet::write(address, slice, id),
                }
            } else {
                Packet::read(address, len, id)
            };
            packets.push(packet);
            chunks.push(Chunk {
                offset,
                len,
                data: None,
            });
        }

        tracing::debug!(
            "reg request {id}: {} bytes in {chunk_count} packet(s) at {:#x}",
            total,
            req.address
        );

        self.transactions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(
                id,
                Transaction {
                    req,
                    chunks,
                    remaining: chunk_count,
                    failed: false,
                    deadline,
                },
            );

        for (index, mut packet) in packets.into_iter().enumerate() {
            let transactions = Arc::clone(&self.transactions);
            let store = Arc::clone(&self.store);
            packet.add_listener(move |p| {
                Self::on_packet_done(&transactions, &store, id, index, p);
            });
            if let Err(err) = self.dispatcher.post(packet) {
                // Packets already posted may still complete; they will find
                // no transaction and be ignored.
                self.transactions
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner)
                    .remove(&id);
                return Err(err);
            }
        }
        Ok(id)
    }

    fn on_packet_done(
        transactions: &Mutex<HashMap<u32, Transaction>>,
        store: &ResultStore<RegRequest>,
        id: u32,
        index: usize,
        packet: &Packet,
    ) {
        let mut map = transactions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(txn) = map.get_mut(&id) else {
            tracing::debug!("completion for resolved transaction {id}, ignored");
            return;
        };
        match packet.state {
            PacketState::Success => txn.chunks[index].data = Some(packet.data.clone()),
            state => {
                tracing::warn!("reg request {id}: packet {index} completed as {state:?}");
                txn.failed = true;
            }
        }
        txn.remaining -= 1;
        if txn.remaining == 0 {
            if let Some(txn) = map.remove(&id) {
                drop(map);
                txn.resolve(store);
            }
        }
    }

    /// Fail transactions whose deadline passed without all completions.
    fn sweep_expired(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut map = self
                .transactions
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            let ids: Vec<u32> = map
                .iter()
                .filter(|(_, txn)| txn.deadline <= now)
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                if let Some(txn) = map.remove(&id) {
                    expired.push(txn);
                }
            }
        }
        for mut txn in expired {
            tracing::warn!("reg request {} expired before completion", txn.req.id);
            txn.req.state = RequestState::Timeout;
            self.store.push(txn.req);
        }
    }

    /// Number of transactions still awaiting packet completions.
    pub fn in_flight(&self) -> usize {
        self.transactions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}
