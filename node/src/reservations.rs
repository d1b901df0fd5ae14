//! The block-download reservation queue.
//!
//! A thread-safe, double-ended queue of `(hash, height)` entries awaiting
//! download. The front is the high-priority end: re-seeding from the
//! candidate top downward pushes each height to the front, so the lowest
//! pending height is handed out first; a reorganization appends its new
//! candidate headers to the back, so the tail always reflects the newest
//! candidate.
//!
//! [`Reservations::get`] is non-blocking: it returns `None` when the queue
//! is empty and sessions retry after an idle delay. All mutators and `get`
//! are serialized on one internal mutex, so any observer sees a total
//! order of pushes, pops, and gets.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bitnode_chain::{BlockChain, ChainError};
use bitnode_types::{Block, BlockHash};

struct Queue {
    /// Front = high priority. Entries are `(hash, height)`.
    entries: VecDeque<(BlockHash, u64)>,
    /// Entry count per height. Two entries may share a height transiently
    /// while a reorganization is being applied.
    heights: HashMap<u64, u32>,
    /// Height keyed by entry hash.
    hashes: HashMap<BlockHash, u64>,
}

impl Queue {
    fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            heights: HashMap::new(),
            hashes: HashMap::new(),
        }
    }

    fn insert_maps(&mut self, hash: BlockHash, height: u64) {
        *self.heights.entry(height).or_insert(0) += 1;
        self.hashes.insert(hash, height);
    }

    fn remove_maps(&mut self, hash: &BlockHash, height: u64) {
        if let Some(count) = self.heights.get_mut(&height) {
            *count -= 1;
            if *count == 0 {
                self.heights.remove(&height);
            }
        }
        self.hashes.remove(hash);
    }
}

struct Shared {
    chain: Arc<BlockChain>,
    queue: Mutex<Queue>,
    /// Latest observed download rate (bytes/sec) per outstanding slot.
    rates: Mutex<HashMap<u64, f64>>,
    next_slot: AtomicU64,
    maximum_deviation: f64,
    block_latency: Duration,
}

impl Shared {
    fn record_rate(&self, slot: u64, rate: f64) {
        self.rates
            .lock()
            .expect("reservation rates lock")
            .insert(slot, rate);
    }

    fn clear_rate(&self, slot: u64) {
        self.rates
            .lock()
            .expect("reservation rates lock")
            .remove(&slot);
    }

    fn push_front(&self, hash: BlockHash, height: u64) {
        let mut queue = self.queue.lock().expect("reservation queue lock");
        if queue.hashes.contains_key(&hash) {
            return;
        }
        queue.entries.push_front((hash, height));
        queue.insert_maps(hash, height);
    }

    /// Whether `slot` lags its cohort: its rate is below the mean rate of
    /// the other outstanding slots divided by the deviation allowance.
    fn is_lagging(&self, slot: u64) -> bool {
        let rates = self.rates.lock().expect("reservation rates lock");
        let own = match rates.get(&slot) {
            Some(rate) => *rate,
            None => return false,
        };
        let others: Vec<f64> = rates
            .iter()
            .filter(|(id, _)| **id != slot)
            .map(|(_, rate)| *rate)
            .collect();
        if others.is_empty() {
            return false;
        }
        let mean = others.iter().sum::<f64>() / others.len() as f64;
        own < mean / self.maximum_deviation
    }
}

/// Issues download slots to sessions and keeps the pending set coherent
/// across reorganizations. Cheap to clone; clones share one queue.
#[derive(Clone)]
pub struct Reservations {
    shared: Arc<Shared>,
}

impl Reservations {
    /// `minimum_connections` sizes the expected cohort of concurrent
    /// downloads; `maximum_deviation` and `block_latency` drive the slow
    /// peer policy.
    pub fn new(
        chain: Arc<BlockChain>,
        minimum_connections: u32,
        maximum_deviation: f64,
        block_latency: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                chain,
                queue: Mutex::new(Queue::new()),
                rates: Mutex::new(HashMap::with_capacity(minimum_connections as usize)),
                next_slot: AtomicU64::new(0),
                maximum_deviation,
                block_latency,
            }),
        }
    }

    /// Insert at the high-priority end. An entry whose hash is already
    /// queued is ignored; no two entries ever share both hash and height.
    pub fn push_front(&self, hash: BlockHash, height: u64) {
        self.shared.push_front(hash, height);
    }

    /// Insert at the low-priority end.
    pub fn push_back(&self, hash: BlockHash, height: u64) {
        let mut queue = self.shared.queue.lock().expect("reservation queue lock");
        if queue.hashes.contains_key(&hash) {
            return;
        }
        queue.entries.push_back((hash, height));
        queue.insert_maps(hash, height);
    }

    /// Remove the tail entry iff it matches both `hash` and `height`.
    /// Returns whether an entry was removed.
    pub fn pop_back(&self, hash: BlockHash, height: u64) -> bool {
        let mut queue = self.shared.queue.lock().expect("reservation queue lock");
        match queue.entries.back() {
            Some(back) if *back == (hash, height) => {
                queue.entries.pop_back();
                queue.remove_maps(&hash, height);
                true
            }
            _ => false,
        }
    }

    /// Atomically pop the front entry and wrap it in a download slot.
    ///
    /// Non-blocking: returns `None` when the queue is empty. Sessions
    /// retry after an idle delay.
    pub fn get(&self) -> Option<Reservation> {
        let (hash, height) = {
            let mut queue = self.shared.queue.lock().expect("reservation queue lock");
            let entry = queue.entries.pop_front()?;
            queue.remove_maps(&entry.0, entry.1);
            entry
        };
        let slot = self.shared.next_slot.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        Some(Reservation {
            hash,
            height,
            slot,
            started: now,
            deadline: now + self.shared.block_latency,
            bytes: 0,
            shared: Arc::clone(&self.shared),
            retired: false,
        })
    }

    pub fn size(&self) -> usize {
        self.shared
            .queue
            .lock()
            .expect("reservation queue lock")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Whether any queued entry sits at `height`.
    pub fn contains_height(&self, height: u64) -> bool {
        self.shared
            .queue
            .lock()
            .expect("reservation queue lock")
            .heights
            .contains_key(&height)
    }

    /// The queued `(hash, height)` tail entry, if any.
    pub fn back(&self) -> Option<(BlockHash, u64)> {
        self.shared
            .queue
            .lock()
            .expect("reservation queue lock")
            .entries
            .back()
            .copied()
    }

    #[cfg(test)]
    fn outstanding_rates(&self) -> usize {
        self.shared
            .rates
            .lock()
            .expect("reservation rates lock")
            .len()
    }
}

/// An assignment of one `(hash, height)` download to one session.
///
/// Completion goes through [`Reservation::done`]; a slot that expires or
/// lags its cohort is returned to the front of the queue with
/// [`Reservation::release`]. A slot dropped without either (e.g. at
/// shutdown) is abandoned: its target is not requeued.
pub struct Reservation {
    hash: BlockHash,
    height: u64,
    slot: u64,
    started: Instant,
    deadline: Instant,
    bytes: u64,
    shared: Arc<Shared>,
    retired: bool,
}

impl Reservation {
    pub fn hash(&self) -> BlockHash {
        self.hash
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    /// Account downloaded bytes toward this slot's rate.
    pub fn record(&mut self, bytes: usize) {
        self.bytes += bytes as u64;
        let elapsed = self.started.elapsed().as_secs_f64().max(1e-3);
        self.shared
            .record_rate(self.slot, self.bytes as f64 / elapsed);
    }

    /// Past the per-block deadline.
    pub fn expired(&self) -> bool {
        Instant::now() > self.deadline
    }

    /// Measured rate fell below `cohort mean / maximum_deviation`.
    pub fn lagging(&self) -> bool {
        self.shared.is_lagging(self.slot)
    }

    /// Forward the downloaded block to the chain and retire the slot.
    pub fn done(mut self, block: Block) -> Result<(), ChainError> {
        self.retired = true;
        self.shared.clear_rate(self.slot);
        self.shared.chain.store_block(block)
    }

    /// Return the target to the front of the queue so another session may
    /// claim it, and retire the slot.
    pub fn release(mut self) {
        self.retired = true;
        self.shared.clear_rate(self.slot);
        self.shared.push_front(self.hash, self.height);
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.retired {
            self.shared.clear_rate(self.slot);
        }
    }
}
