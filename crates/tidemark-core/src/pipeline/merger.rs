use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use std::io::Write;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};

use crate::buffer::PooledBuffer;
use crate::error::{Result, TidemarkError};
use crate::store::BlockStore;
use crate::types::{Generation, Timestamp};

use super::cancel::CancelToken;
use super::types::{MergerIn, RecordSlot, RunCounters};

/// A formatted block active in the merge workspace, consumed through a
/// cursor over its slots.
struct ActiveBlock {
    generation: Generation,
    buffer: PooledBuffer,
    slots: Vec<RecordSlot>,
    cursor: usize,
}

impl ActiveBlock {
    fn head_key(&self) -> (Timestamp, Generation) {
        (self.slots[self.cursor].key, self.generation)
    }
}

impl PartialEq for ActiveBlock {
    fn eq(&self, other: &Self) -> bool {
        self.head_key() == other.head_key()
    }
}

impl Eq for ActiveBlock {}

impl PartialOrd for ActiveBlock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ActiveBlock {
    // BinaryHeap is a max-heap; the order is reversed so the smallest
    // (timestamp, generation) key surfaces first.
    fn cmp(&self, other: &Self) -> Ordering {
        other.head_key().cmp(&self.head_key())
    }
}

enum Arrival {
    Item(MergerIn),
    Closed,
    Cancelled,
}

fn next_arrival(rx: &Receiver<MergerIn>, token: &CancelToken) -> Arrival {
    loop {
        if token.is_cancelled() {
            return Arrival::Cancelled;
        }
        match rx.recv_timeout(Duration::from_millis(50)) {
            Ok(item) => return Arrival::Item(item),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return Arrival::Closed,
        }
    }
}

/// Merger state: the workspace heap, the watermark, and the reorder map
/// that reassembles the pusher's release order from out-of-order formatter
/// completions.
struct Merger<'a> {
    workspace: BinaryHeap<ActiveBlock>,
    pending: BTreeMap<u64, MergerIn>,
    next_seq: u64,
    watermark: Timestamp,
    store: Option<&'a BlockStore>,
    counters: &'a RunCounters,
}

impl<'a> Merger<'a> {
    /// Folds one block into the workspace, in release order. Floors are
    /// the pusher's ordering contract; a decrease is fatal.
    fn admit(&mut self, item: MergerIn) -> Result<()> {
        let (seq, floor) = match &item {
            MergerIn::Block(block) => (block.seq, block.floor),
            MergerIn::Skip { seq, floor } => (*seq, *floor),
        };
        if floor < self.watermark {
            return Err(TidemarkError::ContractViolation(format!(
                "release {seq} carries floor {floor} below watermark {}",
                self.watermark
            )));
        }
        self.watermark = self.watermark.max(floor);
        if let Some(store) = self.store {
            store.advance_watermark(self.watermark);
        }
        if let MergerIn::Block(block) = item {
            self.workspace.push(ActiveBlock {
                generation: block.generation,
                buffer: block.buffer,
                slots: block.slots,
                cursor: 0,
            });
        }
        Ok(())
    }

    /// Inserts an arrival and admits the contiguous release prefix.
    fn arrive(&mut self, item: MergerIn) -> Result<()> {
        self.pending.insert(item.seq(), item);
        while let Some(item) = self.pending.remove(&self.next_seq) {
            self.next_seq += 1;
            self.admit(item)?;
        }
        Ok(())
    }

    /// Emits workspace heads while the admission test holds: the head
    /// record's timestamp is at or below the watermark, so no block still
    /// upstream can carry a smaller one.
    fn emit_admissible(&mut self, sink: &mut dyn Write) -> Result<()> {
        while let Some(top) = self.workspace.peek() {
            if top.head_key().0 > self.watermark {
                break;
            }
            self.emit_head(sink)?;
        }
        Ok(())
    }

    fn emit_head(&mut self, sink: &mut dyn Write) -> Result<()> {
        let mut block = self.workspace.pop().expect("workspace head");
        let slot = block.slots[block.cursor];
        sink.write_all(&block.buffer[slot.span.start..slot.span.end])?;
        block.cursor += 1;
        RunCounters::bump(&self.counters.records_emitted);
        RunCounters::add(&self.counters.bytes_emitted, slot.span.len() as u64);
        if block.cursor < block.slots.len() {
            self.workspace.push(block);
        }
        Ok(())
    }
}

/// Merger stage: k-way merge of formatted blocks into the sink.
///
/// `watermark` is the greatest floor observed over released blocks,
/// processed in release order. The pusher guarantees floors are
/// non-decreasing and every record sits at or above its block's floor, so
/// a head record with timestamp at or below the watermark can never be
/// superseded and is safe to emit. Once upstream has drained, the
/// admission test becomes unconditional.
pub(crate) fn run_merger(
    rx: Receiver<MergerIn>,
    sink: &mut dyn Write,
    store: Option<&BlockStore>,
    counters: &RunCounters,
    token: &CancelToken,
) -> Result<()> {
    let mut merger = Merger {
        workspace: BinaryHeap::new(),
        pending: BTreeMap::new(),
        next_seq: 0,
        watermark: i64::MIN,
        store,
        counters,
    };

    loop {
        merger.emit_admissible(sink)?;
        match next_arrival(&rx, token) {
            Arrival::Item(item) => merger.arrive(item)?,
            Arrival::Closed => {
                // Sequence holes at this point mean an upstream failure;
                // admit whatever arrived, still in release order.
                let leftovers = std::mem::take(&mut merger.pending);
                for (_, item) in leftovers {
                    merger.admit(item)?;
                }
                while !merger.workspace.is_empty() {
                    merger.emit_head(sink)?;
                }
                break;
            }
            Arrival::Cancelled => {
                sink.flush()?;
                return Err(TidemarkError::Cancelled);
            }
        }
    }

    sink.flush()?;
    Ok(())
}
