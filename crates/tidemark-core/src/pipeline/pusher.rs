use std::collections::BTreeMap;
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use crate::error::{Result, TidemarkError};
use crate::filter::Filter;
use crate::store::BlockStore;
use crate::types::{Generation, Timestamp};

use super::cancel::CancelToken;
use super::types::{ParsedBlock, ParsedPayload, ParserOut, ReleasedBlock, RunCounters};

enum Pending {
    Block(ParsedBlock),
    Skip,
}

/// Serialization point between the parser pool and the formatter pool.
///
/// Releases blocks exactly once, in non-decreasing floor order with ties
/// broken by ascending generation. In a scheduled run the reader already
/// emitted blocks in schedule-key order, so reassembling the generation
/// sequence is sufficient; otherwise parsed block metadata is buffered
/// until the reader closes and no earlier-timestamp block can ever arrive.
pub(crate) fn run_pusher(
    rx: Receiver<ParserOut>,
    tx: Sender<ReleasedBlock>,
    scheduled: bool,
    filter: Filter,
    store: Option<Arc<BlockStore>>,
    counters: Arc<RunCounters>,
    token: CancelToken,
) -> Result<()> {
    if scheduled {
        run_scheduled(rx, tx, filter, store, counters, token)
    } else {
        run_buffered(rx, tx, filter, store, counters, token)
    }
}

fn run_scheduled(
    rx: Receiver<ParserOut>,
    tx: Sender<ReleasedBlock>,
    filter: Filter,
    store: Option<Arc<BlockStore>>,
    counters: Arc<RunCounters>,
    token: CancelToken,
) -> Result<()> {
    let mut pending = BTreeMap::<Generation, Pending>::new();
    let mut next: Generation = 0;
    let mut seq: u64 = 0;

    for out in rx.iter() {
        if token.is_cancelled() {
            break;
        }
        match out {
            ParserOut::Block(block) => {
                pending.insert(block.generation, Pending::Block(block));
            }
            ParserOut::Skip(generation) => {
                pending.insert(generation, Pending::Skip);
            }
        }
        while let Some(entry) = pending.remove(&next) {
            next += 1;
            if let Pending::Block(block) = entry {
                let floor = block.floor.ok_or_else(|| {
                    TidemarkError::ContractViolation(format!(
                        "scheduled block {} released without a floor",
                        block.generation
                    ))
                })?;
                if !release(block, floor, &mut seq, &tx, &filter, &store, &counters) {
                    return Ok(());
                }
            }
        }
    }

    // Leftovers exist only after an upstream failure or cancellation;
    // their archived payloads still need their references dropped.
    for (_, entry) in std::mem::take(&mut pending) {
        if let Pending::Block(block) = entry {
            discard(block, &store);
        }
    }
    Ok(())
}

fn run_buffered(
    rx: Receiver<ParserOut>,
    tx: Sender<ReleasedBlock>,
    filter: Filter,
    store: Option<Arc<BlockStore>>,
    counters: Arc<RunCounters>,
    token: CancelToken,
) -> Result<()> {
    let mut blocks = Vec::new();
    for out in rx.iter() {
        if token.is_cancelled() {
            break;
        }
        if let ParserOut::Block(block) = out {
            blocks.push(block);
        }
    }
    if token.is_cancelled() {
        for block in blocks {
            discard(block, &store);
        }
        return Ok(());
    }

    blocks.sort_by_key(|block| (block.index.ts_min(), block.generation));
    let mut floor = i64::MIN;
    let mut seq: u64 = 0;
    for block in blocks {
        floor = floor.max(block.index.ts_min());
        if !release(block, floor, &mut seq, &tx, &filter, &store, &counters) {
            return Ok(());
        }
    }
    Ok(())
}

/// Applies the block-level filter and forwards the block. Returns false
/// when the downstream queue is gone. Only forwarded blocks consume a
/// release sequence number.
fn release(
    block: ParsedBlock,
    floor: Timestamp,
    seq: &mut u64,
    tx: &Sender<ReleasedBlock>,
    filter: &Filter,
    store: &Option<Arc<BlockStore>>,
    counters: &RunCounters,
) -> bool {
    if !filter.accept_index(&block.index) {
        discard(block, store);
        RunCounters::bump(&counters.blocks_skipped);
        return true;
    }
    let released = ReleasedBlock {
        seq: *seq,
        block,
        floor,
    };
    match tx.send(released) {
        Ok(()) => {
            *seq += 1;
            true
        }
        Err(err) => {
            discard(err.into_inner().block, store);
            false
        }
    }
}

fn discard(block: ParsedBlock, store: &Option<Arc<BlockStore>>) {
    if let ParsedPayload::Archived(handle) = block.payload {
        if let Some(store) = store {
            store.release(handle);
        }
    }
}
