use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::warn;

use crate::compression::{self, Codec};
use crate::error::{Result, TidemarkError};
use crate::filter::Filter;
use crate::index::BlockIndex;
use crate::record::{Record, RecordParser, Span};
use crate::store::{BlockStore, CompressedPayload};
use crate::types::{BlockBytes, Generation, Timestamp};

use super::cancel::CancelToken;
use super::types::{BlockOrigin, ParsedBlock, ParsedPayload, ParserOut, RawBlock, RunCounters};

/// State shared by all parser workers.
pub(crate) struct ParserCtx {
    pub parser: Arc<dyn RecordParser>,
    pub filter: Filter,
    pub store: Option<Arc<BlockStore>>,
    pub codec: Codec,
    /// Greatest `timestamps.max` seen on any forwarded container block;
    /// drives the chronological shortcut.
    pub chrono_max: AtomicI64,
    pub counters: Arc<RunCounters>,
}

/// Parser worker loop. Exactly one [`ParserOut`] is emitted per input
/// block so the generation sequence stays contiguous for the pusher.
pub(crate) fn run_parser(
    rx: Receiver<RawBlock>,
    tx: Sender<ParserOut>,
    ctx: Arc<ParserCtx>,
    token: CancelToken,
) -> Result<()> {
    for raw in rx.iter() {
        if token.is_cancelled() {
            break;
        }
        let generation = raw.generation;
        let out = match process_block(raw, &ctx) {
            Ok(Some(block)) => ParserOut::Block(block),
            Ok(None) => ParserOut::Skip(generation),
            Err(TidemarkError::CorruptBlock { generation, reason }) => {
                warn!(generation, %reason, "dropping corrupt block");
                RunCounters::bump(&ctx.counters.blocks_dropped);
                ParserOut::Skip(generation)
            }
            Err(TidemarkError::Cancelled) => break,
            Err(error) => return Err(error),
        };
        if tx.send(out).is_err() {
            break;
        }
    }
    Ok(())
}

fn process_block(raw: RawBlock, ctx: &ParserCtx) -> Result<Option<ParsedBlock>> {
    let RawBlock {
        generation,
        origin,
        bytes,
        compressed,
        prior_index,
        floor,
    } = raw;

    let bytes = match compressed {
        Some(codec) => BlockBytes::owned(
            compression::decompress(bytes.as_slice(), codec).map_err(|err| {
                TidemarkError::CorruptBlock {
                    generation,
                    reason: err.to_string(),
                }
            })?,
        ),
        None => bytes,
    };

    // Fast path: the block's prior index admits every record, so records
    // are re-derived by the formatter instead of being materialized here.
    if let Some(prior) = &prior_index {
        if ctx.filter.admits_fully(prior) {
            RunCounters::add(&ctx.counters.lines_valid, prior.lines.valid);
            RunCounters::add(&ctx.counters.lines_invalid, prior.lines.invalid);
            let payload = match origin {
                BlockOrigin::File => ParsedPayload::Inline(bytes),
                BlockOrigin::Container => {
                    if take_shortcut(ctx, prior) {
                        ParsedPayload::Inline(bytes)
                    } else {
                        archive(ctx, generation, bytes.as_slice(), prior.ts_max())?
                    }
                }
                BlockOrigin::Stream => {
                    archive(ctx, generation, bytes.as_slice(), prior.ts_max())?
                }
            };
            return Ok(Some(ParsedBlock {
                generation,
                floor,
                index: prior.clone(),
                payload,
                records: None,
            }));
        }
    }

    let parsed = ctx.parser.parse_block(bytes.as_slice());
    RunCounters::add(&ctx.counters.lines_valid, parsed.lines.valid);
    RunCounters::add(&ctx.counters.lines_invalid, parsed.lines.invalid);

    let mut index = BlockIndex::new();
    index.lines = parsed.lines;
    // The binary bit is reserved: carried through untouched, never
    // interpreted.
    if let Some(prior) = &prior_index {
        index.flags |= prior.flags & crate::index::FLAG_BINARY;
    }
    let mut survivors = Vec::with_capacity(parsed.records.len());
    for record in parsed.records {
        if ctx.filter.accept_record(record.timestamp, record.level) {
            index.observe(record.timestamp, record.level);
            survivors.push(record);
        }
    }
    if survivors.is_empty() {
        RunCounters::bump(&ctx.counters.blocks_skipped);
        return Ok(None);
    }

    resolve_leading_timestamps(&mut survivors, &index);
    let sorted = survivors
        .windows(2)
        .all(|pair| pair[0].timestamp <= pair[1].timestamp);
    index.set_sorted(sorted);

    let (payload, records) = match origin {
        BlockOrigin::File => (ParsedPayload::Inline(bytes), survivors),
        BlockOrigin::Stream => {
            let compacted = compact(&mut survivors, bytes.as_slice());
            (
                archive(ctx, generation, &compacted, index.ts_max())?,
                survivors,
            )
        }
        BlockOrigin::Container => {
            if take_shortcut(ctx, &index) {
                (ParsedPayload::Inline(bytes), survivors)
            } else {
                let compacted = compact(&mut survivors, bytes.as_slice());
                (
                    archive(ctx, generation, &compacted, index.ts_max())?,
                    survivors,
                )
            }
        }
    };

    Ok(Some(ParsedBlock {
        generation,
        floor,
        index,
        payload,
        records: Some(records),
    }))
}

/// Backfills records preceding the first timestamped record with the
/// block's minimum, so merge keys stay monotone within the block.
pub(crate) fn resolve_leading_timestamps(records: &mut [Record], index: &BlockIndex) {
    let Some(range) = index.timestamps else {
        return;
    };
    for record in records.iter_mut() {
        if record.timestamp.is_some() {
            break;
        }
        record.timestamp = Some(range.min);
    }
}

/// Chronological shortcut: a sorted container block starting at or after
/// everything seen so far will be consumed in order and never revisited,
/// so it skips the archive round-trip.
fn take_shortcut(ctx: &ParserCtx, index: &BlockIndex) -> bool {
    let previous_max = ctx.chrono_max.fetch_max(index.ts_max(), Ordering::AcqRel);
    index.sorted() && index.ts_min() >= previous_max
}

fn archive(
    ctx: &ParserCtx,
    generation: Generation,
    data: &[u8],
    ts_max: Timestamp,
) -> Result<ParsedPayload> {
    let store = ctx
        .store
        .as_ref()
        .expect("archiving requires a block store");
    let payload = CompressedPayload::compress(data, ctx.codec)?;
    let handle = store.put(generation, payload, ts_max)?;
    Ok(ParsedPayload::Archived(handle))
}

/// Copies surviving record bytes into a contiguous buffer and rebases the
/// record spans onto it.
fn compact(records: &mut [Record], data: &[u8]) -> Vec<u8> {
    let total: usize = records.iter().map(|record| record.span.len()).sum();
    let mut buf = Vec::with_capacity(total);
    for record in records.iter_mut() {
        let start = buf.len();
        buf.extend_from_slice(&data[record.span.start..record.span.end]);
        record.span = Span {
            start,
            end: buf.len(),
        };
    }
    buf
}
