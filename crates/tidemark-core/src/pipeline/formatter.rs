use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};
use tracing::warn;

use crate::buffer::BufferPool;
use crate::error::Result;
use crate::record::{Record, RecordFormatter, RecordParser};
use crate::store::BlockStore;
use crate::types::BlockBytes;

use super::cancel::CancelToken;
use super::parser::resolve_leading_timestamps;
use super::types::{
    FormattedBlock, MergerIn, ParsedBlock, ParsedPayload, RecordSlot, ReleasedBlock, RunCounters,
};

/// State shared by all formatter workers.
pub(crate) struct FormatterCtx {
    pub parser: Arc<dyn RecordParser>,
    pub formatter: Arc<dyn RecordFormatter>,
    pub store: Option<Arc<BlockStore>>,
    pub pool: Arc<BufferPool>,
    pub counters: Arc<RunCounters>,
}

enum Payload {
    Inline(BlockBytes),
    Fetched(Vec<u8>),
}

impl Payload {
    fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Inline(bytes) => bytes.as_slice(),
            Payload::Fetched(bytes) => bytes,
        }
    }
}

/// Formatter worker loop: renders each record into a pooled buffer and
/// forwards the formatted block to the merger. Released blocks that end up
/// with no output still produce a tombstone so the merger's release
/// sequence stays contiguous.
pub(crate) fn run_formatter(
    rx: Receiver<ReleasedBlock>,
    tx: Sender<MergerIn>,
    ctx: Arc<FormatterCtx>,
    token: CancelToken,
) -> Result<()> {
    for released in rx.iter() {
        if token.is_cancelled() {
            break;
        }
        let ReleasedBlock { seq, block, floor } = released;
        let ParsedBlock {
            generation,
            index,
            payload,
            records,
            ..
        } = block;

        let payload = match payload {
            ParsedPayload::Inline(bytes) => Payload::Inline(bytes),
            ParsedPayload::Archived(handle) => {
                let store = ctx
                    .store
                    .as_ref()
                    .expect("archived payload requires a block store");
                match store.get(handle) {
                    Ok(raw) => {
                        store.release(handle);
                        Payload::Fetched(raw)
                    }
                    Err(error) => {
                        warn!(generation, %error, "dropping unreadable archived block");
                        RunCounters::bump(&ctx.counters.blocks_dropped);
                        store.release(handle);
                        if tx.send(MergerIn::Skip { seq, floor }).is_err() {
                            break;
                        }
                        continue;
                    }
                }
            }
        };
        let data = payload.as_slice();

        // Fast-path blocks carry no records; every line in them is admitted,
        // so they are re-derived here without filtering.
        let records: Vec<Record> = match records {
            Some(records) => records,
            None => {
                let mut parsed = self::reparse(&ctx, data);
                resolve_leading_timestamps(&mut parsed, &index);
                parsed
            }
        };

        let mut buffer = ctx.pool.acquire();
        let mut slots = Vec::with_capacity(records.len());
        for record in &records {
            let checkpoint = buffer.len();
            let line = &data[record.span.start..record.span.end];
            match ctx
                .formatter
                .format_record(record, line, buffer.as_mut_vec())
            {
                Ok(span) => slots.push(RecordSlot {
                    span,
                    key: record.timestamp.unwrap_or(i64::MIN),
                }),
                Err(error) => {
                    warn!(generation, %error, "dropping record that failed to format");
                    buffer.truncate(checkpoint);
                    RunCounters::bump(&ctx.counters.lines_invalid);
                }
            }
        }

        // The merger consumes each block through a cursor, so slots must be
        // in non-decreasing key order. Stable sort preserves in-block order
        // between equal timestamps.
        if !index.sorted() {
            slots.sort_by_key(|slot| slot.key);
        }
        let out = if slots.is_empty() {
            MergerIn::Skip { seq, floor }
        } else {
            MergerIn::Block(FormattedBlock {
                seq,
                generation,
                floor,
                buffer,
                slots,
            })
        };
        if tx.send(out).is_err() {
            break;
        }
    }
    Ok(())
}

fn reparse(ctx: &FormatterCtx, data: &[u8]) -> Vec<Record> {
    ctx.parser.parse_block(data).records
}
