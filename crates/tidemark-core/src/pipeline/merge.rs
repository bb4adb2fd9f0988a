use std::io::Write;
use std::sync::atomic::AtomicI64;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::bounded;
use tracing::debug;

use crate::buffer::BufferPool;
use crate::error::{Result, TidemarkError};
use crate::record::{JsonLineParser, PlainFormatter, RecordFormatter, RecordParser};
use crate::store::BlockStore;

use super::cancel::CancelToken;
use super::formatter::{run_formatter, FormatterCtx};
use super::merger::run_merger;
use super::parser::{run_parser, ParserCtx};
use super::pusher::run_pusher;
use super::source;
use super::types::{MergeOptions, MergeStats, RunCounters, SourceInput};

/// The staged merge pipeline: reader, parser pool, pusher, formatter pool,
/// and merger, wired through bounded queues.
///
/// Records that pass the configured filters are written to the sink exactly
/// once, in non-decreasing timestamp order, ties broken by ascending
/// generation and in-block position.
pub struct MergePipeline {
    options: MergeOptions,
    parser: Arc<dyn RecordParser>,
    formatter: Arc<dyn RecordFormatter>,
}

impl MergePipeline {
    /// Pipeline with the bundled JSON-lines parser and plain formatter.
    pub fn new(options: MergeOptions) -> Self {
        Self::with_plugins(options, Arc::new(JsonLineParser), Arc::new(PlainFormatter))
    }

    /// Pipeline with custom record parser and formatter plug-ins.
    pub fn with_plugins(
        options: MergeOptions,
        parser: Arc<dyn RecordParser>,
        formatter: Arc<dyn RecordFormatter>,
    ) -> Self {
        Self {
            options,
            parser,
            formatter,
        }
    }

    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    /// Runs the merge to completion.
    pub fn run(&self, inputs: Vec<SourceInput>, sink: &mut (dyn Write + Send)) -> Result<MergeStats> {
        self.run_with_cancel(inputs, sink, &CancelToken::new())
    }

    /// Runs the merge with an external cancellation token. Cancellation is
    /// a clean shutdown: the sink is flushed, no partial record is written,
    /// and the returned stats carry `cancelled = true`.
    pub fn run_with_cancel(
        &self,
        inputs: Vec<SourceInput>,
        sink: &mut (dyn Write + Send),
        token: &CancelToken,
    ) -> Result<MergeStats> {
        let started = Instant::now();
        let counters = Arc::new(RunCounters::default());
        let run = source::prepare(inputs, &self.options, &counters)?;
        let scheduled = run.scheduled();
        let store = run
            .needs_store()
            .then(|| Arc::new(BlockStore::new(self.options.codec, self.options.store_cap)));

        let parsers = self.options.parser_workers.max(1);
        let formatters = self.options.formatter_workers.max(1);
        let pool = Arc::new(BufferPool::new(
            self.options.block_size.clamp(4096, 1 << 20),
            formatters * 2 + 4,
        ));
        debug!(parsers, formatters, scheduled, "starting merge pipeline");

        let (raw_tx, raw_rx) = bounded(2 * parsers);
        let (parsed_tx, parsed_rx) = bounded(4 * parsers);
        let (released_tx, released_rx) = bounded(4 * formatters);
        let (formatted_tx, formatted_rx) = bounded(2 * formatters);

        let parser_ctx = Arc::new(ParserCtx {
            parser: Arc::clone(&self.parser),
            filter: self.options.filter,
            store: store.clone(),
            codec: self.options.codec,
            chrono_max: AtomicI64::new(i64::MIN),
            counters: Arc::clone(&counters),
        });
        let formatter_ctx = Arc::new(FormatterCtx {
            parser: Arc::clone(&self.parser),
            formatter: Arc::clone(&self.formatter),
            store: store.clone(),
            pool: Arc::clone(&pool),
            counters: Arc::clone(&counters),
        });

        let first_error = Mutex::new(None::<TidemarkError>);

        std::thread::scope(|scope| {
            {
                let token = token.clone();
                let counters = Arc::clone(&counters);
                let first_error = &first_error;
                scope.spawn(move || {
                    if let Err(error) = source::run_reader(run, raw_tx, token.clone(), &counters) {
                        record_failure(first_error, &token, error);
                    }
                });
            }

            for _ in 0..parsers {
                let rx = raw_rx.clone();
                let tx = parsed_tx.clone();
                let ctx = Arc::clone(&parser_ctx);
                let token = token.clone();
                let first_error = &first_error;
                scope.spawn(move || {
                    if let Err(error) = run_parser(rx, tx, ctx, token.clone()) {
                        record_failure(first_error, &token, error);
                    }
                });
            }
            drop(raw_rx);
            drop(parsed_tx);

            {
                let filter = self.options.filter;
                let store = store.clone();
                let counters = Arc::clone(&counters);
                let token = token.clone();
                let first_error = &first_error;
                scope.spawn(move || {
                    if let Err(error) = run_pusher(
                        parsed_rx,
                        released_tx,
                        scheduled,
                        filter,
                        store,
                        counters,
                        token.clone(),
                    ) {
                        record_failure(first_error, &token, error);
                    }
                });
            }

            for _ in 0..formatters {
                let rx = released_rx.clone();
                let tx = formatted_tx.clone();
                let ctx = Arc::clone(&formatter_ctx);
                let token = token.clone();
                let first_error = &first_error;
                scope.spawn(move || {
                    if let Err(error) = run_formatter(rx, tx, ctx, token.clone()) {
                        record_failure(first_error, &token, error);
                    }
                });
            }
            drop(released_rx);
            drop(formatted_tx);

            // The merger runs on the orchestrating thread; the sink never
            // crosses a thread boundary.
            if let Err(error) = run_merger(formatted_rx, sink, store.as_deref(), &counters, token) {
                if !matches!(error, TidemarkError::Cancelled) {
                    record_failure(&first_error, token, error);
                }
            }

            // The merger only returns once upstream drained or the run was
            // cancelled or failed; closing the store here unblocks any
            // parser still parked on a capacity wait before the join.
            if let Some(store) = &store {
                store.close();
            }
        });

        if let Some(store) = &store {
            store.advance_watermark(i64::MAX);
        }

        if let Some(error) = first_error
            .into_inner()
            .expect("first error mutex poisoned")
        {
            return Err(error);
        }

        let mut stats = counters.snapshot();
        stats.store_peak_bytes = store
            .as_ref()
            .map(|store| store.peak_usage() as u64)
            .unwrap_or(0);
        stats.elapsed = started.elapsed();
        stats.cancelled = token.is_cancelled();
        Ok(stats)
    }
}

fn record_failure(slot: &Mutex<Option<TidemarkError>>, token: &CancelToken, error: TidemarkError) {
    let mut slot = slot.lock().expect("first error mutex poisoned");
    if slot.is_none() {
        *slot = Some(error);
    }
    token.cancel();
}
