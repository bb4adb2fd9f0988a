use std::fs::File;
use std::io::Read;

use crossbeam_channel::Sender;
use tracing::warn;

use crate::error::{Result, TidemarkError};
use crate::format::ContainerReader;
use crate::index::BlockIndex;
use crate::io::{BlockScanner, MmapInput, StreamChunker};
use crate::types::{BlockBytes, Generation, Timestamp};

use super::cancel::CancelToken;
use super::types::{BlockOrigin, MergeOptions, RawBlock, RunCounters, SourceInput};

/// A block of a mapped source selected for reading.
pub(crate) struct MappedBlock {
    start: usize,
    end: usize,
    prior: Option<BlockIndex>,
    key: Timestamp,
}

/// A container block that survived header pre-filtering.
pub(crate) struct AdmittedBlock {
    container_index: usize,
    key: Timestamp,
}

pub(crate) enum PreparedSource {
    Mapped {
        mmap: MmapInput,
        blocks: Vec<MappedBlock>,
        discarded_partial: bool,
    },
    Stream {
        chunker: StreamChunker<Box<dyn Read + Send>>,
    },
    Container {
        reader: ContainerReader<File>,
        admitted: Vec<AdmittedBlock>,
    },
}

/// Sources opened and block-planned, ready for the reader thread.
///
/// When every source supplies a complete block schedule up front, `plan`
/// holds the global emission order sorted by schedule key and the run
/// releases blocks in generation order downstream.
pub(crate) struct PreparedRun {
    sources: Vec<PreparedSource>,
    plan: Option<Vec<(usize, usize)>>,
}

impl PreparedRun {
    pub fn scheduled(&self) -> bool {
        self.plan.is_some()
    }

    pub fn needs_store(&self) -> bool {
        self.sources.iter().any(|source| {
            matches!(
                source,
                PreparedSource::Stream { .. } | PreparedSource::Container { .. }
            )
        })
    }
}

/// Opens every source, applies index/header pre-filtering, and builds the
/// emission plan.
pub(crate) fn prepare(
    inputs: Vec<SourceInput>,
    options: &MergeOptions,
    counters: &RunCounters,
) -> Result<PreparedRun> {
    let scanner = BlockScanner::new(options.block_size);
    let mut sources = Vec::with_capacity(inputs.len());
    let mut all_scheduled = true;

    for input in inputs {
        match input {
            SourceInput::File { path, index } => {
                let mmap = MmapInput::open(&path)?;
                let index = index.filter(|idx| {
                    let matches = idx.source.size == mmap.len() as u64;
                    if !matches {
                        warn!(
                            path = %path.display(),
                            "persistent index does not match source size, ignoring"
                        );
                    }
                    matches
                });
                match index {
                    Some(idx) => {
                        let mut blocks = Vec::with_capacity(idx.source.blocks.len());
                        for block in &idx.source.blocks {
                            let start = usize::try_from(block.offset).map_err(|_| {
                                TidemarkError::InvalidFrame("index block offset overflow")
                            })?;
                            let end = start
                                .checked_add(usize::try_from(block.size).map_err(|_| {
                                    TidemarkError::InvalidFrame("index block size overflow")
                                })?)
                                .ok_or(TidemarkError::InvalidFrame(
                                    "index block range overflow",
                                ))?;
                            if end > mmap.len() {
                                return Err(TidemarkError::InvalidFrame(
                                    "index block outside source bounds",
                                ));
                            }
                            if !options.filter.accept_index(&block.index) {
                                RunCounters::bump(&counters.blocks_skipped);
                                continue;
                            }
                            blocks.push(MappedBlock {
                                start,
                                end,
                                prior: Some(block.index.clone()),
                                key: block.index.ts_min(),
                            });
                        }
                        sources.push(PreparedSource::Mapped {
                            mmap,
                            blocks,
                            discarded_partial: false,
                        });
                    }
                    None => {
                        let split = scanner.split_mapped(mmap.data());
                        let blocks = split
                            .blocks
                            .into_iter()
                            .map(|(start, end)| MappedBlock {
                                start,
                                end,
                                prior: None,
                                key: i64::MIN,
                            })
                            .collect();
                        all_scheduled = false;
                        sources.push(PreparedSource::Mapped {
                            mmap,
                            blocks,
                            discarded_partial: split.discarded_partial,
                        });
                    }
                }
            }
            SourceInput::Stream { reader } => {
                all_scheduled = false;
                sources.push(PreparedSource::Stream {
                    chunker: StreamChunker::new(reader, options.block_size),
                });
            }
            SourceInput::Container { path } => {
                let file = File::open(&path).map_err(|source| TidemarkError::OpenFailed {
                    path: path.clone(),
                    source,
                })?;
                let reader = ContainerReader::new(file)?;
                let mut admitted = Vec::with_capacity(reader.block_count() as usize);
                for (container_index, header) in reader.headers().enumerate() {
                    let index = header.index();
                    if options.filter.accept_index(&index) {
                        admitted.push(AdmittedBlock {
                            container_index,
                            key: index.ts_min(),
                        });
                    } else {
                        RunCounters::bump(&counters.blocks_skipped);
                    }
                }
                sources.push(PreparedSource::Container { reader, admitted });
            }
        }
    }

    let plan: Option<Vec<(usize, usize)>> = all_scheduled.then(|| {
        let mut entries = Vec::new();
        for (source_idx, source) in sources.iter().enumerate() {
            match source {
                PreparedSource::Mapped { blocks, .. } => {
                    for (block_idx, block) in blocks.iter().enumerate() {
                        entries.push((block.key, source_idx, block_idx));
                    }
                }
                PreparedSource::Container { admitted, .. } => {
                    for (block_idx, block) in admitted.iter().enumerate() {
                        entries.push((block.key, source_idx, block_idx));
                    }
                }
                PreparedSource::Stream { .. } => {}
            }
        }
        entries.sort_by_key(|&(key, source_idx, block_idx)| (key, source_idx, block_idx));
        entries
            .into_iter()
            .map(|(_, source_idx, block_idx)| (source_idx, block_idx))
            .collect()
    });

    Ok(PreparedRun { sources, plan })
}

/// Reader stage: emits raw blocks with strictly increasing generations.
/// This is the only place generations are minted.
pub(crate) fn run_reader(
    mut run: PreparedRun,
    tx: Sender<RawBlock>,
    token: CancelToken,
    counters: &RunCounters,
) -> Result<()> {
    let mut generation: Generation = 0;
    match run.plan.take() {
        Some(plan) => {
            for (source_idx, block_idx) in plan {
                if token.is_cancelled() {
                    return Ok(());
                }
                let raw = match &mut run.sources[source_idx] {
                    PreparedSource::Mapped { mmap, blocks, .. } => {
                        let block = &blocks[block_idx];
                        RawBlock {
                            generation,
                            origin: BlockOrigin::File,
                            bytes: mmap.mapped_slice(block.start, block.end)?,
                            compressed: None,
                            prior_index: block.prior.clone(),
                            floor: Some(block.key),
                        }
                    }
                    PreparedSource::Container { reader, admitted } => {
                        let block = &admitted[block_idx];
                        match read_container_block(reader, block, generation, Some(block.key)) {
                            Ok(Some(raw)) => raw,
                            Ok(None) => {
                                RunCounters::bump(&counters.blocks_dropped);
                                continue;
                            }
                            Err(error) => return Err(error),
                        }
                    }
                    PreparedSource::Stream { .. } => unreachable!("streams are never scheduled"),
                };
                RunCounters::bump(&counters.blocks_read);
                if tx.send(raw).is_err() {
                    return Ok(());
                }
                generation += 1;
            }
        }
        None => {
            for source in &mut run.sources {
                match source {
                    PreparedSource::Mapped {
                        mmap,
                        blocks,
                        discarded_partial,
                    } => {
                        for block in blocks.iter() {
                            if token.is_cancelled() {
                                return Ok(());
                            }
                            let raw = RawBlock {
                                generation,
                                origin: BlockOrigin::File,
                                bytes: mmap.mapped_slice(block.start, block.end)?,
                                compressed: None,
                                prior_index: block.prior.clone(),
                                floor: None,
                            };
                            RunCounters::bump(&counters.blocks_read);
                            if tx.send(raw).is_err() {
                                return Ok(());
                            }
                            generation += 1;
                        }
                        if *discarded_partial {
                            RunCounters::bump(&counters.lines_invalid);
                        }
                    }
                    PreparedSource::Stream { chunker } => loop {
                        if token.is_cancelled() {
                            return Ok(());
                        }
                        let Some(chunk) = chunker.next_block()? else {
                            break;
                        };
                        if chunk.discarded_partial {
                            RunCounters::bump(&counters.lines_invalid);
                        }
                        if chunk.data.is_empty() {
                            continue;
                        }
                        let raw = RawBlock {
                            generation,
                            origin: BlockOrigin::Stream,
                            bytes: BlockBytes::owned(chunk.data),
                            compressed: None,
                            prior_index: None,
                            floor: None,
                        };
                        RunCounters::bump(&counters.blocks_read);
                        if tx.send(raw).is_err() {
                            return Ok(());
                        }
                        generation += 1;
                    },
                    PreparedSource::Container { reader, admitted } => {
                        for block in admitted.iter() {
                            if token.is_cancelled() {
                                return Ok(());
                            }
                            match read_container_block(reader, block, generation, None) {
                                Ok(Some(raw)) => {
                                    RunCounters::bump(&counters.blocks_read);
                                    if tx.send(raw).is_err() {
                                        return Ok(());
                                    }
                                    generation += 1;
                                }
                                Ok(None) => RunCounters::bump(&counters.blocks_dropped),
                                Err(error) => return Err(error),
                            }
                        }
                    }
                }
            }
        }
    }
    Ok(())
}

/// Reads one container block payload. A checksum failure drops the block
/// with a diagnostic instead of failing the run.
fn read_container_block(
    reader: &mut ContainerReader<File>,
    block: &AdmittedBlock,
    generation: Generation,
    floor: Option<Timestamp>,
) -> Result<Option<RawBlock>> {
    match reader.read_payload(block.container_index) {
        Ok((header, payload)) => Ok(Some(RawBlock {
            generation,
            origin: BlockOrigin::Container,
            bytes: BlockBytes::owned(payload),
            compressed: Some(header.codec()?),
            prior_index: Some(header.index()),
            floor,
        })),
        Err(TidemarkError::ChecksumMismatch { expected, actual }) => {
            warn!(
                block = block.container_index,
                expected, actual, "container block checksum mismatch, dropping block"
            );
            Ok(None)
        }
        Err(error) => Err(error),
    }
}
