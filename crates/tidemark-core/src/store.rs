use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::compression::{self, Codec};
use crate::error::{Result, TidemarkError};
use crate::types::{Generation, Timestamp};

/// Compressed block bytes ready for [`BlockStore::put`].
#[derive(Debug, Clone)]
pub struct CompressedPayload {
    pub data: Vec<u8>,
    pub raw_len: usize,
}

impl CompressedPayload {
    pub fn compress(raw: &[u8], codec: Codec) -> Result<Self> {
        Ok(Self {
            data: compression::compress(raw, codec)?,
            raw_len: raw.len(),
        })
    }
}

/// Reference to an archived block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreHandle {
    generation: Generation,
}

impl StoreHandle {
    pub fn generation(&self) -> Generation {
        self.generation
    }
}

struct StoreEntry {
    data: Arc<Vec<u8>>,
    raw_len: usize,
    refs: usize,
    ts_max: Timestamp,
}

struct StoreInner {
    entries: HashMap<Generation, StoreEntry>,
    used: usize,
    closed: bool,
}

/// In-memory, capacity-bounded store for compressed block bytes.
///
/// Non-seekable sources park block payloads here between the parser and the
/// formatter. Entries are reference counted; storage is freed once no stage
/// holds a reference and the merger's watermark has passed the block's
/// `timestamps.max`, at which point no record of the block can still be
/// pending. `put` blocks while the cap is exceeded, back-pressuring the
/// reader through the parser pool.
pub struct BlockStore {
    codec: Codec,
    cap: usize,
    inner: Mutex<StoreInner>,
    space: Condvar,
    watermark: AtomicI64,
    peak: AtomicUsize,
}

impl BlockStore {
    pub fn new(codec: Codec, cap: usize) -> Self {
        Self {
            codec,
            cap: cap.max(1),
            inner: Mutex::new(StoreInner {
                entries: HashMap::new(),
                used: 0,
                closed: false,
            }),
            space: Condvar::new(),
            watermark: AtomicI64::new(i64::MIN),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Stores compressed bytes under the block's generation, taking one
    /// reference. Blocks while the cap is exceeded and other entries could
    /// still be reclaimed; a single oversized block is always admitted into
    /// an empty store so the pipeline cannot deadlock on it.
    pub fn put(
        &self,
        generation: Generation,
        payload: CompressedPayload,
        ts_max: Timestamp,
    ) -> Result<StoreHandle> {
        let len = payload.data.len();
        let mut inner = self.inner.lock().expect("block store mutex poisoned");
        loop {
            if inner.closed {
                return Err(TidemarkError::Cancelled);
            }
            Self::sweep(&mut inner, self.watermark.load(Ordering::Acquire));
            if inner.used + len <= self.cap || inner.entries.is_empty() {
                break;
            }
            inner = self
                .space
                .wait(inner)
                .expect("block store mutex poisoned");
        }
        if inner
            .entries
            .insert(
                generation,
                StoreEntry {
                    data: Arc::new(payload.data),
                    raw_len: payload.raw_len,
                    refs: 1,
                    ts_max,
                },
            )
            .is_some()
        {
            return Err(TidemarkError::ContractViolation(format!(
                "duplicate block {generation} archived"
            )));
        }
        inner.used += len;
        self.peak.fetch_max(inner.used, Ordering::AcqRel);
        Ok(StoreHandle { generation })
    }

    /// Returns a decompressed view of the archived block. Concurrent calls
    /// decompress independently.
    pub fn get(&self, handle: StoreHandle) -> Result<Vec<u8>> {
        let (data, raw_len) = {
            let inner = self.inner.lock().expect("block store mutex poisoned");
            let entry = inner.entries.get(&handle.generation).ok_or_else(|| {
                TidemarkError::ContractViolation(format!(
                    "block {} fetched after release",
                    handle.generation
                ))
            })?;
            (Arc::clone(&entry.data), entry.raw_len)
        };
        let raw = compression::decompress(&data, self.codec)?;
        if raw.len() != raw_len {
            return Err(TidemarkError::CorruptBlock {
                generation: handle.generation,
                reason: format!("archived size mismatch ({} != {raw_len})", raw.len()),
            });
        }
        Ok(raw)
    }

    /// Drops one reference. Storage is reclaimed once the refcount is zero
    /// and the watermark has passed the block's maximum timestamp.
    pub fn release(&self, handle: StoreHandle) {
        let mut inner = self.inner.lock().expect("block store mutex poisoned");
        if let Some(entry) = inner.entries.get_mut(&handle.generation) {
            entry.refs = entry.refs.saturating_sub(1);
            Self::sweep(&mut inner, self.watermark.load(Ordering::Acquire));
            self.space.notify_all();
        }
    }

    /// Raises the reclamation watermark and frees entries it unlocks.
    pub fn advance_watermark(&self, ts: Timestamp) {
        let previous = self.watermark.fetch_max(ts, Ordering::AcqRel);
        if ts > previous {
            let mut inner = self.inner.lock().expect("block store mutex poisoned");
            Self::sweep(&mut inner, ts);
            self.space.notify_all();
        }
    }

    /// Unblocks pending `put` calls; they return `Cancelled`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("block store mutex poisoned");
        inner.closed = true;
        self.space.notify_all();
    }

    pub fn usage(&self) -> usize {
        self.inner
            .lock()
            .expect("block store mutex poisoned")
            .used
    }

    pub fn peak_usage(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("block store mutex poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(inner: &mut StoreInner, watermark: Timestamp) {
        let mut freed = 0usize;
        inner.entries.retain(|_, entry| {
            if entry.refs == 0 && entry.ts_max <= watermark {
                freed += entry.data.len();
                false
            } else {
                true
            }
        });
        inner.used -= freed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(bytes: &[u8]) -> CompressedPayload {
        CompressedPayload::compress(bytes, Codec::Lz4).unwrap()
    }

    #[test]
    fn put_get_round_trip() {
        let store = BlockStore::new(Codec::Lz4, 1 << 20);
        let raw = b"{\"ts\":1}\n".repeat(100);
        let handle = store.put(7, payload(&raw), 1).unwrap();
        assert_eq!(store.get(handle).unwrap(), raw);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn release_frees_only_past_watermark() {
        let store = BlockStore::new(Codec::Lz4, 1 << 20);
        let handle = store.put(0, payload(b"data\n"), 50).unwrap();
        store.release(handle);
        // Refcount is zero but the watermark has not passed ts_max yet.
        assert_eq!(store.len(), 1);
        store.advance_watermark(49);
        assert_eq!(store.len(), 1);
        store.advance_watermark(50);
        assert_eq!(store.len(), 0);
        assert_eq!(store.usage(), 0);
    }

    #[test]
    fn duplicate_generation_is_a_contract_violation() {
        let store = BlockStore::new(Codec::Lz4, 1 << 20);
        store.put(3, payload(b"a\n"), 1).unwrap();
        assert!(matches!(
            store.put(3, payload(b"b\n"), 1),
            Err(TidemarkError::ContractViolation(_))
        ));
    }

    #[test]
    fn oversized_block_is_admitted_into_empty_store() {
        let store = BlockStore::new(Codec::None, 8);
        let handle = store.put(0, payload_none(b"larger than the cap\n"), 1).unwrap();
        assert_eq!(store.get(handle).unwrap(), b"larger than the cap\n");
    }

    fn payload_none(bytes: &[u8]) -> CompressedPayload {
        CompressedPayload::compress(bytes, Codec::None).unwrap()
    }

    #[test]
    fn peak_usage_tracks_high_water() {
        let store = BlockStore::new(Codec::None, 1 << 20);
        let a = store.put(0, payload_none(&[0u8; 100]), 1).unwrap();
        let b = store.put(1, payload_none(&[0u8; 200]), 2).unwrap();
        store.release(a);
        store.release(b);
        store.advance_watermark(i64::MAX);
        assert_eq!(store.usage(), 0);
        assert_eq!(store.peak_usage(), 300);
    }
}
