use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tidemark_core::{BlockStore, Codec, CompressedPayload};

fn payload(bytes: &[u8]) -> CompressedPayload {
    CompressedPayload::compress(bytes, Codec::None).expect("compress payload")
}

#[test]
fn put_blocks_until_the_watermark_frees_space() {
    let store = Arc::new(BlockStore::new(Codec::None, 64));
    let first = store
        .put(0, payload(&[1u8; 48]), 10)
        .expect("first block fits");
    store.release(first);
    // Refcount is zero but ts_max has not been passed; capacity is still held.
    assert_eq!(store.usage(), 48);

    let blocked = {
        let store = Arc::clone(&store);
        thread::spawn(move || {
            // Does not fit next to the retained entry; must wait.
            store.put(1, payload(&[2u8; 48]), 20).expect("second put")
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!blocked.is_finished());

    store.advance_watermark(10);
    let handle = blocked.join().expect("blocked thread");
    assert_eq!(store.get(handle).expect("get second"), vec![2u8; 48]);
}

#[test]
fn close_unblocks_pending_puts() {
    let store = Arc::new(BlockStore::new(Codec::None, 16));
    let held = store.put(0, payload(&[0u8; 16]), 100).expect("first put");

    let blocked = {
        let store = Arc::clone(&store);
        thread::spawn(move || store.put(1, payload(&[0u8; 16]), 200))
    };
    thread::sleep(Duration::from_millis(50));
    store.close();

    assert!(blocked.join().expect("join").is_err());
    store.release(held);
}

#[test]
fn concurrent_gets_see_consistent_data() {
    let store = Arc::new(BlockStore::new(Codec::Lz4, 1 << 20));
    let raw = b"{\"ts\":42,\"level\":\"info\"}\n".repeat(200);
    let handle = store.put(5, CompressedPayload::compress(&raw, Codec::Lz4).unwrap(), 42).unwrap();

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            let expected = raw.clone();
            thread::spawn(move || {
                assert_eq!(store.get(handle).expect("concurrent get"), expected);
            })
        })
        .collect();
    for reader in readers {
        reader.join().expect("reader thread");
    }
    store.release(handle);
}
