use std::io::Cursor;

use tidemark_core::{
    BlockIndex, Codec, ContainerReader, ContainerWriter, Level, LineCounts, SourceBlock,
    SourceFileMeta, SourceIndex, TidemarkError, TsRange, FLAG_SORTED,
};

fn sample_block_index(min: i64, max: i64) -> BlockIndex {
    let mut index = BlockIndex::new();
    index.add_valid(Some(min), Level::Info);
    index.add_valid(Some(max), Level::Error);
    index.add_invalid();
    index.set_sorted(true);
    index
}

fn sample_source_index() -> SourceIndex {
    let first = sample_block_index(100, 200);
    let second = sample_block_index(150, 400);
    let mut total = BlockIndex::new();
    total.merge(&first);
    total.merge(&second);
    SourceIndex {
        source: SourceFileMeta {
            size: 4096,
            sha256: [7u8; 32],
            path: "/var/log/app.log".to_string(),
            modified: 1_700_000_000_000,
            index: total,
            blocks: vec![
                SourceBlock {
                    offset: 0,
                    size: 2048,
                    index: first,
                },
                SourceBlock {
                    offset: 2048,
                    size: 2048,
                    index: second,
                },
            ],
        },
    }
}

mod index_file_tests {
    use super::*;

    #[test]
    fn round_trip_preserves_everything() {
        let index = sample_source_index();
        let mut frame = Vec::new();
        index.save(&mut frame).expect("save index");

        let loaded = SourceIndex::load(&mut Cursor::new(&frame)).expect("load index");
        assert_eq!(loaded, index);
        assert_eq!(
            loaded.source.index.timestamps,
            Some(TsRange { min: 100, max: 400 })
        );
        assert_eq!(
            loaded.source.index.lines,
            LineCounts {
                valid: 4,
                invalid: 2
            }
        );
    }

    #[test]
    fn bad_magic_is_rejected() {
        let index = sample_source_index();
        let mut frame = Vec::new();
        index.save(&mut frame).expect("save index");
        frame[0] ^= 0xFF;

        assert!(matches!(
            SourceIndex::load(&mut Cursor::new(&frame)),
            Err(TidemarkError::InvalidFrame(_))
        ));
    }

    #[test]
    fn unknown_flag_bits_are_rejected() {
        let mut index = sample_source_index();
        index.source.blocks[0].index.flags |= 0x200;
        let mut frame = Vec::new();
        index.save(&mut frame).expect("save index");

        assert!(matches!(
            SourceIndex::load(&mut Cursor::new(&frame)),
            Err(TidemarkError::InvalidFrame(_))
        ));
    }

    #[test]
    fn corrupted_payload_fails_the_checksum() {
        let index = sample_source_index();
        let mut frame = Vec::new();
        index.save(&mut frame).expect("save index");
        let middle = frame.len() / 2;
        frame[middle] ^= 0x01;

        assert!(SourceIndex::load(&mut Cursor::new(&frame)).is_err());
    }
}

mod container_tests {
    use super::*;

    fn build_container(blocks: &[(&[u8], BlockIndex)]) -> Vec<u8> {
        let mut writer = ContainerWriter::new(Vec::new(), Codec::Lz4);
        writer
            .write_global_header(blocks.len() as u32)
            .expect("header");
        for (data, index) in blocks {
            writer.write_block(index, data).expect("block");
        }
        writer.finish().expect("footer")
    }

    #[test]
    fn blocks_round_trip_through_the_container() {
        let payload = b"{\"ts\":100,\"level\":\"info\"}\n".repeat(50);
        let bytes = build_container(&[(payload.as_slice(), sample_block_index(100, 100))]);

        let mut reader = ContainerReader::new(Cursor::new(bytes)).expect("open container");
        assert_eq!(reader.block_count(), 1);
        let header = *reader.header(0).expect("header present");
        assert_eq!(header.index().timestamps, Some(TsRange { min: 100, max: 100 }));
        assert!(header.index().flags & FLAG_SORTED != 0);

        let (_, raw) = reader.read_block(0).expect("read block");
        assert_eq!(raw, payload);
    }

    #[test]
    fn headers_expose_indexes_without_payload_reads() {
        let first = sample_block_index(0, 9);
        let second = sample_block_index(10, 19);
        let bytes = build_container(&[
            (b"block-one\n".as_slice(), first.clone()),
            (b"block-two\n".as_slice(), second.clone()),
        ]);

        let reader = ContainerReader::new(Cursor::new(bytes)).expect("open container");
        let indexes: Vec<BlockIndex> = reader.headers().map(|header| header.index()).collect();
        assert_eq!(indexes, vec![first, second]);
    }

    #[test]
    fn payload_corruption_is_detected() {
        let bytes = build_container(&[(b"some log line\n".as_slice(), sample_block_index(1, 1))]);
        let mut corrupted = bytes.clone();
        let last_payload_byte = corrupted.len() - 9;
        corrupted[last_payload_byte] ^= 0x01;

        assert!(ContainerReader::new(Cursor::new(corrupted)).is_err());
    }

    #[test]
    fn declared_and_written_block_counts_must_match() {
        let mut writer = ContainerWriter::new(Vec::new(), Codec::Lz4);
        writer.write_global_header(2).expect("header");
        writer
            .write_block(&sample_block_index(1, 1), b"only one\n")
            .expect("block");
        assert!(writer.finish().is_err());
    }
}
