/// Magic bytes at the start of a tlc container.
pub const TLC_MAGIC: [u8; 4] = *b"TLC\0";
/// Magic bytes at the start of the footer.
pub const TLC_END_MAGIC: [u8; 4] = *b"END\0";
/// Current version of the container format.
pub const TLC_VERSION: u16 = 1;

/// Fixed size of the global header in bytes.
pub const GLOBAL_HEADER_SIZE: usize = 16;
/// Fixed size of each block header in bytes.
pub const BLOCK_HEADER_SIZE: usize = 64;
/// Fixed size of the footer in bytes.
pub const FOOTER_SIZE: usize = 8;
