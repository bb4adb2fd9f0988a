mod consts;
mod headers;
mod reader;
mod writer;

pub use consts::{
    BLOCK_HEADER_SIZE, FOOTER_SIZE, GLOBAL_HEADER_SIZE, TLC_END_MAGIC, TLC_MAGIC, TLC_VERSION,
};
pub use headers::{ContainerBlockHeader, Footer, GlobalHeader};
pub use reader::ContainerReader;
pub use writer::ContainerWriter;
