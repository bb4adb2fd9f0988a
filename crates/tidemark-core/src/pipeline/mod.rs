mod cancel;
mod formatter;
mod merge;
mod merger;
mod parser;
mod pusher;
mod source;
mod types;

pub use cancel::CancelToken;
pub use merge::MergePipeline;
pub use types::{MergeOptions, MergeStats, SourceInput};
