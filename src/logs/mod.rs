// Logs module - Capture of child output into per-process files

mod pipe;
mod writer;

pub use pipe::{LogPipe, LogTargets, StreamKind};
pub use writer::LogWriter;
