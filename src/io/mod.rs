pub mod line_reader;
pub mod write_queue;

pub use line_reader::LineReader;
pub use write_queue::{WriteQueue, WriteQueueError};
