pub mod arena;
pub mod dynbuf;

pub use arena::{Block, SlabArena};
pub use dynbuf::DynBuf;
