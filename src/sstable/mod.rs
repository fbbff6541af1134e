pub mod block;
pub mod table;

pub use block::{Block, BlockBuilder, BlockHandle, BlockIterator};
pub use table::{SSTable, SSTableIterator, TableBuilder, MAX_DATA_BLOCK_SIZE};
