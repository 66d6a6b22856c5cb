//! Segmented append-only storage: a store file of length-prefixed
//! records, a memory-mapped index from relative offsets to store
//! positions, and the log that stitches segments together.

mod index;
mod log;
mod segment;
mod store;

pub use self::log::{Log, LogReader};
pub use index::Index;
pub use segment::Segment;
pub use store::Store;
