//! Bounded Ring Buffer
//!
//! Holds messages that could not be delivered yet. When full, the oldest
//! entry is evicted and handed back to the caller so the loss can be
//! recorded.

mod buffer;

pub use buffer::{RingBuffer, DEFAULT_CAPACITY};
