//! The message coalescing core: grouping functions, the time-windowed
//! buffer, the summary renderer, and the arrival-rate counter.
//!
//! Everything here is pure state plus wall-clock arithmetic. The coordinator
//! owns the buffer and the rate counter exclusively, so no type in this crate
//! carries a lock.

pub mod buffer;
pub mod grouping;
pub mod rate;
pub mod render;

pub use buffer::{BufferStats, Group, MessageBuffer, Summary};
pub use grouping::GroupBy;
pub use rate::RateCounter;
pub use render::SummaryRenderer;
