pub mod receiver;
pub mod source;
pub mod wire;

pub use receiver::{ReceiverStats, TradeReceiver};
pub use source::{FlowControl, LoopbackFeed, OffsetManager, StreamCursor};
