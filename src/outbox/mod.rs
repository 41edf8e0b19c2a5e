pub mod dispatcher;
pub mod sizer;
pub mod worker;

pub use dispatcher::OutboxDispatcher;
pub use sizer::AdaptiveBatchSizer;
pub use worker::DispatchWorker;
