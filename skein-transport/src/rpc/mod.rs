//! Request/response correlation.
//!
//! A client registers every outgoing request with its [`Correlator`] and
//! gets a [`ReplyFuture`] back. The correlator resolves that future exactly
//! once with the response, a timeout, or a send-time failure, and reports
//! every outcome to the registered [`CallObserver`]s.

mod context;
mod correlator;
mod reply_future;
mod stats;

pub use context::RequestContext;
pub use correlator::Correlator;
pub use reply_future::{Reply, ReplyFuture};
pub use stats::{CallAggregate, CallObserver, CallRecord, CallStatus, ClientStats, StatsKey};
