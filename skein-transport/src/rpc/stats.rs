//! Per-call outcome hooks and a built-in latency aggregator.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// How a call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallStatus {
    /// A `result` came back.
    Ok,
    /// The remote side answered with a business error.
    RemoteError,
    /// The remote side answered with an unhandled fault.
    RemoteFault,
    /// No response before the deadline.
    Timeout,
    /// No route to the destination at send time.
    Unreachable,
    /// Any other failure (backpressure, invalid response, encoding).
    Failed,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallStatus::Ok => "ok",
            CallStatus::RemoteError => "remote_error",
            CallStatus::RemoteFault => "remote_fault",
            CallStatus::Timeout => "timeout",
            CallStatus::Unreachable => "unreachable",
            CallStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One completed call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    /// Target `name@version`.
    pub entity: String,
    /// Called endpoint.
    pub endpoint: String,
    /// Address the request was handed to, if it got that far.
    pub host: Option<String>,
    /// Outcome.
    pub status: CallStatus,
    /// `true` only for [`CallStatus::Ok`].
    pub success: bool,
    /// Time from registration to resolution.
    pub duration: Duration,
}

/// Receives one record per resolved call.
///
/// Called synchronously on the scheduler thread; implementations must not
/// block.
pub trait CallObserver {
    /// A call was resolved.
    fn on_call(&self, record: &CallRecord);
}

/// Aggregate for one `(entity, host, endpoint)` key.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallAggregate {
    /// Number of calls.
    pub count: u64,
    /// Running average duration.
    pub average: Duration,
}

/// Key of a [`ClientStats`] entry: `(entity, host, endpoint)`.
pub type StatsKey = (String, String, String);

/// Call count and running average latency per `(entity, host, endpoint)`.
///
/// Meant to be drained periodically by a metrics reporter.
#[derive(Debug, Default)]
pub struct ClientStats {
    entries: RefCell<HashMap<StatsKey, CallAggregate>>,
}

impl ClientStats {
    /// Empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current aggregate for a key.
    pub fn get(&self, entity: &str, host: &str, endpoint: &str) -> Option<CallAggregate> {
        let key = (entity.to_string(), host.to_string(), endpoint.to_string());
        self.entries.borrow().get(&key).copied()
    }

    /// Take every aggregate and start over.
    pub fn drain(&self) -> HashMap<StatsKey, CallAggregate> {
        std::mem::take(&mut *self.entries.borrow_mut())
    }
}

impl CallObserver for ClientStats {
    fn on_call(&self, record: &CallRecord) {
        let key = (
            record.entity.clone(),
            record.host.clone().unwrap_or_default(),
            record.endpoint.clone(),
        );
        let mut entries = self.entries.borrow_mut();
        let entry = entries.entry(key).or_insert(CallAggregate {
            count: 0,
            average: Duration::ZERO,
        });
        // avg' = (avg * n + d) / (n + 1)
        let total = entry.average.as_secs_f64() * entry.count as f64 + record.duration.as_secs_f64();
        entry.count += 1;
        entry.average = Duration::from_secs_f64(total / entry.count as f64);
    }
}
