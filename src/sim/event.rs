use crate::base::port::PortName;
use crate::dispatch::request::{Source, Tier};
use crate::timeq::{EventQueue, Prioritized};

/// Components that finish work on their own schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Accounting,
    Tier(Tier),
    Flat,
    /// Work the dispatcher deferred to a later step.
    Dispatcher,
}

/// Every callback in a run.  Peers never call into the dispatcher themselves; they leave one of
/// these on the scheduler and the driver delivers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    /// A server may have completed work.
    Complete(Unit),
    /// The peer behind `PortName` can take traffic again.
    PortRetry(PortName),
    /// The issuer for a source may offer its next request.
    Issue(Source),
}

impl Prioritized for SimEvent {
    // completions free capacity before retries consume it, and migration issues ahead of remap
    fn priority(&self) -> u8 {
        match self {
            SimEvent::Complete(_) => 0,
            SimEvent::PortRetry(_) => 1,
            SimEvent::Issue(Source::Migration) => 2,
            SimEvent::Issue(Source::Remap) => 3,
        }
    }
}

pub type Scheduler = EventQueue<SimEvent>;
