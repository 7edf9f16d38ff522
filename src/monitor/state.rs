use crate::driver::StatusReport;
use crate::ledger::LedgerStatus;

/// What a poll result means for a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Status unchanged, nothing to write.
    Stay,
    Move(LedgerStatus),
    /// The backend reports the job finished. A staged driver may still turn
    /// this into a re-submission.
    Finish,
}

/// Map a driver's report onto the ledger state machine.
///
/// `Submitted -> Running -> Done` is the normal path and `Unknown` is
/// reachable from anywhere. A `Done` entry is never polled; if it is, the
/// report is ignored.
pub fn on_poll(current: LedgerStatus, report: StatusReport) -> Transition {
    match (current, report) {
        (LedgerStatus::Done, _) => Transition::Stay,
        (_, StatusReport::Done) => Transition::Finish,
        (LedgerStatus::Running, StatusReport::Running) => Transition::Stay,
        (_, StatusReport::Running) => Transition::Move(LedgerStatus::Running),
        (LedgerStatus::Unknown, StatusReport::Unknown) => Transition::Stay,
        (_, StatusReport::Unknown) => Transition::Move(LedgerStatus::Unknown),
    }
}
