//! Messages delivered to group actors.
//!
//! Everything a group reacts to arrives through one channel, so the group
//! handles host events, commands and its own timers strictly in order.

use tokio::sync::oneshot;

use super::event::StateChangedEvent;
use super::state::CorrelationId;
use crate::climate::EnforceOutcome;
use crate::climate::GroupCommand;
use crate::climate::GroupError;

#[derive(Debug)]
pub enum GroupMessage {
    /// A host entity changed state.
    StateChanged(StateChangedEvent),

    /// A command from the API or another caller, answered on `reply`.
    Command {
        command: GroupCommand,
        reply: oneshot::Sender<Result<(), GroupError>>,
    },

    /// A window control timer fired. Timers from before the latest reschedule
    /// carry an older generation.
    WindowTimer { generation: u64 },

    /// A sync enforcement run tagged with `context` finished.
    EnforcementDone {
        context: CorrelationId,
        outcome: EnforceOutcome,
    },

    /// The capitulation timeout of the sync snapshot opened as `generation`
    /// expired.
    CapitulationTimer { generation: u64 },

    /// Recompute the aggregate without any new input.
    Refresh,

    Shutdown,
}
