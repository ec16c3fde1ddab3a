use crate::stream::types::SessionPhase;
use tokio_util::sync::CancellationToken;

/// Transition triggers for the connection lifecycle. The transport reports
/// open/close on its own schedule, so transitions are total: a trigger that is
/// not valid for the current phase leaves it unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    StartRequested,
    TransportOpen,
    StopRequested,
    TransportClosed,
    ConnectFailed,
}

impl SessionPhase {
    pub fn can_start(self) -> bool {
        matches!(self, Self::Idle | Self::Closed | Self::Failed)
    }

    pub fn can_stop(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Open)
    }

    pub fn transition(self, event: SessionEvent) -> Self {
        match (self, event) {
            (phase, SessionEvent::StartRequested) if phase.can_start() => Self::Connecting,
            (Self::Connecting, SessionEvent::TransportOpen) => Self::Open,
            (phase, SessionEvent::StopRequested) if phase.can_stop() => Self::Closing,
            // A close notification lands in Closed whether or not we asked
            // for it, so a later start() sees a clean slot.
            (Self::Connecting | Self::Open | Self::Closing | Self::Closed, SessionEvent::TransportClosed) => {
                Self::Closed
            }
            (Self::Connecting, SessionEvent::ConnectFailed) => Self::Failed,
            (phase, _) => phase,
        }
    }
}

/// Handle for one spawned session task. Owned exclusively by the controller's
/// session slot; the epoch distinguishes stale async resolutions from the
/// current session.
#[derive(Debug)]
pub struct SessionHandle {
    pub epoch: u64,
    pub cancel: CancellationToken,
    pub join: tokio::task::JoinHandle<()>,
}
