//! Run control channel.
//!
//! Callers hold a [`RunController`] and the driver drains the matching
//! receiver before every dispatch. A cancel request never interrupts the
//! handler that is already running; it stops the next step from starting.

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, error::TryRecvError, unbounded_channel};
use tracing::info;

/// Commands a caller can send to a running workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunControl {
    Cancel,
}

/// Sending half handed to the caller.
#[derive(Debug, Clone)]
pub struct RunController {
    sender: UnboundedSender<RunControl>,
}

impl RunController {
    /// Requests cancellation. Returns false when the run already finished.
    pub fn cancel(&self) -> bool {
        self.sender.send(RunControl::Cancel).is_ok()
    }
}

/// Creates a controller and the receiver to pass to the engine.
pub fn control_channel() -> (RunController, UnboundedReceiver<RunControl>) {
    let (sender, receiver) = unbounded_channel();
    (RunController { sender }, receiver)
}

/// Driver-side view of the control channel.
#[derive(Debug, Default)]
pub struct ControlState {
    receiver: Option<UnboundedReceiver<RunControl>>,
    cancel_requested: bool,
}

impl ControlState {
    pub fn new(receiver: Option<UnboundedReceiver<RunControl>>) -> Self {
        Self {
            receiver,
            cancel_requested: false,
        }
    }

    /// Drains pending commands and reports whether cancellation was requested.
    pub fn cancel_requested(&mut self) -> bool {
        self.drain_pending_commands();
        self.cancel_requested
    }

    fn drain_pending_commands(&mut self) {
        let Some(receiver) = self.receiver.as_mut() else {
            return;
        };
        loop {
            match receiver.try_recv() {
                Ok(RunControl::Cancel) => {
                    if !self.cancel_requested {
                        info!("cancellation requested");
                    }
                    self.cancel_requested = true;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.receiver = None;
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_sticky() {
        let (controller, receiver) = control_channel();
        let mut state = ControlState::new(Some(receiver));
        assert!(!state.cancel_requested());
        assert!(controller.cancel());
        assert!(state.cancel_requested());
        drop(controller);
        assert!(state.cancel_requested());
    }

    #[test]
    fn missing_receiver_never_cancels() {
        let mut state = ControlState::new(None);
        assert!(!state.cancel_requested());
    }
}
