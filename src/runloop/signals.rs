//! OS signal to loop-event forwarding.
//!
//! tokio's signal driver does the async-signal-safe part (a self-pipe write);
//! the tasks here only turn each delivery into a [`LoopEvent`] for the
//! dispatch loop. SIGINT and SIGWINCH get separate streams and separate
//! events so one can never be mistaken for the other.

use std::io;

use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::LoopEvent;

/// Running forwarder tasks. Dropping this stops forwarding.
pub(crate) struct SignalForwarders {
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for SignalForwarders {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Subscribe to SIGINT and SIGWINCH and post them to `events`.
///
/// Installing the SIGINT listener replaces the default disposition, so an
/// interrupt no longer kills the process outright. Must be called from
/// within a tokio runtime.
pub(crate) fn forward(events: UnboundedSender<LoopEvent>) -> io::Result<SignalForwarders> {
    let mut interrupts = signal(SignalKind::interrupt())?;
    let mut resizes = signal(SignalKind::window_change())?;

    let interrupt_events = events.clone();
    let interrupt_task = tokio::spawn(async move {
        while interrupts.recv().await.is_some() {
            debug!("SIGINT received");
            if interrupt_events.send(LoopEvent::Interrupt).is_err() {
                break;
            }
        }
    });

    let resize_task = tokio::spawn(async move {
        while resizes.recv().await.is_some() {
            trace!("SIGWINCH received");
            if events.send(LoopEvent::WindowChanged).is_err() {
                break;
            }
        }
    });

    Ok(SignalForwarders {
        tasks: vec![interrupt_task, resize_task],
    })
}
