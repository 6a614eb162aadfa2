//! Process lifecycle monitoring
//!
//! Two independent interrupt sources race: an OS termination signal and
//! the background watch on the tunnel processes. The monitor merges them
//! into one terminal event; whichever fires first wins and the loser's
//! channel is abandoned, which is benign because both paths end in process
//! death.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kubetun_transport::{BackgroundExit, ProcessWatch};
use tokio::sync::mpsc;

/// The single terminal event of a connect process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterruptEvent {
    /// Explicit OS-level termination request (ctrl-c)
    UserTerminate,
    /// A watched background process exited unexpectedly
    BackgroundFailure(String),
}

impl fmt::Display for InterruptEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UserTerminate => write!(f, "interrupt"),
            Self::BackgroundFailure(reason) => write!(f, "background failure ({reason})"),
        }
    }
}

/// Merges the two interrupt sources into exactly one event.
pub struct LifecycleMonitor {
    background_rx: mpsc::Receiver<BackgroundExit>,
}

impl LifecycleMonitor {
    /// Create the monitor and the watch handle for background processes.
    pub fn new() -> (Self, ProcessWatch) {
        let (watch, background_rx) = ProcessWatch::channel();
        (Self { background_rx }, watch)
    }

    /// Block until either interrupt source fires.
    pub async fn wait(mut self) -> InterruptEvent {
        let background = async {
            loop {
                match self.background_rx.recv().await {
                    Some(exit) => break exit,
                    // All watch handles dropped: no background source left,
                    // only the signal path can end the process now.
                    None => std::future::pending::<()>().await,
                }
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => InterruptEvent::UserTerminate,
            exit = background => InterruptEvent::BackgroundFailure(exit.reason),
        }
    }
}

/// Single-use latch guarding the cleanup routine, so cleanup executes at
/// most once even if multiple paths reach it near-simultaneously.
#[derive(Debug, Clone, Default)]
pub struct CleanupLatch(Arc<AtomicBool>);

impl CleanupLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true exactly once, for the caller that gets to clean up.
    pub fn begin(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }
}
