//! Status reporting towards the caller.
//!
//! The caller owns the receiving half of an unbounded channel and polls it at its
//! own pace. Reporting never fails from the acquisition's point of view: a closed
//! receiver just means nobody is listening anymore.

use rand::seq::SliceRandom;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Messages shown when an acquisition starts.
pub const START_MESSAGES: &[&str] = &[
    "⏳ Starting...",
    "🔎 Looking for the best source...",
    "📡 Fetching media...",
    "🎬 Getting your video ready...",
];

/// Messages rotated while the remote worker is busy.
pub const WAITING_MESSAGES: &[&str] = &[
    "Downloading... it can take more time...",
    "⏳ Still working on it...",
    "🛠 Processing on the server...",
    "📦 Almost there, packing the file...",
];

#[derive(Clone, Debug)]
pub struct ProgressReporter {
    sender: Option<mpsc::UnboundedSender<String>>,
}

impl ProgressReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender: Some(sender) }, receiver)
    }

    /// Reporter that drops every update.
    pub fn silent() -> Self {
        Self { sender: None }
    }

    pub fn report(&self, status: impl Into<String>) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(status.into());
        }
    }
}

/// A fixed pool of cosmetic status lines.
#[derive(Clone, Debug)]
pub struct StatusPool {
    messages: Vec<String>,
}

impl StatusPool {
    pub fn new(messages: &[&str]) -> Self {
        Self {
            messages: messages.iter().map(|m| m.to_string()).collect(),
        }
    }

    pub fn pick(&self) -> String {
        self.messages
            .choose(&mut rand::thread_rng())
            .cloned()
            .unwrap_or_default()
    }

    /// Message for the n-th tick, cycling through the pool.
    pub fn rotate(&self, tick: usize) -> String {
        if self.messages.is_empty() {
            return String::new();
        }
        self.messages[tick % self.messages.len()].clone()
    }
}

/// Emits a rotating status line every `interval` until its guard is dropped.
/// A zero interval ticks once per second.
pub struct ProgressTicker;

impl ProgressTicker {
    pub fn start(progress: ProgressReporter, pool: StatusPool, interval: Duration) -> TickerGuard {
        let interval = if interval.is_zero() { Duration::from_secs(1) } else { interval };
        log::debug!("[TICKER] started ({:?} interval)", interval);
        let handle = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            let mut tick = 0usize;
            loop {
                timer.tick().await;
                progress.report(pool.rotate(tick));
                tick += 1;
            }
        });
        TickerGuard { handle }
    }
}

/// Aborts the ticker task when dropped, whichever way the owning scope exits.
pub struct TickerGuard {
    handle: JoinHandle<()>,
}

impl Drop for TickerGuard {
    fn drop(&mut self) {
        self.handle.abort();
        log::debug!("[TICKER] cancelled");
    }
}
