//! Poll cadence as a cancellable stream of tick events.
//!
//! The first tick fires immediately. Each later tick fires one `interval`
//! after [`Ticker::next`] is called again, i.e. after the previous pass has
//! finished, so passes never overlap and a slow pass pushes the schedule
//! back instead of queueing ticks. A poll request fires the next tick
//! early. Shutdown is only observed while waiting.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};

/// Why a tick fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TickCause {
    Startup,
    Interval,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// 1-based sequence number.
    pub seq: u64,
    pub cause: TickCause,
}

enum Wake {
    Shutdown,
    Poll,
    PollClosed,
    Interval,
}

pub struct Ticker {
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
    poll: Option<mpsc::Receiver<()>>,
    seq: u64,
}

impl Ticker {
    pub fn new(interval: Duration, shutdown: broadcast::Receiver<()>) -> Self {
        Self {
            interval,
            shutdown,
            poll: None,
            seq: 0,
        }
    }

    /// Fire early whenever a message arrives on `poll`.
    pub fn with_poll(mut self, poll: mpsc::Receiver<()>) -> Self {
        self.poll = Some(poll);
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait for the next tick. `None` once shutdown was signalled or every
    /// shutdown sender is gone; the sequence does not resume after that.
    pub async fn next(&mut self) -> Option<Tick> {
        match self.shutdown.try_recv() {
            Err(broadcast::error::TryRecvError::Empty) => {}
            _ => return None,
        }

        if self.seq == 0 {
            return Some(self.fire(TickCause::Startup));
        }

        loop {
            let wake = tokio::select! {
                biased;
                _ = self.shutdown.recv() => Wake::Shutdown,
                msg = recv_poll(&mut self.poll) => match msg {
                    Some(()) => Wake::Poll,
                    None => Wake::PollClosed,
                },
                _ = tokio::time::sleep(self.interval) => Wake::Interval,
            };

            match wake {
                Wake::Shutdown => return None,
                Wake::Poll => return Some(self.fire(TickCause::Poll)),
                Wake::Interval => return Some(self.fire(TickCause::Interval)),
                // No poll senders left; fall back to the plain interval.
                Wake::PollClosed => self.poll = None,
            }
        }
    }

    fn fire(&mut self, cause: TickCause) -> Tick {
        self.seq += 1;
        Tick {
            seq: self.seq,
            cause,
        }
    }
}

async fn recv_poll(poll: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match poll {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
