//! Game-thread marshaling for state bag mutations.
//!
//! The store may be called from any thread, but change callbacks must run on
//! the game thread. A [`GameInterface`] reports whether the caller is off
//! that thread and, if so, accepts a task to run there later.

use crossbeam_channel::{Receiver, Sender, unbounded};

/// Work deferred to the game thread.
pub type GameTask = Box<dyn FnOnce() + Send>;

/// Hop onto the game thread.
pub trait GameInterface: Send + Sync {
    /// Whether callbacks must be deferred through [`queue_task`](Self::queue_task).
    fn is_asynchronous(&self) -> bool;

    /// Run `task` on the game thread at the next opportunity.
    fn queue_task(&self, task: GameTask);
}

/// Runs everything immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineGameInterface;

impl GameInterface for InlineGameInterface {
    fn is_asynchronous(&self) -> bool {
        false
    }

    fn queue_task(&self, task: GameTask) {
        task();
    }
}

/// Queues tasks on a channel the game thread drains with
/// [`run_pending`](QueuedGameInterface::run_pending).
pub struct QueuedGameInterface {
    tx: Sender<GameTask>,
    rx: Receiver<GameTask>,
}

impl QueuedGameInterface {
    /// Create an empty queue.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Run every queued task; returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(task) = self.rx.try_recv() {
            task();
            ran += 1;
        }
        ran
    }

    /// Number of tasks waiting.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }
}

impl Default for QueuedGameInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl GameInterface for QueuedGameInterface {
    fn is_asynchronous(&self) -> bool {
        true
    }

    fn queue_task(&self, task: GameTask) {
        // the receiver lives in self, so the channel cannot be disconnected
        let _ = self.tx.send(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_inline_runs_immediately() {
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        InlineGameInterface.queue_task(Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_queued_defers_until_drained() {
        let game = QueuedGameInterface::new();
        let hits = Arc::new(AtomicU32::new(0));
        for _ in 0..3 {
            let h = hits.clone();
            game.queue_task(Box::new(move || {
                h.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(game.pending(), 3);
        assert_eq!(game.run_pending(), 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
