//! Deferred room teardown.
//!
//! DESIGN
//! ======
//! Finished chess rooms linger briefly so clients can show the result, then
//! get deleted by a one-shot background task. Every task is registered here
//! keyed by room id so any path that deletes the room earlier (disconnect
//! sweep) or revives it (reset) can cancel the pending teardown instead of
//! relying on the task to notice the room is gone.
//!
//! A generation counter disambiguates a task's self-removal from a newer
//! task scheduled under the same room id.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Clone, Default)]
pub struct CleanupQueue {
    tasks: Arc<Mutex<HashMap<String, (u64, JoinHandle<()>)>>>,
    next_gen: Arc<AtomicU64>,
}

impl CleanupQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `fut` to run after `delay`. Replaces (and aborts) any task
    /// already scheduled for this room.
    pub fn schedule<F>(&self, room_id: &str, delay: Duration, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_gen.fetch_add(1, Ordering::Relaxed);
        let queue = self.clone();
        let key = room_id.to_string();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            fut.await;
            queue.finished(&key, generation);
        });

        let mut tasks = self.tasks.lock().expect("cleanup mutex poisoned");
        if let Some((_, old)) = tasks.insert(room_id.to_string(), (generation, handle)) {
            old.abort();
        }
    }

    /// Cancel the pending task for a room, if any.
    pub fn cancel(&self, room_id: &str) {
        let mut tasks = self.tasks.lock().expect("cleanup mutex poisoned");
        if let Some((_, handle)) = tasks.remove(room_id) {
            handle.abort();
        }
    }

    /// Whether a teardown is currently scheduled for a room.
    #[must_use]
    pub fn is_scheduled(&self, room_id: &str) -> bool {
        self.tasks
            .lock()
            .expect("cleanup mutex poisoned")
            .contains_key(room_id)
    }

    /// Drop a completed task's own entry, unless a newer task replaced it.
    fn finished(&self, room_id: &str, generation: u64) {
        let mut tasks = self.tasks.lock().expect("cleanup mutex poisoned");
        if tasks.get(room_id).is_some_and(|(r#gen, _)| *r#gen == generation) {
            tasks.remove(room_id);
        }
    }
}
