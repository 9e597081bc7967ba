//! Dispatches pushed `INTERRUPT` messages to per-device callbacks (§4.F).
//!
//! [`Router::push`] is called from a transport's reader thread and must be
//! cheap: it enqueues onto a bounded per-device queue (evicting the oldest
//! entry on overflow) and wakes the dispatch thread, which is the only thread
//! that ever invokes a registered callback. This keeps driver-facing callback
//! code off the reader thread, so a slow or re-entrant handler cannot stall a
//! transport's inbound reads.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

/// Per-device backlog cap. A push past this evicts the oldest pending irq id.
pub const QUEUE_CAPACITY: usize = 64;

type Callback = Arc<dyn Fn(u32, u32) + Send + Sync>;

struct SharedState {
    queues: RwLock<HashMap<u32, Mutex<VecDeque<u32>>>>,
    callbacks: RwLock<HashMap<u32, Callback>>,
    dropped: RwLock<HashMap<u32, AtomicU64>>,
}

impl SharedState {
    fn new() -> Self {
        SharedState {
            queues: RwLock::new(HashMap::new()),
            callbacks: RwLock::new(HashMap::new()),
            dropped: RwLock::new(HashMap::new()),
        }
    }

    fn record_drop(&self, device_id: u32) {
        if let Some(counter) = self.dropped.read().unwrap().get(&device_id) {
            counter.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.dropped
            .write()
            .unwrap()
            .entry(device_id)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }
}

/// Owns the per-device queues and callback table. One dispatch thread drains
/// every device's queue; `push` never blocks on a callback.
pub struct Router {
    state: Arc<SharedState>,
    wake_tx: mpsc::Sender<u32>,
    dispatch_thread: Option<JoinHandle<()>>,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        let state = Arc::new(SharedState::new());
        let (wake_tx, wake_rx) = mpsc::channel();
        let dispatch_thread = std::thread::Builder::new()
            .name("icd3-interrupt-dispatch".into())
            .spawn({
                let state = Arc::clone(&state);
                move || dispatch_loop(wake_rx, state)
            })
            .expect("spawning the interrupt dispatch thread");

        Router {
            state,
            wake_tx,
            dispatch_thread: Some(dispatch_thread),
        }
    }

    /// Registers (or replaces) the callback for `device_id`. Only affects
    /// irqs pushed from this point on: per spec §4.F, an irq pushed while no
    /// callback is registered is dropped immediately (see [`Router::push`]),
    /// so there is never a backlog to flush when a callback shows up.
    pub fn register_callback(&self, device_id: u32, cb: impl Fn(u32, u32) + Send + Sync + 'static) {
        self.state
            .callbacks
            .write()
            .unwrap()
            .insert(device_id, Arc::new(cb));
    }

    pub fn unregister_callback(&self, device_id: u32) {
        self.state.callbacks.write().unwrap().remove(&device_id);
    }

    /// Enqueues `irq_id` for `device_id`, evicting the oldest pending entry
    /// if the per-device queue is already at [`QUEUE_CAPACITY`]. If no
    /// callback is registered for `device_id` at all, the interrupt is
    /// dropped immediately and counted instead of being queued (spec §4.F:
    /// "if no callback is registered, the interrupt is dropped with a
    /// counter increment").
    pub fn push(&self, device_id: u32, irq_id: u32) {
        if !self.state.callbacks.read().unwrap().contains_key(&device_id) {
            self.state.record_drop(device_id);
            return;
        }

        let overflowed = {
            if let Some(queue) = self.state.queues.read().unwrap().get(&device_id) {
                enqueue(&mut queue.lock().unwrap(), irq_id)
            } else {
                let mut queues = self.state.queues.write().unwrap();
                let queue = queues.entry(device_id).or_insert_with(|| Mutex::new(VecDeque::new()));
                enqueue(&mut queue.lock().unwrap(), irq_id)
            }
        };
        if overflowed {
            self.state.record_drop(device_id);
        }
        let _ = self.wake_tx.send(device_id);
    }

    /// A cloneable sink suitable for handing to [`icd3_transport::Transport::connect`]
    /// as the `on_push` callback.
    pub fn sink(self: &Arc<Self>) -> impl Fn(u32, u32) + Send + Sync + Clone {
        let router = Arc::clone(self);
        move |device_id, irq_id| router.push(device_id, irq_id)
    }

    /// Irqs evicted for `device_id` due to queue overflow, total since the
    /// router was created. Ambient diagnostic, not part of the façade API.
    pub fn dropped_count(&self, device_id: u32) -> u64 {
        self.state
            .dropped
            .read()
            .unwrap()
            .get(&device_id)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

impl Drop for Router {
    fn drop(&mut self) {
        // Dropping the sender breaks the dispatch thread out of its recv loop.
        if let Some(handle) = self.dispatch_thread.take() {
            drop(std::mem::replace(&mut self.wake_tx, mpsc::channel().0));
            let _ = handle.join();
        }
    }
}

fn enqueue(queue: &mut VecDeque<u32>, irq_id: u32) -> bool {
    let overflowed = queue.len() >= QUEUE_CAPACITY;
    if overflowed {
        queue.pop_front();
    }
    queue.push_back(irq_id);
    overflowed
}

fn dispatch_loop(wake_rx: mpsc::Receiver<u32>, state: Arc<SharedState>) {
    for device_id in wake_rx.iter() {
        loop {
            let next = match state.queues.read().unwrap().get(&device_id) {
                Some(queue) => queue.lock().unwrap().pop_front(),
                None => None,
            };
            let Some(irq_id) = next else { break };

            // Look up and clone the callback, then drop the lock before
            // invoking it: a callback that calls back into the router
            // (e.g. to unregister itself) must not deadlock.
            let cb = state.callbacks.read().unwrap().get(&device_id).cloned();
            match cb {
                Some(cb) => cb(device_id, irq_id),
                None => {
                    // The callback was unregistered after this irq was
                    // queued but before it was dispatched; count it the same
                    // as a push with no callback registered at all (§4.F).
                    state.record_drop(device_id);
                    tracing::debug!(device_id, irq_id, "no callback registered, dropping delivery");
                }
            }
        }
    }
}
