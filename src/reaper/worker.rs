//! The monitor loop and bounded worker pool (spec.md §4.3).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::interval;

use super::conn::ConnState;

struct Node {
    state: Arc<ConnState>,
    last_observed: u64,
    miss: u32,
}

impl Node {
    fn new(state: Arc<ConnState>) -> Self {
        Self {
            state,
            last_observed: 0,
            miss: 0,
        }
    }
}

struct Slot {
    id: u64,
    tx: mpsc::Sender<Arc<ConnState>>,
}

/// Owns the bounded set of monitor workers for one wrapped listener or
/// dialer. Dispatch tries existing workers first and only spawns a new one,
/// up to `cap`, when every existing worker's in-channel would block.
pub(crate) struct WorkerPool {
    slots: Mutex<Vec<Slot>>,
    next_id: AtomicU64,
    cap: usize,
    timeout: Duration,
    interval: Duration,
}

/// `max_miss = ceil(timeout / interval)`, floored at 1 (spec.md §4.3).
fn max_miss(timeout: Duration, interval: Duration) -> u32 {
    if interval.is_zero() {
        return 1;
    }
    let ticks = timeout.as_secs_f64() / interval.as_secs_f64();
    (ticks.ceil() as u32).max(1)
}

impl WorkerPool {
    pub(crate) fn new(timeout: Duration, interval: Duration, cap: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            cap: cap.max(1),
            timeout,
            interval,
        })
    }

    /// Hands a freshly-wrapped connection to a worker, spawning one if
    /// needed and the cap allows it, otherwise retrying delivery to
    /// existing workers until one accepts it.
    pub(crate) async fn dispatch(self: &Arc<Self>, state: Arc<ConnState>) {
        loop {
            // Try every existing worker's in-channel, non-blocking.
            let existing: Vec<mpsc::Sender<Arc<ConnState>>> =
                self.slots.lock().unwrap().iter().map(|s| s.tx.clone()).collect();
            for tx in &existing {
                match tx.try_send(state.clone()) {
                    Ok(()) => return,
                    Err(mpsc::error::TrySendError::Full(_)) => continue,
                    Err(mpsc::error::TrySendError::Closed(_)) => continue,
                }
            }

            if self.try_spawn(state.clone()) {
                return;
            }

            // Cap reached and every worker's channel is momentarily full:
            // yield and retry rather than blocking the caller forever.
            tokio::task::yield_now().await;
        }
    }

    fn try_spawn(self: &Arc<Self>, initial: Arc<ConnState>) -> bool {
        let mut slots = self.slots.lock().unwrap();
        if slots.len() >= self.cap {
            return false;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Capacity 1, not buffered (spec.md §5, "producers communicate via
        // an unbuffered channel"): a worker whose channel is already full
        // must report `would-block` back to `dispatch`, which is what
        // actually triggers spawning an additional worker up to `cap`.
        let (tx, rx) = mpsc::channel(1);
        slots.push(Slot { id, tx });
        drop(slots);

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            run_worker(pool, id, rx, initial).await;
        });
        true
    }

    fn remove(&self, id: u64) {
        self.slots.lock().unwrap().retain(|s| s.id != id);
    }

    #[cfg(test)]
    pub(crate) fn worker_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

async fn run_worker(
    pool: Arc<WorkerPool>,
    id: u64,
    mut rx: mpsc::Receiver<Arc<ConnState>>,
    initial: Arc<ConnState>,
) {
    let max_miss = max_miss(pool.timeout, pool.interval);
    let mut nodes = vec![Node::new(initial)];
    let mut ticker = interval(pool.interval);
    ticker.tick().await; // first tick fires immediately; consume it up front.
    let mut empty_ticks = 0u32;

    loop {
        tokio::select! {
            biased;
            maybe = rx.recv() => {
                match maybe {
                    Some(state) => {
                        nodes.push(Node::new(state));
                        empty_ticks = 0;
                    }
                    None => break,
                }
            }
            _ = ticker.tick() => {
                nodes.retain_mut(|node| {
                    if node.state.is_closed() {
                        return false;
                    }
                    if !node.state.monitor_enabled() {
                        return true;
                    }
                    let current = node.state.count();
                    if current == node.last_observed {
                        node.miss += 1;
                    } else {
                        node.miss = 0;
                        node.last_observed = current;
                    }
                    if node.miss >= max_miss {
                        node.state.try_close();
                        return false;
                    }
                    true
                });

                if nodes.is_empty() {
                    empty_ticks += 1;
                    if empty_ticks >= 2 {
                        break;
                    }
                } else {
                    empty_ticks = 0;
                }
            }
        }
    }

    // Remove this worker from the pool before returning, so no `dispatch`
    // snapshot taken from here on can hand it more work, then drain
    // whatever a send that raced the idle-exit decision already placed in
    // the channel and re-dispatch it -- otherwise it would be silently
    // dropped along with `rx`, leaving a connection unmonitored (spec.md §8
    // properties 5/6).
    pool.remove(id);
    while let Ok(state) = rx.try_recv() {
        pool.dispatch(state).await;
    }
}
