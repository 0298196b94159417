//! Status events and the cooperative task queue that non-blocking
//! progression runs on, plus the timer that posts stage deadlines onto it.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{
    bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError,
};
use serde::Serialize;
use tracing::{debug, warn};

use crate::context::{ConnectionStatus, Operation};
use crate::device::SimState;
use crate::error::{CellularError, Result};
use crate::network::{AttachStatus, RegistrationStatus, SignalQuality};

/// Broadcast by the device to every context and to the device callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "value")]
pub enum CellularEvent {
    DeviceReady,
    SimStatusChanged(SimState),
    RegistrationStatusChanged(RegistrationStatus),
    AttachStatusChanged(AttachStatus),
    SignalQualityChanged(SignalQuality),
    /// Emitted by a context to its own callback only.
    ConnectionStatusChanged(ConnectionStatus),
    /// A non-blocking stage attempt ended in failure.
    OperationFailed {
        operation: Operation,
        error: CellularError,
    },
}

pub type StatusCallback = Arc<dyn Fn(&CellularEvent) + Send + Sync>;

// ─── EventQueue ──────────────────────────────────────────────────────────────

pub type Task = Box<dyn FnOnce() + Send>;

/// Bounded FIFO of short tasks. Cloning yields another handle to the same
/// queue.
#[derive(Clone)]
pub struct EventQueue {
    tx: Sender<Task>,
    rx: Receiver<Task>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    /// Enqueue without blocking.
    pub fn post(&self, task: Task) -> Result<()> {
        match self.tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(capacity = ?self.tx.capacity(), "event queue full");
                Err(CellularError::NoMemory)
            }
            Err(TrySendError::Disconnected(_)) => Err(CellularError::NoMemory),
        }
    }

    /// Run queued tasks on the calling thread until the queue is empty,
    /// including tasks posted by the tasks themselves. Returns how many ran.
    pub fn dispatch_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            match self.rx.try_recv() {
                Ok(task) => {
                    task();
                    ran += 1;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return ran,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Start a dedicated thread that drains this queue until the returned
    /// dispatcher is dropped.
    pub fn spawn_dispatcher(&self, name: &str) -> anyhow::Result<EventDispatcher> {
        let rx = self.rx.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || dispatcher_worker(rx, stop_flag))?;
        debug!(thread = name, "event dispatcher started");
        Ok(EventDispatcher {
            stop,
            handle: Some(handle),
        })
    }

    /// Start a timer thread that posts each scheduled task onto this queue
    /// once its deadline passes. At most `capacity` schedules may be in
    /// transit to the thread.
    pub fn spawn_deadline_timer(
        &self,
        name: &str,
        capacity: usize,
    ) -> anyhow::Result<(Deadlines, EventDispatcher)> {
        let (tx, rx) = bounded(capacity.max(1));
        let queue = self.tx.clone();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || deadline_worker(rx, queue, stop_flag))?;
        debug!(thread = name, "deadline timer started");
        Ok((
            Deadlines { tx },
            EventDispatcher {
                stop,
                handle: Some(handle),
            },
        ))
    }
}

/// Handle for scheduling delayed tasks onto an [`EventQueue`].
#[derive(Clone)]
pub struct Deadlines {
    tx: Sender<(Instant, Task)>,
}

impl Deadlines {
    /// Post `task` to the queue after `delay`. Never blocks.
    pub fn schedule(&self, delay: Duration, task: Task) -> Result<()> {
        self.tx
            .try_send((Instant::now() + delay, task))
            .map_err(|_| CellularError::NoMemory)
    }
}

/// Owns a background thread serving an [`EventQueue`]. Dropping it stops
/// and joins the thread.
pub struct EventDispatcher {
    stop: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl EventDispatcher {
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            // Dropped from one of its own tasks: the loop exits on its own.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for EventDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

const WORKER_POLL: Duration = Duration::from_millis(50);

fn dispatcher_worker(rx: Receiver<Task>, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Relaxed) {
        if let Ok(task) = rx.recv_timeout(WORKER_POLL) {
            task();
        }
    }
}

fn deadline_worker(rx: Receiver<(Instant, Task)>, queue: Sender<Task>, stop: Arc<AtomicBool>) {
    let mut order: BinaryHeap<Reverse<(Instant, u64)>> = BinaryHeap::new();
    let mut tasks: HashMap<u64, Task> = HashMap::new();
    let mut next_seq = 0u64;

    while !stop.load(Ordering::Relaxed) {
        let now = Instant::now();
        while let Some(&Reverse((at, seq))) = order.peek() {
            if at > now {
                break;
            }
            let Some(task) = tasks.remove(&seq) else {
                order.pop();
                continue;
            };
            match queue.try_send(task) {
                Ok(()) => {
                    order.pop();
                }
                // Stays due; retried on the next pass.
                Err(TrySendError::Full(task)) => {
                    tasks.insert(seq, task);
                    break;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }

        let wait = order
            .peek()
            .map(|Reverse((at, _))| at.saturating_duration_since(now))
            .unwrap_or(WORKER_POLL)
            .min(WORKER_POLL);
        match rx.recv_timeout(wait) {
            Ok((at, task)) => {
                order.push(Reverse((at, next_seq)));
                tasks.insert(next_seq, task);
                next_seq += 1;
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
