// SPDX-License-Identifier: GPL-3.0-only

//! Single-consumer job queues with a dedicated worker thread (spec §4.7).
//!
//! The orchestrator (H) instantiates four of these — master-dark, calibration,
//! registration, stacking — one per pipeline stage. Matches the teacher's
//! preference for one long-lived background thread per stage (see
//! `backends::camera::frame_loop::CaptureLoopController`) over a shared thread
//! pool: each stage has at most one job in flight at a time, so a pool buys
//! nothing here.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, info};

/// A one-shot synchronization point: [`Latch::wait`] blocks until some other party
/// calls [`Latch::release`]. Used by [`Worker::cancel`]/[`Worker::stop`] to let a
/// caller block until the worker has actually quiesced.
#[derive(Clone)]
pub struct Latch(Arc<(Mutex<bool>, Condvar)>);

impl Default for Latch {
    fn default() -> Self {
        Latch(Arc::new((Mutex::new(false), Condvar::new())))
    }
}

impl Latch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self) {
        let (lock, condvar) = &*self.0;
        *lock.lock().unwrap() = true;
        condvar.notify_all();
    }

    pub fn wait(&self) {
        let (lock, condvar) = &*self.0;
        let mut done = lock.lock().unwrap();
        while !*done {
            done = condvar.wait(done).unwrap();
        }
    }
}

struct QueueState<J> {
    items: VecDeque<J>,
    stopping: bool,
    busy: bool,
}

struct Shared<J> {
    queue: Mutex<QueueState<J>>,
    not_empty: Condvar,
    idle: Condvar,
    cancel: AtomicBool,
    started: AtomicBool,
}

/// A single-consumer job queue with a dedicated worker thread.
///
/// `J` is the job type; the closure given to [`Worker::start`] runs once per popped
/// job and is handed a `&AtomicBool` it should poll during any long-running
/// per-job computation (registration, stacking) so [`Worker::cancel`] can interrupt
/// it at its next safe point.
pub struct Worker<J: Send + 'static> {
    name: String,
    shared: Arc<Shared<J>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<J: Send + 'static> Worker<J> {
    pub fn new(name: &str) -> Self {
        Worker {
            name: name.to_string(),
            shared: Arc::new(Shared {
                queue: Mutex::new(QueueState { items: VecDeque::new(), stopping: false, busy: false }),
                not_empty: Condvar::new(),
                idle: Condvar::new(),
                cancel: AtomicBool::new(false),
                started: AtomicBool::new(false),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawns exactly one thread that runs `process` once per popped job.
    /// Idempotent while already running: returns `false` without spawning a second
    /// thread if a previous thread is still alive. Respawns a fresh thread after a
    /// prior [`Self::stop`]/[`Self::wait`] has let the old one exit.
    pub fn start<F>(&self, process: F) -> bool
    where
        F: Fn(J, &AtomicBool) + Send + 'static,
    {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return false;
        }

        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.stopping = false;
        }

        let shared = Arc::clone(&self.shared);
        let name = self.name.clone();

        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                info!(worker = %name, "worker thread started");
                loop {
                    let job = {
                        let mut queue = shared.queue.lock().unwrap();
                        loop {
                            if let Some(job) = queue.items.pop_front() {
                                queue.busy = true;
                                break Some(job);
                            }
                            if queue.stopping {
                                break None;
                            }
                            queue = shared.not_empty.wait(queue).unwrap();
                        }
                    };

                    let Some(job) = job else {
                        break;
                    };

                    shared.cancel.store(false, Ordering::Relaxed);
                    process(job, &shared.cancel);

                    {
                        let mut queue = shared.queue.lock().unwrap();
                        queue.busy = false;
                    }
                    shared.idle.notify_all();
                }
                info!(worker = %name, "worker thread exiting");
            })
            .expect("spawning a worker thread should not fail");

        *self.handle.lock().unwrap() = Some(handle);
        true
    }

    /// Enqueues `items` at the back, preserving push order.
    pub fn push_frames(&self, items: Vec<J>) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.items.extend(items);
        self.shared.not_empty.notify_all();
    }

    /// Enqueues a reference job at the front, leapfrogging any regular frames
    /// already queued. The job currently in flight (if any) has already left the
    /// queue and is unaffected.
    pub fn push_reference_frame(&self, item: J) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.items.push_front(item);
        self.shared.not_empty.notify_all();
    }

    /// Drops all queued items and asks the in-flight job, if any, to interrupt at
    /// its next poll of the cancel flag. Releases `latch`, once given, when the
    /// worker has become quiescent (no job in flight). A worker that was never
    /// started releases the latch immediately.
    pub fn cancel(&self, latch: Option<Latch>) {
        if !self.shared.started.load(Ordering::SeqCst) {
            if let Some(latch) = latch {
                latch.release();
            }
            return;
        }

        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.items.clear();
        }
        self.shared.cancel.store(true, Ordering::Relaxed);
        debug!(worker = %self.name, "cancel requested");

        if let Some(latch) = latch {
            let shared = Arc::clone(&self.shared);
            thread::spawn(move || {
                let mut queue = shared.queue.lock().unwrap();
                while queue.busy {
                    queue = shared.idle.wait(queue).unwrap();
                }
                drop(queue);
                latch.release();
            });
        }
    }

    /// Drains the queue (finishes the current job and all already-queued ones),
    /// then exits the worker thread. Releases `latch`, if given, once the thread
    /// has exited.
    pub fn stop(&self, latch: Option<Latch>) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.stopping = true;
        }
        self.shared.not_empty.notify_all();

        if let Some(latch) = latch {
            self.join_and_allow_restart();
            latch.release();
        }
    }

    /// Drops queued items but keeps the worker thread running for future pushes.
    pub fn reset(&self) {
        let mut queue = self.shared.queue.lock().unwrap();
        queue.items.clear();
    }

    /// Number of jobs still waiting behind the one currently in flight, if any.
    /// Used by the stacking stage to tell whether a just-finished frame was the
    /// last one of the current burst (see spec's default batch-flush behavior).
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().unwrap().items.len()
    }

    /// Blocks until the worker thread exits (following a [`Self::stop`]). Leaves
    /// `started` set, so a worker joined this way must not be [`Self::start`]ed
    /// again; use [`Self::wait`] after [`Self::stop`] instead, which also clears it.
    fn join(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn join_and_allow_restart(&self) {
        self.join();
        self.shared.started.store(false, Ordering::SeqCst);
    }

    /// Blocks until the worker is quiescent.
    ///
    /// After [`Self::cancel`] this means: the in-flight job (if any) has returned
    /// and no new one has been picked up — the worker thread itself stays parked,
    /// ready to accept more work. After [`Self::stop`] this additionally waits for
    /// the worker thread to actually exit and clears `started`, so a later
    /// [`Self::start`] spawns a fresh thread instead of silently no-opping.
    pub fn wait(&self) {
        {
            let mut queue = self.shared.queue.lock().unwrap();
            while queue.busy {
                queue = self.shared.idle.wait(queue).unwrap();
            }
        }

        let stopping = self.shared.queue.lock().unwrap().stopping;
        if stopping {
            self.join_and_allow_restart();
        }
    }
}
