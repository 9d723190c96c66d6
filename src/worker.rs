//! Background worker execution.
//!
//! The preferred way to run an attack is on a dedicated worker thread, so
//! the calling thread stays responsive without relying on the cooperative
//! yields of the same-thread fallback. Communication uses a tagged
//! request/response protocol correlated by [`TaskId`]; an `Init`/`Ready`
//! handshake must complete before the first real task is accepted.
//!
//! A worker fault (panic, closed channel) permanently poisons the
//! [`CloakWorker`] for the rest of the session: the in-flight task is
//! reported as cancelled, and the caller is expected to fall back to the
//! same-thread path for subsequent work. Panics are contained and logged,
//! never propagated into the calling thread.

use std::{
    io,
    thread::{self, JoinHandle},
    time::Duration,
};

use crossbeam::channel::{self, Receiver, Sender};

use crate::{
    attack::{AttackConfig, Progress},
    cancel::CancelToken,
    drop::defer,
    process::ProcessOutput,
    throttle::Priority,
    CloakError, Result,
};

/// How long the `Init`/`Ready` handshake may take before the worker is
/// declared unusable.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Correlates responses with the request that caused them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(u64);

/// Messages sent to the worker thread.
pub enum Request {
    /// Handshake probe. The worker answers with [`Response::Ready`].
    Init,
    /// Run the full pipeline on raw image bytes.
    Process {
        task: TaskId,
        data: Vec<u8>,
        config: AttackConfig,
        cancel: CancelToken,
        priority: Priority,
    },
}

/// Messages sent back from the worker thread.
pub enum Response {
    /// Handshake acknowledgement.
    Ready,
    /// Progress of the task identified by `task`.
    Progress { task: TaskId, progress: Progress },
    /// Terminal outcome of the task identified by `task`.
    Finished {
        task: TaskId,
        result: Result<ProcessOutput>,
    },
}

/// A handle to the background processing thread.
pub struct CloakWorker {
    worker: Worker<Request>,
    events: Receiver<Response>,
    poisoned: bool,
    next_task: u64,
}

impl CloakWorker {
    /// Spawns the worker thread and performs the handshake.
    pub fn spawn() -> io::Result<Self> {
        let (events_tx, events_rx) = channel::unbounded();
        let worker = Worker::builder()
            .name("kasumi-worker")
            .spawn(move |request| handle_request(request, &events_tx))?;

        let mut this = Self {
            worker,
            events: events_rx,
            poisoned: false,
            next_task: 0,
        };
        this.handshake()?;
        Ok(this)
    }

    fn handshake(&mut self) -> io::Result<()> {
        if self.worker.send(Request::Init).is_err() {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "worker thread exited before handshake",
            ));
        }
        match self.events.recv_timeout(HANDSHAKE_TIMEOUT) {
            Ok(Response::Ready) => Ok(()),
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected response during handshake",
            )),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "worker handshake timed out",
            )),
        }
    }

    /// Whether a fault has permanently disabled this worker.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Runs one task to completion on the worker, forwarding progress
    /// reports to `progress`.
    ///
    /// Only one task runs at a time; this blocks until the terminal
    /// response arrives. If the worker dies mid-task, the task is reported
    /// as [`CloakError::Cancelled`] and the worker is poisoned.
    pub fn submit(
        &mut self,
        data: Vec<u8>,
        config: AttackConfig,
        cancel: CancelToken,
        priority: Priority,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<ProcessOutput> {
        assert!(!self.poisoned, "task submitted to a poisoned worker");

        let task = TaskId(self.next_task);
        self.next_task += 1;

        let request = Request::Process {
            task,
            data,
            config,
            cancel,
            priority,
        };
        if self.worker.send(request).is_err() {
            self.poison("worker thread died before accepting the task");
            return Err(CloakError::Cancelled);
        }

        loop {
            match self.events.recv() {
                Ok(Response::Progress { task: t, progress: p }) if t == task => progress(p),
                Ok(Response::Finished { task: t, result }) if t == task => return result,
                // Stale traffic from an earlier, abandoned task.
                Ok(_) => continue,
                Err(_) => {
                    self.poison("worker thread died mid-task");
                    return Err(CloakError::Cancelled);
                }
            }
        }
    }

    fn poison(&mut self, why: &str) {
        log::error!("{why}; disabling worker for this session");
        self.poisoned = true;
    }
}

fn handle_request(request: Request, events: &Sender<Response>) {
    match request {
        Request::Init => {
            events.send(Response::Ready).ok();
        }
        Request::Process {
            task,
            data,
            config,
            cancel,
            priority,
        } => {
            let mut forward = |p: Progress| {
                events
                    .send(Response::Progress { task, progress: p })
                    .ok();
            };
            let result =
                crate::process::run_pipeline(&data, &config, cancel, priority, &mut forward);
            events.send(Response::Finished { task, result }).ok();
        }
    }
}

/// A builder object that can be used to configure and spawn a [`Worker`].
#[derive(Clone)]
pub struct WorkerBuilder {
    name: Option<String>,
    capacity: usize,
}

impl WorkerBuilder {
    /// Sets the name of the [`Worker`] thread.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the channel capacity of the [`Worker`].
    ///
    /// By default, a capacity of 0 is used, which means that [`Worker::send`]
    /// will block until the worker has finished processing any preceding
    /// message.
    pub fn capacity(self, capacity: usize) -> Self {
        Self { capacity, ..self }
    }

    /// Spawns a [`Worker`] thread that uses `handler` to process incoming
    /// messages.
    pub fn spawn<I, F>(self, mut handler: F) -> io::Result<Worker<I>>
    where
        I: Send + 'static,
        F: FnMut(I) + Send + 'static,
    {
        let (sender, recv) = channel::bounded(self.capacity);
        let mut builder = thread::Builder::new();
        if let Some(name) = self.name.clone() {
            builder = builder.name(name);
        }
        let handle = builder.spawn(move || {
            let _guard;
            if let Some(name) = self.name {
                log::trace!("worker '{name}' starting");
                _guard = defer(move || log::trace!("worker '{name}' exiting"));
            }
            for message in recv {
                handler(message);
            }
        })?;

        Ok(Worker {
            sender: Some(sender),
            handle: Some(handle),
        })
    }
}

/// Error returned by [`Worker::send`] when the worker thread is gone.
#[derive(Debug, Clone, Copy)]
pub struct WorkerGone {
    _priv: (),
}

/// A handle to a worker thread that processes messages of type `I`.
///
/// When dropped, the channel to the thread is closed and the thread joined.
/// A panic on the worker thread is logged, not propagated: from the outside
/// a panicked worker is indistinguishable from one that exited, and the
/// protocol layer above treats both as a fault.
pub struct Worker<I: Send + 'static> {
    sender: Option<Sender<I>>,
    handle: Option<JoinHandle<()>>,
}

impl<I: Send + 'static> Drop for Worker<I> {
    fn drop(&mut self) {
        // Close the channel to signal the thread to exit.
        drop(self.sender.take());
        self.wait_for_exit();
    }
}

impl Worker<()> {
    /// Returns a builder that can be used to configure and spawn a [`Worker`].
    #[inline]
    pub fn builder() -> WorkerBuilder {
        WorkerBuilder {
            name: None,
            capacity: 0,
        }
    }
}

impl<I: Send + 'static> Worker<I> {
    fn wait_for_exit(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("worker thread panicked");
            }
        }
    }

    /// Sends a message to the worker thread.
    ///
    /// Blocks until the thread is available to accept the message. Fails if
    /// the thread has exited (normally or by panic); the thread is joined
    /// before this returns.
    pub fn send(&mut self, msg: I) -> Result<(), WorkerGone> {
        match self.sender.as_ref() {
            Some(sender) if sender.send(msg).is_ok() => Ok(()),
            _ => {
                self.wait_for_exit();
                Err(WorkerGone { _priv: () })
            }
        }
    }
}
