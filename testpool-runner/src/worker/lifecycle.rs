// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::{
    CallContext, PendingCall, ProcessExit, SetupCache, TerminateSignal,
    pending::PendingCalls,
    transport::{
        OutputTail, ReaderExit, SpawnedProcess, Transport, WorkerCommand, read_responses,
        relay_output, spawn_process, wait_for_port, write_requests,
    },
};
use crate::{
    errors::{CallError, WorkerStartError},
    list::Payload,
};
use std::{
    fmt,
    net::Ipv4Addr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    net::TcpStream,
    process::Child,
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

/// Identifies a worker within a run.
///
/// IDs are never reused: a replacement worker gets a new ID.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// The lifecycle state of a worker.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerState {
    /// The process is running and connected.
    Connected,
    /// The worker is being shut down or killed.
    Terminating,
    /// The worker's process is gone. This state is final.
    Terminated,
}

/// Why a worker was terminated.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TerminateReason {
    /// The worker process exited on its own.
    ProcessExited(ProcessExit),
    /// The connection to the worker closed or failed.
    SocketClosed,
    /// An item running on the worker timed out.
    Timeout,
    /// System memory usage crossed the configured threshold.
    MemoryPressure,
    /// The worker broke the protocol.
    ProtocolViolation,
    /// The worker's startup hook failed.
    StartupFailed,
    /// The run finished, or the worker was otherwise closed on purpose.
    Shutdown,
    /// The run was interrupted more than once.
    Interrupted,
}

impl TerminateReason {
    // For these reasons the process is expected to go away without being asked.
    fn expects_exit(&self) -> bool {
        matches!(self, Self::ProcessExited(_) | Self::SocketClosed)
    }
}

impl fmt::Display for TerminateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProcessExited(exit) => write!(f, "worker process {exit}"),
            Self::SocketClosed => write!(f, "connection to worker closed"),
            Self::Timeout => write!(f, "item timed out"),
            Self::MemoryPressure => write!(f, "memory usage exceeded threshold"),
            Self::ProtocolViolation => write!(f, "protocol violation"),
            Self::StartupFailed => write!(f, "startup hook failed"),
            Self::Shutdown => write!(f, "shut down"),
            Self::Interrupted => write!(f, "run interrupted"),
        }
    }
}

/// Options for starting workers.
#[derive(Clone, Debug)]
pub struct WorkerOptions {
    /// How to launch the worker process.
    pub command: WorkerCommand,

    /// The concurrency hint passed to the worker.
    pub threads: usize,

    /// How long the worker may take to announce its port.
    pub connect_timeout: Duration,

    /// How long to wait after each termination signal.
    pub grace_period: Duration,

    /// If set, a startup hook call with this payload is made right after connecting.
    pub startup_hook: Option<Payload>,

    /// How many of the worker's last output lines to keep for crash reports.
    pub output_tail_lines: usize,

    /// How many times [`Worker::robust_start`] tries to start a worker.
    pub startup_attempts: usize,

    /// The delay between start attempts.
    pub startup_retry_delay: Duration,
}

impl WorkerOptions {
    /// Creates options with default settings for the given command.
    pub fn new(command: WorkerCommand) -> Self {
        Self {
            command,
            threads: 1,
            connect_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(1),
            startup_hook: None,
            output_tail_lines: 20,
            startup_attempts: 3,
            startup_retry_delay: Duration::from_millis(500),
        }
    }
}

/// A handle to a worker process and its connection.
///
/// Cloning a `Worker` is cheap; all clones refer to the same process.
#[derive(Clone, Debug)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Starts a worker and connects to it.
    ///
    /// Returns once the worker has announced its port, the connection is established, and the
    /// startup hook (if any) has completed.
    pub async fn start(id: WorkerId, options: &WorkerOptions) -> Result<Self, WorkerStartError> {
        let tail = Arc::new(OutputTail::new(options.output_tail_lines));
        let mut process = spawn_process(id, options, &tail)?;
        debug!(worker = %id, pid = process.pid, "spawned worker process");

        let handshake = tokio::time::timeout(
            options.connect_timeout,
            wait_for_port(&mut process.stdout, id, &tail),
        )
        .await;
        let port = match handshake {
            Ok(Ok(Some(port))) => port,
            Ok(Ok(None)) => {
                // Stdout closed, which almost always means the process is exiting.
                let exit = match tokio::time::timeout(options.grace_period, process.child.wait())
                    .await
                {
                    Ok(Ok(status)) => ProcessExit::from_status(status, false),
                    _ => {
                        process.kill().await;
                        ProcessExit::Unknown
                    }
                };
                // Give the stderr relay a moment to drain.
                _ = tokio::time::timeout(Duration::from_millis(100), &mut process.stderr_task)
                    .await;
                return Err(WorkerStartError::ExitedDuringStartup {
                    exit,
                    output: tail.snapshot(),
                });
            }
            Ok(Err(err)) => {
                process.kill().await;
                return Err(WorkerStartError::Handshake(err));
            }
            Err(_) => {
                process.kill().await;
                return Err(WorkerStartError::ConnectTimeout {
                    timeout: options.connect_timeout,
                });
            }
        };

        let stream = match TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
            Ok(stream) => stream,
            Err(error) => {
                process.kill().await;
                return Err(WorkerStartError::Connect { port, error });
            }
        };
        _ = stream.set_nodelay(true);

        let worker = Self::connected(id, process, stream, tail, options);
        debug!(worker = %id, pid = worker.pid(), port, "connected to worker");

        if let Some(payload) = &options.startup_hook {
            match worker.call(CallContext::StartupHook, payload.clone()).await {
                Ok(_) => {}
                Err(CallError::WorkerTerminated { .. }) => {
                    let exit = worker
                        .inner
                        .wait_for_exit(options.grace_period)
                        .await
                        .unwrap_or(ProcessExit::Unknown);
                    worker.terminate(TerminateReason::StartupFailed).await;
                    return Err(WorkerStartError::ExitedDuringStartup {
                        exit,
                        output: worker.output_tail(),
                    });
                }
                Err(err) => {
                    worker.terminate(TerminateReason::StartupFailed).await;
                    return Err(WorkerStartError::StartupHook(err));
                }
            }
        }

        Ok(worker)
    }

    /// Starts a worker, retrying a few times if it exits during startup.
    ///
    /// Other start errors, such as a missing executable or a connect timeout, are returned
    /// immediately.
    pub async fn robust_start(
        id: WorkerId,
        options: &WorkerOptions,
    ) -> Result<Self, WorkerStartError> {
        let attempts = options.startup_attempts.max(1);
        let mut attempt = 1;
        loop {
            match Self::start(id, options).await {
                Ok(worker) => return Ok(worker),
                Err(err) if err.is_retryable() && attempt < attempts => {
                    warn!(
                        worker = %id,
                        attempt,
                        attempts,
                        error = %err,
                        "worker failed to start, retrying"
                    );
                    attempt += 1;
                    tokio::time::sleep(options.startup_retry_delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn connected(
        id: WorkerId,
        process: SpawnedProcess,
        stream: TcpStream,
        tail: Arc<OutputTail>,
        options: &WorkerOptions,
    ) -> Self {
        let SpawnedProcess {
            child,
            pid,
            stdout,
            stderr_task,
        } = process;
        let (read_half, write_half) = stream.into_split();
        let pending = Arc::new(PendingCalls::new());
        let (transport, line_rx) = Transport::new(pending.clone());
        let (state_tx, _) = watch::channel(WorkerState::Connected);
        let (exit_tx, exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(WorkerInner {
            id,
            pid,
            transport,
            pending,
            setup_cache: SetupCache::new(),
            state_tx,
            reason: Mutex::new(None),
            exit_rx,
            sent_signal: AtomicBool::new(false),
            kill_tx,
            tail: tail.clone(),
            tasks: Mutex::new(Vec::new()),
            grace_period: options.grace_period,
        });

        let stdout_task = tokio::spawn(relay_output(stdout, id, "stdout", tail));
        let reader_task = {
            let inner = inner.clone();
            tokio::spawn(async move {
                let exit = read_responses(read_half, &inner.pending).await;
                inner.on_reader_exit(exit);
            })
        };
        let writer_task = {
            let inner = inner.clone();
            tokio::spawn(async move {
                if let Err(err) = write_requests(write_half, line_rx).await {
                    debug!(worker = %inner.id, %err, "failed to write to worker");
                    inner.on_connection_lost();
                }
            })
        };
        inner
            .lock_tasks()
            .extend([stderr_task, stdout_task, reader_task, writer_task]);

        // The watchdog owns the child. It is never aborted, so the exit status is always observed.
        tokio::spawn(watch_process(inner.clone(), child, exit_tx, kill_rx));

        Self { inner }
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> WorkerId {
        self.inner.id
    }

    /// Returns the worker's process ID.
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Returns the worker's current state.
    pub fn state(&self) -> WorkerState {
        *self.inner.state_tx.borrow()
    }

    /// Returns true if the worker can accept calls.
    pub fn is_connected(&self) -> bool {
        self.state() == WorkerState::Connected
    }

    /// Sends a call to the worker.
    ///
    /// This returns immediately. The returned call resolves when the worker responds, or with
    /// [`CallError::WorkerTerminated`] if the worker goes away first.
    pub fn call(&self, context: CallContext, payload: Payload) -> PendingCall {
        self.inner.transport.send(Some(context), payload)
    }

    /// Returns the worker's setup cache.
    pub fn setup_cache(&self) -> &SetupCache {
        &self.inner.setup_cache
    }

    /// Returns why the worker was terminated, if it has started terminating.
    pub fn termination_reason(&self) -> Option<TerminateReason> {
        self.inner.lock_reason().clone()
    }

    /// Returns how the worker process exited, if it has.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.inner.exit_rx.borrow()
    }

    /// Returns the last lines the worker printed.
    pub fn output_tail(&self) -> Vec<String> {
        self.inner.tail.snapshot()
    }

    /// Terminates the worker.
    ///
    /// Outstanding calls fail immediately with [`CallError::WorkerTerminated`]. The process group
    /// is then sent SIGINT, SIGTERM and SIGKILL in turn, waiting the grace period after each, until
    /// it exits.
    ///
    /// Terminating is idempotent: if the worker is already terminating, this waits for that to
    /// finish, and the first reason is kept.
    pub async fn terminate(&self, reason: TerminateReason) {
        self.inner.terminate(reason).await;
    }

    /// Shuts the worker down gracefully.
    ///
    /// Sends a shutdown request and waits up to `timeout` for the worker to acknowledge it, then
    /// terminates the worker as usual, giving it a grace period to exit on its own first.
    pub async fn close(&self, timeout: Duration) {
        let inner = &self.inner;
        if !inner.begin_terminating(TerminateReason::Shutdown) {
            inner.wait_terminated().await;
            return;
        }

        let ack = inner.transport.send(None, Payload::null());
        let graceful = matches!(tokio::time::timeout(timeout, ack).await, Ok(Ok(_)));
        if !graceful {
            debug!(worker = %inner.id, "worker did not acknowledge shutdown");
        }
        inner.pending.close_all(CallError::WorkerTerminated {
            reason: TerminateReason::Shutdown,
        });
        inner.finish_terminating(graceful).await;
    }
}

#[derive(Debug)]
struct WorkerInner {
    id: WorkerId,
    pid: u32,
    transport: Transport,
    pending: Arc<PendingCalls>,
    setup_cache: SetupCache,
    state_tx: watch::Sender<WorkerState>,
    reason: Mutex<Option<TerminateReason>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
    sent_signal: AtomicBool,
    kill_tx: mpsc::UnboundedSender<()>,
    tail: Arc<OutputTail>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    grace_period: Duration,
}

impl WorkerInner {
    async fn terminate(&self, reason: TerminateReason) {
        if !self.begin_terminating(reason.clone()) {
            self.wait_terminated().await;
            return;
        }
        debug!(worker = %self.id, pid = self.pid, %reason, "terminating worker");
        let expects_exit = reason.expects_exit();
        self.pending.close_all(CallError::WorkerTerminated { reason });
        self.finish_terminating(expects_exit).await;
    }

    /// Moves the worker to `Terminating`. Returns false if another caller got there first.
    fn begin_terminating(&self, reason: TerminateReason) -> bool {
        let began = self.state_tx.send_if_modified(|state| {
            if *state == WorkerState::Connected {
                *state = WorkerState::Terminating;
                true
            } else {
                false
            }
        });
        if began {
            *self.lock_reason() = Some(reason);
        }
        began
    }

    async fn finish_terminating(&self, expects_exit: bool) {
        let mut exited = expects_exit && self.wait_for_exit(self.grace_period).await.is_some();

        for signal in TerminateSignal::ESCALATION {
            if exited {
                break;
            }
            self.sent_signal.store(true, Ordering::SeqCst);
            debug!(worker = %self.id, pid = self.pid, %signal, "signalling worker");
            signal.send(self.pid);
            if signal == TerminateSignal::Kill {
                _ = self.kill_tx.send(());
            }
            exited = self.wait_for_exit(self.grace_period).await.is_some();
        }
        if !exited {
            warn!(worker = %self.id, pid = self.pid, "worker did not exit after SIGKILL");
        }

        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        self.state_tx.send_replace(WorkerState::Terminated);
        debug!(worker = %self.id, "worker terminated");
    }

    async fn wait_terminated(&self) {
        let mut state_rx = self.state_tx.subscribe();
        _ = state_rx
            .wait_for(|state| *state == WorkerState::Terminated)
            .await;
    }

    async fn wait_for_exit(&self, timeout: Duration) -> Option<ProcessExit> {
        let mut exit_rx = self.exit_rx.clone();
        match tokio::time::timeout(timeout, exit_rx.wait_for(Option::is_some)).await {
            Ok(Ok(exit)) => *exit,
            _ => None,
        }
    }

    fn on_reader_exit(self: &Arc<Self>, exit: ReaderExit) {
        match exit {
            ReaderExit::Eof => {
                debug!(worker = %self.id, "worker closed the connection");
                self.on_connection_lost();
            }
            ReaderExit::Io(err) => {
                debug!(worker = %self.id, %err, "error reading from worker");
                self.on_connection_lost();
            }
            ReaderExit::Protocol(err) => {
                warn!(worker = %self.id, %err, "worker violated the protocol");
                self.pending.close_all(CallError::Protocol(err));
                self.spawn_terminate(TerminateReason::ProtocolViolation);
            }
        }
    }

    fn on_connection_lost(self: &Arc<Self>) {
        self.pending.close_all(CallError::WorkerTerminated {
            reason: TerminateReason::SocketClosed,
        });
        self.spawn_terminate(TerminateReason::SocketClosed);
    }

    // Connection tasks are aborted while terminating, so they hand termination off to a fresh
    // task rather than running it themselves.
    fn spawn_terminate(self: &Arc<Self>, reason: TerminateReason) {
        let inner = self.clone();
        tokio::spawn(async move { inner.terminate(reason).await });
    }

    fn lock_reason(&self) -> std::sync::MutexGuard<'_, Option<TerminateReason>> {
        self.reason.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }
}

async fn watch_process(
    inner: Arc<WorkerInner>,
    mut child: Child,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    mut kill_rx: mpsc::UnboundedReceiver<()>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(()) = kill_rx.recv() => {
                _ = child.start_kill();
            }
        }
    };

    let exit = match status {
        Ok(status) => ProcessExit::from_status(status, inner.sent_signal.load(Ordering::SeqCst)),
        Err(err) => {
            warn!(worker = %inner.id, %err, "failed to wait for worker process");
            ProcessExit::Unknown
        }
    };

    if *inner.state_tx.borrow() == WorkerState::Connected {
        info!(worker = %inner.id, pid = inner.pid, %exit, "worker exited unexpectedly");
    } else {
        debug!(worker = %inner.id, pid = inner.pid, %exit, "worker exited");
    }
    exit_tx.send_replace(Some(exit));
    inner.terminate(TerminateReason::ProcessExited(exit)).await;
}
