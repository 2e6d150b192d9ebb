// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Spawning worker processes and moving messages to and from them.

use super::{
    CallContext, PendingCall, Request, Response, TerminateReason, WORKER_ID_ENV,
    WORKER_THREADS_ENV, WorkerId, WorkerOptions, pending::PendingCalls, protocol::parse_handshake,
};
use crate::{
    errors::{CallError, ProtocolError, WorkerStartError},
    list::Payload,
};
use std::{
    collections::{BTreeMap, VecDeque},
    ffi::OsString,
    io,
    path::PathBuf,
    process::Stdio,
    sync::{Arc, Mutex},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, Lines},
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    process::{Child, ChildStdout},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::debug;

/// How to launch a worker process.
#[derive(Clone, Debug)]
pub struct WorkerCommand {
    program: PathBuf,
    args: Vec<OsString>,
    env: BTreeMap<String, String>,
}

impl WorkerCommand {
    /// Creates a command that runs `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Adds an argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable for the worker.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Sets several environment variables for the worker.
    pub fn envs(
        mut self,
        vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Returns the program.
    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

/// The last lines a worker printed, kept for crash reports.
#[derive(Debug)]
pub(crate) struct OutputTail {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl OutputTail {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub(crate) fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub(crate) fn snapshot(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        lines.iter().cloned().collect()
    }
}

/// A worker process that has been spawned but not connected to.
pub(crate) struct SpawnedProcess {
    pub(crate) child: Child,
    pub(crate) pid: u32,
    pub(crate) stdout: Lines<BufReader<ChildStdout>>,
    pub(crate) stderr_task: JoinHandle<()>,
}

impl SpawnedProcess {
    /// Kills the process and reaps it.
    pub(crate) async fn kill(&mut self) {
        #[cfg(unix)]
        super::signals::TerminateSignal::Kill.send(self.pid);
        _ = self.child.kill().await;
    }
}

pub(crate) fn spawn_process(
    id: WorkerId,
    options: &WorkerOptions,
    tail: &Arc<OutputTail>,
) -> Result<SpawnedProcess, WorkerStartError> {
    let command = &options.command;
    let spawn_error = |error| WorkerStartError::Spawn {
        program: command.program.display().to_string(),
        error,
    };

    let mut cmd = std::process::Command::new(&command.program);
    cmd.args(&command.args)
        .envs(&command.env)
        .env(WORKER_THREADS_ENV, options.threads.to_string())
        .env(WORKER_ID_ENV, id.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Put the worker in its own process group, so that termination signals reach anything it
    // spawns as well.
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);

    let mut cmd = tokio::process::Command::from(cmd);
    cmd.kill_on_drop(true);
    let mut child = cmd.spawn().map_err(spawn_error)?;

    let (Some(pid), Some(stdout), Some(stderr)) =
        (child.id(), child.stdout.take(), child.stderr.take())
    else {
        return Err(spawn_error(io::Error::other(
            "worker process exited before its pipes could be set up",
        )));
    };

    let stderr_task = tokio::spawn(relay_output(
        BufReader::new(stderr).lines(),
        id,
        "stderr",
        tail.clone(),
    ));

    Ok(SpawnedProcess {
        child,
        pid,
        stdout: BufReader::new(stdout).lines(),
        stderr_task,
    })
}

/// Reads the worker's stdout until it announces its port. Returns `None` if stdout closes first.
pub(crate) async fn wait_for_port(
    stdout: &mut Lines<BufReader<ChildStdout>>,
    id: WorkerId,
    tail: &OutputTail,
) -> io::Result<Option<u16>> {
    while let Some(line) = stdout.next_line().await? {
        if let Some(port) = parse_handshake(&line) {
            return Ok(Some(port));
        }
        debug!(target: "testpool::worker_output", worker = %id, stream = "stdout", "{line}");
        tail.push(line);
    }
    Ok(None)
}

/// Forwards a worker's output to the log, keeping the last few lines.
pub(crate) async fn relay_output<R>(
    mut lines: Lines<BufReader<R>>,
    id: WorkerId,
    stream: &'static str,
    tail: Arc<OutputTail>,
) where
    R: AsyncRead + Unpin,
{
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "testpool::worker_output", worker = %id, stream, "{line}");
        tail.push(line);
    }
}

/// The coordinator's end of a worker connection.
///
/// Requests are queued to a writer task, so sending never blocks.
#[derive(Debug)]
pub(crate) struct Transport {
    line_tx: mpsc::UnboundedSender<String>,
    pending: Arc<PendingCalls>,
}

impl Transport {
    pub(crate) fn new(pending: Arc<PendingCalls>) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        (Self { line_tx, pending }, line_rx)
    }

    /// Sends a request. A `None` context sends a shutdown request.
    pub(crate) fn send(&self, context: Option<CallContext>, payload: Payload) -> PendingCall {
        let call = self.pending.register();
        let request_id = call.request_id();
        let request = match context {
            Some(context) => Request::call(request_id, context, payload),
            None => Request::shutdown(request_id),
        };

        match request.to_line() {
            Ok(line) => {
                if self.line_tx.send(line).is_err() {
                    self.pending.fail(
                        request_id,
                        CallError::WorkerTerminated {
                            reason: TerminateReason::SocketClosed,
                        },
                    );
                }
            }
            Err(err) => self.pending.fail(
                request_id,
                CallError::Protocol(ProtocolError::Encode {
                    message: err.to_string(),
                }),
            ),
        }
        call
    }
}

/// Writes queued request lines to the worker until the queue closes or a write fails.
pub(crate) async fn write_requests(
    mut writer: OwnedWriteHalf,
    mut line_rx: mpsc::UnboundedReceiver<String>,
) -> io::Result<()> {
    while let Some(line) = line_rx.recv().await {
        writer.write_all(line.as_bytes()).await?;
    }
    writer.shutdown().await
}

/// Why the response reader stopped.
#[derive(Debug)]
pub(crate) enum ReaderExit {
    Eof,
    Io(io::Error),
    Protocol(ProtocolError),
}

/// Reads responses from the worker and completes the matching calls.
pub(crate) async fn read_responses(reader: OwnedReadHalf, pending: &PendingCalls) -> ReaderExit {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return ReaderExit::Eof,
            Err(err) => return ReaderExit::Io(err),
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match Response::from_line(&line) {
            Ok(response) => response,
            Err(err) => {
                return ReaderExit::Protocol(ProtocolError::Decode {
                    line,
                    message: err.to_string(),
                });
            }
        };
        if let Err(err) = pending.fulfill(response) {
            return ReaderExit::Protocol(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{CallResult, RequestId};
    use std::net::Ipv4Addr;
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .expect("bound listener");
        let port = listener.local_addr().expect("has address").port();
        let (client, server) = tokio::join!(
            TcpStream::connect((Ipv4Addr::LOCALHOST, port)),
            listener.accept()
        );
        (client.expect("connected"), server.expect("accepted").0)
    }

    #[tokio::test]
    async fn requests_and_out_of_order_responses() {
        let (client, server) = connected_pair().await;
        let (client_read, client_write) = client.into_split();
        let pending = Arc::new(PendingCalls::new());
        let (transport, line_rx) = Transport::new(pending.clone());

        let writer = tokio::spawn(write_requests(client_write, line_rx));
        let reader = {
            let pending = pending.clone();
            tokio::spawn(async move { read_responses(client_read, &pending).await })
        };

        // A fake worker: read two requests, then answer them in reverse order.
        let fake_worker = tokio::spawn(async move {
            let (read, mut write) = server.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut requests = Vec::new();
            for _ in 0..2 {
                let line = lines.next_line().await.expect("read").expect("line");
                requests.push(Request::from_line(&line).expect("valid request"));
            }
            for request in requests.iter().rev() {
                let response = Response::ok(
                    request.request_id,
                    CallResult::Diagnostics {
                        report: format!("answer to {}", request.request_id),
                    },
                );
                write
                    .write_all(response.to_line().expect("encodes").as_bytes())
                    .await
                    .expect("wrote");
            }
            requests
        });

        let first = transport.send(Some(CallContext::Diagnostics), Payload::null());
        let second = transport.send(Some(CallContext::StartupHook), Payload::null());

        match (first.await, second.await) {
            (
                Ok(CallResult::Diagnostics { report: first }),
                Ok(CallResult::Diagnostics { report: second }),
            ) => {
                assert_eq!(first, "answer to 1");
                assert_eq!(second, "answer to 2");
            }
            other => panic!("unexpected results {other:?}"),
        }

        let requests = fake_worker.await.expect("fake worker ran");
        assert_eq!(requests[0].request_id, RequestId(1));
        assert_eq!(requests[0].context, Some(CallContext::Diagnostics));
        assert_eq!(requests[1].context, Some(CallContext::StartupHook));

        // The fake worker hung up, so the reader sees EOF.
        assert!(matches!(reader.await.expect("reader ran"), ReaderExit::Eof));
        drop(transport);
        writer.await.expect("writer ran").ok();
    }

    #[tokio::test]
    async fn garbage_is_a_protocol_error() {
        let (client, server) = connected_pair().await;
        let (client_read, _client_write) = client.into_split();
        let pending = PendingCalls::new();

        let (_, mut write) = server.into_split();
        write.write_all(b"this is not json\n").await.expect("wrote");

        match read_responses(client_read, &pending).await {
            ReaderExit::Protocol(ProtocolError::Decode { line, .. }) => {
                assert_eq!(line, "this is not json");
            }
            other => panic!("unexpected reader exit {other:?}"),
        }
    }

    #[test]
    fn output_tail_is_bounded() {
        let tail = OutputTail::new(2);
        for line in ["a", "b", "c"] {
            tail.push(line.to_owned());
        }
        assert_eq!(tail.snapshot(), vec!["b".to_owned(), "c".to_owned()]);
    }
}
