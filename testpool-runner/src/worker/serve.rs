// Copyright (c) The testpool Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The serving side of the protocol, which runs inside worker processes.
//!
//! A worker binary implements [`UnitHandler`] and calls [`serve`]. `serve` binds a loopback port,
//! announces it on stdout, accepts the coordinator's connection, and dispatches requests to the
//! handler until it is asked to shut down or the coordinator goes away.

use super::{
    CallContext, CallResult, ExecutionReport, RequestId, Response, SetupHandle, SetupRef,
    WORKER_THREADS_ENV, memory::process_rss_mib, protocol::handshake_line,
};
use crate::{
    errors::ServeError,
    helpers::panic_message,
    list::{ItemId, Payload},
};
use std::{
    collections::{BTreeMap, HashMap},
    fmt::Write as _,
    io::{self, Write as _},
    net::Ipv4Addr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, tcp::OwnedWriteHalf},
    sync::{Semaphore, mpsc},
    task::JoinSet,
};
use tracing::debug;

/// Runs work on behalf of the coordinator, inside a worker process.
///
/// Handler methods are called on a blocking thread pool, so they may block freely. At most as many
/// calls as the worker's concurrency hint run at once.
pub trait UnitHandler: Send + Sync + 'static {
    /// The value a setup evaluates to.
    type Context: Send + Sync + 'static;

    /// Runs the startup hook. The default does nothing.
    fn startup(&self, payload: &Payload) -> Result<(), String> {
        let _ = payload;
        Ok(())
    }

    /// Evaluates a setup.
    fn evaluate_setup(&self, name: &str, payload: &Payload) -> Result<Self::Context, String>;

    /// Executes an item with the values of its setups.
    fn execute(
        &self,
        item: &ItemRequest,
        payload: &Payload,
        setups: &SetupValues<Self::Context>,
    ) -> ExecutionReport;

    /// Returns extra text for the worker's diagnostics report. Called on the worker's async
    /// threads, so this must not block.
    fn diagnostics(&self) -> Option<String> {
        None
    }
}

/// The item an execute call is for.
#[derive(Clone, Debug)]
pub struct ItemRequest {
    /// The item's ID.
    pub id: ItemId,
    /// The item's name.
    pub name: String,
    /// The attempt number, starting at 1.
    pub attempt: u32,
}

/// The evaluated setups an item depends on, in the order the item declares them.
#[derive(Debug)]
pub struct SetupValues<C> {
    values: Vec<(String, Arc<C>)>,
}

impl<C> SetupValues<C> {
    /// Creates a set of setup values, in declaration order.
    pub fn from_values(values: Vec<(String, Arc<C>)>) -> Self {
        Self { values }
    }

    /// Looks up a setup's value by name.
    pub fn get(&self, name: &str) -> Option<&C> {
        self.values
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| value.as_ref())
    }

    /// Iterates over setup names and values.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &C)> + '_ {
        self.values
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_ref()))
    }

    /// Returns the number of setups.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns true if the item has no setups.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Serves requests from the coordinator until shutdown.
///
/// The concurrency hint is read from `TESTPOOL_WORKER_THREADS`.
pub fn serve<H: UnitHandler>(handler: H) -> Result<(), ServeError> {
    let threads = worker_threads_from_env();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(threads)
        .thread_name("testpool-worker")
        .build()
        .map_err(ServeError::TokioRuntimeCreate)?;

    let result = runtime.block_on(async move {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(ServeError::Bind)?;
        let port = listener.local_addr().map_err(ServeError::Bind)?.port();
        announce(port).map_err(ServeError::Handshake)?;

        let (stream, _) = listener.accept().await.map_err(ServeError::Accept)?;
        drop(listener);
        serve_connection(stream, Arc::new(handler), threads).await
    });

    // Handler calls still running after the coordinator hung up can't be cancelled; don't wait
    // on them forever.
    runtime.shutdown_timeout(Duration::from_secs(1));
    result
}

fn worker_threads_from_env() -> usize {
    std::env::var(WORKER_THREADS_ENV)
        .ok()
        .and_then(|threads| threads.parse::<usize>().ok())
        .unwrap_or(1)
        .max(1)
}

fn announce(port: u16) -> io::Result<()> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{}", handshake_line(port))?;
    stdout.flush()
}

/// Serves requests arriving on `stream`.
pub(crate) async fn serve_connection<H: UnitHandler>(
    stream: TcpStream,
    handler: Arc<H>,
    threads: usize,
) -> Result<(), ServeError> {
    _ = stream.set_nodelay(true);
    let server = Arc::new(WorkerServer::new(handler, threads));
    let (read_half, write_half) = stream.into_split();
    let (response_tx, response_rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_responses(write_half, response_rx));

    let mut lines = BufReader::new(read_half).lines();
    let mut in_flight = JoinSet::new();
    let read_result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("coordinator closed the connection");
                break Ok(());
            }
            Err(err) => break Err(ServeError::Read(err)),
        };
        if line.trim().is_empty() {
            continue;
        }
        let request = match super::Request::from_line(&line) {
            Ok(request) => request,
            Err(err) => break Err(ServeError::Decode(err)),
        };

        if request.is_shutdown {
            // Deliver every outstanding response before acknowledging.
            while in_flight.join_next().await.is_some() {}
            _ = response_tx.send(Response::ok(request.request_id, CallResult::Ack));
            debug!("shutdown requested");
            break Ok(());
        }

        let server = server.clone();
        let response_tx = response_tx.clone();
        in_flight.spawn(async move {
            let response = server
                .handle(request.request_id, request.context, request.payload)
                .await;
            _ = response_tx.send(response);
        });
    };

    // Abandon anything still running: nobody is left to receive the results.
    in_flight.abort_all();
    drop(in_flight);
    drop(response_tx);

    let write_result = match writer.await {
        Ok(result) => result.map_err(ServeError::Write),
        Err(join_error) => Err(ServeError::Write(io::Error::other(join_error))),
    };
    read_result.and(write_result)
}

async fn write_responses(
    mut writer: OwnedWriteHalf,
    mut response_rx: mpsc::UnboundedReceiver<Response>,
) -> io::Result<()> {
    while let Some(response) = response_rx.recv().await {
        let line = response.to_line().map_err(io::Error::other)?;
        writer.write_all(line.as_bytes()).await?;
    }
    writer.shutdown().await
}

struct WorkerServer<H: UnitHandler> {
    handler: Arc<H>,
    contexts: Mutex<HashMap<SetupHandle, Arc<H::Context>>>,
    last_handle: AtomicU64,
    in_flight: Mutex<BTreeMap<RequestId, InFlightCall>>,
    permits: Arc<Semaphore>,
    threads: usize,
    started: Instant,
}

struct InFlightCall {
    description: String,
    started: Instant,
}

impl<H: UnitHandler> WorkerServer<H> {
    fn new(handler: Arc<H>, threads: usize) -> Self {
        Self {
            handler,
            contexts: Mutex::new(HashMap::new()),
            last_handle: AtomicU64::new(0),
            in_flight: Mutex::new(BTreeMap::new()),
            permits: Arc::new(Semaphore::new(threads.max(1))),
            threads,
            started: Instant::now(),
        }
    }

    async fn handle(
        self: Arc<Self>,
        request_id: RequestId,
        context: Option<CallContext>,
        payload: Payload,
    ) -> Response {
        let Some(context) = context else {
            return Response::error(request_id, "request has no context");
        };
        // Diagnostics must answer even when every permit is held by a hung item.
        if context == CallContext::Diagnostics {
            return Response::ok(
                request_id,
                CallResult::Diagnostics {
                    report: self.diagnostics(),
                },
            );
        }

        let Ok(_permit) = self.permits.clone().acquire_owned().await else {
            return Response::error(request_id, "worker is shutting down");
        };

        self.lock_in_flight().insert(
            request_id,
            InFlightCall {
                description: describe(&context),
                started: Instant::now(),
            },
        );
        let server = self.clone();
        let result =
            tokio::task::spawn_blocking(move || server.handle_blocking(context, &payload)).await;
        self.lock_in_flight().remove(&request_id);

        match result {
            Ok(Ok(result)) => Response::ok(request_id, result),
            Ok(Err(message)) => Response::error(request_id, message),
            Err(join_error) => match join_error.try_into_panic() {
                Ok(panic) => Response::error(
                    request_id,
                    format!("handler panicked: {}", panic_message(&*panic)),
                ),
                Err(_) => Response::error(request_id, "handler was cancelled"),
            },
        }
    }

    fn handle_blocking(
        &self,
        context: CallContext,
        payload: &Payload,
    ) -> Result<CallResult, String> {
        match context {
            CallContext::StartupHook => {
                self.handler.startup(payload)?;
                Ok(CallResult::Ack)
            }
            CallContext::EvaluateSetup { name, declared } => {
                if !declared {
                    return Err(format!("setup `{name}` is not declared"));
                }
                let value = self.handler.evaluate_setup(&name, payload)?;
                let handle = SetupHandle(self.last_handle.fetch_add(1, Ordering::SeqCst) + 1);
                self.lock_contexts().insert(handle, Arc::new(value));
                Ok(CallResult::SetupEvaluated { handle })
            }
            CallContext::Execute {
                item_id,
                name,
                attempt,
                setups,
            } => {
                let values = self.setup_values(setups)?;
                let item = ItemRequest {
                    id: item_id,
                    name,
                    attempt,
                };
                let started = Instant::now();
                let mut report = self.handler.execute(&item, payload, &values);
                report.stats.elapsed.get_or_insert_with(|| started.elapsed());
                if report.stats.rss_mib.is_none() {
                    report.stats.rss_mib = process_rss_mib(std::process::id());
                }
                Ok(CallResult::Executed(report))
            }
            CallContext::Diagnostics => Ok(CallResult::Diagnostics {
                report: self.diagnostics(),
            }),
        }
    }

    fn setup_values(&self, setups: Vec<SetupRef>) -> Result<SetupValues<H::Context>, String> {
        let contexts = self.lock_contexts();
        let values = setups
            .into_iter()
            .map(|SetupRef { name, handle }| match contexts.get(&handle) {
                Some(value) => Ok((name, value.clone())),
                None => Err(format!("unknown handle {} for setup `{name}`", handle.0)),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(SetupValues { values })
    }

    fn diagnostics(&self) -> String {
        let mut report = String::new();
        _ = write!(
            report,
            "worker pid {}, up {:.1}s, concurrency {}",
            std::process::id(),
            self.started.elapsed().as_secs_f64(),
            self.threads,
        );
        if let Some(rss) = process_rss_mib(std::process::id()) {
            _ = write!(report, ", rss {rss} MiB");
        }
        _ = writeln!(report, ", {} setups evaluated", self.lock_contexts().len());

        let in_flight = self.lock_in_flight();
        if in_flight.is_empty() {
            _ = writeln!(report, "no calls in flight");
        }
        for (request_id, call) in in_flight.iter() {
            _ = writeln!(
                report,
                "request {request_id}: {} (running for {:.1}s)",
                call.description,
                call.started.elapsed().as_secs_f64(),
            );
        }
        drop(in_flight);

        if let Some(extra) = self.handler.diagnostics() {
            report.push_str(&extra);
            if !extra.ends_with('\n') {
                report.push('\n');
            }
        }
        report
    }

    fn lock_contexts(&self) -> std::sync::MutexGuard<'_, HashMap<SetupHandle, Arc<H::Context>>> {
        self.contexts.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, BTreeMap<RequestId, InFlightCall>> {
        self.in_flight.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn describe(context: &CallContext) -> String {
    match context {
        CallContext::Execute {
            item_id, attempt, ..
        } => format!("executing `{item_id}` (attempt {attempt})"),
        CallContext::EvaluateSetup { name, .. } => format!("evaluating setup `{name}`"),
        other => other.kind().to_owned(),
    }
}
