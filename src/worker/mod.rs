//! Worker supervisor.
//!
//! A worker serves exactly one upstream: the balancer that probed it. After
//! accepting that control connection the supervisor starts `preforked`
//! handler tasks and then settles into its event loop:
//!
//! ```text
//!            +------------+  requests   +-----------+
//!  balancer  |  control   | ----------> | handler 0 |--+
//! <--------- | connection |             +-----------+  |
//!            +------------+  (per-task  +-----------+  | responses, written
//!                  ^          channels) | handler 1 |--+ directly on the
//!                  |                    +-----------+  | shared write half
//!                  |                         ...       |
//!                  +-----------------------------------+
//! ```
//!
//! Each incoming request goes to the first FREE handler, walking the pool
//! in index order. With nobody free the pool grows by one temporary handler
//! (up to `max_children`); at the ceiling the worker answers 503 itself.
//! Temporary handlers carry an idle deadline and are reaped when it
//! expires. A pre-forked handler that dies, by chaos roll or otherwise, is
//! replaced at the same index; a temporary one is just removed. Handler
//! exits are observed through the task set, but all correctness flows
//! through explicit completion records on the completion channel, so the
//! order in which an exit and its last completion arrive does not matter.

mod handler;
pub mod service;

pub use handler::{HandlerRecord, HandlerStatus};

use std::{
    future::{self, Future},
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::{
    net::{tcp::OwnedWriteHalf, TcpListener},
    sync::{mpsc, Mutex},
    task::{AbortHandle, JoinError, JoinSet},
    time::{sleep_until, Instant},
};

use crate::{
    config::WorkerConfig,
    http::{self, response::Response, Status},
    Error,
};

/// The worker process. [`Supervisor::init`] only binds the listening
/// socket; [`Supervisor::run`] accepts the balancer and serves until
/// shutdown.
pub struct Supervisor {
    config: WorkerConfig,
    listener: TcpListener,
    address: SocketAddr,
    shutdown: Pin<Box<dyn Future<Output = ()> + Send>>,
}

impl Supervisor {
    pub async fn init(config: WorkerConfig) -> Result<Self, Error> {
        if config.max_children < config.preforked {
            return Err(Error::Usage(format!(
                "max_children ({}) must be at least the preforked pool size ({})",
                config.max_children, config.preforked
            )));
        }

        let listener = TcpListener::bind(config.listen).await?;
        let address = listener.local_addr()?;

        Ok(Self {
            config,
            listener,
            address,
            shutdown: Box::pin(future::pending()),
        })
    }

    /// The supervisor will start its graceful shutdown when `future`
    /// completes.
    pub fn shutdown_on(mut self, future: impl Future + Send + 'static) -> Self {
        self.shutdown = Box::pin(async move {
            future.await;
        });

        self
    }

    /// Address of the listening socket, useful when port 0 was configured.
    pub fn socket_address(&self) -> SocketAddr {
        self.address
    }

    /// Accepts the single upstream control connection, pre-forks the
    /// handler pool and runs the event loop until the balancer goes away or
    /// a shutdown event arrives.
    pub async fn run(self) -> Result<(), Error> {
        let Self {
            config,
            listener,
            address,
            mut shutdown,
        } = self;

        info!("worker listening on {address}");

        let (control, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = &mut shutdown => {
                info!("received shutdown signal before any balancer connected");
                return Ok(());
            }
        };

        info!("serving balancer at {peer}");

        // One upstream only: connections attempted after this one are
        // refused outright.
        drop(listener);

        let (control_read, control_write) = control.into_split();

        // Frames can arrive split; the stateful reader keeps partial frames
        // buffered across `select!` iterations.
        let mut control_read = http::FrameReader::new(control_read);
        let writer = Arc::new(Mutex::new(control_write));

        // Sized so every handler can park one final completion record in it
        // without blocking, whatever the pool ceiling is.
        let (completion_tx, mut completions) = mpsc::channel(config.max_children.max(64));

        let mut tasks = JoinSet::new();
        let mut pool = Pool::new(config, writer.clone(), completion_tx);

        for index in 0..pool.config.preforked {
            pool.start_handler(&mut tasks, index, false);
        }

        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        loop {
            // Earliest idle deadline in the pool, if any temporary handler
            // is alive. The placeholder instant is never awaited because
            // the branch is disabled when there is no deadline.
            let next_deadline = pool.next_deadline();
            let placeholder = Instant::now() + Duration::from_secs(3600);

            tokio::select! {
                frame = control_read.next() => match frame {
                    Ok(Some(frame)) => {
                        if let Err(err) = pool.dispatch(&mut tasks, frame).await {
                            error!("failed to answer upstream: {err}");
                            break;
                        }
                    }
                    Ok(None) => {
                        warn!("balancer closed the control connection");
                        break;
                    }
                    Err(err) => {
                        error!("control connection read failed: {err}");
                        break;
                    }
                },

                Some(record) = completions.recv() => pool.complete(record),

                Some(joined) = tasks.join_next_with_id() => {
                    pool.handle_exit(&mut tasks, joined);
                }

                _ = sleep_until(next_deadline.unwrap_or(placeholder)), if next_deadline.is_some() => {
                    pool.reap_idle();
                }

                _ = sigint.recv() => {
                    info!("worker interrupted");
                    break;
                }

                _ = sigterm.recv() => {
                    info!("worker terminated");
                    break;
                }

                _ = &mut shutdown => {
                    info!("received shutdown signal");
                    break;
                }
            }
        }

        // Closing the completion channel first means a handler finishing its
        // last request can never block on it during teardown.
        drop(completions);
        pool.stop_all(&mut tasks).await;
        info!("worker shut down");

        Ok(())
    }
}

/// One live handler, as the supervisor tracks it.
struct Handler {
    /// Stable position in the pool. Indexes below `preforked` belong to
    /// permanent handlers.
    index: usize,

    status: HandlerStatus,

    /// Sender half of the handler's control channel. Capacity 1: a FREE
    /// handler is by definition parked on the other end.
    requests: mpsc::Sender<Bytes>,

    /// Handle of the handler task, used to identify exits and to stop
    /// temporary handlers.
    task: AbortHandle,

    /// Idle deadline, present on temporary handlers only. Reset on every
    /// completed request.
    deadline: Option<Instant>,
}

impl Handler {
    fn temporary(&self) -> bool {
        self.deadline.is_some()
    }
}

/// Pool bookkeeping, separated from the event sources so the `select!` arms
/// can borrow independently.
struct Pool {
    config: WorkerConfig,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    completions: mpsc::Sender<HandlerRecord>,
    handlers: Vec<Handler>,

    /// Live handlers, permanent and temporary. Satisfies
    /// `preforked <= children_exist <= max_children` while running.
    children_exist: usize,
}

impl Pool {
    fn new(
        config: WorkerConfig,
        writer: Arc<Mutex<OwnedWriteHalf>>,
        completions: mpsc::Sender<HandlerRecord>,
    ) -> Self {
        let children_exist = config.preforked;

        Self {
            config,
            writer,
            completions,
            handlers: Vec::new(),
            children_exist,
        }
    }

    /// Spawns a handler task at `index` and registers it FREE.
    fn start_handler(&mut self, tasks: &mut JoinSet<()>, index: usize, temporary: bool) {
        let (requests_tx, requests_rx) = mpsc::channel(1);

        let context = handler::Context {
            index,
            max_load: self.config.max_children,
            chaos_exit: self.config.chaos_exit,
            writer: self.writer.clone(),
            completions: self.completions.clone(),
        };

        let task = tasks.spawn(handler::run(context, requests_rx));
        let deadline =
            temporary.then(|| Instant::now() + Duration::from_secs(self.config.idle_timeout));

        debug!(
            "started {} handler {index}",
            if temporary { "temporary" } else { "preforked" }
        );

        self.handlers.push(Handler {
            index,
            status: HandlerStatus::Free,
            requests: requests_tx,
            task,
            deadline,
        });
    }

    /// Routes one request frame: first FREE handler in index order, then a
    /// new temporary handler if the pool may still grow, otherwise a 503
    /// straight back upstream.
    async fn dispatch(&mut self, tasks: &mut JoinSet<()>, frame: Bytes) -> Result<(), Error> {
        let mut frame = frame;

        // A handler can be marked FREE and still be gone: it may have died
        // right after its last completion, before its exit was observed.
        // Such a handler rejects the send; keep the frame and move on to the
        // next free one. The stale entry is marked BUSY so it is never
        // picked again and the exit event cleans it up.
        loop {
            let free = self
                .handlers
                .iter()
                .enumerate()
                .filter(|(_, handler)| handler.status == HandlerStatus::Free)
                .min_by_key(|(_, handler)| handler.index)
                .map(|(position, _)| position);

            let Some(position) = free else {
                break;
            };

            match self.handlers[position].requests.try_send(frame) {
                Ok(()) => {
                    self.handlers[position].status = HandlerStatus::Busy;
                    return Ok(());
                }
                Err(rejected) => {
                    warn!(
                        "handler {} rejected a request, trying the next one",
                        self.handlers[position].index
                    );
                    self.handlers[position].status = HandlerStatus::Busy;
                    frame = rejected.into_inner();
                }
            }
        }

        if self.children_exist < self.config.max_children {
            let index = self.next_temporary_index();
            self.start_handler(tasks, index, true);
            self.children_exist += 1;

            let handler = self.handlers.last_mut().expect("just pushed");
            if handler.requests.try_send(frame).is_ok() {
                handler.status = HandlerStatus::Busy;
            }
            debug!("pool grew to {} handlers", self.children_exist);

            return Ok(());
        }

        warn!("handler pool is saturated, answering 503");

        let source_ip = http::peek_header(&frame, "Source-IP").unwrap_or_default();
        let source_port = http::peek_header(&frame, "Source-Port").unwrap_or_default();
        let response = Response::new(Status::ServiceUnavailable, source_ip, source_port);

        let mut writer = self.writer.lock().await;
        http::write_frame(&mut *writer, &response.encode()).await
    }

    /// Applies a completion record: the handler is FREE again and, if
    /// temporary, gets a fresh idle deadline.
    fn complete(&mut self, record: HandlerRecord) {
        let Some(handler) = self
            .handlers
            .iter_mut()
            .find(|handler| handler.index == record.index)
        else {
            return;
        };

        handler.status = record.status;

        if handler.temporary() {
            handler.deadline =
                Some(Instant::now() + Duration::from_secs(self.config.idle_timeout));
            debug!("reset idle timer of handler {}", handler.index);
        }

        self.list_free();
    }

    /// Handles a handler task exit. A permanent handler is replaced at the
    /// same index; a temporary one is removed. Exits of handlers already
    /// reaped (their abort landing here) are ignored.
    fn handle_exit(
        &mut self,
        tasks: &mut JoinSet<()>,
        joined: Result<(tokio::task::Id, ()), JoinError>,
    ) {
        let id = match &joined {
            Ok((id, ())) => *id,
            Err(err) => err.id(),
        };

        let Some(position) = self.handlers.iter().position(|h| h.task.id() == id) else {
            return;
        };

        let handler = self.handlers.remove(position);

        if handler.index < self.config.preforked {
            warn!("preforked handler {} exited, replacing it", handler.index);
            self.start_handler(tasks, handler.index, false);
        } else {
            warn!("temporary handler {} exited", handler.index);
            self.children_exist -= 1;
        }
    }

    /// Earliest idle deadline among the temporary handlers.
    fn next_deadline(&self) -> Option<Instant> {
        self.handlers.iter().filter_map(|h| h.deadline).min()
    }

    /// Reaps every temporary handler whose idle deadline has passed.
    fn reap_idle(&mut self) {
        let now = Instant::now();

        let mut index = 0;
        while index < self.handlers.len() {
            if self.handlers[index].deadline.is_some_and(|d| d <= now) {
                let handler = self.handlers.remove(index);
                info!("idle timeout, stopping temporary handler {}", handler.index);
                handler.task.abort();
                self.children_exist -= 1;
            } else {
                index += 1;
            }
        }
    }

    /// Picks the lowest unused index at or above the preforked range for a
    /// new temporary handler.
    fn next_temporary_index(&self) -> usize {
        let mut index = self.config.preforked;
        while self.handlers.iter().any(|h| h.index == index) {
            index += 1;
        }
        index
    }

    /// Graceful teardown: close every control channel, which makes idle
    /// handlers return immediately and busy ones return after their current
    /// request, then wait for all of them.
    async fn stop_all(self, tasks: &mut JoinSet<()>) {
        info!("stopping {} handlers", self.handlers.len());

        drop(self.handlers);

        while tasks.join_next().await.is_some() {}
    }

    fn list_free(&self) {
        debug!(
            "{:<8} {:<8} {:<10}",
            "Index", "Status", "Temporary"
        );
        for handler in &self.handlers {
            if handler.status == HandlerStatus::Free {
                debug!(
                    "{:<8} {:<8} {:<10}",
                    handler.index,
                    "FREE",
                    handler.temporary()
                );
            }
        }
    }
}
