//! Balancer dispatch core.
//!
//! The balancer is a single event loop multiplexing four event sources:
//! the client-facing listener, the control channels of every registered
//! worker, the periodic health-check timer and the process signals.
//!
//! ```text
//!  clients                         workers
//!     |                               |
//!     v                               v
//! +--------+    requests       +-------------+
//! | accept | ----------------> | control ch. |
//! +--------+                   +-------------+
//!     ^                               |
//!     |        responses              |
//!     +------- (Target-IP/Port) <-----+
//! ```
//!
//! Each accepted connection contributes exactly one request. The configured
//! scheduler picks a worker, the raw frame is relayed on that worker's
//! control channel and the client is parked in the pending table, keyed by
//! its source port. Responses coming back from workers carry the
//! `Target-IP`/`Target-Port` routing pair, which is the only thing the
//! balancer reads from them: it finds the parked client, relays the frame
//! and closes the connection.
//!
//! Worker control channels are read by one small forwarding task each, so
//! the loop itself stays a plain `select!`. A read error or EOF on a control
//! channel deregisters the worker at any time; losing the last worker is
//! fatal.

mod pending;
mod pidfile;

pub use pidfile::PidFile;

use std::{
    collections::BTreeMap,
    future::{self, Future},
    net::SocketAddr,
    pin::Pin,
    time::Duration,
};

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::{
    net::{tcp::OwnedReadHalf, tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::mpsc,
    task::JoinHandle,
    time::{interval_at, Instant},
};

use crate::{
    config::{Algorithm, BalancerConfig},
    http::{self, request::Request, response::Response, Method, Status},
    sched::{self, SchedState, Scheduler, Selection, ServerLoad, WorkerId},
    Error,
};

use pending::PendingTable;

/// A registered worker, as seen from the balancer.
struct Upstream {
    /// Worker address, kept as strings because that is how the routing
    /// headers travel on the wire.
    address: String,
    port: String,

    /// Capacity learned from the SERVERCHECK probe.
    max_load: u32,

    /// Requests relayed to this worker and not yet answered.
    cur_load: u32,

    /// Write half of the control channel.
    writer: OwnedWriteHalf,

    /// Task forwarding frames from the read half into the event channel.
    reader: JoinHandle<()>,
}

/// What the per-worker forwarding tasks feed into the dispatch loop.
enum Event {
    /// One whole response frame arrived on a worker's control channel.
    Frame(WorkerId, Bytes),

    /// The control channel EOFed or errored.
    Closed(WorkerId),
}

/// The balancer process. [`Balancer::init`] performs the whole startup
/// sequence (PID lock, scheduler, worker probes, client listener) without
/// accepting connections yet; [`Balancer::run`] enters the dispatch loop.
/// Splitting the two lets tests bind port 0 and discover the actual address
/// before any traffic flows.
pub struct Balancer {
    config: BalancerConfig,
    dispatcher: Dispatcher,
    listener: TcpListener,
    address: SocketAddr,
    events: mpsc::Receiver<Event>,

    /// Kept so the event channel never closes, even with zero forwarding
    /// tasks alive.
    _event_tx: mpsc::Sender<Event>,

    /// When this future completes, the balancer shuts down gracefully. Any
    /// future works, which is what integration tests rely on; the binary
    /// uses process signals instead.
    shutdown: Pin<Box<dyn Future<Output = ()> + Send>>,

    /// Held for the lifetime of the process.
    _pid_file: PidFile,
}

impl Balancer {
    /// Runs the startup sequence: acquire the PID lock, instantiate the
    /// scheduler, probe every configured worker with SERVERCHECK and bind
    /// the client-facing listener. Zero reachable workers is fatal.
    pub async fn init(config: BalancerConfig) -> Result<Self, Error> {
        let pid_file = PidFile::acquire(&config.pid_file)?;
        let scheduler = sched::make(config.algorithm);
        let (event_tx, events) = mpsc::channel(64);

        let mut dispatcher = Dispatcher {
            algorithm: config.algorithm,
            listen: config.listen,
            scheduler,
            pool: BTreeMap::new(),
            pending: PendingTable::new(),
        };

        for (id, &address) in config.workers.iter().enumerate() {
            match probe_worker(id, address, config.listen, &event_tx).await? {
                Some(upstream) => {
                    dispatcher.pool.insert(id, upstream);
                }
                None => continue,
            }
        }

        let listener = TcpListener::bind(config.listen).await?;
        let address = listener.local_addr()?;

        // Health probes advertise the actual bound address, which matters
        // when port 0 was configured.
        dispatcher.listen = address;

        if dispatcher.pool.is_empty() {
            return Err(Error::NoWorkers);
        }

        Ok(Self {
            config,
            dispatcher,
            listener,
            address,
            events,
            _event_tx: event_tx,
            shutdown: Box::pin(future::pending()),
            _pid_file: pid_file,
        })
    }

    /// The balancer will start its graceful shutdown when `future`
    /// completes.
    pub fn shutdown_on(mut self, future: impl Future + Send + 'static) -> Self {
        self.shutdown = Box::pin(async move {
            future.await;
        });

        self
    }

    /// Address of the client-facing socket, useful when port 0 was
    /// configured.
    pub fn socket_address(&self) -> SocketAddr {
        self.address
    }

    /// Enters the dispatch loop until a fatal error or a shutdown event.
    pub async fn run(self) -> Result<(), Error> {
        let Self {
            config,
            mut dispatcher,
            listener,
            address,
            mut events,
            _event_tx,
            mut shutdown,
            _pid_file,
        } = self;

        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        let period = Duration::from_secs(config.health_check_interval.max(1));
        let mut health = interval_at(Instant::now() + period, period);

        info!("listening for requests on {address}");

        let result = loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, client_addr)) => {
                        if let Err(err) = dispatcher.dispatch(stream, client_addr).await {
                            break Err(err);
                        }
                    }
                    // The listener itself failing means no request can ever
                    // be accepted again.
                    Err(err) => break Err(err.into()),
                },

                Some(event) = events.recv() => match event {
                    Event::Frame(id, frame) => dispatcher.forward_response(id, frame).await,
                    Event::Closed(id) => {
                        dispatcher.deregister(id, "control channel closed");
                        if dispatcher.pool.is_empty() {
                            break Err(Error::NoWorkers);
                        }
                    }
                },

                _ = health.tick() => {
                    if let Err(err) = dispatcher.health_check().await {
                        break Err(err);
                    }
                }

                _ = sigint.recv() => {
                    info!("caught SIGINT");
                    break Ok(());
                }

                _ = sigterm.recv() => {
                    info!("caught SIGTERM");
                    break Ok(());
                }

                _ = &mut shutdown => {
                    info!("received shutdown signal");
                    break Ok(());
                }
            }
        };

        drop(listener);
        dispatcher.clear_all();
        info!("balancer shut down");

        result
    }
}

/// Probes one worker endpoint with a SERVERCHECK request. Returns `None`
/// when the worker is unreachable (it is simply skipped); a worker that
/// accepts the connection but misbehaves during the probe is a startup
/// failure.
async fn probe_worker(
    id: WorkerId,
    address: SocketAddr,
    listen: SocketAddr,
    events: &mpsc::Sender<Event>,
) -> Result<Option<Upstream>, Error> {
    let mut stream = match TcpStream::connect(address).await {
        Ok(stream) => stream,
        Err(err) => {
            warn!("worker {address} is unreachable: {err}");
            return Ok(None);
        }
    };

    let mut check = Request::new(Method::ServerCheck, address.ip().to_string())
        .source(listen.ip().to_string(), listen.port().to_string());
    check.host = Some(address.ip().to_string());

    http::write_frame(&mut stream, &check.encode()).await?;

    let Some(frame) = http::read_frame(&mut stream).await? else {
        return Err(Error::Protocol(format!(
            "unexpected EOF from worker {address} during capacity probe"
        )));
    };

    let response = Response::parse(&frame)?;
    let max_load = response.body.trim().parse::<u32>().map_err(|_| {
        Error::Protocol(format!(
            "worker {address} sent a bad capacity: {:?}",
            response.body
        ))
    })?;

    info!("worker {address} advertises capacity {max_load}");

    let (read_half, writer) = stream.into_split();
    let reader = tokio::spawn(forward_frames(id, read_half, events.clone()));

    Ok(Some(Upstream {
        address: address.ip().to_string(),
        port: address.port().to_string(),
        max_load,
        cur_load: 0,
        writer,
        reader,
    }))
}

/// Forwards every frame read from a worker's control channel into the
/// dispatch loop, then reports the channel closed.
async fn forward_frames(id: WorkerId, mut reader: OwnedReadHalf, events: mpsc::Sender<Event>) {
    loop {
        match http::read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if events.send(Event::Frame(id, frame)).await.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(err) => {
                debug!("read error on worker {id} control channel: {err}");
                break;
            }
        }
    }

    let _ = events.send(Event::Closed(id)).await;
}

/// Everything the event handlers mutate, separated from the event sources so
/// the `select!` arms can borrow them independently.
struct Dispatcher {
    algorithm: Algorithm,
    listen: SocketAddr,
    scheduler: Box<dyn Scheduler>,
    pool: BTreeMap<WorkerId, Upstream>,
    pending: PendingTable<TcpStream>,
}

impl Dispatcher {
    /// Handles one accepted client connection: read the request, pick a
    /// worker, relay, park the client. All per-connection failures are
    /// logged and swallowed; only conditions that leave the balancer unable
    /// to serve anything are returned as errors.
    async fn dispatch(
        &mut self,
        mut stream: TcpStream,
        client_addr: SocketAddr,
    ) -> Result<(), Error> {
        let frame = match http::read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                warn!("client {client_addr} closed before sending a request");
                return Ok(());
            }
            Err(err) => {
                error!("failed reading request from {client_addr}: {err}");
                return Ok(());
            }
        };

        let host = normalize_host(client_addr.ip().to_string());
        let service = client_addr.port().to_string();

        if self.pool.is_empty() {
            error!("no worker is available");
            return Err(Error::NoWorkers);
        }

        let handle_ip = match self.algorithm {
            Algorithm::Dh => http::peek_header(&frame, "Host").map(normalize_host),
            Algorithm::Sh => Some(host.clone()),
            _ => None,
        };

        let id = match self.scheduler.select(&self.snapshot(handle_ip)) {
            Selection::Server(id) => id,
            Selection::NoCapacity => {
                warn!("no worker can take the request from {host}:{service}");
                return reply_error(stream, Status::ServiceUnavailable, &host, &service).await;
            }
            Selection::Malformed => {
                warn!("request from {host}:{service} has no hashable address");
                return reply_error(stream, Status::InternalServerError, &host, &service).await;
            }
        };

        let upstream = self.pool.get_mut(&id).expect("scheduler picked from the pool");

        if let Err(err) = http::write_frame(&mut upstream.writer, &frame).await {
            error!(
                "failed to relay request to worker {}:{}: {err}",
                upstream.address, upstream.port
            );
            self.deregister(id, "write failure");

            if self.pool.is_empty() {
                return Err(Error::NoWorkers);
            }
            return Ok(());
        }

        upstream.cur_load += 1;
        self.pending.insert(service, host, stream);
        self.list_workers();

        Ok(())
    }

    /// Handles one response frame from a worker: extract the routing pair,
    /// find the parked client, relay and close. Frames with no waiting
    /// client (late responses after a handler death, health probe answers)
    /// are dropped without touching the load accounting.
    async fn forward_response(&mut self, id: WorkerId, frame: Bytes) {
        let target_ip = http::peek_header(&frame, "Target-IP").unwrap_or_default();
        let target_port = http::peek_header(&frame, "Target-Port").unwrap_or_default();

        let Some(mut stream) = self.pending.remove_match(&target_port, &target_ip) else {
            debug!("response for {target_ip}:{target_port} has no waiting client, dropping");
            return;
        };

        if let Err(err) = http::write_frame(&mut stream, &frame).await {
            error!("failed to relay response to {target_ip}:{target_port}: {err}");
        }

        // Closes the client connection: one request, one response.
        drop(stream);

        if let Some(upstream) = self.pool.get_mut(&id) {
            upstream.cur_load = upstream.cur_load.saturating_sub(1);
        }

        self.list_workers();
    }

    /// Sends an OPTIONS probe to every worker. Only runs while no request
    /// is in flight, so the load accounting cannot be disturbed; probe
    /// responses come back through the normal event channel and are dropped
    /// there as unmatched frames. Workers that cannot even be written to are
    /// deregistered on the spot; read-side failures surface through the
    /// forwarding tasks whenever they happen.
    async fn health_check(&mut self) -> Result<(), Error> {
        if !self.pending.is_empty() {
            debug!(
                "skipping health check, {} requests in flight",
                self.pending.len()
            );
            return Ok(());
        }

        info!("health checking {} workers", self.pool.len());

        let ids: Vec<WorkerId> = self.pool.keys().copied().collect();

        for id in ids {
            let upstream = self.pool.get_mut(&id).expect("id taken from the pool");

            let mut check = Request::new(Method::Options, "*")
                .source(self.listen.ip().to_string(), self.listen.port().to_string());
            check.host = Some(upstream.address.clone());
            check.accept = Some(String::from("*"));

            if let Err(err) = http::write_frame(&mut upstream.writer, &check.encode()).await {
                error!(
                    "health check write to {}:{} failed: {err}",
                    upstream.address, upstream.port
                );
                self.deregister(id, "health check failure");
            }
        }

        if self.pool.is_empty() {
            return Err(Error::NoWorkers);
        }

        Ok(())
    }

    /// Removes a worker from the pool and stops its forwarding task.
    /// Requests already relayed to it will never be answered; their clients
    /// stay parked until shutdown.
    fn deregister(&mut self, id: WorkerId, reason: &str) {
        if let Some(upstream) = self.pool.remove(&id) {
            warn!(
                "deregistering worker {}:{} ({reason})",
                upstream.address, upstream.port
            );
            upstream.reader.abort();
        }
    }

    fn snapshot(&self, handle_ip: Option<String>) -> SchedState {
        let pool = self
            .pool
            .iter()
            .map(|(&id, upstream)| {
                (
                    id,
                    ServerLoad {
                        max_load: upstream.max_load,
                        cur_load: upstream.cur_load,
                    },
                )
            })
            .collect();

        SchedState { pool, handle_ip }
    }

    fn list_workers(&self) {
        debug!(
            "{:<16} {:<8} {:<10} {:<12}",
            "Server", "Port", "Max Load", "Current Load"
        );
        for upstream in self.pool.values() {
            debug!(
                "{:<16} {:<8} {:<10} {:<12}",
                upstream.address, upstream.port, upstream.max_load, upstream.cur_load
            );
        }
    }

    fn clear_all(&mut self) {
        for (_, upstream) in std::mem::take(&mut self.pool) {
            upstream.reader.abort();
        }

        // Dropping the parked connections closes them.
        drop(self.pending.drain());
    }
}

/// Sends a synthesized error response straight back to the client. Nothing
/// here is fatal: the client may well have gone away already.
async fn reply_error(
    mut stream: TcpStream,
    status: Status,
    host: &str,
    service: &str,
) -> Result<(), Error> {
    let response = Response::new(status, host, service);

    if let Err(err) = http::write_frame(&mut stream, &response.encode()).await {
        error!("failed to send {} to {host}:{service}: {err}", status.code());
    }

    Ok(())
}

/// `localhost` and `127.0.0.1` must compare equal when matching routing
/// headers, so everything is normalized to the numeric form up front.
fn normalize_host(host: String) -> String {
    if host == "localhost" {
        String::from("127.0.0.1")
    } else {
        host
    }
}
