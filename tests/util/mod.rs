//! Some nice utilities for writing automated tests that run a worker, a
//! balancer and clients on the same tokio runtime. Everything binds port 0
//! so tests never collide; the actual addresses are discovered through
//! `socket_address()` before the servers start serving.

use std::net::SocketAddr;

use tokio::{net::TcpStream, task::JoinHandle};

use rlb::{
    balancer::Balancer,
    config::{Algorithm, BalancerConfig, WorkerConfig},
    http::{self, request::Request, response::Response},
    worker::Supervisor,
    Error,
};

/// Worker config bound to an ephemeral loopback port, with the chaos roll
/// disabled so pool sizes stay deterministic. Tests exercising the recovery
/// path turn it back on explicitly.
pub fn worker_config(max_children: usize) -> WorkerConfig {
    WorkerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        max_children,
        preforked: max_children.min(5),
        idle_timeout: 30,
        chaos_exit: 0,
    }
}

/// Balancer config pointing at the given workers, with a unique PID file
/// and a health-check interval long enough to never fire during a test.
pub fn balancer_config(workers: Vec<SocketAddr>, algorithm: Algorithm, name: &str) -> BalancerConfig {
    let pid_file = std::env::temp_dir()
        .join(format!("rlb-test-{}-{name}.pid", std::process::id()))
        .display()
        .to_string();

    BalancerConfig {
        listen: "127.0.0.1:0".parse().unwrap(),
        workers,
        algorithm,
        health_check_interval: 300,
        pid_file,
    }
}

/// Starts a worker in the background and returns its control address.
pub async fn spawn_worker(config: WorkerConfig) -> (SocketAddr, JoinHandle<Result<(), Error>>) {
    let supervisor = Supervisor::init(config).await.unwrap();
    let address = supervisor.socket_address();
    let handle = tokio::task::spawn(supervisor.run());

    (address, handle)
}

/// Starts a balancer in the background and returns its client-facing
/// address. The workers must already be listening: the balancer probes them
/// during init.
pub async fn spawn_balancer(config: BalancerConfig) -> (SocketAddr, JoinHandle<Result<(), Error>>) {
    let balancer = Balancer::init(config).await.unwrap();
    let address = balancer.socket_address();
    let handle = tokio::task::spawn(balancer.run());

    (address, handle)
}

/// Opens a connection to `to`, stamps the request with the connection's
/// actual source address and port, sends it and reads the one response.
/// Returns the local address used, so tests can assert on the routing pair.
pub async fn send_request(to: SocketAddr, request: Request) -> (SocketAddr, Response) {
    let mut stream = TcpStream::connect(to).await.unwrap();
    let local = stream.local_addr().unwrap();

    let request = request.source(local.ip().to_string(), local.port().to_string());

    http::write_frame(&mut stream, &request.encode())
        .await
        .unwrap();

    let frame = http::read_frame(&mut stream).await.unwrap().unwrap();

    (local, Response::parse(&frame).unwrap())
}

/// Quick request factory.
pub mod request {
    use rlb::http::{request::Request, Method};

    pub fn get(url: &str) -> Request {
        let mut request = Request::new(Method::Get, url);
        request.host = Some(String::from("localhost"));
        request.accept = Some(String::from("*"));
        request
    }

    pub fn options() -> Request {
        let mut request = Request::new(Method::Options, "*");
        request.host = Some(String::from("localhost"));
        request.accept = Some(String::from("*"));
        request
    }
}

/// A scratch file path unique to this test process.
pub fn scratch_file(name: &str, contents: &str) -> String {
    let path = std::env::temp_dir()
        .join(format!("rlb-test-{}-{name}", std::process::id()))
        .display()
        .to_string();

    std::fs::write(&path, contents).unwrap();
    path
}
