//! Client generator.
//!
//! Spawns many concurrent logical clients, each of which opens one
//! connection, sends one request of a random kind and reads one response.
//! A process-wide LRU cache keyed by request kind short-circuits kinds that
//! were already answered: those clients count a cache hit and never touch
//! the network. The cache and the hit counter live behind a single lock
//! that is only held around cache operations, never across I/O.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use log::{debug, info, warn};
use rand::Rng;
use tokio::{net::TcpStream, sync::Mutex, task::JoinSet};

use crate::{
    cache::{Cache, LruCache},
    config::ClientConfig,
    http::{self, request::Request, Method},
    Error,
};

/// File fetched by GET, HEAD and TRACE requests.
const DOWNLOAD_URL: &str = "./download.txt";

/// File written by PUT requests.
const UPLOAD_URL: &str = "./upload.txt";

/// File removed by DELETE requests.
const DELETE_URL: &str = "./delete.txt";

/// What a generator run produced.
#[derive(Debug)]
pub struct Report {
    /// Clients spawned.
    pub clients: usize,

    /// Clients that completed their exchange (or were served from cache).
    pub completed: usize,

    /// Clients answered straight from the cache.
    pub cache_hits: usize,

    /// Wall time of the whole run.
    pub elapsed: Duration,
}

impl Report {
    pub fn hit_rate(&self) -> f64 {
        if self.clients == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / self.clients as f64
    }
}

/// State shared by every client under one lock.
struct Shared {
    cache: LruCache<u8, Bytes>,
    hits: usize,
}

/// The load generator. Construct with the target and client count, then
/// [`run`](Generator::run) to completion.
pub struct Generator {
    config: ClientConfig,
}

impl Generator {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Spawns all clients (in small bursts, so the balancer's accept queue
    /// is not flooded), waits for every one of them and reports the cache
    /// hit rate and elapsed time.
    pub async fn run(self) -> Result<Report, Error> {
        let Generator { config } = self;

        let started = std::time::Instant::now();
        let shared = Arc::new(Mutex::new(Shared {
            cache: LruCache::new(config.cache_capacity.max(1)),
            hits: 0,
        }));

        let mut clients = JoinSet::new();

        for seq in 0..config.clients {
            if seq > 0
                && config.spawn_burst > 0
                && seq % config.spawn_burst == 0
                && config.spawn_delay_ms > 0
            {
                tokio::time::sleep(Duration::from_millis(config.spawn_delay_ms)).await;
            }

            clients.spawn(run_client(seq, config.target, Arc::clone(&shared)));
        }

        let mut completed = 0;
        while let Some(result) = clients.join_next().await {
            match result {
                Ok(Ok(())) => completed += 1,
                Ok(Err(err)) => warn!("client failed: {err}"),
                Err(err) => warn!("client panicked: {err}"),
            }
        }

        let hits = shared.lock().await.hits;
        let report = Report {
            clients: config.clients,
            completed,
            cache_hits: hits,
            elapsed: started.elapsed(),
        };

        info!(
            "{}/{} clients done, cache hit rate {:.2}, {} us elapsed",
            report.completed,
            report.clients,
            report.hit_rate(),
            report.elapsed.as_micros()
        );

        Ok(report)
    }
}

/// One logical client: check the cache, otherwise connect, send one request
/// and cache the response.
async fn run_client(seq: usize, target: SocketAddr, shared: Arc<Mutex<Shared>>) -> Result<(), Error> {
    let kind = rand::thread_rng().gen_range(0..7u8);

    {
        let mut shared = shared.lock().await;
        if shared.cache.contains(&kind) {
            shared.hits += 1;
            // Promote the entry; a popular kind should stay cached.
            shared.cache.get(&kind);
            debug!("client {seq}: cache hit for kind {kind}");
            return Ok(());
        }
    }

    let mut stream = TcpStream::connect(target).await?;
    let local = stream.local_addr()?;

    let request = request_for(kind, local.ip().to_string(), local.port().to_string());
    debug!("client {seq}: sending {} from {local}", request.method);

    http::write_frame(&mut stream, &request.encode()).await?;

    let Some(frame) = http::read_frame(&mut stream).await? else {
        return Err(Error::Protocol(format!(
            "server closed the connection before answering client {seq}"
        )));
    };

    shared.lock().await.cache.put(kind, frame);

    Ok(())
}

/// Builds the request for one of the seven kinds a client can pick.
pub fn request_for(kind: u8, source_ip: String, source_port: String) -> Request {
    let mut request = match kind % 7 {
        0 => Request::new(Method::Get, DOWNLOAD_URL),
        1 => Request::new(Method::Head, DOWNLOAD_URL),
        2 => {
            let mut request = Request::new(Method::Put, UPLOAD_URL);
            request.content_type = Some(String::from("text/plain"));
            request.content_length = Some(String::from("14"));
            request.body = String::from("I'm a message.");
            request
        }
        3 => {
            let mut request = Request::new(Method::Post, UPLOAD_URL);
            request.content_type = Some(String::from("text/plain"));
            request.content_length = Some(String::from("9"));
            request.body = String::from("color=red");
            request
        }
        4 => Request::new(Method::Trace, DOWNLOAD_URL),
        5 => Request::new(Method::Options, "*"),
        _ => Request::new(Method::Delete, DELETE_URL),
    };

    request.host = Some(String::from("localhost"));

    if matches!(
        request.method,
        Method::Get | Method::Head | Method::Trace | Method::Options
    ) {
        request.accept = Some(String::from("*"));
    }

    request.source(source_ip, source_port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::request::Request as Parsed;

    #[test]
    fn every_kind_builds_a_parsable_request() {
        let methods = [
            Method::Get,
            Method::Head,
            Method::Put,
            Method::Post,
            Method::Trace,
            Method::Options,
            Method::Delete,
        ];

        for kind in 0..7u8 {
            let request = request_for(kind, String::from("127.0.0.1"), String::from("49152"));
            let parsed = Parsed::parse(&request.encode()).unwrap();

            assert_eq!(parsed.method, methods[kind as usize]);
            assert_eq!(
                parsed.routing_pair(),
                (String::from("127.0.0.1"), String::from("49152"))
            );
        }
    }

    #[test]
    fn body_carrying_kinds_have_content_headers() {
        let put = request_for(2, String::from("127.0.0.1"), String::from("1"));
        assert_eq!(put.body, "I'm a message.");
        assert_eq!(put.content_type.as_deref(), Some("text/plain"));

        let post = request_for(3, String::from("127.0.0.1"), String::from("1"));
        assert_eq!(post.body, "color=red");
    }
}
