//! Structs and enums derived from the optional `rlb.toml` config file using
//! [`serde`]. Every field has a default matching the well-known deployment
//! (balancer on `127.0.0.1:60000`, workers on `127.0.0.2..127.0.0.4:50000`),
//! so the file can be partial or missing entirely. The positional CLI
//! arguments described in each binary override the relevant fields.

use std::{net::SocketAddr, path::Path, str::FromStr};

use serde::Deserialize;

use crate::Error;

/// Number of handler tasks every worker starts up front. Handlers below this
/// index are permanent and get replaced when they die.
pub const PREFORKED: usize = 5;

/// Workers probed by the balancer at startup when no explicit list is given:
/// `127.0.0.2` to `127.0.0.(1 + MAX_REAL_SERVER)`.
pub const MAX_REAL_SERVER: usize = 3;

/// Default port workers listen on.
pub const WORKER_PORT: u16 = 50000;

/// Top level configuration, one section per program.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub balancer: BalancerConfig,
    pub worker: WorkerConfig,
    pub client: ClientConfig,
}

impl Config {
    /// Reads the config from `path` if the file exists, otherwise returns
    /// the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(err.into()),
        }
    }
}

/// Balancer process configuration.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct BalancerConfig {
    /// Client-facing listening address.
    pub listen: SocketAddr,

    /// Worker endpoints probed at startup. Unreachable entries are skipped;
    /// an empty surviving pool is fatal.
    pub workers: Vec<SocketAddr>,

    /// Scheduling policy. The CLI argument takes precedence.
    pub algorithm: Algorithm,

    /// Seconds between health-check rounds.
    pub health_check_interval: u64,

    /// Path of the PID lock file that enforces a single balancer instance.
    pub pid_file: String,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        let workers = (1..=MAX_REAL_SERVER)
            .map(|i| {
                format!("127.0.0.{}:{WORKER_PORT}", i + 1)
                    .parse()
                    .unwrap()
            })
            .collect();

        Self {
            listen: "127.0.0.1:60000".parse().unwrap(),
            workers,
            algorithm: Algorithm::Wlc,
            health_check_interval: 30,
            pid_file: String::from("balancer.pid"),
        }
    }
}

/// Worker process configuration.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    /// Address the worker listens on for its single balancer connection.
    pub listen: SocketAddr,

    /// Handler pool ceiling. Must be at least [`preforked`](Self::preforked);
    /// this is also the capacity the worker advertises on SERVERCHECK.
    pub max_children: usize,

    /// Handlers started up front. Defaults to [`PREFORKED`].
    pub preforked: usize,

    /// Seconds an on-demand handler may sit idle before it is reaped.
    pub idle_timeout: u64,

    /// A handler exits cleanly with probability `1/chaos_exit` after
    /// finishing a request, exercising the supervisor's recovery path.
    /// `0` disables the behavior.
    pub chaos_exit: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen: format!("127.0.0.2:{WORKER_PORT}").parse().unwrap(),
            max_children: 10,
            preforked: PREFORKED,
            idle_timeout: 20,
            chaos_exit: 50,
        }
    }
}

/// Client generator configuration.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ClientConfig {
    /// Number of concurrent one-shot clients to spawn.
    pub clients: usize,

    /// Address of the balancer.
    pub target: SocketAddr,

    /// Capacity of the shared LRU response cache.
    pub cache_capacity: usize,

    /// Clients are spawned in bursts of this size...
    pub spawn_burst: usize,

    /// ...separated by this pause, so the balancer's accept queue is not
    /// flooded at startup.
    pub spawn_delay_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            clients: 1,
            target: "127.0.0.1:60000".parse().unwrap(),
            cache_capacity: 3,
            spawn_burst: 10,
            spawn_delay_ms: 1000,
        }
    }
}

/// Scheduling policy used by the balancer to pick a worker for each request.
/// See [`crate::sched`] for the algorithm implementations.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Round Robin.
    #[serde(rename = "RR")]
    Rr,

    /// Weighted Round Robin.
    #[serde(rename = "WRR")]
    Wrr,

    /// Least Connection.
    #[serde(rename = "LC")]
    Lc,

    /// Weighted Least Connection (recommended).
    #[serde(rename = "WLC")]
    Wlc,

    /// Destination Hashing.
    #[serde(rename = "DH")]
    Dh,

    /// Source Hashing.
    #[serde(rename = "SH")]
    Sh,
}

impl FromStr for Algorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RR" => Ok(Algorithm::Rr),
            "WRR" => Ok(Algorithm::Wrr),
            "LC" => Ok(Algorithm::Lc),
            "WLC" => Ok(Algorithm::Wlc),
            "DH" => Ok(Algorithm::Dh),
            "SH" => Ok(Algorithm::Sh),
            other => Err(Error::Usage(format!("unknown scheduling algorithm: {other}"))),
        }
    }
}
