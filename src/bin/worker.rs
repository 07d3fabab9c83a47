use std::net::{IpAddr, SocketAddr};

use log::{error, info};
use rlb::{config::Config, logger::Logger, worker::Supervisor};

#[tokio::main]
async fn main() {
    Logger::new()
        .label("worker")
        .init()
        .expect("failed to initialize the logger");

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        println!("Usage: {} <max_children> <bind_address>", args[0]);
        return;
    }

    let max_children: usize = match args[1].parse() {
        Ok(n) => n,
        Err(_) => {
            error!("<max_children> must be a number, got {:?}", args[1]);
            std::process::exit(1);
        }
    };

    let address: IpAddr = match args[2].parse() {
        Ok(address) => address,
        Err(_) => {
            error!("<bind_address> must be an IP address, got {:?}", args[2]);
            std::process::exit(1);
        }
    };

    let mut config = match Config::load("rlb.toml") {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            std::process::exit(1);
        }
    };
    config.worker.max_children = max_children;
    config.worker.listen = SocketAddr::new(address, config.worker.listen.port());

    info!("worker {} starting on {}", rlb::VERSION, config.worker.listen);

    let result = match Supervisor::init(config.worker).await {
        Ok(supervisor) => supervisor.run().await,
        Err(err) => Err(err),
    };

    if let Err(err) = result {
        error!("fatal: {err}");
        std::process::exit(1);
    }
}
