use std::net::{IpAddr, SocketAddr};

use log::error;
use rlb::{client::Generator, config::Config, logger::Logger};

#[tokio::main]
async fn main() {
    Logger::new()
        .label("loadgen")
        .init()
        .expect("failed to initialize the logger");

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 4 {
        println!("Usage: {} <#clients> <host> <port>", args[0]);
        return;
    }

    let clients: usize = match args[1].parse() {
        Ok(n) => n,
        Err(_) => {
            error!("<#clients> must be a number, got {:?}", args[1]);
            std::process::exit(1);
        }
    };

    let host: IpAddr = match args[2].as_str() {
        "localhost" => "127.0.0.1".parse().unwrap(),
        other => match other.parse() {
            Ok(address) => address,
            Err(_) => {
                error!("<host> must be an IP address, got {:?}", args[2]);
                std::process::exit(1);
            }
        },
    };

    let port: u16 = match args[3].parse() {
        Ok(port) => port,
        Err(_) => {
            error!("<port> must be a port number, got {:?}", args[3]);
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
    config.client.clients = clients;
    config.client.target = SocketAddr::new(host, port);

    match Generator::new(config.client).run().await {
        Ok(report) => {
            println!("Cache hit rate: {:.2}", report.hit_rate());
            println!("Time used: {} microseconds", report.elapsed.as_micros());
        }
        Err(err) => {
            error!("fatal: {err}");
            std::process::exit(1);
        }
    }
}
