use log::{error, info};
use rlb::{
    balancer::Balancer,
    config::{Algorithm, Config},
    logger::Logger,
};

fn usage(program: &str) {
    println!("Usage: {program} <scheduling algorithm>");
    println!("RR:  Round Robin");
    println!("WRR: Weighted Round Robin");
    println!("LC:  Least Connection");
    println!("WLC: Weighted Least Connection (Recommended)");
    println!("DH:  Destination Hashing");
    println!("SH:  Source Hashing");
}

#[tokio::main]
async fn main() {
    Logger::new()
        .label("balancer")
        .init()
        .expect("failed to initialize the logger");

    let mut args = std::env::args();
    let program = args.next().unwrap_or_else(|| String::from("balancer"));

    let Some(token) = args.next() else {
        usage(&program);
        return;
    };

    let algorithm: Algorithm = match token.parse() {
        Ok(algorithm) => algorithm,
        Err(err) => {
            error!("{err}");
            usage(&program);
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
    config.balancer.algorithm = algorithm;

    info!("balancer {} starting with {token}", rlb::VERSION);

    let result = match Balancer::init(config.balancer).await {
        Ok(balancer) => balancer.run().await,
        Err(err) => Err(err),
    };

    if let Err(err) = result {
        error!("fatal: {err}");
        std::process::exit(1);
    }
}
