//! apiary - a native MQTT 3.1.1 broker for edge gateways.

use log::error;

use apiary::{Broker, Config};

struct Args {
    config_path: String,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = "apiary.toml".to_string();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                if i + 1 < args.len() {
                    config_path = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("Error: -c requires a file path");
                    std::process::exit(1);
                }
            }
            "-h" | "--help" => {
                println!("apiary - native MQTT 3.1.1 broker");
                println!();
                println!("Usage: apiary [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --config <FILE>     Config file path (default: apiary.toml)");
                println!("  -h, --help              Show this help message");
                println!();
                println!("Configuration:");
                println!("  Config file uses TOML format. All settings can be overridden");
                println!("  with environment variables using the APIARY__ prefix:");
                println!();
                println!("  APIARY__SERVER__PORT=1884");
                println!("  APIARY__LIMITS__MAX_PAYLOAD_SIZE=16384");
                println!("  APIARY__LOG__LEVEL=debug");
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                eprintln!("Use --help for usage information");
                std::process::exit(1);
            }
        }
    }

    Args { config_path }
}

fn main() {
    let args = parse_args();

    let config = match Config::load(&args.config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.log.level),
    )
    .init();

    let mut broker = match Broker::new(config) {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to start broker: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = broker.run() {
        error!("Broker error: {}", e);
        std::process::exit(1);
    }
}
