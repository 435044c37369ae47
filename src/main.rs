use clap::Parser;
use env_logger::Env;

use fire_history::api::{Cli, Command, run_http_server, run_simulate_command};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Serve { port, data } => {
            if let Err(e) = run_http_server(port, data).await {
                log::error!("server error: {e}");
                std::process::exit(1);
            }
        }
        Command::Simulate(args) => match run_simulate_command(&args) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                log::error!("{e}");
                std::process::exit(1);
            }
        },
    }
}
