use std::env;
use std::fs;
use std::process::ExitCode;

use log::{error, info};

use gridflow::config::SolverConfig;
use gridflow::export::results_summary;
use gridflow::loadflow::{Method, run_load_flow};
use gridflow::parse::read_case;
use gridflow::server::{DEFAULT_ADDR, run_server};

const USAGE: &str = "usage: gridflow [<case file> [nr|gs|fd] [config.json]]\n\
                     With no arguments the HTTP server is started.";

fn init_logging() -> std::io::Result<()> {
    let path = env::var("GRIDFLOW_LOG").unwrap_or_else(|_| "gridflow.log".to_string());
    let log_file = fs::File::create(path)?;

    // default level info, RUST_LOG still overrides
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .init();
    Ok(())
}

fn solve_file(args: &[String]) -> gridflow::Result<String> {
    let mut network = read_case(&args[0])?;
    let method = match args.get(1) {
        Some(m) => m.parse()?,
        None => Method::NewtonRaphson,
    };
    let config = match args.get(2) {
        Some(path) => SolverConfig::for_method(method).with_overrides_file(path)?,
        None => SolverConfig::for_method(method),
    };
    let solution = run_load_flow(&mut network, method, &config)?;
    Ok(results_summary(&network, &solution))
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_logging() {
        eprintln!("Could not create log file: {}", e);
        return ExitCode::FAILURE;
    }
    info!("Beginning run...");

    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        println!("{}", USAGE);
        return ExitCode::SUCCESS;
    }

    if args.is_empty() {
        let addr = env::var("GRIDFLOW_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.to_string());
        return match run_server(&addr).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Server error: {}", e);
                eprintln!("Server error: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    match solve_file(&args) {
        Ok(summary) => {
            print!("{}", summary);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}
