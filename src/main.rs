use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use vestcalc::api;
use vestcalc::core::{ScenarioConfig, build_graph};

#[derive(Parser, Debug)]
#[command(
    name = "vestcalc",
    about = "Equity compensation and tax calculator (RSU/NSO/ISO vesting, sales, AMT)"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the JSON API.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Evaluate a scenario file and print the requested nodes as JSON.
    Eval {
        #[arg(long)]
        scenario: PathBuf,
        #[arg(long = "node", help = "Node to report; repeat for several")]
        nodes: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match Cli::parse().command {
        Command::Serve { port } => {
            if let Err(e) = api::run_http_server(port).await {
                eprintln!("Server error: {e}");
                std::process::exit(1);
            }
        }
        Command::Eval { scenario, nodes } => match eval(&scenario, nodes) {
            Ok(report) => println!("{report}"),
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        },
    }
}

fn eval(path: &Path, nodes: Vec<String>) -> Result<String, String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {}: {e}", path.display()))?;
    let config: ScenarioConfig =
        serde_json::from_str(&raw).map_err(|e| format!("Invalid scenario JSON: {e}"))?;
    let graph = build_graph(&config).map_err(|e| e.to_string())?;
    let names = if nodes.is_empty() {
        api::default_report_names()
    } else {
        nodes
    };
    let values = api::report(&graph, &names).map_err(|e| e.to_string())?;
    serde_json::to_string_pretty(&values).map_err(|e| format!("Failed to encode report: {e}"))
}
