use std::path::PathBuf;

use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::Value;

use bulwark::config::load_config;
use bulwark::config::schema::DEFAULT_ADMIN_KEY;

#[derive(Parser)]
#[command(name = "bulwark-cli")]
#[command(about = "Management CLI for the Bulwark daemon", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8080")]
    url: String,

    /// Admin API key (`admin.api_key` in the daemon config)
    #[arg(short, long, default_value = DEFAULT_ADMIN_KEY)]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check daemon status
    Status,
    /// Show the startup report
    Ready,
    /// List circuit breakers
    Breakers,
    /// Force a breaker open
    Open { name: String },
    /// Force a breaker closed
    Close { name: String },
    /// Show connection manager metrics
    Connections,
    /// Show per-channel boundary statistics
    Boundary,
    /// Validate a config file without contacting the daemon
    Validate { config: PathBuf },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let request = match cli.command {
        Commands::Validate { config } => {
            return match load_config(&config) {
                Ok(parsed) => {
                    println!(
                        "{} is valid ({} startup components)",
                        config.display(),
                        parsed.startup.components.len()
                    );
                    Ok(())
                }
                Err(e) => {
                    eprintln!("{}: {}", config.display(), e);
                    std::process::exit(1);
                }
            };
        }
        Commands::Status => client.get(format!("{}/admin/status", cli.url)),
        Commands::Ready => client.get(format!("{}/health/ready", cli.url)),
        Commands::Breakers => client.get(format!("{}/admin/breakers", cli.url)),
        Commands::Open { name } => client.post(format!("{}/admin/breakers/{}/open", cli.url, name)),
        Commands::Close { name } => client.post(format!("{}/admin/breakers/{}/close", cli.url, name)),
        Commands::Connections => client.get(format!("{}/admin/connections", cli.url)),
        Commands::Boundary => client.get(format!("{}/admin/boundary", cli.url)),
    };

    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );

    print_response(request.headers(headers).send().await?).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;
    if !status.is_success() {
        eprintln!("Error: daemon returned status {}", status);
    }

    // readiness failures still carry a JSON report worth printing
    match serde_json::from_str::<Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{}", text),
    }
    Ok(())
}
