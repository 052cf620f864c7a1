mod config;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use api::AppState;
use config::Config;
use docsvc::DocService;
use storage::SqliteVfs;

#[derive(Parser)]
#[command(name = "docfs", about = "Database-backed virtual file system server")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file path (default: ~/.docfs/config.toml)
    #[arg(long, global = true)]
    config: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server in the foreground (default)
    Start,
    /// Write a default config file and exit
    InitConfig,
    /// Validate the config and database, then exit
    Check,
}

fn load_config(cli: &Cli) -> Config {
    match &cli.config {
        Some(path) => Config::load_from(std::path::Path::new(path)),
        None => Config::load(),
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("docfs={level},api={level},storage={level},docsvc={level}")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command.as_ref().unwrap_or(&Command::Start) {
        Command::InitConfig => {
            let path = cli
                .config
                .as_ref()
                .map(std::path::PathBuf::from)
                .unwrap_or_else(Config::default_path);
            if path.exists() {
                eprintln!("config already exists at {}", path.display());
                std::process::exit(1);
            }
            let cfg = Config::default();
            if let Err(e) = cfg.save_to(&path) {
                eprintln!("failed to write config: {e}");
                std::process::exit(1);
            }
            println!("wrote {}", path.display());
        }
        Command::Check => {
            let cfg = load_config(&cli);
            init_tracing(&cfg.logging.level);
            if let Err(e) = check(&cfg) {
                eprintln!("config check failed: {e}");
                std::process::exit(1);
            }
            println!("ok");
        }
        Command::Start => {
            let cfg = load_config(&cli);
            init_tracing(&cfg.logging.level);
            if let Err(e) = run(cfg).await {
                tracing::error!("fatal: {e}");
                std::process::exit(1);
            }
        }
    }
}

fn check(cfg: &Config) -> Result<(), String> {
    cfg.vfs_root_keys()?;
    SqliteVfs::open(&cfg.db_path()).map_err(|e| e.to_string())?;
    Ok(())
}

async fn run(cfg: Config) -> Result<(), String> {
    let roots = cfg.vfs_root_keys()?;
    let db_path = cfg.db_path();

    let store = SqliteVfs::open(&db_path).map_err(|e| e.to_string())?;
    tracing::info!(path = %db_path.display(), "opened node store");

    let svc = Arc::new(DocService::new(Arc::new(store)));
    let state = AppState::new(svc, roots);

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    };

    api::serve(state, &cfg.api.addr, shutdown)
        .await
        .map_err(|e| e.to_string())
}
