use std::{fs, path::Path};

use anyhow::Result;
use clap::Parser;
use log::LevelFilter;
use log4rs::{
    append::console::ConsoleAppender,
    config::{Appender, Root},
};

use funderr::{
    repositories::Repositories,
    services,
    settings::{Settings, StorageBackend},
};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[arg(short, long, default_value = "config.toml")]
    config: String,
    #[arg(long, default_value = "log4rs.yaml")]
    log4rs: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    init_logging(&args.log4rs)?;
    log::info!("Starting Funderr API.");

    let settings = Settings::load(&args.config)?;

    let repositories = match settings.storage.backend {
        StorageBackend::Postgres => {
            log::info!("Connecting to PostgreSQL.");
            Repositories::postgres(&settings.database.url, settings.database.max_connections)
                .await?
        }
        StorageBackend::Memory => {
            log::warn!("Using in-memory storage; data is lost on restart.");
            Repositories::in_memory()
        }
    };

    services::start_services(repositories, settings).await
}

fn init_logging(path: &str) -> Result<()> {
    if !Path::new("logs").exists() {
        fs::create_dir("logs")?;
    }

    match log4rs::init_file(path, Default::default()) {
        Ok(_) => Ok(()),
        Err(e) => {
            eprintln!("[WARN] Could not load {}: {}. Logging to console.", path, e);

            let stdout = ConsoleAppender::builder().build();
            let config = log4rs::Config::builder()
                .appender(Appender::builder().build("stdout", Box::new(stdout)))
                .build(Root::builder().appender("stdout").build(LevelFilter::Info))?;
            log4rs::init_config(config)?;

            Ok(())
        }
    }
}
