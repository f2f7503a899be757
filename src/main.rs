use std::path::Path;
use std::sync::Arc;

use mongodb::{options::ClientOptions, Client};

use chat_store::db_utils::indexes;
use chat_store::error::Error;
use chat_store::{ensure_indexes, Config, MongoStore, ValidateMode};

#[derive(Debug, Default)]
struct Args {
    check: bool,
    print_indexes: bool,
}

impl Args {
    fn parse(args: impl Iterator<Item = String>) -> Result<Self, Error> {
        let mut res = Args::default();
        for arg in args {
            match arg.as_str() {
                "--check" => res.check = true,
                "--print-indexes" => res.print_indexes = true,
                _ => return Err(Error::Usage(arg)),
            }
        }
        Ok(res)
    }
}

fn init_logger(path: &Path) -> Result<(), Error> {
    if path.exists() {
        log4rs::init_file(path, Default::default()).map_err(|e| Error::Logger {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    } else {
        pretty_env_logger::try_init()?;
        log::debug!("{} not found, logging to stderr", path.display());
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Error> {
    let args = Args::parse(std::env::args().skip(1))?;

    if args.print_indexes {
        println!("{}", serde_json::to_string_pretty(indexes::catalogue())?);
        return Ok(());
    }

    if let Err(e) = dotenv::dotenv() {
        eprintln!("No .env loaded: {}", e);
    }
    let config = Config::from_env()?;
    init_logger(&config.log_config)?;
    log::info!("Starting chat store initialisation");

    let mut options = ClientOptions::parse(&config.mongodb_uri).await?;
    options.min_pool_size = config.min_pool_size;
    options.max_pool_size = config.max_pool_size;
    let client = Arc::new(Client::with_options(options)?);
    let store = MongoStore::new(client, config.db_name.as_str(), config.page_limits);

    let mode = if args.check {
        ValidateMode::Check
    } else {
        ValidateMode::Create
    };
    let report = ensure_indexes(&store.database(), mode).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_complete() {
        let missing = report.collections.values().map(|c| c.missing.len()).sum();
        return Err(Error::MissingIndexes(missing));
    }
    log::info!("Created {} indexes", report.created());
    Ok(())
}
