//! courier - remote SQL execution over direct, IAM or SSH connections.

use db_courier::cli::{render_outcome, Cli};
use db_courier::config::Settings;
use db_courier::error::Result;
use db_courier::logging;
use db_courier::query::RemoteExecutor;
use tracing::{debug, info};

#[tokio::main]
async fn main() {
    // Before parsing so `.env` can supply COURIER_CREDENTIALS.
    let dotenv = dotenvy::dotenv();
    let cli = Cli::parse_args();
    logging::init_stderr_logging(cli.verbose);
    if let Ok(path) = dotenv {
        debug!("Loaded environment from {}", path.display());
    }

    if let Err(e) = run(cli).await {
        eprintln!("{}: {}", e.category(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config_path();
    info!("Loading config from: {}", config_path.display());
    let settings = Settings::load_from_file(&config_path)?;
    let executor = RemoteExecutor::from_settings(&settings);

    if cli.clear_cache {
        let removed = executor.cache().clear()?;
        println!("{removed} cached results removed");
        return Ok(());
    }

    let format = cli.parse_output_format()?;
    let request = cli.to_request()?;
    let outcome = executor.execute(request).await?;

    if let Some(meta) = outcome.rows().and_then(|r| r.cache.as_ref()) {
        info!("Cache: {meta}");
    }
    println!("{}", render_outcome(&outcome, format)?);
    Ok(())
}
