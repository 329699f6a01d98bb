//! Operator CLI for context stores.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing::info;

use ctxstore_core::ContextStorage;
use ctxstore_infrastructure::StorageFactory;
use ctxstore_shared::config::Overrides;
use ctxstore_shared::telemetry::init_telemetry;
use ctxstore_shared::utils::mask_credentials;
use ctxstore_shared::StorageSettings;

#[derive(Parser)]
#[command(name = "ctxstore-cli")]
#[command(about = "Inspect and maintain conversation context stores")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Connection string, `<scheme>://<address>`
    #[arg(short, long, env = "CTXSTORE_CONNECTION")]
    connection: Option<String>,

    /// Table / collection / key prefix
    #[arg(short, long)]
    prefix: Option<String>,

    /// Settings file (without extension), e.g. config/ctxstore
    #[arg(long)]
    config: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a context as JSON
    Read { id: String },
    /// Delete a context and all of its entries
    Delete { id: String },
    /// Delete every context under the prefix
    Clear {
        /// Required, the operation cannot be undone
        #[arg(long)]
        yes: bool,
    },
    /// List known backends and whether this build includes them
    Backends,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_telemetry(cli.json_logs);

    let factory = StorageFactory::new();
    let overrides = Overrides {
        connection: cli.connection,
        table_prefix: cli.prefix,
    };
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Read { id } => {
            let storage = open(&factory, config, &overrides).await?;
            let ctx = storage.read(&id).await?;
            if !ctx.is_persisted() {
                info!("Context {} does not exist", id);
            }
            println!("{}", serde_json::to_string_pretty(&ctx)?);
        }
        Commands::Delete { id } => {
            let storage = open(&factory, config, &overrides).await?;
            storage.delete(&id).await?;
            println!("Deleted {}", id);
        }
        Commands::Clear { yes } => {
            let storage = open(&factory, config, &overrides).await?;
            if !yes {
                anyhow::bail!("refusing to clear {} without --yes", storage.backend());
            }
            storage.clear_all().await?;
            println!("Cleared all contexts from {}", storage.backend());
        }
        Commands::Backends => print_backends(&factory),
    }

    Ok(())
}

async fn open(
    factory: &StorageFactory,
    config: Option<&str>,
    overrides: &Overrides,
) -> anyhow::Result<ContextStorage> {
    let settings = StorageSettings::load_with(config, overrides)?;
    factory
        .open(&settings)
        .await
        .with_context(|| format!("cannot open {}", mask_credentials(&settings.connection)))
}

fn print_backends(factory: &StorageFactory) {
    println!("{:<12} {:<18} {:<10} SCHEMES", "BACKEND", "FAMILY", "BUILT-IN");
    for backend in factory.backends() {
        println!(
            "{:<12} {:<18} {:<10} {}",
            backend.name,
            backend.family.to_string(),
            if backend.available { "yes" } else { "no" },
            backend.schemes.join(", ")
        );
    }
}
