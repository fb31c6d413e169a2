use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use hello_router::{
    apps::{App, Demo},
    config::{ConfigManager, ConfigManagerType, EnvConfigManager, RouterConfig},
    logger::init_tracing,
    schema::write_schema,
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "hello_router",
    about = "Hello-world workflows behind a webhook or websocket ingress",
    version
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct GlobalArgs {
    /// Path to config.yaml
    #[arg(long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    /// Log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// .env file with overrides
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Webhook server, one hello world workflow per request
    Webhook,

    /// Websocket chat, one running workflow per source
    Websocket,

    /// Websocket chat resumed from snapshots turn by turn
    WebsocketSnapshots,

    /// Emit the JSON Schema of config.yaml
    Schema {
        #[arg(long, default_value = "schemas")]
        out: PathBuf,
    },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let demo = match cli.command {
        Commands::Schema { out } => {
            let path = write_schema(&out)?;
            println!("Schema written to {}", path.display());
            return Ok(());
        }
        Commands::Webhook => Demo::Webhook,
        Commands::Websocket => Demo::Websocket,
        Commands::WebsocketSnapshots => Demo::WebsocketSnapshots,
    };

    let env = EnvConfigManager::new(cli.global.env_file);
    let overrides = ConfigManager(env.clone_box());
    let mut config = RouterConfig::load(&cli.global.config, &overrides).await?;
    if let Some(level) = cli.global.log_level {
        config.log.level = level;
    }
    init_tracing(&config.log).context("could not set up logging")?;
    env.report();
    if !cli.global.config.exists() {
        info!("no config at {}, using defaults", cli.global.config.display());
    }

    let mut app = App::new();
    if let Err(err) = app.bootstrap(demo, &config).await {
        error!("Failed to bootstrap hello router: {err:#}");
        app.shutdown().await;
        return Err(err);
    }

    info!("hello router running; press Ctrl-C to exit");
    app.wait().await;

    info!("hello router shutting down");
    app.shutdown().await;
    Ok(())
}
