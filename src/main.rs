use clap::{Parser, Subcommand};
use standin::config::Config;
use standin::{logging, runtime};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Parser)]
#[command(name = "standin", version = VERSION, about = "Automated personal-assistant reply agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<MainCommand>,

    /// Log to the console instead of the data-dir log file
    #[arg(long, global = true)]
    console: bool,
}

#[derive(Debug, Subcommand)]
enum MainCommand {
    /// Start the Telegram dispatcher
    Start,
    /// Show version
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command.unwrap_or(MainCommand::Start) {
        MainCommand::Version => {
            println!("standin {VERSION}");
            Ok(())
        }
        MainCommand::Start => {
            let config = Config::load()?;
            if cli.console {
                logging::init_console_logging();
            } else {
                logging::init_logging(&config.data_dir)?;
            }
            info!("standin {VERSION} starting");
            runtime::run(config).await
        }
    }
}
