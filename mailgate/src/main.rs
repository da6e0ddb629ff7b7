use clap::{Args, Parser, Subcommand};
use mailgate::config::{Cfg, CfgLog, LogFormat};
use mailgate::{open_filters, run_chain, MessageContext};
use miette::{Context, IntoDiagnostic, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mailgate", version, about = "Greylisting, auto-whitelisting and sender dialback")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the filter chain for one message and print its decision
    Check(CheckArgs),
    /// Remove expired records from the stores of every enabled filter
    Purge,
}

#[derive(Args)]
struct CheckArgs {
    /// Envelope sender; empty for bounces
    #[arg(long, default_value = "")]
    sender: String,

    /// Envelope recipient, repeatable
    #[arg(long = "rcpt", required = true)]
    recipients: Vec<String>,

    /// Address of the connecting client
    #[arg(long)]
    ip: Option<String>,

    /// SMTP AUTH user, if the client authenticated
    #[arg(long)]
    auth: Option<String>,

    /// Run only these filters, repeatable
    #[arg(long = "filter")]
    filters: Vec<String>,
}

fn init_tracing(cfg: &CfgLog) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.level))
        .into_diagnostic()
        .wrap_err("parsing log level")?;

    // stdout is reserved for the decision.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);
    let installed = match cfg.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    installed.map_err(|e| miette::miette!("installing log subscriber: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = Cfg::load(&cli.config).wrap_err("loading config")?;
    init_tracing(&cfg.log)?;

    match cli.command {
        Command::Check(args) => {
            let filters = open_filters(&cfg, &args.filters).await?;
            let msg = MessageContext {
                sender: args.sender,
                recipients: args.recipients,
                sender_ip: args.ip,
                auth_user: args.auth,
            };
            let decision = run_chain(&filters, &msg).await;
            println!("{}", decision);
        }
        Command::Purge => {
            let filters = open_filters(&cfg, &[]).await?;
            let mut failed = 0;
            for filter in &filters {
                match filter.purge().await {
                    Ok(()) => info!(filter = filter.name(), "Purged"),
                    Err(err) => {
                        error!(filter = filter.name(), error = %err, "Purge failed");
                        failed += 1;
                    }
                }
            }
            if failed > 0 {
                miette::bail!("{} filter(s) failed to purge", failed);
            }
        }
    }

    Ok(())
}
