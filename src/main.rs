use clap::{Args, Parser, Subcommand};
use outcome_reporter::config::Config;
use outcome_reporter::secrets::{self, SecretsManagerConfig};
use outcome_reporter::server;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "outcome-reporter",
    version,
    about = "Reporter agent for the on-chain outcome-resolution protocol"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the reporter agent, bootstrapping all modules together
    Server(ServerArgs),
    /// Manage reporter secrets
    Secrets {
        #[command(subcommand)]
        command: SecretsCommands,
    },
}

#[derive(Args)]
struct ServerArgs {
    /// Path to the YAML config file
    #[arg(long)]
    config: PathBuf,
    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum SecretsCommands {
    /// Initialize secrets stores and the reporter key
    Init(SecretsInitArgs),
}

#[derive(Args)]
struct SecretsInitArgs {
    /// Data directory for the local secrets store
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Path to a secrets-manager config file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,
    /// How many secrets stores to initialize
    #[arg(long, default_value_t = 1)]
    num: u32,
    /// Generate a new ECDSA reporter key (pass `--ecdsa=false` to skip)
    #[arg(
        long,
        default_value_t = true,
        action = clap::ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    ecdsa: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        eprintln!("failed to install rustls crypto provider");
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Server(args) => run_server(args).await,
        Commands::Secrets {
            command: SecretsCommands::Init(args),
        } => secrets_init(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let config = Config::load(&args.config)?;
    server::init_logging(args.json || config.json_log_format);
    server::run(config).await
}

fn secrets_init(args: SecretsInitArgs) -> anyhow::Result<()> {
    if args.data_dir.is_none() && args.config.is_none() {
        anyhow::bail!("no config file or data directory passed in");
    }
    if !(1..=30).contains(&args.num) {
        anyhow::bail!("--num must be within 1..30");
    }

    let secrets_config = match &args.config {
        Some(path) => Some(SecretsManagerConfig::read(path)?),
        None => None,
    };

    for i in 0..args.num {
        let data_dir = match &args.data_dir {
            Some(dir) if args.num > 1 => PathBuf::from(format!("{}{}", dir.display(), i + 1)),
            Some(dir) => dir.clone(),
            None => PathBuf::from("."),
        };

        let manager = secrets::new_secrets_manager(secrets_config.as_ref(), &data_dir)?;

        let address = if args.ecdsa {
            secrets::init_reporter_key(manager.as_ref())?
        } else {
            secrets::load_reporter_address(manager.as_ref())?
        };

        println!("[SECRETS INIT]");
        println!("Reporter address = {address}");
    }

    Ok(())
}
