//! Developer CLI for Signkit.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use signkit_core::{choose_mode, Action, Environment};
use tracing_subscriber::EnvFilter;

mod simulate;

#[derive(Parser)]
#[command(name = "signkit")]
#[command(about = "Passkey dialog negotiation tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Print the presentation mode chosen for an action on a platform
    Mode {
        #[arg(value_enum)]
        action: ActionArg,

        /// Classify this user agent instead of using --mobile/--safari
        #[arg(long)]
        user_agent: Option<String>,

        #[command(flatten)]
        platform: PlatformArgs,
    },

    /// Negotiate against a simulated authority surface and print the outcome
    Simulate(SimulateArgs),
}

#[derive(Clone, Copy, ValueEnum)]
enum ActionArg {
    Connect,
    Sign,
}

impl From<ActionArg> for Action {
    fn from(action: ActionArg) -> Self {
        match action {
            ActionArg::Connect => Self::Connect,
            ActionArg::Sign => Self::Sign,
        }
    }
}

#[derive(Args)]
struct PlatformArgs {
    /// Pretend to be a phone or tablet
    #[arg(long)]
    mobile: bool,

    /// Pretend to be Safari
    #[arg(long)]
    safari: bool,

    /// Pretend the host page is not a secure context
    #[arg(long)]
    insecure: bool,
}

impl PlatformArgs {
    const fn environment(&self) -> Environment {
        Environment {
            is_mobile: self.mobile,
            is_safari: self.safari,
            is_secure_context: !self.insecure,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SurfaceArg {
    /// Run the ceremony and answer
    Respond,
    /// Never answer
    Silent,
    /// Close from inside the surface
    Close,
    /// Answer from a foreign origin
    Impersonate,
    /// The user dismisses the surface
    Dismiss,
}

#[derive(Args)]
struct SimulateArgs {
    #[arg(value_enum)]
    action: ActionArg,

    /// Page of the authority surface
    #[arg(
        long,
        env = "SIGNKIT_AUTHORITY_URL",
        default_value = "https://portal.example.com/dialog"
    )]
    authority_url: String,

    /// JSON negotiator config; overrides --authority-url
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the response deadline
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[command(flatten)]
    platform: PlatformArgs,

    /// How the simulated surface behaves
    #[arg(long, value_enum, default_value_t = SurfaceArg::Respond)]
    surface: SurfaceArg,

    /// Delay before the surface answers
    #[arg(long, default_value_t = 50)]
    latency_ms: u64,

    /// Credential id of the passkey held by the surface
    #[arg(long, default_value = "abc")]
    credential_id: String,

    /// Store a session for this credential id before negotiating
    #[arg(long)]
    stored: Option<String>,

    /// Wallet address the surface reports on connect
    #[arg(long)]
    smart_wallet_address: Option<String>,

    /// The surface asks for stored credentials before answering
    #[arg(long)]
    request_credentials: bool,

    /// The surface acknowledges credential sync with READY
    #[arg(long)]
    ack_sync: bool,

    /// Message to sign
    #[arg(long, default_value = "hello")]
    message: String,

    /// JSON instruction to wrap the signature into a transaction
    #[arg(long)]
    instruction: Option<String>,
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Command::Mode {
            action,
            user_agent,
            platform,
        } => {
            let environment = user_agent.map_or_else(
                || platform.environment(),
                |user_agent| Environment::from_user_agent(&user_agent, !platform.insecure),
            );
            tracing::debug!(?environment, "classified platform");
            println!("{}", choose_mode(action.into(), environment));
            Ok(())
        }
        Command::Simulate(args) => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()?;
            runtime.block_on(simulate::run(&args))
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use signkit_core::PresentationMode;

    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_simulate_flags() {
        let cli = Cli::parse_from([
            "signkit",
            "simulate",
            "sign",
            "--mobile",
            "--safari",
            "--surface",
            "silent",
            "--timeout-ms",
            "500",
        ]);
        let Command::Simulate(args) = cli.command else {
            panic!("expected simulate");
        };
        assert!(matches!(args.action, ActionArg::Sign));
        assert!(args.surface == SurfaceArg::Silent);
        assert_eq!(args.timeout_ms, Some(500));
        let environment = args.platform.environment();
        assert_eq!(
            choose_mode(Action::Sign, environment),
            PresentationMode::Embedded
        );
    }
}
