use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use skydeck_store::CredentialStoreEncryptionMode;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CliCredentialStoreEncryptionMode {
    None,
    Keyed,
}

impl From<CliCredentialStoreEncryptionMode> for CredentialStoreEncryptionMode {
    fn from(value: CliCredentialStoreEncryptionMode) -> Self {
        match value {
            CliCredentialStoreEncryptionMode::None => Self::None,
            CliCredentialStoreEncryptionMode::Keyed => Self::Keyed,
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "skydeck",
    about = "Multi-account session keeper for AT Protocol identities",
    version
)]
pub struct Cli {
    #[arg(
        long = "store-path",
        env = "SKYDECK_STORE_PATH",
        default_value = ".skydeck/accounts.json",
        global = true,
        help = "Path of the credential store file."
    )]
    pub store_path: PathBuf,

    #[arg(
        long = "store-encryption",
        env = "SKYDECK_STORE_ENCRYPTION",
        value_enum,
        default_value = "keyed",
        global = true,
        help = "Encryption applied to tokens at rest."
    )]
    pub store_encryption: CliCredentialStoreEncryptionMode,

    #[arg(
        long = "store-key",
        env = "SKYDECK_STORE_KEY",
        hide_env_values = true,
        global = true,
        help = "Key seed for keyed encryption. Defaults to a machine-derived seed."
    )]
    pub store_key: Option<String>,

    #[arg(
        long = "request-timeout-ms",
        env = "SKYDECK_REQUEST_TIMEOUT_MS",
        default_value_t = 10_000,
        value_parser = parse_positive_u64,
        global = true,
        help = "Per-request network timeout in milliseconds."
    )]
    pub request_timeout_ms: u64,

    #[arg(
        long = "max-agents",
        env = "SKYDECK_MAX_AGENTS",
        default_value_t = 10,
        value_parser = parse_positive_usize,
        global = true,
        help = "Upper bound on live protocol agents."
    )]
    pub max_agents: usize,

    #[arg(
        long = "reauth-threshold",
        env = "SKYDECK_REAUTH_THRESHOLD",
        default_value_t = 3,
        global = true,
        help = "Consecutive refresh failures before an account needs re-authentication."
    )]
    pub reauth_threshold: u32,

    #[arg(long, global = true, help = "Emit JSON instead of text.")]
    pub json: bool,

    #[arg(short, long, global = true, help = "Enable debug logging.")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub enum CliCommand {
    /// Validate every stored session, refreshing those close to expiry.
    Validate,
    /// Keep sessions fresh in the foreground until interrupted.
    Monitor(MonitorArgs),
    /// Create a session with an app password and store it.
    SignIn(SignInArgs),
    /// Remove an account and its stored credentials.
    SignOut(SignOutArgs),
    /// Stop keeping an account's session alive without deleting it.
    Deactivate(SignOutArgs),
    /// List stored accounts with their connection health.
    Accounts,
}

#[derive(Debug, clap::Args)]
pub struct MonitorArgs {
    #[arg(
        long = "tick-interval-ms",
        env = "SKYDECK_MONITOR_TICK_INTERVAL_MS",
        default_value_t = 1_000,
        value_parser = parse_positive_u64
    )]
    pub tick_interval_ms: u64,

    #[arg(
        long = "validate-interval-ms",
        env = "SKYDECK_MONITOR_VALIDATE_INTERVAL_MS",
        default_value_t = 60_000,
        value_parser = parse_positive_u64
    )]
    pub validate_interval_ms: u64,

    #[arg(
        long = "state-path",
        env = "SKYDECK_MONITOR_STATE_PATH",
        help = "Where to persist the monitor snapshot."
    )]
    pub state_path: Option<PathBuf>,

    #[arg(
        long = "duration-ms",
        value_parser = parse_positive_u64,
        help = "Stop after this long instead of waiting for Ctrl-C."
    )]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, clap::Args)]
pub struct SignInArgs {
    /// Handle, DID or email.
    #[arg(long)]
    pub identifier: String,

    #[arg(long, env = "SKYDECK_APP_PASSWORD", hide_env_values = true)]
    pub password: String,

    #[arg(long, env = "SKYDECK_SERVICE_URL")]
    pub service: Option<String>,
}

#[derive(Debug, clap::Args)]
pub struct SignOutArgs {
    /// Account DID.
    pub account: String,
}
