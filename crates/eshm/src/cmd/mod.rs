use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Subcommand, ValueEnum};
use eshm_link::{DisconnectBehavior, EndpointConfig, Role};

use crate::exit::{link_error, CliError, CliResult, INTERNAL, USAGE};
use crate::output::OutputFormat;

pub mod echo;
pub mod listen;
pub mod send;
pub mod stats;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Write one message to the peer.
    Send(SendArgs),
    /// Read and print messages from the peer.
    Listen(ListenArgs),
    /// Write every received message back to the peer.
    Echo(EchoArgs),
    /// Print a snapshot of a region's shared counters.
    Stats(StatsArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Send(args) => send::run(args, format),
        Command::Listen(args) => listen::run(args, format),
        Command::Echo(args) => echo::run(args, format),
        Command::Stats(args) => stats::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum RoleArg {
    Master,
    Slave,
    Auto,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Master => Role::Master,
            RoleArg::Slave => Role::Slave,
            RoleArg::Auto => Role::Auto,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
pub enum DisconnectArg {
    Immediately,
    OnTimeout,
    Never,
}

impl From<DisconnectArg> for DisconnectBehavior {
    fn from(behavior: DisconnectArg) -> Self {
        match behavior {
            DisconnectArg::Immediately => DisconnectBehavior::Immediately,
            DisconnectArg::OnTimeout => DisconnectBehavior::OnTimeout,
            DisconnectArg::Never => DisconnectBehavior::Never,
        }
    }
}

/// Endpoint options shared by every command that opens a region.
#[derive(Args, Debug)]
pub struct LinkArgs {
    /// Region name shared by both sides.
    pub name: String,
    /// Side of the region to take.
    #[arg(long, value_enum, default_value = "auto", env = "ESHM_ROLE")]
    pub role: RoleArg,
    /// What a stale peer means for reads and writes.
    #[arg(long, value_enum, default_value = "on-timeout", env = "ESHM_DISCONNECT")]
    pub disconnect: DisconnectArg,
    /// Heartbeat silence after which the peer is stale (e.g. 100ms, 1s).
    #[arg(long, default_value = "100ms", env = "ESHM_STALE_THRESHOLD")]
    pub stale_threshold: String,
    /// Total reconnection window; 0 = unlimited.
    #[arg(long, default_value = "5s", env = "ESHM_RECONNECT_WAIT")]
    pub reconnect_wait: String,
    /// Delay between reconnection attempts.
    #[arg(long, default_value = "100ms", env = "ESHM_RECONNECT_INTERVAL")]
    pub reconnect_interval: String,
    /// Reconnection attempt cap; 0 = unlimited.
    #[arg(long, default_value_t = 50, env = "ESHM_MAX_RECONNECT_ATTEMPTS")]
    pub max_reconnect_attempts: u32,
    /// Leave the region in place on exit even when no peer remains.
    #[arg(long, env = "ESHM_KEEP_REGION")]
    pub keep_region: bool,
}

impl LinkArgs {
    pub fn to_config(&self) -> CliResult<EndpointConfig> {
        let config = EndpointConfig::new(self.name.clone())
            .with_role(self.role.into())
            .with_disconnect_behavior(self.disconnect.into())
            .with_stale_threshold(parse_duration(&self.stale_threshold)?)
            .with_reconnect_wait(parse_optional_duration(&self.reconnect_wait)?)
            .with_reconnect_retry_interval(parse_duration(&self.reconnect_interval)?)
            .with_max_reconnect_attempts(
                (self.max_reconnect_attempts != 0).then_some(self.max_reconnect_attempts),
            )
            .with_auto_cleanup(!self.keep_region);
        config
            .validate()
            .map_err(|err| link_error("invalid endpoint options", err))?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct SendArgs {
    #[command(flatten)]
    pub link: LinkArgs,
    /// Typed item `key=type:value`; type is int, bool, real, str or hex. Repeatable.
    #[arg(long, value_name = "ITEM", conflicts_with_all = ["data", "file"])]
    pub item: Vec<String>,
    /// Raw string payload.
    #[arg(long, conflicts_with_all = ["item", "file"])]
    pub data: Option<String>,
    /// Read raw payload from file.
    #[arg(long, conflicts_with_all = ["item", "data"])]
    pub file: Option<PathBuf>,
    /// How long to wait for the peer to be live before writing (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_peer: String,
    /// Wait for one reply and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the reply when --wait is set.
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
    /// Print the reply without decoding items.
    #[arg(long)]
    pub raw: bool,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    #[command(flatten)]
    pub link: LinkArgs,
    /// Exit after receiving N messages.
    #[arg(long)]
    pub count: Option<usize>,
    /// Exit with a timeout error after this long without a message.
    #[arg(long)]
    pub timeout: Option<String>,
    /// Print payloads without decoding items.
    #[arg(long)]
    pub raw: bool,
}

#[derive(Args, Debug)]
pub struct EchoArgs {
    #[command(flatten)]
    pub link: LinkArgs,
    /// Exit after echoing N messages.
    #[arg(long)]
    pub count: Option<usize>,
}

#[derive(Args, Debug)]
pub struct StatsArgs {
    /// Region name.
    pub name: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Poll step for command loops that also watch for ctrl-c.
pub(crate) const READ_SLICE: Duration = Duration::from_millis(100);

pub(crate) fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

/// Like [`parse_duration`], but `0` (with or without unit) means unlimited.
pub(crate) fn parse_optional_duration(input: &str) -> CliResult<Option<Duration>> {
    match input.trim() {
        "0" | "0s" | "0ms" => Ok(None),
        other => parse_duration(other).map(Some),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds_and_millis() {
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn parse_duration_rejects_invalid_values() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn zero_reconnect_wait_means_unlimited() {
        assert_eq!(parse_optional_duration("0").unwrap(), None);
        assert_eq!(
            parse_optional_duration("250ms").unwrap(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn link_args_build_validated_config() {
        let args = LinkArgs {
            name: "sensors".to_string(),
            role: RoleArg::Slave,
            disconnect: DisconnectArg::Never,
            stale_threshold: "250ms".to_string(),
            reconnect_wait: "0".to_string(),
            reconnect_interval: "20ms".to_string(),
            max_reconnect_attempts: 0,
            keep_region: true,
        };
        let config = args.to_config().unwrap();
        assert_eq!(config.role, Role::Slave);
        assert_eq!(config.disconnect_behavior, DisconnectBehavior::Never);
        assert_eq!(config.stale_threshold, Duration::from_millis(250));
        assert_eq!(config.reconnect_wait, None);
        assert_eq!(config.max_reconnect_attempts, None);
        assert!(!config.auto_cleanup);
    }

    #[test]
    fn link_args_reject_bad_name() {
        let args = LinkArgs {
            name: String::new(),
            role: RoleArg::Auto,
            disconnect: DisconnectArg::OnTimeout,
            stale_threshold: "100ms".to_string(),
            reconnect_wait: "5s".to_string(),
            reconnect_interval: "100ms".to_string(),
            max_reconnect_attempts: 50,
            keep_region: false,
        };
        assert_eq!(args.to_config().unwrap_err().code, USAGE);
    }
}
