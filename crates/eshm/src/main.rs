mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "eshm", version, about = "Shared-memory master/slave messaging CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true, env = "ESHM_FORMAT")]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(
        long,
        value_name = "FORMAT",
        default_value = "text",
        global = true,
        env = "ESHM_LOG_FORMAT"
    )]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(
        long,
        value_name = "LEVEL",
        default_value = "warn",
        global = true,
        env = "ESHM_LOG_LEVEL"
    )]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    match cmd::run(cli.command, format) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_with_items() {
        let cli = Cli::try_parse_from([
            "eshm",
            "send",
            "sensors",
            "--item",
            "counter=int:42",
            "--item",
            "status=str:OK",
            "--role",
            "slave",
        ])
        .expect("send args should parse");

        match cli.command {
            Command::Send(args) => {
                assert_eq!(args.link.name, "sensors");
                assert_eq!(args.item.len(), 2);
            }
            other => panic!("expected send, got {other:?}"),
        }
    }

    #[test]
    fn rejects_items_with_raw_payload() {
        let err = Cli::try_parse_from([
            "eshm",
            "send",
            "sensors",
            "--item",
            "counter=int:1",
            "--data",
            "hello",
        ])
        .expect_err("conflicting args should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn parses_listen_with_global_format() {
        let cli = Cli::try_parse_from([
            "eshm", "listen", "sensors", "--count", "3", "--raw", "--format", "json",
        ])
        .expect("listen args should parse");
        assert!(matches!(cli.format, Some(OutputFormat::Json)));
        assert!(matches!(cli.command, Command::Listen(ref args) if args.count == Some(3) && args.raw));
    }

    #[test]
    fn parses_stats_subcommand() {
        let cli = Cli::try_parse_from(["eshm", "stats", "sensors"]).expect("stats should parse");
        assert!(matches!(cli.command, Command::Stats(_)));
    }

    #[test]
    fn rejects_unknown_disconnect_behavior() {
        let err = Cli::try_parse_from(["eshm", "echo", "sensors", "--disconnect", "sometimes"])
            .expect_err("unknown behavior should fail");
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }
}
