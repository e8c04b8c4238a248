//! The four-subcommand CLI surface: `broker`, `worker`, `run`, `run-local`.

use clap::{Args, Parser, Subcommand};

/// Fixed small exit-code enum shared by every subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Ok = 0,
    GeneralError = 1,
    InvalidArgs = 2,
    ConfigError = 3,
    TransportError = 4,
    Cancelled = 5,
    RemoteError = 6,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        self as i32
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct SslArgs {
    #[arg(long)]
    pub ssl_cert: Option<String>,
    #[arg(long)]
    pub ssl_key: Option<String>,
    #[arg(long)]
    pub ssl_ca: Option<String>,
    #[arg(long)]
    pub ssl_ciphers: Option<String>,
    #[arg(long)]
    pub ssl_versions: Option<String>,
}

#[derive(Parser, Debug)]
#[command(name = "reasonchip", about = "ReasonChip broker, worker, and pipeline client")]
pub struct Cli {
    /// `[LOGGER=]LEVEL`, repeatable — e.g. `info`, `reasonchip_core=debug`.
    #[arg(long = "log-level", global = true)]
    pub log_level: Vec<String>,

    /// Path to an INI config file; CLI flags override any value it sets.
    #[arg(long = "config", global = true)]
    pub config: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a broker: routes RUN/CANCEL from clients to workers.
    Broker {
        #[arg(long, default_value = "0.0.0.0:7700")]
        client_listen: String,
        #[arg(long, default_value = "0.0.0.0:7701")]
        worker_listen: String,
        #[command(flatten)]
        ssl: SslArgs,
    },
    /// Run a worker: executes pipelines dispatched by a broker.
    Worker {
        #[arg(long)]
        broker: String,
        /// `name=path`, repeatable.
        #[arg(long = "collection")]
        collections: Vec<String>,
        #[arg(long, default_value_t = 4)]
        workers: u32,
        #[command(flatten)]
        ssl: SslArgs,
    },
    /// Run a pipeline on a remote broker and print its JSON result.
    Run {
        #[arg(long)]
        broker: String,
        pipeline: String,
        /// JSON-encoded variables mapping.
        #[arg(long, default_value = "{}")]
        variables: String,
        #[command(flatten)]
        ssl: SslArgs,
    },
    /// Run a pipeline in-process, no broker involved.
    RunLocal {
        /// `name=path`, repeatable.
        #[arg(long = "collection")]
        collections: Vec<String>,
        pipeline: String,
        #[arg(long, default_value = "{}")]
        variables: String,
    },
}

/// Split one `[LOGGER=]LEVEL` flag value into (target, level); `target` is
/// `None` for the bare-level form, which sets the default directive.
pub fn split_log_directive(raw: &str) -> (Option<&str>, &str) {
    match raw.split_once('=') {
        Some((logger, level)) => (Some(logger), level),
        None => (None, raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_level_has_no_target() {
        assert_eq!(split_log_directive("debug"), (None, "debug"));
    }

    #[test]
    fn scoped_level_splits_on_equals() {
        assert_eq!(split_log_directive("reasonchip_core=trace"), (Some("reasonchip_core"), "trace"));
    }
}
