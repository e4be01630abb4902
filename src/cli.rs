//! Command-line interface for taskmaster.
use clap::Parser;
use std::str::FromStr;
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse the log levels the
/// configuration surface documents (`debug`, `info`, `warning`, `error`).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for an `EnvFilter` directive.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl Default for LogLevelArg {
    fn default() -> Self {
        LogLevelArg(LevelFilter::WARN)
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for taskmaster.
#[derive(Parser)]
#[command(name = "taskmaster", version, author)]
#[command(about = "A process supervisor", long_about = None)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'f', long = "file", default_value = "taskmaster.yml")]
    pub file: String,

    /// Generate a skeleton configuration file at the given path and exit.
    #[arg(short = 'g', long = "generate", value_name = "PATH")]
    pub generate: Option<String>,

    /// Logging verbosity (debug, info, warning, error).
    #[arg(short = 'l', long = "loglevel", value_name = "LEVEL", default_value = "warning")]
    pub log_level: LogLevelArg,
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
