//! Configuration management for taskmaster.
use regex::Regex;
use serde::Deserialize;
use std::{collections::HashMap, fs, io, path::Path};
use strum_macros::AsRefStr;

use crate::error::ConfigError;

/// Maximum length of a service name.
pub const MAX_NAME_LEN: usize = 32;
/// Maximum number of worker processes per service.
pub const MAX_NUMPROCS: u32 = 32;
/// Maximum number of start retries before a worker is declared fatal.
pub const MAX_STARTRETRIES: u32 = 10;
/// Largest value accepted for `umask` (decimal digits, read as octal).
pub const MAX_UMASK: u32 = 777;

/// Pattern both notification addresses must match.
const EMAIL_PATTERN: &str = r"^[a-zA-Z0-9_.+-]+@[a-zA-Z0-9-]+\.[a-zA-Z0-9-.]+$";

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Optional SMTP notification settings.
    pub email: Option<EmailConfig>,
    /// Supervised services, in declaration order.
    pub services: Vec<ServiceConfig>,
}

/// SMTP settings used by the notifier.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct EmailConfig {
    /// Hostname of the SMTP relay.
    pub smtp_server: String,
    /// Port of the SMTP relay.
    pub smtp_port: u16,
    /// Sender address, also used as the login name.
    pub smtp_email: String,
    /// Password for the sender account.
    pub smtp_password: String,
    /// Recipient address.
    pub to: String,
}

/// Configuration for an individual service.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    /// Service name, unique across the configuration.
    pub name: String,
    /// Command used to start the workers, split on whitespace.
    pub cmd: String,
    /// Number of identical worker processes.
    pub numprocs: u32,
    /// File mode creation mask, written in decimal digits read as octal
    /// (e.g. `77` means `0o77`).
    pub umask: u32,
    /// Working directory for the workers, passed verbatim to the OS.
    pub workingdir: String,
    /// Whether the service starts as soon as the supervisor does.
    pub autostart: bool,
    /// Restart policy applied when a worker exits on its own.
    pub autorestart: AutoRestart,
    /// Exit codes considered expected by the `unexpected` policy.
    pub exitcodes: Vec<i32>,
    /// Number of spawn retries before a worker is declared fatal.
    pub startretries: u32,
    /// Seconds a worker must stay alive to count as started.
    pub starttime: u64,
    /// Signal delivered on stop.
    pub stopsignal: StopSignal,
    /// Seconds to wait for a graceful exit before SIGKILL.
    pub stoptime: u64,
    /// Optional file the workers' stdout is redirected to.
    #[serde(default)]
    pub stdout: Option<String>,
    /// Optional file the workers' stderr is redirected to.
    #[serde(default)]
    pub stderr: Option<String>,
    /// Optional OS user the workers run as.
    #[serde(default)]
    pub user: Option<String>,
    /// Environment of the workers (the whole environment, not additive).
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ServiceConfig {
    /// Returns the umask as mode bits, reading the decimal digits of the
    /// configured value as octal.
    pub fn umask_mode(&self) -> u32 {
        let (h, t, o) = (self.umask / 100, self.umask / 10 % 10, self.umask % 10);
        (h << 6) | (t << 3) | o
    }
}

/// Restart policy for workers that exit on their own.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AutoRestart {
    /// Restart unconditionally.
    Always,
    /// Never restart.
    Never,
    /// Restart only when the exit code is not listed in `exitcodes`.
    Unexpected,
}

/// Signals accepted as `stopsignal`.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum StopSignal {
    /// Terminate (15).
    Term,
    /// Hangup (1).
    Hup,
    /// Interrupt (2).
    Int,
    /// Quit (3).
    Quit,
    /// Kill (9).
    Kill,
    /// User-defined signal 1 (10).
    Usr1,
    /// User-defined signal 2 (12).
    Usr2,
}

impl StopSignal {
    /// Maps the configured signal onto the OS signal it delivers.
    pub fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;
        match self {
            StopSignal::Term => Signal::SIGTERM,
            StopSignal::Hup => Signal::SIGHUP,
            StopSignal::Int => Signal::SIGINT,
            StopSignal::Quit => Signal::SIGQUIT,
            StopSignal::Kill => Signal::SIGKILL,
            StopSignal::Usr1 => Signal::SIGUSR1,
            StopSignal::Usr2 => Signal::SIGUSR2,
        }
    }
}

/// Checks every range and semantic rule the schema cannot express.
fn validate(config: &Config) -> Result<(), ConfigError> {
    let mut seen: Vec<&str> = Vec::with_capacity(config.services.len());

    for service in &config.services {
        let name = service.name.as_str();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(ConfigError::Schema(format!(
                "service name '{name}' must be 1 to {MAX_NAME_LEN} characters"
            )));
        }
        if seen.contains(&name) {
            return Err(ConfigError::DuplicateName(name.to_string()));
        }
        seen.push(name);

        if service.cmd.split_whitespace().next().is_none() {
            return Err(ConfigError::Schema(format!(
                "service '{name}': cmd must not be empty"
            )));
        }
        if service.numprocs == 0 || service.numprocs > MAX_NUMPROCS {
            return Err(ConfigError::Schema(format!(
                "service '{name}': numprocs must be between 1 and {MAX_NUMPROCS}"
            )));
        }
        if service.umask > MAX_UMASK
            || service.umask / 100 > 7
            || service.umask / 10 % 10 > 7
            || service.umask % 10 > 7
        {
            return Err(ConfigError::Schema(format!(
                "service '{name}': umask must be octal digits between 0 and {MAX_UMASK}"
            )));
        }
        if service.startretries > MAX_STARTRETRIES {
            return Err(ConfigError::Schema(format!(
                "service '{name}': startretries must be between 0 and {MAX_STARTRETRIES}"
            )));
        }
        for code in &service.exitcodes {
            if !(0..=255).contains(code) {
                return Err(ConfigError::Schema(format!(
                    "service '{name}': exit code {code} must be between 0 and 255"
                )));
            }
        }
        for (label, value) in [
            ("stdout", &service.stdout),
            ("stderr", &service.stderr),
            ("user", &service.user),
        ] {
            if let Some(value) = value
                && value.is_empty()
            {
                return Err(ConfigError::Schema(format!(
                    "service '{name}': {label} must not be empty"
                )));
            }
        }
    }

    if let Some(email) = &config.email {
        let pattern = Regex::new(EMAIL_PATTERN).expect("email pattern is valid");
        for (label, address) in [("smtp_email", &email.smtp_email), ("to", &email.to)] {
            if !pattern.is_match(address) {
                return Err(ConfigError::Schema(format!(
                    "email: {label} '{address}' is not a valid address"
                )));
            }
        }
        if email.smtp_server.is_empty() {
            return Err(ConfigError::Schema(
                "email: smtp_server must not be empty".into(),
            ));
        }
    }

    Ok(())
}

/// Loads and validates the configuration file.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|err| {
        if err.kind() == io::ErrorKind::NotFound {
            ConfigError::NotFound(path.to_path_buf())
        } else {
            ConfigError::Read(err)
        }
    })?;

    let config: Config = serde_yaml::from_str(&content)?;
    validate(&config)?;
    Ok(config)
}

/// Writes a commented skeleton configuration file.
pub fn generate_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    fs::write(
        path.as_ref(),
        "\
# email:
#   to: \"ops@example.com\"
#   smtp_email: \"taskmaster@example.com\"
#   smtp_password: \"secret\"
#   smtp_server: \"smtp.gmail.com\"
#   smtp_port: 465

services:
  - name: example
    cmd: /bin/sleep 60
    numprocs: 1 # min 1 max 32
    umask: 77
    workingdir: /tmp
    autostart: true
    autorestart: unexpected # always, never, unexpected
    exitcodes:
      - 0
    startretries: 3
    starttime: 5
    stopsignal: TERM
    stoptime: 10
    # env:
    #   KEY: \"value\"
    # stdout: /tmp/example.stdout
    # stderr: /tmp/example.stderr
    # user: nobody
",
    )
    .map_err(ConfigError::Read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write_config(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("taskmaster.yml");
        let mut file = fs::File::create(&path).unwrap();
        write!(file, "{content}").unwrap();
        (dir, path)
    }

    const MINIMAL: &str = r#"
services:
  - name: sleeper
    cmd: /bin/sleep 2
    numprocs: 2
    umask: 77
    workingdir: /tmp
    autostart: false
    autorestart: never
    exitcodes: [0]
    startretries: 3
    starttime: 1
    stopsignal: TERM
    stoptime: 2
"#;

    #[test]
    fn loads_minimal_config() {
        let (_dir, path) = write_config(MINIMAL);
        let config = load_config(&path).unwrap();

        assert!(config.email.is_none());
        assert_eq!(config.services.len(), 1);
        let service = &config.services[0];
        assert_eq!(service.name, "sleeper");
        assert_eq!(service.numprocs, 2);
        assert_eq!(service.autorestart, AutoRestart::Never);
        assert_eq!(service.stopsignal, StopSignal::Term);
        assert!(service.stdout.is_none());
        assert!(service.env.is_empty());
    }

    #[test]
    fn missing_file_is_not_found() {
        match load_config("/nonexistent/taskmaster.yml") {
            Err(ConfigError::NotFound(path)) => {
                assert_eq!(path, Path::new("/nonexistent/taskmaster.yml"))
            }
            other => panic!("expected not-found error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_key_is_rejected() {
        let (_dir, path) = write_config(&MINIMAL.replace("stoptime: 2", "stoptime: 2\n    frobnicate: 1"));
        assert!(matches!(load_config(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let doubled = format!("{}{}", MINIMAL, &MINIMAL["\nservices:".len()..]);
        let (_dir, path) = write_config(&doubled);
        match load_config(&path) {
            Err(ConfigError::DuplicateName(name)) => assert_eq!(name, "sleeper"),
            other => panic!("expected duplicate name error, got {other:?}"),
        }
    }

    #[test]
    fn numprocs_out_of_range_is_rejected() {
        let (_dir, path) = write_config(&MINIMAL.replace("numprocs: 2", "numprocs: 33"));
        assert!(matches!(load_config(&path), Err(ConfigError::Schema(_))));

        let (_dir, path) = write_config(&MINIMAL.replace("numprocs: 2", "numprocs: 0"));
        assert!(matches!(load_config(&path), Err(ConfigError::Schema(_))));
    }

    #[test]
    fn umask_with_non_octal_digit_is_rejected() {
        let (_dir, path) = write_config(&MINIMAL.replace("umask: 77", "umask: 78"));
        assert!(matches!(load_config(&path), Err(ConfigError::Schema(_))));
    }

    #[test]
    fn umask_mode_reads_decimal_digits_as_octal() {
        let (_dir, path) = write_config(&MINIMAL.replace("umask: 77", "umask: 777"));
        let config = load_config(&path).unwrap();
        assert_eq!(config.services[0].umask_mode(), 0o777);

        let (_dir, path) = write_config(MINIMAL);
        let config = load_config(&path).unwrap();
        assert_eq!(config.services[0].umask_mode(), 0o77);
    }

    #[test]
    fn exit_code_out_of_range_is_rejected() {
        let (_dir, path) = write_config(&MINIMAL.replace("exitcodes: [0]", "exitcodes: [0, 256]"));
        assert!(matches!(load_config(&path), Err(ConfigError::Schema(_))));
    }

    #[test]
    fn unknown_stop_signal_is_rejected() {
        let (_dir, path) = write_config(&MINIMAL.replace("stopsignal: TERM", "stopsignal: STOP"));
        assert!(matches!(load_config(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn invalid_email_address_is_rejected() {
        let email = r#"
email:
  smtp_server: smtp.example.com
  smtp_port: 465
  smtp_email: not-an-address
  smtp_password: secret
  to: ops@example.com
"#;
        let (_dir, path) = write_config(&format!("{email}{MINIMAL}"));
        assert!(matches!(load_config(&path), Err(ConfigError::Schema(_))));
    }

    #[test]
    fn valid_email_config_is_accepted() {
        let email = r#"
email:
  smtp_server: smtp.example.com
  smtp_port: 465
  smtp_email: taskmaster@example.com
  smtp_password: secret
  to: ops@example.com
"#;
        let (_dir, path) = write_config(&format!("{email}{MINIMAL}"));
        let config = load_config(&path).unwrap();
        assert_eq!(config.email.unwrap().smtp_port, 465);
    }

    #[test]
    fn generated_skeleton_loads_back() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("skeleton.yml");
        generate_config(&path).unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].name, "example");
        assert_eq!(config.services[0].umask_mode(), 0o77);
    }

    #[test]
    fn stop_signals_map_to_os_signals() {
        use nix::sys::signal::Signal;
        assert_eq!(StopSignal::Term.as_nix(), Signal::SIGTERM);
        assert_eq!(StopSignal::Kill.as_nix(), Signal::SIGKILL);
        assert_eq!(StopSignal::Usr2.as_nix(), Signal::SIGUSR2);
        assert_eq!(StopSignal::Usr1.as_ref(), "USR1");
    }
}
