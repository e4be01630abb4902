use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use taskmaster::{
    cli::{Cli, parse_args},
    config::{Config, generate_config, load_config},
    error::SupervisorError,
    handler::Handler,
};

fn main() -> ExitCode {
    let args = parse_args();

    if let Some(path) = &args.generate {
        return match generate_config(path) {
            Ok(()) => {
                println!("configuration skeleton written to {path}");
                ExitCode::SUCCESS
            }
            Err(err) => {
                eprintln!("taskmaster: {err}");
                ExitCode::FAILURE
            }
        };
    }

    init_logging(&args);

    let config = match load_config(&args.file) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("taskmaster: {err}");
            return ExitCode::FAILURE;
        }
    };

    match supervise(args.file, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("supervisor exited with error: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(args: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.as_str()));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Runs the supervision loop on a single-threaded runtime.
///
/// Signal handlers only set flags; the loop reacts to them between its
/// 100 ms ticks. SIGINT triggers an orderly shutdown, SIGHUP re-reads
/// the configuration file used at startup.
#[tokio::main(flavor = "current_thread")]
async fn supervise(config_path: String, config: Config) -> Result<(), SupervisorError> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let reload = Arc::new(AtomicBool::new(false));

    let mut sigint = signal(SignalKind::interrupt())?;
    let shutdown_flag = Arc::clone(&shutdown);
    tokio::spawn(async move {
        loop {
            sigint.recv().await;
            shutdown_flag.store(true, Ordering::SeqCst);
        }
    });

    let mut sighup = signal(SignalKind::hangup())?;
    let reload_flag = Arc::clone(&reload);
    tokio::spawn(async move {
        loop {
            sighup.recv().await;
            reload_flag.store(true, Ordering::SeqCst);
        }
    });

    info!("starting taskmaster");
    let mut handler = Handler::new(config);
    handler.autostart();

    loop {
        tokio::time::sleep(Duration::from_millis(100)).await;

        if shutdown.swap(false, Ordering::SeqCst) {
            warn!("shutdown requested, terminating services");
            handler.delete().await;
            break;
        }

        if reload.swap(false, Ordering::SeqCst) {
            info!("reloading configuration from {config_path} (SIGHUP)");
            match load_config(&config_path) {
                Ok(new_config) => handler.reload(new_config).await,
                Err(err) => {
                    error!("configuration reload failed, keeping previous configuration: {err}")
                }
            }
        }
    }

    Ok(())
}
