mod cli;
mod error;

use std::io::IsTerminal;

use clap::Parser;
use secrecy::SecretString;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use arlo_config::{Config, ConfigError};
use arlo_core::{Arlo, ArloConfig, TfaSource};

use crate::cli::{Cli, LogFormat};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.log_format);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8, format: LogFormat) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = build_arlo_config(&cli)?;
    info!(
        profile = %config.name,
        storage = %config.storage_dir.display(),
        "connecting"
    );

    let arlo = Arlo::connect(config).await?;
    info!(
        base_stations = arlo.base_stations().len(),
        cameras = arlo.cameras().len(),
        doorbells = arlo.doorbells().len(),
        lights = arlo.lights().len(),
        "devices enumerated"
    );

    if !arlo.is_started() {
        let waiter = arlo.clone();
        tokio::spawn(async move {
            match waiter.wait_for_initial_setup().await {
                Ok(()) => info!("initial refresh complete"),
                Err(e) => warn!(error = %e, "initial refresh did not complete"),
            }
        });
    }
    tokio::spawn(log_device_events(arlo.clone()));

    tokio::signal::ctrl_c().await?;
    info!("interrupted, saving state");

    arlo.stop().await?;
    if let Some(err) = arlo.last_error() {
        debug!(last_error = %err, "stopped");
    }
    Ok(())
}

/// Build the runtime config from the config file, profile and CLI overrides.
fn build_arlo_config(cli: &Cli) -> Result<ArloConfig, CliError> {
    let path = cli.config.clone().unwrap_or_else(arlo_config::config_path);
    let cfg = arlo_config::load_config_from(&path)?;

    let (name, profile) = arlo_config::select_profile(&cfg, cli.profile.as_deref())
        .map_err(|e| profile_error(e, &cfg, &path))?;

    // Username first: a missing one is not fixed by prompting for a password.
    arlo_config::resolve_username(profile, &name)?;
    let password = match arlo_config::resolve_password(profile, &name) {
        Ok(pw) => pw,
        Err(ConfigError::NoCredentials { .. }) if std::io::stdin().is_terminal() => {
            prompt_password(&name)?
        }
        Err(e) => return Err(e.into()),
    };

    let mut config =
        arlo_config::profile_to_arlo_config_with_password(&cfg, profile, &name, password)?;
    // Mailbox codes need a mailbox handed to `Arlo::connect_with_source`.
    if config.tfa.source == TfaSource::Mailbox {
        return Err(CliError::Validation {
            field: "tfa.source".into(),
            reason: "'mailbox' needs an application that supplies the mailbox; \
                     arlo-sync reads codes from the console"
                .into(),
        });
    }
    if let Some(dir) = &cli.storage_dir {
        config.storage_dir.clone_from(dir);
    }
    config.dump_packets |= cli.dump_packets;
    if cli.no_wait {
        config.wait_for_initial_setup = false;
    }
    Ok(config)
}

fn profile_error(err: ConfigError, cfg: &Config, path: &std::path::Path) -> CliError {
    match err {
        ConfigError::UnknownProfile { profile } => {
            let mut names: Vec<&str> = cfg.profiles.keys().map(String::as_str).collect();
            names.sort_unstable();
            CliError::ProfileNotFound {
                name: profile,
                available: if names.is_empty() {
                    "(none)".into()
                } else {
                    names.join(", ")
                },
                path: path.display().to_string(),
            }
        }
        other => other.into(),
    }
}

fn prompt_password(profile: &str) -> Result<SecretString, CliError> {
    let pw = rpassword::prompt_password(format!("Arlo password for '{profile}': "))?;
    if pw.is_empty() {
        return Err(CliError::NoCredentials {
            profile: profile.into(),
        });
    }
    Ok(SecretString::from(pw))
}

async fn log_device_events(arlo: Arlo) {
    let mut events = arlo.events();
    loop {
        match events.recv().await {
            Ok(event) => debug!(
                device = %event.device_id,
                kind = %event.kind,
                changed = ?event.changed,
                "device updated"
            ),
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "device event log lagged"),
            Err(RecvError::Closed) => break,
        }
    }
}
