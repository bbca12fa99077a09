#![deny(
    trivial_numeric_casts,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Entry point: parses the CLI, loads and validates configuration, and
//! either exits after a dry run or hands off to the [`supervisor::Supervisor`].
//!
//! Exit codes: `0` clean shutdown or a successful dry run, `2` invalid
//! configuration, `3` the supervisor failed to start or exited on an
//! unrecoverable error.

mod cli;
mod error;
mod observability;
mod pipeline;
mod supervisor;

use clap::Parser;
use cli::Cli;
use config::LogFormat;
use context::ProcessContext;

const EXIT_OK: i32 = 0;
const EXIT_INVALID_CONFIG: i32 = 2;
const EXIT_SUPERVISOR_FAILURE: i32 = 3;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    let mut config = match config::load_and_validate(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            if let config::Error::Invalid(issues) = &err {
                for issue in issues {
                    eprintln!("  {}: {}", issue.path, issue.message);
                }
            }
            return EXIT_INVALID_CONFIG;
        }
    };

    if cli.demo_mode {
        config.demo_mode = true;
    }

    if cli.dry_run {
        println!("configuration OK: {} device(s) configured", config.devices.len());
        return EXIT_OK;
    }

    init_logging(&config.logging);

    let process_id = std::env::var("ADAM_PROCESS_ID").unwrap_or_else(|_| "adam-counter-core".to_string());
    let context = ProcessContext::new(process_id, config.demo_mode);

    let supervisor = match supervisor::Supervisor::new(context, cli.config.clone(), config).await {
        Ok(supervisor) => supervisor,
        Err(err) => {
            tracing::error!(error = %err, "supervisor failed to start");
            return EXIT_SUPERVISOR_FAILURE;
        }
    };

    match supervisor.run().await {
        Ok(()) => EXIT_OK,
        Err(err) => {
            tracing::error!(error = %err, "supervisor exited with an unrecoverable error");
            EXIT_SUPERVISOR_FAILURE
        }
    }
}

fn init_logging(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&logging.level).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match logging.format {
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        }
    }
}
