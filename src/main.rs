use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};

use fleet_sync::app::FleetSyncApp;
use fleet_sync::config::Settings;
use fleet_sync::observability::init_tracing;
use fleet_sync::version::resolve_source;

#[derive(Parser, Debug)]
#[command(name = "fleet-sync")]
#[command(about = "Keeps a host's monitoring scripts in sync with a remote repository", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one update cycle (default).
    Run {
        /// URL this updater was downloaded from; used to infer the asset base URL.
        #[arg(long)]
        self_url: Option<String>,
    },
    /// Compare local and remote versions without changing anything.
    Check {
        #[arg(long)]
        self_url: Option<String>,
    },
    /// Show local version, lock state and the last cycle record as JSON.
    Status,
    /// Validate resolved configuration.
    Doctor,
    /// Remove the update lock regardless of its owner.
    Unlock {
        #[arg(long, default_value_t = false)]
        confirm: bool,
    },
}

fn main() -> ExitCode {
    init_tracing();

    match run_cli() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("fleet-sync: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run_cli() -> Result<ExitCode> {
    let cli = Cli::parse();
    let mut settings = Settings::load()?;

    let command = cli.command.unwrap_or(Commands::Run { self_url: None });
    if let Commands::Run {
        self_url: Some(url),
    }
    | Commands::Check {
        self_url: Some(url),
    } = &command
    {
        settings.source.self_url = Some(url.clone());
    }
    let app = FleetSyncApp::new(settings);

    match command {
        Commands::Run { .. } => {
            // The update log and exit code are the whole user-facing surface.
            return Ok(match app.run_cycle() {
                Ok(_) => ExitCode::SUCCESS,
                Err(err) => ExitCode::from(err.exit_code()),
            });
        }
        Commands::Check { .. } => println!("{}", app.check_json()?),
        Commands::Status => println!("{}", app.status_json()?),
        Commands::Doctor => {
            let report = app.doctor();
            let source = resolve_source(&app.settings().source);
            println!("fleet-sync doctor");
            println!("install_dir: {}", report.install_dir.display());
            println!("scripts_dir: {}", report.scripts_dir.display());
            println!("version_file: {}", report.version_file.display());
            println!("lock_file: {}", report.lock_file.display());
            println!("log_file: {}", report.log_file.display());
            println!("state_dir: {}", report.state_dir.display());
            println!(
                "channel: {}",
                report
                    .channel_override
                    .unwrap_or_else(|| "<default>".to_string())
            );
            println!(
                "base_url_override: {}",
                report
                    .base_url_override
                    .unwrap_or_else(|| "<unset>".to_string())
            );
            println!(
                "self_url: {}",
                report.self_url.unwrap_or_else(|| "<unset>".to_string())
            );
            println!("default_repository: {}", report.default_repository);
            println!(
                "resolved_base_url: {} ({:?})",
                source.base_url, source.origin
            );
            println!(
                "transport: {}",
                report.transport_tool.unwrap_or_else(|| "auto".to_string())
            );
            println!("connect_timeout_secs: {}", report.connect_timeout_secs);
            println!("max_time_secs: {}", report.max_time_secs);
            println!("retries: {}", report.retries);
            println!("retry_delay_secs: {}", report.retry_delay_secs);
            println!("lock_timeout_secs: {}", report.lock_timeout_secs);
            if report.warnings.is_empty() {
                println!("status: ok");
            } else {
                println!("status: warning");
                for warning in report.warnings {
                    println!("- {}", warning);
                }
            }
        }
        Commands::Unlock { confirm } => println!("{}", app.force_unlock_json(confirm)?),
    }

    Ok(ExitCode::SUCCESS)
}
