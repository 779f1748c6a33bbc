mod configs;
mod listener;
mod status;
mod store;
mod timeouts;

use crate::configs::{JobLoggerConfig, DEFAULT_SUPERVISOR_CONFIG};
use crate::store::EventStore;
use crate::status::{OK_EXIT, SYSTEM_ERROR_EXIT};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// supervisord configuration holding `maxruntime` and `dbpath` settings
    #[arg(
        short = 'c',
        long,
        env = "JOBLOGGER_SUPERVISOR_CONFIG",
        value_name = "FILE",
        default_value = DEFAULT_SUPERVISOR_CONFIG
    )]
    supervisor_config: PathBuf,

    /// Job history database, overrides `dbpath`
    #[arg(short, long, env = "JOBLOGGER_DB", value_name = "FILE")]
    database: Option<PathBuf>,

    /// Log filter used when JOBLOGGER_LOG is not set
    #[arg(long, default_value = "info")]
    log: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the latest status of every job as JSON
    List,
    /// Exit 0 if the job ran successfully within MAX_AGE, 2 otherwise
    Check {
        group: String,
        job: String,
        /// e.g. 30m, 12h, 1d
        max_age: String,
    },
    /// Print every recorded event of a job, one JSON object per line
    History { group: String, job: String },
    /// Print every event of every job recorded within MAX_AGE, one JSON object per line
    Since { max_age: String },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            err.print()?;
            return Ok(ExitCode::from(usage_exit_code(&err)));
        }
    };

    if std::env::var("JOBLOGGER_LOG").is_err() {
        std::env::set_var("JOBLOGGER_LOG", &args.log);
    }
    // stdout belongs to supervisord in listener mode
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_env("JOBLOGGER_LOG"))
        .with_writer(std::io::stderr)
        .init();

    debug!("{:#?}", args);
    let Some(command) = args.command else {
        info!("Starting JobLogger");
        listener::run(&args.supervisor_config, args.database.as_deref()).await?;
        info!("Exiting");
        return Ok(ExitCode::SUCCESS);
    };

    let config = JobLoggerConfig::load(&args.supervisor_config)
        .wrap_err("Failed to read supervisor config")?;
    let database = args.database.unwrap_or(config.database);

    match command {
        Command::List => {
            let store = EventStore::open(&database)?;
            let dump = status::list(&store)?;
            println!("{}", serde_json::to_string(&dump)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Check {
            group,
            job,
            max_age,
        } => {
            let max_age = configs::parse_duration(&max_age)?;
            let store = EventStore::open(&database)?;
            let report = status::check(&store, &group, &job, max_age)?;
            println!("{report}");
            Ok(ExitCode::from(report.exit_code()))
        }
        Command::History { group, job } => {
            let store = EventStore::open(&database)?;
            for entry in status::history(&store, &group, &job)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Since { max_age } => {
            let max_age = configs::parse_duration(&max_age)?;
            let store = EventStore::open(&database)?;
            for entry in status::recent(&store, max_age)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Usage errors must not share the CRITICAL exit code.
fn usage_exit_code(err: &clap::Error) -> u8 {
    match err.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => OK_EXIT,
        _ => SYSTEM_ERROR_EXIT,
    }
}
