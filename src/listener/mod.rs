mod event_handlers;
pub mod protocol;
mod types;

use self::protocol::Channel;
use crate::configs::{JobLoggerConfig, RuntimeLimits};
use crate::store::EventStore;
use crate::timeouts::{Sigterm, TimeoutEnforcer};
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use std::path::Path;
use tokio::io::{AsyncBufRead, AsyncWrite, BufReader};
use tracing::{error, info, instrument};

pub const SUPERVISOR_ENV: &str = "SUPERVISOR_SERVER_URL";

/// Turns supervisor notifications into stored events, one at a time.
#[derive(Debug)]
pub struct Listener {
    store: EventStore,
    limits: RuntimeLimits,
    enforcer: TimeoutEnforcer,
}

impl Listener {
    pub fn new(store: EventStore, limits: RuntimeLimits, enforcer: TimeoutEnforcer) -> Self {
        Self {
            store,
            limits,
            enforcer,
        }
    }

    /// Receive, record, acknowledge. A notification is only acknowledged
    /// once its event is stored; any error ends the loop unacknowledged.
    #[instrument(skip_all)]
    pub async fn run<R, W>(&self, channel: &mut Channel<R, W>) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        while let Some(notification) = channel.next().await? {
            let transition = event_handlers::classify(&notification)?;
            event_handlers::handle_transition(self, transition)?;
            channel.ack().await?;
        }
        info!("Supervisor closed the event channel");
        Ok(())
    }
}

/// Runs the listener over stdin/stdout. Refuses to start outside supervisord,
/// before the supervisor config is even read.
#[instrument]
pub async fn run(supervisor_config: &Path, database: Option<&Path>) -> Result<()> {
    if std::env::var_os(SUPERVISOR_ENV).is_none() {
        error!("joblogger must be run as a supervisor event listener");
        return Ok(());
    }

    let config = JobLoggerConfig::load(supervisor_config).wrap_err("Failed to read supervisor config")?;
    let database = database.unwrap_or(config.database.as_path());

    if config.runtime_limits.is_empty() {
        info!("No maxruntime configured");
    }
    for (job, limit) in config.runtime_limits.iter() {
        info!("{} maxruntime {}", job, humantime::format_duration(limit));
    }

    info!("Creating job history database");
    let store = EventStore::open(database)?;
    let enforcer = TimeoutEnforcer::new(Sigterm, config.cancel_timers_on_exit);
    let listener = Listener::new(store, config.runtime_limits.clone(), enforcer);

    info!("Starting event listener");
    let mut channel = Channel::new(BufReader::new(tokio::io::stdin()), tokio::io::stdout());
    listener.run(&mut channel).await
}
