use super::protocol::{Headers, Notification};
use super::types::Transition;
use super::Listener;
use crate::store::{Event, EventKind};
use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use tracing::{debug, info, warn};

pub fn classify(notification: &Notification) -> Result<Transition> {
    let event_name = notification.event_name();
    if !matches!(event_name, "PROCESS_STATE_RUNNING" | "PROCESS_STATE_EXITED") {
        return Ok(Transition::Ignored {
            event_name: event_name.to_string(),
        });
    }

    let (headers, _) = notification.payload_headers()?;
    let group = required(&headers, "groupname")?.to_string();
    let job = required(&headers, "processname")?.to_string();
    let pid: i32 = required(&headers, "pid")?
        .parse()
        .wrap_err("Invalid pid")?;
    if pid <= 0 {
        bail!("Invalid pid {pid}");
    }

    if event_name == "PROCESS_STATE_RUNNING" {
        return Ok(Transition::Running { group, job, pid });
    }
    let expected: i64 = required(&headers, "expected")?
        .parse()
        .wrap_err("Invalid expected flag")?;
    Ok(Transition::Exited {
        group,
        job,
        pid,
        expected: expected != 0,
    })
}

fn required<'a>(headers: &'a Headers, key: &str) -> Result<&'a str> {
    headers
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| eyre!("Payload has no {key}"))
}

/// Records the transition, arming or cancelling runtime timers on the way.
pub fn handle_transition(listener: &Listener, transition: Transition) -> Result<()> {
    let event = match transition {
        Transition::Ignored { event_name } => {
            debug!(%event_name, "Ignoring notification");
            return Ok(());
        }
        Transition::Running { group, job, pid } => {
            if let Some(limit) = listener.limits.get(&job) {
                let timer = listener.enforcer.arm(&job, pid, limit);
                debug!(%timer, outstanding = listener.enforcer.outstanding(&job), "Armed maxruntime");
            }
            info!(%group, %job, pid, "Started");
            Event::new(group, job, EventKind::Started, pid)
        }
        Transition::Exited {
            group,
            job,
            pid,
            expected,
        } => {
            listener.enforcer.job_ended(&job, pid);
            let kind = if expected {
                info!(%group, %job, pid, "Finished");
                EventKind::Finished
            } else {
                warn!(%group, %job, pid, "Failed");
                EventKind::Failed
            };
            Event::new(group, job, kind, pid)
        }
    };
    listener.store.append(&event)
}
