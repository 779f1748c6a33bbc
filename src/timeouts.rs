use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// Delivers the termination signal for an overrunning job.
pub trait Signaller: Send + Sync + 'static {
    fn terminate(&self, pid: i32) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Sigterm;

impl Signaller for Sigterm {
    fn terminate(&self, pid: i32) -> Result<()> {
        kill(Pid::from_raw(pid), Signal::SIGTERM).wrap_err("Failed to send signal")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerId {
    pub job: String,
    pub seq: u64,
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.job, self.seq)
    }
}

struct ArmedTimer {
    seq: u64,
    pid: i32,
    handle: JoinHandle<()>,
}

struct Inner {
    timers: Mutex<HashMap<String, Vec<ArmedTimer>>>,
    next_seq: AtomicU64,
    signaller: Box<dyn Signaller>,
    cancel_on_exit: bool,
}

/// Terminates jobs that run longer than their configured limit.
///
/// Every armed timer is tracked per job until it fires. Whether a terminal
/// event cancels it is decided by `cancel_on_exit`; when disabled a timer
/// always fires, even if the job already ended or its pid was reused.
#[derive(Clone)]
pub struct TimeoutEnforcer {
    inner: Arc<Inner>,
}

impl fmt::Debug for TimeoutEnforcer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimeoutEnforcer")
            .field("cancel_on_exit", &self.inner.cancel_on_exit)
            .field("armed", &self.inner.timers.lock().values().map(Vec::len).sum::<usize>())
            .finish()
    }
}

impl TimeoutEnforcer {
    pub fn new(signaller: impl Signaller, cancel_on_exit: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                timers: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
                signaller: Box::new(signaller),
                cancel_on_exit,
            }),
        }
    }

    /// Schedules a SIGTERM for `pid` once `limit` has elapsed. Never blocks;
    /// must be called from within a tokio runtime.
    pub fn arm(&self, job: &str, pid: i32, limit: Duration) -> TimerId {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let mut timers = self.inner.timers.lock();
        let inner = self.inner.clone();
        let owner = job.to_string();
        let handle = tokio::spawn(
            async move {
                tokio::time::sleep(limit).await;
                if !inner.take(&owner, seq) {
                    debug!("Timer cancelled before firing");
                    return;
                }
                info!("Maximum runtime of {} reached, terminating", humantime::format_duration(limit));
                if let Err(err) = inner.signaller.terminate(pid) {
                    warn!(?err, "Failed to terminate process");
                }
            }
            .instrument(info_span!("runtime_timer", job, pid, seq)),
        );
        timers
            .entry(job.to_string())
            .or_default()
            .push(ArmedTimer { seq, pid, handle });
        debug!(job, pid, seq, "Armed runtime timer for {}", humantime::format_duration(limit));
        TimerId {
            job: job.to_string(),
            seq,
        }
    }

    /// Called for every terminal event. Returns how many timers were cancelled.
    pub fn job_ended(&self, job: &str, pid: i32) -> usize {
        if !self.inner.cancel_on_exit {
            return 0;
        }
        let mut timers = self.inner.timers.lock();
        let Some(armed) = timers.get_mut(job) else {
            return 0;
        };
        let before = armed.len();
        armed.retain(|timer| {
            if timer.pid == pid {
                timer.handle.abort();
                false
            } else {
                true
            }
        });
        let cancelled = before - armed.len();
        if armed.is_empty() {
            timers.remove(job);
        }
        if cancelled > 0 {
            info!(job, pid, cancelled, "Cancelled runtime timers");
        }
        cancelled
    }

    /// Timers armed for `job` that have neither fired nor been cancelled.
    pub fn outstanding(&self, job: &str) -> usize {
        self.inner.timers.lock().get(job).map_or(0, Vec::len)
    }
}

impl Inner {
    /// Removes a timer about to fire. False when it was cancelled meanwhile.
    fn take(&self, job: &str, seq: u64) -> bool {
        let mut timers = self.timers.lock();
        let Some(armed) = timers.get_mut(job) else {
            return false;
        };
        let Some(index) = armed.iter().position(|timer| timer.seq == seq) else {
            return false;
        };
        armed.remove(index);
        if armed.is_empty() {
            timers.remove(job);
        }
        true
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[derive(Debug, Clone, Default)]
    pub(crate) struct RecordingSignaller {
        pub(crate) pids: Arc<Mutex<Vec<i32>>>,
    }

    impl RecordingSignaller {
        pub(crate) fn signalled(&self) -> Vec<i32> {
            self.pids.lock().clone()
        }
    }

    impl Signaller for RecordingSignaller {
        fn terminate(&self, pid: i32) -> Result<()> {
            self.pids.lock().push(pid);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_after_limit() {
        let signaller = RecordingSignaller::default();
        let enforcer = TimeoutEnforcer::new(signaller.clone(), false);

        let id = enforcer.arm("nightly", 4242, Duration::from_secs(10));
        assert_eq!(id.to_string(), format!("nightly#{}", id.seq));
        assert_eq!(enforcer.outstanding("nightly"), 1);

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(signaller.signalled().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(signaller.signalled(), vec![4242]);
        assert_eq!(enforcer.outstanding("nightly"), 0);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(signaller.signalled(), vec![4242]);
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_arm_independent_timers() {
        let signaller = RecordingSignaller::default();
        let enforcer = TimeoutEnforcer::new(signaller.clone(), false);

        let first = enforcer.arm("nightly", 100, Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(5)).await;
        let second = enforcer.arm("nightly", 200, Duration::from_secs(10));
        assert_ne!(first.seq, second.seq);
        assert_eq!(enforcer.outstanding("nightly"), 2);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(signaller.signalled(), vec![100]);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(signaller.signalled(), vec![100, 200]);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_events_leave_timers_alone_by_default() {
        let signaller = RecordingSignaller::default();
        let enforcer = TimeoutEnforcer::new(signaller.clone(), false);

        enforcer.arm("nightly", 100, Duration::from_secs(10));
        assert_eq!(enforcer.job_ended("nightly", 100), 0);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(signaller.signalled(), vec![100]);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_events_cancel_matching_timers_when_enabled() {
        let signaller = RecordingSignaller::default();
        let enforcer = TimeoutEnforcer::new(signaller.clone(), true);

        enforcer.arm("nightly", 100, Duration::from_secs(10));
        enforcer.arm("nightly", 200, Duration::from_secs(10));
        enforcer.arm("report", 100, Duration::from_secs(10));

        assert_eq!(enforcer.job_ended("nightly", 100), 1);
        assert_eq!(enforcer.job_ended("nightly", 100), 0);
        assert_eq!(enforcer.job_ended("unknown", 100), 0);
        assert_eq!(enforcer.outstanding("nightly"), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        let mut signalled = signaller.signalled();
        signalled.sort();
        assert_eq!(signalled, vec![100, 200]);
        assert_eq!(enforcer.outstanding("nightly"), 0);
        assert_eq!(enforcer.outstanding("report"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn signal_failures_do_not_panic() {
        struct Failing;
        impl Signaller for Failing {
            fn terminate(&self, _pid: i32) -> Result<()> {
                color_eyre::eyre::bail!("No such process")
            }
        }

        let enforcer = TimeoutEnforcer::new(Failing, false);
        enforcer.arm("nightly", 1, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(enforcer.outstanding("nightly"), 0);
    }
}
