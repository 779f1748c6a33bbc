#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// `PROCESS_STATE_RUNNING`
    Running { group: String, job: String, pid: i32 },
    /// `PROCESS_STATE_EXITED`; `expected` is supervisord's verdict on the exit code.
    Exited {
        group: String,
        job: String,
        pid: i32,
        expected: bool,
    },
    /// Any other event type, acknowledged without being recorded.
    Ignored { event_name: String },
}
