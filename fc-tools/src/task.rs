use anyhow::Error;

/// Methods commonly needed by long-running operations -- cache flushes,
/// checkpoint snapshots, GC sweeps, copy retries -- that otherwise have no
/// relation to whatever is driving them (a scheduler job, a CLI command, a
/// test harness). Ported from the teacher's `pbs-tools::task` trait.
pub trait WorkerTaskContext {
    /// If the task should be aborted, this should fail with a reasonable
    /// error message.
    fn check_abort(&self) -> Result<(), Error>;

    /// Create a log message for this task.
    fn log(&self, level: log::Level, message: &std::fmt::Arguments);
}

impl<T: WorkerTaskContext + ?Sized> WorkerTaskContext for std::sync::Arc<T> {
    fn check_abort(&self) -> Result<(), Error> {
        <T as WorkerTaskContext>::check_abort(self)
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        <T as WorkerTaskContext>::log(self, level, message)
    }
}

#[macro_export]
macro_rules! task_error {
    ($task:expr, $($fmt:tt)+) => {{
        $crate::task::WorkerTaskContext::log(&*$task, log::Level::Error, &format_args!($($fmt)+))
    }};
}

#[macro_export]
macro_rules! task_warn {
    ($task:expr, $($fmt:tt)+) => {{
        $crate::task::WorkerTaskContext::log(&*$task, log::Level::Warn, &format_args!($($fmt)+))
    }};
}

#[macro_export]
macro_rules! task_log {
    ($task:expr, $($fmt:tt)+) => {{
        $crate::task::WorkerTaskContext::log(&*$task, log::Level::Info, &format_args!($($fmt)+))
    }};
}

#[macro_export]
macro_rules! task_debug {
    ($task:expr, $($fmt:tt)+) => {{
        $crate::task::WorkerTaskContext::log(&*$task, log::Level::Debug, &format_args!($($fmt)+))
    }};
}

/// A `WorkerTaskContext` that never aborts and logs through the global
/// `log` facade. Useful for tests and for standalone CLI invocations that
/// have no surrounding job tracker.
pub struct StandaloneTaskContext;

impl WorkerTaskContext for StandaloneTaskContext {
    fn check_abort(&self) -> Result<(), Error> {
        Ok(())
    }

    fn log(&self, level: log::Level, message: &std::fmt::Arguments) {
        log::log!(level, "{}", message);
    }
}
