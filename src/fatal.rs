//! Fail-fast handling for errors the log cannot recover from.
//!
//! A durability layer that keeps accepting writes after it has lost the
//! ability to sync them is worse than a crash, so the default policy halts
//! the process. Deployments that prefer a supervised restart can downgrade
//! to [`FatalPolicy::LogAndContinue`]; this is an operational choice, not
//! a recovery mechanism.

use log::error;

/// What to do when a fatal redo log error occurs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FatalPolicy {
    /// Log the error and abort the process.
    #[default]
    Halt,
    /// Log the error and keep running.
    LogAndContinue,
}

impl FatalPolicy {
    /// Signal a fatal error under this policy.
    pub fn signal(self, context: &str, err: &dyn std::fmt::Display) {
        error!("event=redolog_fatal context={} error={}", context, err);
        if self == FatalPolicy::Halt {
            error!("event=redolog_halt context={}", context);
            std::process::abort();
        }
    }
}
