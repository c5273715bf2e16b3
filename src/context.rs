use std::fmt;
use std::fs;
use std::os::unix::fs::MetadataExt;

use crate::LogPriority;

/// Crate-wide configuration: the log priority threshold and the two filesystem paths the
/// peer-liveness probe (used when downgrading a `"peer"` monitor to `"none"`) consults.
///
/// Passed to `Monitor::from_group` and threaded through every library operation, the way a
/// library-wide handle carries shared configuration; unlike a device library's own context this
/// one carries no device/properties state of its own, since device storage belongs entirely to
/// the external `Device` implementation.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Context {
    run_path: String,
    dev_path: String,
    log_priority: LogPriority,
}

impl Context {
    /// Creates a new [Context] with the conventional `/run` and `/dev` paths.
    pub fn new() -> Self {
        Self {
            run_path: "/run".to_owned(),
            dev_path: "/dev".to_owned(),
            log_priority: LogPriority::new(),
        }
    }

    /// Convenience function for crate log messages, gated by `log_priority`.
    pub fn log<M: fmt::Display>(&self, priority: LogPriority, msg: M) {
        if priority <= self.log_priority {
            match priority {
                LogPriority::Emergency
                | LogPriority::Alert
                | LogPriority::Critical
                | LogPriority::Error => log::error!("{priority}: {msg}"),
                LogPriority::Warning => log::warn!("{priority}: {msg}"),
                LogPriority::Notice | LogPriority::Info => log::info!("{priority}: {msg}"),
                LogPriority::Debug => log::debug!("{priority}: {msg}"),
            }
        }
    }

    /// Gets the run path (default `/run`), used to probe for `<run_path>/udev/control`.
    pub fn run_path(&self) -> &str {
        self.run_path.as_str()
    }

    /// Sets the run path.
    pub fn set_run_path<P: Into<String>>(&mut self, path: P) {
        self.run_path = path.into();
    }

    /// Builder function that sets the run path.
    pub fn with_run_path<P: Into<String>>(mut self, path: P) -> Self {
        self.set_run_path(path);
        self
    }

    /// Gets the device path (default `/dev`), used to probe whether the device filesystem is
    /// mounted.
    pub fn dev_path(&self) -> &str {
        self.dev_path.as_str()
    }

    /// Sets the device path.
    pub fn set_dev_path<P: Into<String>>(&mut self, path: P) {
        self.dev_path = path.into();
    }

    /// Builder function that sets the device path.
    pub fn with_dev_path<P: Into<String>>(mut self, path: P) -> Self {
        self.set_dev_path(path);
        self
    }

    /// Gets the [LogPriority].
    pub const fn log_priority(&self) -> LogPriority {
        self.log_priority
    }

    /// Sets the [LogPriority].
    pub fn set_log_priority<P: Into<LogPriority>>(&mut self, priority: P) {
        self.log_priority = priority.into();
    }

    /// Builder function that sets the [LogPriority].
    pub fn with_log_priority<P: Into<LogPriority>>(mut self, priority: P) -> Self {
        self.set_log_priority(priority);
        self
    }
}

/// Best-effort check for whether the peer device manager appears to be running on the host.
///
/// `Monitor::from_group(Group::Peer, ...)` downgrades to [`crate::Group::None`] when this
/// returns `false`, i.e. when the control path is absent *and* the device filesystem is not a
/// distinct mount. Exposed as a trait so tests can substitute a fake probe instead of depending
/// on real `/run` and `/dev` state.
pub trait LivenessProbe {
    fn peer_is_running(&self, ctx: &Context) -> bool;
}

/// The default, filesystem-backed [LivenessProbe].
#[derive(Clone, Copy, Debug, Default)]
pub struct FsLivenessProbe;

impl LivenessProbe for FsLivenessProbe {
    fn peer_is_running(&self, ctx: &Context) -> bool {
        control_path_exists(ctx) || dev_path_is_mounted(ctx)
    }
}

fn control_path_exists(ctx: &Context) -> bool {
    fs::metadata(format!("{}/udev/control", ctx.run_path())).is_ok()
}

/// Whether `ctx.dev_path()` is a mount point distinct from its parent directory, i.e. whether a
/// device filesystem has actually been mounted there (as opposed to being an ordinary directory
/// on the root filesystem).
fn dev_path_is_mounted(ctx: &Context) -> bool {
    let path = ctx.dev_path();
    let parent = match std::path::Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => return false,
    };

    match (fs::metadata(path), fs::metadata(parent)) {
        (Ok(dev_meta), Ok(parent_meta)) => dev_meta.dev() != parent_meta.dev(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_defaults() {
        let ctx = Context::new();
        assert_eq!(ctx.run_path(), "/run");
        assert_eq!(ctx.dev_path(), "/dev");
        assert_eq!(ctx.log_priority(), LogPriority::new());
    }

    #[test]
    fn test_context_builders() {
        let ctx = Context::new()
            .with_run_path("/tmp/run")
            .with_dev_path("/tmp/dev")
            .with_log_priority(LogPriority::Debug);

        assert_eq!(ctx.run_path(), "/tmp/run");
        assert_eq!(ctx.dev_path(), "/tmp/dev");
        assert_eq!(ctx.log_priority(), LogPriority::Debug);
    }

    #[test]
    fn test_context_setters() {
        let mut ctx = Context::new();
        ctx.set_run_path("/a");
        ctx.set_dev_path("/b");
        ctx.set_log_priority(LogPriority::Warning);

        assert_eq!(ctx.run_path(), "/a");
        assert_eq!(ctx.dev_path(), "/b");
        assert_eq!(ctx.log_priority(), LogPriority::Warning);
    }

    struct AlwaysRunning;
    impl LivenessProbe for AlwaysRunning {
        fn peer_is_running(&self, _ctx: &Context) -> bool {
            true
        }
    }

    struct NeverRunning;
    impl LivenessProbe for NeverRunning {
        fn peer_is_running(&self, _ctx: &Context) -> bool {
            false
        }
    }

    #[test]
    fn test_fake_liveness_probes() {
        let ctx = Context::new();
        assert!(AlwaysRunning.peer_is_running(&ctx));
        assert!(!NeverRunning.peer_is_running(&ctx));
    }

    #[test]
    fn test_default_probe_on_nonexistent_paths_reports_not_running() {
        let ctx = Context::new()
            .with_run_path("/nonexistent-run-path-for-tests")
            .with_dev_path("/nonexistent-dev-path-for-tests");

        assert!(!FsLivenessProbe.peer_is_running(&ctx));
    }
}
