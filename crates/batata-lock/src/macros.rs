// Logging helpers shared by the coordinator and the lease extender

/// Emit at `info` when the component runs verbose, `debug` otherwise.
///
/// Verbosity is carried by `CoordinatorOptions` rather than a global switch,
/// so two coordinators in one process can log at different levels.
macro_rules! verbose_log {
    ($verbose:expr, $($arg:tt)+) => {
        if $verbose {
            tracing::info!($($arg)+);
        } else {
            tracing::debug!($($arg)+);
        }
    };
}
