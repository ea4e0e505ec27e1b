use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the stderr log subscriber. `RUST_LOG` wins over the defaults.
pub fn init(verbose: bool, debug: bool) {
    let default = if debug {
        "auditor=debug"
    } else if verbose {
        "auditor=info"
    } else {
        "auditor=warn"
    };
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init();
}

/// Run a telemetry write. Failures are logged and swallowed: event logs,
/// summaries and artifact copies never abort a scan.
pub fn best_effort<F>(what: &str, write: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    if let Err(e) = write() {
        warn!("Could not write {what}: {e:#}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_effort_swallows_errors() {
        let mut ran = false;
        best_effort("nothing", || {
            ran = true;
            anyhow::bail!("disk full")
        });
        assert!(ran);
    }
}
