use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;

const DEFAULT_FILTER: &str = "p2p_gossip=debug,integration_test=debug";

/// Route events from the nodes under test to the test harness output.
/// `RUST_LOG` overrides [`DEFAULT_FILTER`].
///
/// Every test calls this. Only the first call in a process installs the
/// subscriber.
pub fn init_test_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_test_writer()
        .with_target(false)
        .finish();

    let _already_installed = tracing::subscriber::set_global_default(subscriber);
}
