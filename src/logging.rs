use log::info;

const DEFAULT_FILTER: &str = "info,eyetrack_session=debug";

/// `RUST_LOG` overrides the default filter. Safe to call more than once.
pub fn setup_logging() {
    let env = env_logger::Env::default().default_filter_or(DEFAULT_FILTER);
    if env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .try_init()
        .is_ok()
    {
        info!("Initialized logging");
    }
}
