use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

const DEFAULT_LOG_LEVEL: &str = "info";

/// Initializes the global tracing subscriber from the CLI verbosity flag.
pub fn init(verbosity: Option<&str>) -> anyhow::Result<()> {
    let level = resolve_log_level(verbosity)?;
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("initialize logging subscriber: {err}"))?;
    Ok(())
}

fn resolve_log_level(verbosity: Option<&str>) -> anyhow::Result<LevelFilter> {
    let raw_level = verbosity.unwrap_or(DEFAULT_LOG_LEVEL);
    let normalized = raw_level.trim().to_ascii_lowercase();

    normalized.parse::<LevelFilter>().map_err(|_| {
        anyhow!(
            "invalid log level `{raw_level}`; expected one of trace, debug, info, warn, error, off"
        )
    })
}
