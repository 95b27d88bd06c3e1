use anyhow::Result;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt;

/// Quiet by default so one-shot CLI output stays clean; `--verbose` enables
/// debug-level events, and server mode always logs at info.
pub fn init(verbose: bool, server_mode: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::DEBUG
    } else if server_mode {
        LevelFilter::INFO
    } else {
        return Ok(());
    };
    let _ = fmt()
        .with_max_level(level)
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
    Ok(())
}
