//! `tracing-subscriber` initialization, following the teacher's `EnvFilter`
//! + `fmt` layering. Driven by `LOGRELAY_LOG`, defaulting to `info`.

use tracing_subscriber::EnvFilter;

/// Initializes the global subscriber. `ansi` should be `true` only in
/// foreground mode -- a daemonized process has no tty to colorize for.
pub fn init(ansi: bool) {
    let filter = EnvFilter::try_from_env("LOGRELAY_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_target(true)
        .init();
}
