//! Logging bootstrap shared by the daemon and CLI.

use std::io::Write;

/// Initialise the process-wide logger.
///
/// `default_level` applies when `RUST_LOG` is unset. Calling this twice is
/// harmless; the second call is ignored.
pub fn init(default_level: &str) {
    let env = env_logger::Env::default().default_filter_or(default_level);
    let _ = env_logger::Builder::from_env(env)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                buf.timestamp_seconds(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .try_init();
}
