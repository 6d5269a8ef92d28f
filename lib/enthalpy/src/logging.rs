//! Thin facade over `slog` so the rest of the workspace has a single logging
//! import. Components take `impl Into<Option<&Logger>>` and log into a child
//! of the supplied logger, or into a discard root when running unlogged.

pub use slog::{b, crit, debug, error, info, kv, log, o, record, record_static, trace, warn};
pub use slog::{Discard, Drain, Level, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the default terminal logger used by services and demo binaries.
pub fn init() -> Logger {
    from_config(DEFAULT_CONFIG)
}

/// Builds a logger from a sloggers TOML configuration string.
///
/// Logger construction happens once at process startup, so a malformed
/// configuration aborts rather than returning an error.
pub fn from_config(toml: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).expect("Error parsing logging config");
    config.build_logger().expect("Error building logger")
}

/// Returns a child of the supplied logger, or a discard root when `None`.
#[inline]
pub fn child<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => Logger::root(Discard, o!()),
    }
}
