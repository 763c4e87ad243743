pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Logger};

use sloggers::{Config, LoggerConfig};

const TERMINAL_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the default terminal logger used by the operational binaries.
pub fn init() -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(TERMINAL_CONFIG).expect("Malformed built-in logger config");

    config.build_logger().expect("Logger construction failed")
}

/// Builds a logger from a TOML configuration snippet.
pub fn init_from_toml(toml: &str) -> Result<Logger, String> {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).map_err(|err| err.to_string())?;

    config.build_logger().map_err(|err| err.to_string())
}

/// A logger that discards everything. Components constructed without a parent
/// logger use this.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
