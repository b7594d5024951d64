pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the process logger. Configuration is baked in for now; the
/// executables call this once and hand child loggers down to the drivers.
pub fn init() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("embedded logger config must parse");

    config.build_logger().expect("logger construction failed")
}
