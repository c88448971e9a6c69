//! Logging system setup and configuration
//!
//! Initializes the tracing-based logging system used throughout the server
//! for debugging, monitoring, and diagnostic output.

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{Args, LoggingSettings};

/// Initialize the logging system
///
/// Sets up structured logging using the tracing crate. The level comes from
/// the configuration file's `[logging]` section unless the `--debug` flag is
/// set, which forces "debug"; the same section selects plain or JSON output.
///
/// # Arguments
/// * `args` - Command line arguments containing the debug flag
/// * `settings` - Parsed `[logging]` section of the configuration file
///
/// # Environment Variables
/// * `RUST_LOG` - Override the default logging filter (e.g., "debug", "channel_server=trace")
pub fn setup_logging(args: &Args, settings: Option<&LoggingSettings>) -> Result<()> {
    let (level, json_format) = resolve_settings(args, settings);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json_format {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_target(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .init();
    }

    Ok(())
}

/// Level and format resolution: `--debug` beats the configured level, and
/// a missing `[logging]` section falls back to plain "info" output.
fn resolve_settings<'a>(args: &Args, settings: Option<&'a LoggingSettings>) -> (&'a str, bool) {
    let level = if args.debug {
        "debug"
    } else {
        settings.map(|s| s.level.as_str()).unwrap_or("info")
    };
    let json_format = settings.is_some_and(|s| s.json_format);
    (level, json_format)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(level: &str, json_format: bool) -> LoggingSettings {
        LoggingSettings { level: level.to_string(), json_format }
    }

    #[test]
    fn configured_level_and_format_are_honored() {
        let args = Args::default();
        let settings = settings("warn", true);
        let (level, json) = resolve_settings(&args, Some(&settings));
        assert_eq!(level, "warn");
        assert!(json);
    }

    #[test]
    fn debug_flag_overrides_configured_level() {
        let args = Args { debug: true, ..Args::default() };
        let settings = settings("warn", false);
        let (level, json) = resolve_settings(&args, Some(&settings));
        assert_eq!(level, "debug");
        assert!(!json);
    }

    #[test]
    fn missing_section_falls_back_to_plain_info() {
        let args = Args::default();
        let (level, json) = resolve_settings(&args, None);
        assert_eq!(level, "info");
        assert!(!json);
    }
}
