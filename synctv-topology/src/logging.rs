use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, writer::BoxMakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

/// Transport crates that log per packet; held at `warn` unless tracing
const TRANSPORT_TARGETS: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_dtls",
    "webrtc_sctp",
    "webrtc_srtp",
    "webrtc_mdns",
];

/// Initialize structured logging based on configuration
///
/// `RUST_LOG` takes precedence over the configured level. JSON output is
/// meant for production, pretty output for development. Both go to stdout
/// unless `file_path` is set.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;

    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(directives(level)))?;

    let writer = match &config.file_path {
        Some(file_path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file_path)?;
            BoxMakeWriter::new(Arc::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let registry = tracing_subscriber::registry().with(env_filter);

    if config.format.as_str() == "json" {
        let json_layer = fmt::layer()
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .with_current_span(true)
            .with_target(true)
            .with_line_number(true)
            .with_writer(writer);
        registry.with(json_layer).try_init()?;
    } else {
        let pretty_layer = fmt::layer()
            .pretty()
            .with_target(true)
            .with_line_number(true)
            .with_file(false)
            .with_writer(writer);
        registry.with(pretty_layer).try_init()?;
    }

    Ok(())
}

/// Parse log level string to tracing Level
fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(anyhow::anyhow!("Invalid log level: {level}")),
    }
}

/// Filter directives for `level`
fn directives(level: Level) -> String {
    let base = level.to_string().to_lowercase();
    if level == Level::TRACE {
        return base;
    }
    std::iter::once(base)
        .chain(TRANSPORT_TARGETS.iter().map(|target| format!("{target}=warn")))
        .collect::<Vec<_>>()
        .join(",")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("trace").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level("WARNING").unwrap(), Level::WARN);
        assert!(parse_log_level("error").is_ok());
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_transport_crates_quiet_below_trace() {
        let filter = directives(Level::DEBUG);
        assert!(filter.starts_with("debug,"));
        assert!(filter.contains("webrtc_ice=warn"));
        assert!(EnvFilter::try_new(&filter).is_ok());

        assert_eq!(directives(Level::TRACE), "trace");
    }

    #[test]
    fn test_init_rejects_bad_level() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..Default::default()
        };
        assert!(init_logging(&config).is_err());
    }
}
