/// Tracing subscriber setup for the binaries.
/// Events go to stderr so stdout carries only the report.
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

/// How the subscriber filters and formats events.
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Fallback directive when `RUST_LOG` is unset or invalid, e.g. `info`
    /// or `fcsim=debug`
    pub default_directive: String,
    pub ansi: bool,
    /// Log span close events with their busy/idle time
    pub span_timing: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            default_directive: "warn".to_string(),
            ansi: true,
            span_timing: false,
        }
    }
}

impl LogConfig {
    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.default_directive = directive.into();
        self
    }

    /// `RUST_LOG` wins over the configured directive.
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.default_directive))
    }
}

/// Level directive for a `-v`/`-q` count: 0 is `warn`, each `-v` adds a level.
pub fn directive_for_verbosity(verbosity: i32) -> &'static str {
    match verbosity {
        i32::MIN..=-1 => "error",
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

/// Install the global subscriber. Returns an error string if one is
/// already installed.
pub fn init_tracing(config: &LogConfig) -> Result<(), String> {
    let span_events = if config.span_timing {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    tracing_subscriber::fmt()
        .with_env_filter(config.filter())
        .with_writer(std::io::stderr)
        .with_ansi(config.ansi)
        .with_target(false)
        .with_span_events(span_events)
        .try_init()
        .map_err(|e| e.to_string())
}
