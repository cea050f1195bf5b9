//! Process-wide diagnostics for a pairing client.

/// Logging setup: one global `tracing` subscriber writing through a
/// non-blocking appender.
///
/// The filter comes from `PAIRING_LOG_FILTER` when set. Otherwise it is
/// derived from [`LogLevel`]: the session targets (`negotiation`,
/// `coordinator`, `signaling`, `webrtc` and the crate modules) follow the
/// level, everything else stays at `info`. At `trace` the WebRTC and
/// WebSocket stacks are held at `info` unless `PAIRING_TRACE_DEPS` is set,
/// since a single ICE gathering pass would otherwise flood the output.
pub mod logging {
    use std::fmt;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::str::FromStr;
    use std::sync::OnceLock;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    const SESSION_TARGETS: &[&str] = &[
        "pairing_session",
        "pairing_client",
        "transport_webrtc",
        "negotiation",
        "coordinator",
        "signaling",
        "webrtc",
    ];

    const NOISY_DEPENDENCIES: &[&str] = &[
        "webrtc_ice",
        "webrtc_dtls",
        "webrtc_sctp",
        "webrtc_srtp",
        "webrtc_mdns",
        "tokio_tungstenite",
        "tungstenite",
        "mio",
    ];

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Off,
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Off => "off",
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }
    }

    impl fmt::Display for LogLevel {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.as_str())
        }
    }

    impl FromStr for LogLevel {
        type Err = String;

        fn from_str(value: &str) -> Result<Self, Self::Err> {
            match value.trim().to_ascii_lowercase().as_str() {
                "off" | "none" => Ok(LogLevel::Off),
                "error" => Ok(LogLevel::Error),
                "warn" | "warning" => Ok(LogLevel::Warn),
                "info" => Ok(LogLevel::Info),
                "debug" => Ok(LogLevel::Debug),
                "trace" => Ok(LogLevel::Trace),
                other => Err(format!("unknown log level '{other}'")),
            }
        }
    }

    /// Where logs go and how much of them.
    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        /// Appended to; stderr when `None`.
        pub file: Option<PathBuf>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("cannot open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("another global subscriber is installed: {0}")]
        AlreadySet(String),
    }

    // Holding the guard keeps the appender thread flushing until exit.
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Install the global subscriber. Repeated calls keep the first setup.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if GUARD.get().is_some() {
            return Ok(());
        }

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let (directives, throttled) = match std::env::var("PAIRING_LOG_FILTER") {
            Ok(custom) => (custom, false),
            Err(_) => filter_directives(config.level, dependency_traces_allowed()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(directives))
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level == LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::AlreadySet(err.to_string()))?;

        let _ = GUARD.set(guard);
        if throttled {
            tracing::info!(
                "webrtc/websocket internals held at info; set PAIRING_TRACE_DEPS=1 to see them"
            );
        }
        Ok(())
    }

    fn dependency_traces_allowed() -> bool {
        std::env::var("PAIRING_TRACE_DEPS")
            .map(|value| !value.is_empty() && value != "0")
            .unwrap_or(false)
    }

    /// `EnvFilter` directives for `level`, and whether noisy dependencies
    /// were capped.
    fn filter_directives(level: LogLevel, allow_deps: bool) -> (String, bool) {
        match level {
            LogLevel::Off | LogLevel::Error | LogLevel::Warn | LogLevel::Info => {
                (level.as_str().to_owned(), false)
            }
            LogLevel::Debug => (with_targets("info", SESSION_TARGETS, "debug"), false),
            LogLevel::Trace if allow_deps => ("trace".to_owned(), false),
            LogLevel::Trace => (with_targets("trace", NOISY_DEPENDENCIES, "info"), true),
        }
    }

    fn with_targets(base: &str, targets: &[&str], level: &str) -> String {
        targets.iter().fold(base.to_owned(), |mut filter, target| {
            filter.push_str(&format!(",{target}={level}"));
            filter
        })
    }

}
