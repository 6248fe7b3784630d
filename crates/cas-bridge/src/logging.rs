//! Tracing subscriber setup for host processes and workers.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn base_level(cas_log: Option<&str>) -> &'static str {
    match cas_log {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_directives(cas_log: Option<&str>) -> String {
    let level = base_level(cas_log);
    format!("cas_bridge={level},cas_stub_worker={level}")
}

/// Output encoding selected by `LOG_FORMAT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Text,
        }
    }
}

/// Initialize tracing with CAS_LOG and LOG_FORMAT support.
///
/// `RUST_LOG` takes precedence over `CAS_LOG`. Output goes to stderr so a
/// worker's stdout stays free. Safe to call more than once.
pub fn init_tracing() {
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(filter_directives(std::env::var("CAS_LOG").ok().as_deref())),
    };
    let format = LogFormat::parse(std::env::var("LOG_FORMAT").ok().as_deref());

    // Exactly one of the two layers is present.
    let json = (format == LogFormat::Json)
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text = (format == LogFormat::Text).then(|| fmt::layer().with_writer(std::io::stderr));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(text)
        .try_init();
}
