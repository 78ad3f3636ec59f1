//! Logging setup and request-scoped logging context.
//!
//! [`init_logging`] installs the process-wide subscriber with the sinks named in
//! `logging.providers`; the task-locals carry the request id, provider and
//! client key name into log lines without threading them through every call.

use crate::core::config::LoggingConfig;
use crate::core::log_file::SizeRotatingFile;
use anyhow::{Context, Result};
use chrono::Local;
use std::sync::OnceLock;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

tokio::task_local! {
    /// Provider id serving the current upstream call.
    pub static PROVIDER_CONTEXT: String;
    /// Request id assigned by the request-id middleware.
    pub static REQUEST_ID: String;
    /// Authenticated client key name (`anonymous` without auth).
    pub static CLIENT_KEY_NAME: String;
}

/// Empty outside a provider scope.
pub fn get_provider_context() -> String {
    PROVIDER_CONTEXT.try_with(Clone::clone).unwrap_or_default()
}

/// Empty outside a request scope.
pub fn get_request_id() -> String {
    REQUEST_ID.try_with(Clone::clone).unwrap_or_default()
}

pub fn get_client_key_name() -> String {
    CLIENT_KEY_NAME
        .try_with(Clone::clone)
        .unwrap_or_else(|_| crate::api::auth::ANONYMOUS.to_string())
}

pub fn generate_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Run `$body` with the request id and client key name scoped as task-locals.
///
/// ```ignore
/// with_request_context!(request_id, client_key, async move { /* handler */ })
/// ```
#[macro_export]
macro_rules! with_request_context {
    ($request_id:expr, $client_key_name:expr, $body:expr) => {
        $crate::core::logging::REQUEST_ID
            .scope($request_id, async {
                $crate::core::logging::CLIENT_KEY_NAME
                    .scope($client_key_name, $body)
                    .await
            })
            .await
    };
}

/// Custom time formatter that uses local timezone (respects TZ environment variable)
struct LocalTime;

impl tracing_subscriber::fmt::time::FormatTime for LocalTime {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%d %H:%M:%S"))
    }
}

/// Keeps the non-blocking file writer flushing for the life of the process.
static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Noisy HTTP internals are capped at warn whatever RUST_LOG says.
fn build_filter(level: &str) -> EnvFilter {
    let base = std::env::var("RUST_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| level.to_string());
    EnvFilter::new(format!(
        "{},hyper=warn,hyper::proto=warn,h2=warn,reqwest=warn,sqlx=warn",
        base
    ))
}

/// Sink names enabled by the config; `console` when nothing is configured.
fn enabled_sinks(config: &LoggingConfig) -> (bool, bool, bool) {
    let has = |name: &str| config.providers.iter().any(|p| p.eq_ignore_ascii_case(name));
    let file = has("file") || config.file.enabled;
    let json = has("json");
    let console = has("console") || (!json && !file && config.providers.is_empty());
    (console, json, file)
}

/// Install the global subscriber. Calling it twice is an error.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let (console, json, file) = enabled_sinks(config);
    let no_color = std::env::var("NO_COLOR").is_ok();

    let file_layer = if file {
        let writer = SizeRotatingFile::open(
            &config.file.path,
            config.file.max_size_mb,
            config.file.max_backups,
        )
        .with_context(|| format!("Failed to open log file {}", config.file.path))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(writer);
        let _ = FILE_GUARD.set(guard);
        Some(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTime)
                .with_ansi(false)
                .with_writer(non_blocking),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(build_filter(&config.level))
        .with(console.then(|| {
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTime)
                .with_ansi(!no_color)
        }))
        .with(json.then(|| tracing_subscriber::fmt::layer().json().with_current_span(false)))
        .with(file_layer)
        .try_init()
        .context("Failed to install tracing subscriber")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logging(providers: &[&str], file_enabled: bool) -> LoggingConfig {
        let mut config = LoggingConfig {
            providers: providers.iter().map(|p| p.to_string()).collect(),
            ..Default::default()
        };
        config.file.enabled = file_enabled;
        config
    }

    #[test]
    fn test_sink_selection() {
        assert_eq!(enabled_sinks(&logging(&[], false)), (true, false, false));
        assert_eq!(enabled_sinks(&logging(&["json"], false)), (false, true, false));
        assert_eq!(enabled_sinks(&logging(&["console", "file"], false)), (true, false, true));
        assert_eq!(enabled_sinks(&logging(&[], true)), (false, false, true));
    }

    #[tokio::test]
    async fn test_context_defaults_outside_scope() {
        assert_eq!(get_provider_context(), "");
        assert_eq!(get_request_id(), "");
        assert_eq!(get_client_key_name(), "anonymous");
    }

    #[tokio::test]
    async fn test_request_context_macro_scopes_both() {
        let seen = crate::with_request_context!("req-1".to_string(), "team-a".to_string(), async {
            PROVIDER_CONTEXT
                .scope("openai".to_string(), async {
                    (get_request_id(), get_client_key_name(), get_provider_context())
                })
                .await
        });
        assert_eq!(seen, ("req-1".into(), "team-a".into(), "openai".into()));
    }

    #[tokio::test]
    async fn test_contexts_isolated_between_tasks() {
        let spawn = |id: &'static str| {
            tokio::spawn(REQUEST_ID.scope(id.to_string(), async {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                get_request_id()
            }))
        };
        let (a, b) = (spawn("request-1"), spawn("request-2"));
        assert_eq!(a.await.unwrap(), "request-1");
        assert_eq!(b.await.unwrap(), "request-2");
    }

    #[test]
    fn test_generate_request_id_is_unique_uuid() {
        let id = generate_request_id();
        assert!(uuid::Uuid::parse_str(&id).is_ok());
        assert_ne!(id, generate_request_id());
    }
}
