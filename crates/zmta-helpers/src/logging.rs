#[cfg(target_os = "linux")]
use std::env;

use tracing_subscriber::EnvFilter;
#[cfg(target_os = "linux")]
use tracing_subscriber::layer::SubscriberExt;
#[cfg(target_os = "linux")]
use tracing_subscriber::util::SubscriberInitExt;

/// Where the log filter comes from and how the process identifies itself.
#[derive(Debug, Clone)]
pub struct LogSettings<'a> {
    /// Crate target that receives the configured level, e.g. `zmta_webadmin`.
    pub target: &'a str,
    /// Level from the config file (`error`, `warn`, `info`, `debug`, `trace`).
    pub level: &'a str,
    /// Env var that overrides the whole filter directive.
    pub env_key: &'a str,
    pub service_name: &'a str,
}

impl LogSettings<'_> {
    /// Default directive: the service crates at the configured level and the
    /// chatty dependencies held at `warn`.
    pub fn default_directive(&self) -> String {
        let level = normalize_level(self.level);
        format!(
            "{target}={level},zmta_proto={level},sqlx=warn,hyper=warn,reqwest=warn,tokio=warn",
            target = self.target
        )
    }
}

pub fn init_logging(settings: &LogSettings<'_>) {
    let env_filter = build_env_filter(settings);

    #[cfg(target_os = "linux")]
    {
        if is_running_under_systemd() {
            match tracing_journald::layer() {
                Ok(layer) => {
                    tracing_subscriber::registry()
                        .with(env_filter)
                        .with(layer.with_syslog_identifier(
                            settings.service_name.to_string(),
                        ))
                        .init();
                    return;
                }
                Err(err) => {
                    eprintln!(
                        "{}: journald init failed, falling back to stderr formatter: {err}",
                        settings.service_name
                    );
                }
            }
        }
    }

    tracing_subscriber::fmt().with_env_filter(env_filter).init();
}

fn build_env_filter(settings: &LogSettings<'_>) -> EnvFilter {
    EnvFilter::try_from_env(settings.env_key)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(settings.default_directive()))
}

fn normalize_level(level: &str) -> &'static str {
    match level.trim().to_ascii_lowercase().as_str() {
        "error" | "silent" => "error",
        "warn" | "warning" => "warn",
        "debug" | "verbose" => "debug",
        "trace" | "silly" => "trace",
        _ => "info",
    }
}

#[cfg(target_os = "linux")]
#[inline]
fn is_running_under_systemd() -> bool {
    env::var_os("JOURNAL_STREAM").is_some()
        || env::var_os("INVOCATION_ID").is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_directive_uses_configured_level() {
        let settings = LogSettings {
            target: "zmta_webadmin",
            level: "verbose",
            env_key: "ZMTA_LOG",
            service_name: "zmta-webadmin",
        };
        let directive = settings.default_directive();
        assert!(directive.starts_with("zmta_webadmin=debug,"));
        assert!(directive.contains("sqlx=warn"));
    }

    #[test]
    fn unknown_level_falls_back_to_info() {
        assert_eq!(normalize_level("loud"), "info");
        assert_eq!(normalize_level(" WARN "), "warn");
    }
}
