//! Server configuration.

use complyflow_infra::config::JobConfig;
use complyflow_observability::{LogConfig, LogFormat};
use tracing::warn;

const DEV_JWT_SECRET: &str = "dev-secret";

/// Process-level settings for the API binary.
///
/// | Env Var        | Default        |
/// |----------------|----------------|
/// | `HOST`         | `0.0.0.0`      |
/// | `PORT`         | `8080`         |
/// | `JWT_SECRET`   | dev secret     |
/// | `DATABASE_URL` | unset (memory) |
/// | `REDIS_URL`    | unset (local)  |
/// | `INSTANCE_ID`  | random         |
/// | `RUN_WORKERS`  | `true`         |
/// | `LOG_FORMAT`   | `json`         |
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub jwt_secret: String,
    pub database_url: Option<String>,
    pub redis_url: Option<String>,
    pub instance_id: String,
    pub run_workers: bool,
    pub log: LogConfig,
    pub jobs: JobConfig,
}

impl ServerConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let port = match non_empty("PORT") {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(value = %raw, "invalid PORT; using 8080");
                8080
            }),
            None => 8080,
        };

        let jwt_secret = non_empty("JWT_SECRET").unwrap_or_else(|| {
            warn!("JWT_SECRET not set; using insecure dev default");
            DEV_JWT_SECRET.to_string()
        });

        let run_workers = non_empty("RUN_WORKERS")
            .map(|v| !matches!(v.to_ascii_lowercase().as_str(), "0" | "false" | "no" | "off"))
            .unwrap_or(true);

        Self {
            host: non_empty("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            jwt_secret,
            database_url: non_empty("DATABASE_URL"),
            redis_url: non_empty("REDIS_URL"),
            instance_id: non_empty("INSTANCE_ID").unwrap_or_else(|| format!("api-{}", uuid::Uuid::now_v7().simple())),
            run_workers,
            log: LogConfig {
                format: non_empty("LOG_FORMAT").map(|v| LogFormat::parse(&v)).unwrap_or_default(),
                ..LogConfig::default()
            },
            jobs: JobConfig::from_lookup(&lookup),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_select_in_memory_backends() {
        let cfg = ServerConfig::from_lookup(|_| None);
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8080");
        assert_eq!(cfg.jwt_secret, DEV_JWT_SECRET);
        assert!(cfg.database_url.is_none());
        assert!(cfg.redis_url.is_none());
        assert!(cfg.run_workers);
        assert!(cfg.instance_id.starts_with("api-"));
        assert_eq!(cfg.log.format, LogFormat::Json);
        assert_eq!(cfg.jobs, JobConfig::default());
    }

    #[test]
    fn reads_overrides() {
        let cfg = ServerConfig::from_lookup(lookup(&[
            ("HOST", "127.0.0.1"),
            ("PORT", "9000"),
            ("JWT_SECRET", "s3cret"),
            ("DATABASE_URL", "postgres://localhost/complyflow"),
            ("REDIS_URL", " "),
            ("INSTANCE_ID", "api-7"),
            ("RUN_WORKERS", "false"),
            ("LOG_FORMAT", "pretty"),
            ("JOB_MAX_ATTEMPTS", "5"),
        ]));
        assert_eq!(cfg.bind_addr(), "127.0.0.1:9000");
        assert_eq!(cfg.jwt_secret, "s3cret");
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/complyflow"));
        assert!(cfg.redis_url.is_none());
        assert_eq!(cfg.instance_id, "api-7");
        assert!(!cfg.run_workers);
        assert_eq!(cfg.log.format, LogFormat::Pretty);
        assert_eq!(cfg.jobs.max_attempts, 5);
    }

    #[test]
    fn bad_port_falls_back() {
        let cfg = ServerConfig::from_lookup(lookup(&[("PORT", "http")]));
        assert_eq!(cfg.port, 8080);
    }
}
