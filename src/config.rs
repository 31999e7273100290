use std::env;

use serde::Deserialize;

use crate::core::resolver::ConflictStrategy;

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub graph: GraphConfig,
    pub devops: DevOpsConfig,
    pub matching: MatchingConfig,
    pub deviation: DeviationConfig,
    pub conflict: ConflictConfig,
    pub retry: RetryConfig,
    pub scheduler: SchedulerConfig,
    pub apply: ApplyConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Microsoft Graph (calendar source) credentials and fetch scope.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    pub client_id: String,
    pub client_secret: String,
    pub tenant_id: String,
    /// Users whose calendars are reconciled, comma-separated in `RECONCILE_USERS`.
    pub users: Vec<String>,
    /// How many days back the calendar window reaches on each run.
    pub lookback_days: i64,
}

/// Azure DevOps (work-item source) credentials and query scope.
#[derive(Debug, Clone)]
pub struct DevOpsConfig {
    pub organization: String,
    pub project: String,
    pub pat: String,
    /// Optional iteration path restricting the work items in scope.
    pub iteration_path: Option<String>,
    pub api_version: String,
}

/// One operator-pinned matching rule: a subject pattern that forces a
/// specific work item, evaluated before any heuristic rule.
#[derive(Debug, Clone, Deserialize)]
pub struct OverrideRule {
    pub pattern: String,
    pub work_item_id: i64,
}

#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// Minimum fraction of meeting attendees that must overlap a work item's
    /// assignee set for an attendee match.
    pub attendee_overlap_threshold: f64,
    /// Minimum fuzzy similarity between subject and title for a title match.
    pub title_similarity_threshold: f64,
    /// Operator overrides, `MATCH_OVERRIDE_RULES` as a JSON array.
    pub override_rules: Vec<OverrideRule>,
}

/// Deviation-category thresholds as fractions of the estimate. Acceptable
/// variance differs per team, so none of these are hard-coded.
#[derive(Debug, Clone)]
pub struct DeviationConfig {
    pub acceptable: f64,
    pub low: f64,
    pub moderate: f64,
}

#[derive(Debug, Clone)]
pub struct ConflictConfig {
    pub strategy: ConflictStrategy,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per work-item patch before the item is marked failed.
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per attempt.
    pub initial_backoff_ms: u64,
    /// Cap for the exponential backoff.
    pub max_backoff_ms: u64,
    /// Random jitter added to each delay, as a fraction of the delay.
    pub jitter_fraction: f64,
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Cron expression (`SCHEDULE_CRON`), evaluated in UTC. Takes precedence
    /// over the interval when both are set.
    pub cron: Option<String>,
    /// Fixed interval in minutes (`SCHEDULE_INTERVAL_MINUTES`).
    pub interval_minutes: Option<u64>,
    /// What to do with a trigger that fires while a run is active.
    pub overlap_policy: OverlapPolicy,
    /// Bounded execution-history capacity; oldest records are evicted.
    pub history_capacity: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// Remember one pending trigger and run it immediately after.
    Queue,
    /// Drop the trigger with a logged warning.
    Drop,
}

#[derive(Debug, Clone)]
pub struct ApplyConfig {
    /// Maximum concurrent work-item patches in flight.
    pub concurrency: usize,
    /// Abort the run on the first per-item failure instead of containing it.
    pub abort_on_first_failure: bool,
    /// Compute everything, write nothing.
    pub dry_run: bool,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => default,
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let users = env::var("RECONCILE_USERS")
            .map_err(|_| ConfigError::MissingEnv("RECONCILE_USERS".to_string()))?
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();
        if users.is_empty() {
            return Err(ConfigError::InvalidValue("RECONCILE_USERS".to_string()));
        }

        let override_rules = match env::var("MATCH_OVERRIDE_RULES") {
            Ok(raw) => serde_json::from_str(&raw)
                .map_err(|_| ConfigError::InvalidValue("MATCH_OVERRIDE_RULES".to_string()))?,
            Err(_) => Vec::new(),
        };

        let strategy = match env::var("CONFLICT_STRATEGY") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| ConfigError::InvalidValue("CONFLICT_STRATEGY".to_string()))?,
            Err(_) => ConflictStrategy::Skip,
        };

        let overlap_policy = match env::var("SCHEDULE_OVERLAP_POLICY") {
            Ok(v) => match v.to_lowercase().as_str() {
                "queue" => OverlapPolicy::Queue,
                "drop" => OverlapPolicy::Drop,
                _ => return Err(ConfigError::InvalidValue("SCHEDULE_OVERLAP_POLICY".to_string())),
            },
            Err(_) => OverlapPolicy::Queue,
        };

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/reconciler.db".to_string()),
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 5),
            },
            graph: GraphConfig {
                client_id: env::var("GRAPH_CLIENT_ID")
                    .map_err(|_| ConfigError::MissingEnv("GRAPH_CLIENT_ID".to_string()))?,
                client_secret: env::var("GRAPH_CLIENT_SECRET")
                    .map_err(|_| ConfigError::MissingEnv("GRAPH_CLIENT_SECRET".to_string()))?,
                tenant_id: env::var("GRAPH_TENANT_ID")
                    .map_err(|_| ConfigError::MissingEnv("GRAPH_TENANT_ID".to_string()))?,
                users,
                lookback_days: env_or("CALENDAR_LOOKBACK_DAYS", 7),
            },
            devops: DevOpsConfig {
                organization: env::var("DEVOPS_ORGANIZATION")
                    .map_err(|_| ConfigError::MissingEnv("DEVOPS_ORGANIZATION".to_string()))?,
                project: env::var("DEVOPS_PROJECT")
                    .map_err(|_| ConfigError::MissingEnv("DEVOPS_PROJECT".to_string()))?,
                pat: env::var("DEVOPS_PAT")
                    .map_err(|_| ConfigError::MissingEnv("DEVOPS_PAT".to_string()))?,
                iteration_path: env::var("DEVOPS_ITERATION_PATH").ok(),
                api_version: env::var("DEVOPS_API_VERSION").unwrap_or_else(|_| "7.1".to_string()),
            },
            matching: MatchingConfig {
                attendee_overlap_threshold: env_or("MATCH_ATTENDEE_OVERLAP_THRESHOLD", 0.5),
                title_similarity_threshold: env_or("MATCH_TITLE_SIMILARITY_THRESHOLD", 0.6),
                override_rules,
            },
            deviation: DeviationConfig {
                acceptable: env_or("DEVIATION_ACCEPTABLE", 0.10),
                low: env_or("DEVIATION_LOW", 0.25),
                moderate: env_or("DEVIATION_MODERATE", 0.50),
            },
            conflict: ConflictConfig { strategy },
            retry: RetryConfig {
                max_attempts: env_or("RETRY_MAX_ATTEMPTS", 3),
                initial_backoff_ms: env_or("RETRY_INITIAL_BACKOFF_MS", 500),
                max_backoff_ms: env_or("RETRY_MAX_BACKOFF_MS", 30_000),
                jitter_fraction: env_or("RETRY_JITTER_FRACTION", 0.2),
            },
            scheduler: SchedulerConfig {
                cron: env::var("SCHEDULE_CRON").ok(),
                interval_minutes: env::var("SCHEDULE_INTERVAL_MINUTES")
                    .ok()
                    .and_then(|v| v.parse().ok()),
                overlap_policy,
                history_capacity: env_or("SCHEDULE_HISTORY_CAPACITY", 50),
            },
            apply: ApplyConfig {
                concurrency: env_or("APPLY_CONCURRENCY", 4),
                abort_on_first_failure: env_bool("ABORT_ON_FIRST_FAILURE", false),
                dry_run: env_bool("DRY_RUN", false),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "sqlite://data/reconciler.db".to_string(),
                max_connections: 5,
            },
            graph: GraphConfig {
                client_id: String::new(),
                client_secret: String::new(),
                tenant_id: String::new(),
                users: Vec::new(),
                lookback_days: 7,
            },
            devops: DevOpsConfig {
                organization: String::new(),
                project: String::new(),
                pat: String::new(),
                iteration_path: None,
                api_version: "7.1".to_string(),
            },
            matching: MatchingConfig {
                attendee_overlap_threshold: 0.5,
                title_similarity_threshold: 0.6,
                override_rules: Vec::new(),
            },
            deviation: DeviationConfig {
                acceptable: 0.10,
                low: 0.25,
                moderate: 0.50,
            },
            conflict: ConflictConfig {
                strategy: ConflictStrategy::Skip,
            },
            retry: RetryConfig {
                max_attempts: 3,
                initial_backoff_ms: 500,
                max_backoff_ms: 30_000,
                jitter_fraction: 0.2,
            },
            scheduler: SchedulerConfig {
                cron: None,
                interval_minutes: None,
                overlap_policy: OverlapPolicy::Queue,
                history_capacity: 50,
            },
            apply: ApplyConfig {
                concurrency: 4,
                abort_on_first_failure: false,
                dry_run: false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_rules_parse_from_json() {
        let raw = r#"[{"pattern": "(?i)standup", "work_item_id": 42}]"#;
        let rules: Vec<OverrideRule> = serde_json::from_str(raw).unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].work_item_id, 42);
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.retry.max_attempts, 3);
        assert!(cfg.deviation.acceptable < cfg.deviation.low);
        assert!(cfg.deviation.low < cfg.deviation.moderate);
        assert_eq!(cfg.scheduler.overlap_policy, OverlapPolicy::Queue);
    }
}
