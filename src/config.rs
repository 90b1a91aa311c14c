use crate::models::WithdrawalLimits;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Fractional digits the ledger schema stores for money columns
pub const MAX_CURRENCY_SCALE: u32 = 2;

/// Database configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
    pub test_before_acquire: bool,
}

/// Which backing store holds the ledger. Chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl StoreBackend {
    pub fn from_str(s: &str) -> Result<Self, String> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            _ => Err(format!("Invalid LEDGER_STORE: {}. Must be postgres or memory", s)),
        }
    }
}

/// Overdue-return penalty applied when an escrowed deposit comes back late.
#[derive(Debug, Clone)]
pub struct PenaltyPolicy {
    /// Charged for every started hour past the due time (after the grace period)
    pub per_hour: Decimal,
    pub grace_minutes: i64,
}

impl Default for PenaltyPolicy {
    fn default() -> Self {
        Self {
            per_hour: Decimal::new(5_000, 0),
            grace_minutes: 0,
        }
    }
}

/// Accounting rules injected into every ledger service.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Actor ids allowed to post corrections, approve payouts and freeze wallets
    pub admin_ids: Vec<String>,
    /// Maximum number of fractional digits accepted on amounts
    pub currency_scale: u32,
    pub default_daily_withdrawal_limit: Decimal,
    pub default_monthly_withdrawal_limit: Decimal,
    /// Balances below this after a debit publish a low-balance event
    pub low_balance_threshold: Decimal,
    pub penalty: PenaltyPolicy,
    pub settlement_interval_secs: u64,
    pub settlement_scheduler_enabled: bool,
}

impl LedgerConfig {
    /// Create ledger config from environment variables
    pub fn from_env() -> Result<Self, String> {
        let defaults = Self::default();

        let admin_ids = env::var("LEDGER_ADMIN_IDS")
            .map(|s| {
                s.split(',')
                    .map(|id| id.trim().to_string())
                    .filter(|id| !id.is_empty())
                    .collect::<Vec<_>>()
            })
            .unwrap_or_default();

        let currency_scale = env::var("CURRENCY_SCALE")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(defaults.currency_scale);

        let default_daily_withdrawal_limit =
            decimal_var("DAILY_WITHDRAWAL_LIMIT")?.unwrap_or(defaults.default_daily_withdrawal_limit);
        let default_monthly_withdrawal_limit = decimal_var("MONTHLY_WITHDRAWAL_LIMIT")?
            .unwrap_or(defaults.default_monthly_withdrawal_limit);
        let low_balance_threshold =
            decimal_var("LOW_BALANCE_THRESHOLD")?.unwrap_or(defaults.low_balance_threshold);

        let penalty = PenaltyPolicy {
            per_hour: decimal_var("OVERDUE_PENALTY_PER_HOUR")?.unwrap_or(defaults.penalty.per_hour),
            grace_minutes: env::var("OVERDUE_GRACE_MINUTES")
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or(defaults.penalty.grace_minutes),
        };

        let settlement_interval_secs = env::var("SETTLEMENT_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(defaults.settlement_interval_secs);

        let settlement_scheduler_enabled = env::var("SETTLEMENT_SCHEDULER_ENABLED")
            .ok()
            .and_then(|s| s.parse::<bool>().ok())
            .unwrap_or(defaults.settlement_scheduler_enabled);

        let config = Self {
            admin_ids,
            currency_scale,
            default_daily_withdrawal_limit,
            default_monthly_withdrawal_limit,
            low_balance_threshold,
            penalty,
            settlement_interval_secs,
            settlement_scheduler_enabled,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.currency_scale > MAX_CURRENCY_SCALE {
            return Err(format!(
                "CURRENCY_SCALE must be at most {} to fit the ledger columns",
                MAX_CURRENCY_SCALE
            ));
        }
        if self.default_daily_withdrawal_limit < Decimal::ZERO
            || self.default_monthly_withdrawal_limit < Decimal::ZERO
        {
            return Err("Withdrawal limits must not be negative".to_string());
        }
        if self.default_daily_withdrawal_limit > self.default_monthly_withdrawal_limit {
            return Err("DAILY_WITHDRAWAL_LIMIT must not exceed MONTHLY_WITHDRAWAL_LIMIT".to_string());
        }
        if self.penalty.per_hour < Decimal::ZERO || self.penalty.grace_minutes < 0 {
            return Err("Penalty policy values must not be negative".to_string());
        }
        if self.settlement_interval_secs == 0 {
            return Err("SETTLEMENT_INTERVAL_SECS must be greater than 0".to_string());
        }
        Ok(())
    }

    /// Check whether an actor id is on the admin allowlist
    pub fn is_admin(&self, actor_id: &str) -> bool {
        self.admin_ids.iter().any(|id| id == actor_id)
    }

    pub fn default_withdrawal_limits(&self) -> WithdrawalLimits {
        WithdrawalLimits {
            daily: self.default_daily_withdrawal_limit,
            monthly: self.default_monthly_withdrawal_limit,
        }
    }

    pub fn settlement_interval(&self) -> Duration {
        Duration::from_secs(self.settlement_interval_secs)
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            admin_ids: Vec::new(),
            currency_scale: 0,
            default_daily_withdrawal_limit: Decimal::new(5_000_000, 0),
            default_monthly_withdrawal_limit: Decimal::new(50_000_000, 0),
            low_balance_threshold: Decimal::new(20_000, 0),
            penalty: PenaltyPolicy::default(),
            settlement_interval_secs: 86_400,
            settlement_scheduler_enabled: false,
        }
    }
}

fn decimal_var(name: &str) -> Result<Option<Decimal>, String> {
    match env::var(name) {
        Ok(raw) => Decimal::from_str(raw.trim())
            .map(Some)
            .map_err(|e| format!("Invalid {}: {} ({})", name, raw, e)),
        Err(_) => Ok(None),
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub ledger: LedgerConfig,
    pub store_backend: StoreBackend,
    pub log_level: String,
    pub log_json: bool,
    pub http_port: u16,
    pub environment: String,
}

impl DatabaseConfig {
    /// Create database config from environment variables
    pub fn from_env() -> Result<Self, String> {
        let url = env::var("DATABASE_URL")
            .map_err(|_| "DATABASE_URL environment variable is required")?;

        let max_connections = env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(10);

        let acquire_timeout_secs = env::var("DATABASE_ACQUIRE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(30);

        let idle_timeout_secs = env::var("DATABASE_IDLE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(600); // 10 minutes

        let max_lifetime_secs = env::var("DATABASE_MAX_LIFETIME_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(1800); // 30 minutes

        let test_before_acquire = env::var("DATABASE_TEST_BEFORE_ACQUIRE")
            .ok()
            .and_then(|s| s.parse::<bool>().ok())
            .unwrap_or(true);

        if max_connections == 0 {
            return Err("DATABASE_MAX_CONNECTIONS must be greater than 0".to_string());
        }

        if acquire_timeout_secs == 0 {
            return Err("DATABASE_ACQUIRE_TIMEOUT_SECS must be greater than 0".to_string());
        }

        Ok(Self {
            url,
            max_connections,
            acquire_timeout_secs,
            idle_timeout_secs,
            max_lifetime_secs,
            test_before_acquire,
        })
    }

    /// Get acquire timeout as Duration
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    /// Get idle timeout as Duration
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Get max lifetime as Duration
    pub fn max_lifetime(&self) -> Duration {
        Duration::from_secs(self.max_lifetime_secs)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/ecocup_ledger".to_string(),
            max_connections: 10,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
            test_before_acquire: true,
        }
    }
}

impl AppConfig {
    /// Create application config from environment variables
    pub fn from_env() -> Result<Self, String> {
        let store_backend = env::var("LEDGER_STORE")
            .map(|s| StoreBackend::from_str(&s))
            .unwrap_or(Ok(StoreBackend::Postgres))?;

        let database = match store_backend {
            StoreBackend::Postgres => DatabaseConfig::from_env()?,
            StoreBackend::Memory => DatabaseConfig::default(),
        };

        let ledger = LedgerConfig::from_env()?;

        let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let log_json = env::var("LOG_FORMAT")
            .map(|f| f.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let http_port = env::var("HTTP_PORT")
            .ok()
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(8080);

        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid LOG_LEVEL: {}. Must be one of: {:?}",
                log_level, valid_log_levels
            ));
        }

        let valid_environments = ["development", "staging", "production"];
        if !valid_environments.contains(&environment.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid ENVIRONMENT: {}. Must be one of: {:?}",
                environment, valid_environments
            ));
        }

        let config = Self {
            database,
            ledger,
            store_backend,
            log_level: log_level.to_lowercase(),
            log_json,
            http_port,
            environment: environment.to_lowercase(),
        };

        if config.is_production() && config.store_backend == StoreBackend::Memory {
            return Err("LEDGER_STORE=memory is not allowed in production".to_string());
        }

        Ok(config)
    }

    /// Check if running in production
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    /// Check if running in development
    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    /// Get database URL (convenience method)
    pub fn database_url(&self) -> &str {
        &self.database.url
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            ledger: LedgerConfig::default(),
            store_backend: StoreBackend::Postgres,
            log_level: "info".to_string(),
            log_json: false,
            http_port: 8080,
            environment: "development".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_config_default() {
        let config = DatabaseConfig::default();
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.acquire_timeout_secs, 30);
    }

    #[test]
    fn test_app_config_default() {
        let config = AppConfig::default();
        assert_eq!(config.http_port, 8080);
        assert_eq!(config.store_backend, StoreBackend::Postgres);
        assert!(config.is_development());
        assert!(!config.is_production());
    }

    #[test]
    fn test_ledger_config_defaults_are_valid() {
        let config = LedgerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.penalty.per_hour, Decimal::new(5_000, 0));
        assert!(!config.is_admin("anyone"));
    }

    #[test]
    fn test_admin_allowlist() {
        let config = LedgerConfig {
            admin_ids: vec!["admin-1".to_string()],
            ..LedgerConfig::default()
        };
        assert!(config.is_admin("admin-1"));
        assert!(!config.is_admin("admin-2"));
    }

    #[test]
    fn test_daily_limit_above_monthly_is_rejected() {
        let config = LedgerConfig {
            default_daily_withdrawal_limit: Decimal::new(10, 0),
            default_monthly_withdrawal_limit: Decimal::new(5, 0),
            ..LedgerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_currency_scale_is_capped_by_schema() {
        let cents = LedgerConfig {
            currency_scale: MAX_CURRENCY_SCALE,
            ..LedgerConfig::default()
        };
        assert!(cents.validate().is_ok());

        let finer = LedgerConfig {
            currency_scale: MAX_CURRENCY_SCALE + 2,
            ..LedgerConfig::default()
        };
        assert!(finer.validate().is_err());
    }

    #[test]
    fn test_store_backend_parsing() {
        assert_eq!(StoreBackend::from_str("Postgres").unwrap(), StoreBackend::Postgres);
        assert_eq!(StoreBackend::from_str("memory").unwrap(), StoreBackend::Memory);
        assert!(StoreBackend::from_str("firestore").is_err());
    }
}
