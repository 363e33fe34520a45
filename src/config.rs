use std::str::FromStr;

use tracing_subscriber::filter::LevelFilter;

use crate::{error::ConfigError, models::usermodel::UserId};

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub referral_target: i64,
    pub code_prefix: String,
    pub code_length: usize,
    pub code_attempts: u32,
    pub admin_user_ids: Vec<UserId>,
    pub log_level: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: "sqlite://referrals.db?mode=rwc".to_string(),
            database_max_connections: 5,
            referral_target: 5,
            code_prefix: "ref_".to_string(),
            code_length: 12,
            code_attempts: 5,
            admin_user_ids: Vec::new(),
            log_level: LevelFilter::INFO,
        }
    }
}

impl Config {
    /// Reads the process environment. Call `dotenv().ok()` first to pick up
    /// a local `.env` file.
    pub fn init() -> Result<Config, ConfigError> {
        Config::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();

        let database_url = lookup("DATABASE_URL").unwrap_or(defaults.database_url);

        let database_max_connections = parse_or(
            &lookup,
            "DATABASE_MAX_CONNECTIONS",
            defaults.database_max_connections,
            "a positive integer",
        )?;
        if database_max_connections == 0 {
            return Err(invalid("DATABASE_MAX_CONNECTIONS", "0", "a positive integer"));
        }

        let referral_target =
            parse_or(&lookup, "REFERRAL_TARGET", defaults.referral_target, "an integer")?;

        let code_prefix = lookup("REFERRAL_CODE_PREFIX").unwrap_or(defaults.code_prefix);

        let code_length = parse_or(
            &lookup,
            "REFERRAL_CODE_LENGTH",
            defaults.code_length,
            "an integer between 1 and 64",
        )?;
        if !(1..=64).contains(&code_length) {
            return Err(invalid(
                "REFERRAL_CODE_LENGTH",
                &code_length.to_string(),
                "an integer between 1 and 64",
            ));
        }

        let code_attempts = parse_or(
            &lookup,
            "REFERRAL_CODE_ATTEMPTS",
            defaults.code_attempts,
            "a positive integer",
        )?;
        if code_attempts == 0 {
            return Err(invalid("REFERRAL_CODE_ATTEMPTS", "0", "a positive integer"));
        }

        // Non-numeric entries are skipped rather than rejected.
        let admin_user_ids = lookup("ADMIN_USER_IDS")
            .map(|raw| {
                raw.split(',')
                    .filter_map(|id| id.trim().parse::<UserId>().ok())
                    .collect()
            })
            .unwrap_or_default();

        let log_level = match lookup("LOG_LEVEL") {
            Some(raw) => LevelFilter::from_str(raw.trim()).map_err(|_| {
                invalid("LOG_LEVEL", &raw, "one of off, error, warn, info, debug, trace")
            })?,
            None => defaults.log_level,
        };

        Ok(Config {
            database_url,
            database_max_connections,
            referral_target,
            code_prefix,
            code_length,
            code_attempts,
            admin_user_ids,
            log_level,
        })
    }

    pub fn is_admin(&self, user_id: UserId) -> bool {
        self.admin_user_ids.contains(&user_id)
    }
}

fn parse_or<F, T>(
    lookup: &F,
    name: &'static str,
    default: T,
    expected: &'static str,
) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        Some(raw) => raw.trim().parse::<T>().map_err(|_| invalid(name, &raw, expected)),
        None => Ok(default),
    }
}

fn invalid(name: &'static str, value: &str, expected: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        name,
        value: value.to_string(),
        expected,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.referral_target, 5);
        assert_eq!(config.code_prefix, "ref_");
        assert_eq!(config.code_length, 12);
        assert_eq!(config.log_level, LevelFilter::INFO);
        assert!(config.admin_user_ids.is_empty());
    }

    #[test]
    fn admin_ids_skip_garbage() {
        let config = config_from(&[("ADMIN_USER_IDS", "12, abc,,34 ")]).unwrap();
        assert_eq!(config.admin_user_ids, vec![12, 34]);
        assert!(config.is_admin(34));
        assert!(!config.is_admin(56));
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = config_from(&[("REFERRAL_TARGET", "five")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "REFERRAL_TARGET", .. }));

        let err = config_from(&[("REFERRAL_CODE_LENGTH", "65")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "REFERRAL_CODE_LENGTH", .. }));

        let err = config_from(&[("REFERRAL_CODE_ATTEMPTS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { name: "REFERRAL_CODE_ATTEMPTS", .. }));
    }

    #[test]
    fn log_level_is_parsed() {
        let config = config_from(&[("LOG_LEVEL", "debug")]).unwrap();
        assert_eq!(config.log_level, LevelFilter::DEBUG);
        assert!(config_from(&[("LOG_LEVEL", "loud")]).is_err());
    }
}
