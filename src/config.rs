use std::env;

use crate::error::{AppError, AppResult};

#[derive(Clone, Debug)]
pub struct Config {
    pub db_url: String,
    pub migration_limit: i64,
    pub storage_url: String,
    pub storage_api_token: String,
    pub storage_chat_id: Option<String>,
    pub enable_delete: bool,
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        // ENV_FILE overrides the default .env lookup
        match env::var("ENV_FILE") {
            Ok(path) => {
                dotenvy::from_filename(path).ok();
            }
            Err(_) => {
                dotenvy::dotenv().ok();
            }
        }

        Ok(Config {
            db_url: require("DB_URL")?,
            migration_limit: env::var("MIGRATION_LIMIT")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .unwrap_or(100),
            storage_url: require("AWSL_STORAGE_URL")?,
            storage_api_token: require("AWSL_STORAGE_API_TOKEN")?,
            storage_chat_id: env::var("AWSL_STORAGE_CHAT_ID")
                .ok()
                .filter(|s| !s.is_empty()),
            enable_delete: env::var("ENABLE_DELETE")
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
        })
    }
}

fn require(name: &str) -> AppResult<String> {
    env::var(name)
        .ok()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| AppError::Config(format!("{} must be set", name)))
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool_truthy() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool("TRUE"));
        assert!(parse_bool("Yes"));
        assert!(parse_bool(" true "));
    }

    #[test]
    fn test_parse_bool_falsy() {
        assert!(!parse_bool("0"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
        assert!(!parse_bool("enabled"));
    }
}
