use std::env;
use std::time::Duration;

use anyhow::{Context, Result};

/// Applicant profile used as cover-letter template input. Global per
/// deployment, read from the environment like everything else.
#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    pub position: String,
    pub summary: String,
    pub skills: Vec<String>,
}

/// Runtime settings, read once at startup from the environment (a local
/// `.env` file is honored). Every numeric knob has a conservative default.
#[derive(Debug, Clone)]
pub struct Config {
    pub api_base: String,
    pub api_token: Option<String>,
    pub openai_api_key: Option<String>,
    pub telegram_token: Option<String>,
    pub tick_interval: Duration,
    pub requests_per_second: f64,
    pub retry_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub http_timeout: Duration,
    pub per_page: u32,
    pub max_applications_per_day: Option<u32>,
    pub tick_concurrency: usize,
    pub profile: Profile,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // Missing .env is fine; real environment variables still apply.
        let _ = dotenvy::dotenv();

        let interval_minutes: u64 = parse_env("SEARCH_INTERVAL_MINUTES", 60)?;
        let backoff_base_ms: u64 = parse_env("BACKOFF_BASE_MS", 1_000)?;
        let backoff_cap_ms: u64 = parse_env("BACKOFF_CAP_MS", 30_000)?;
        let http_timeout_secs: u64 = parse_env("HTTP_TIMEOUT_SECS", 30)?;
        let daily_cap: u32 = parse_env("MAX_APPLICATIONS_PER_DAY", 20)?;

        let skills = env::var("APPLICANT_SKILLS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            api_base: env::var("JOB_API_BASE").unwrap_or_else(|_| "https://api.hh.ru".to_string()),
            api_token: env::var("JOB_API_TOKEN").ok(),
            openai_api_key: env::var("OPENAI_API_KEY").ok(),
            telegram_token: env::var("TELEGRAM_BOT_TOKEN").ok(),
            tick_interval: Duration::from_secs(interval_minutes * 60),
            requests_per_second: parse_env("REQUESTS_PER_SECOND", 1.0)?,
            retry_attempts: parse_env("RETRY_ATTEMPTS", 3)?,
            backoff_base: Duration::from_millis(backoff_base_ms),
            backoff_cap: Duration::from_millis(backoff_cap_ms),
            http_timeout: Duration::from_secs(http_timeout_secs),
            per_page: parse_env("SEARCH_PER_PAGE", 10)?,
            max_applications_per_day: if daily_cap == 0 { None } else { Some(daily_cap) },
            tick_concurrency: parse_env("TICK_CONCURRENCY", 4)?,
            profile: Profile {
                name: env::var("APPLICANT_NAME").unwrap_or_default(),
                position: env::var("APPLICANT_POSITION").unwrap_or_default(),
                summary: env::var("APPLICANT_SUMMARY").unwrap_or_default(),
                skills,
            },
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: '{}'", name, raw)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_default_and_override() {
        unsafe { env::remove_var("JOBSCOUT_TEST_KNOB") };
        let v: u32 = parse_env("JOBSCOUT_TEST_KNOB", 7).unwrap();
        assert_eq!(v, 7);

        unsafe { env::set_var("JOBSCOUT_TEST_KNOB", "42") };
        let v: u32 = parse_env("JOBSCOUT_TEST_KNOB", 7).unwrap();
        assert_eq!(v, 42);

        unsafe { env::set_var("JOBSCOUT_TEST_KNOB", "not-a-number") };
        assert!(parse_env::<u32>("JOBSCOUT_TEST_KNOB", 7).is_err());
        unsafe { env::remove_var("JOBSCOUT_TEST_KNOB") };
    }
}
