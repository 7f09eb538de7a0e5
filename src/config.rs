use anyhow::Result;
use std::env;
use std::time::Duration;

/// Process configuration, read once from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub chat_api_url: String,
    pub chat_bot_token: String,
    pub redis_url: Option<String>,
    pub engine: EngineConfig,
}

/// Timing and retry knobs of the lottery engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Pause between "all rounds finished" and reading their winners, so the last
    /// in-flight votes can land in the participation store.
    pub finalize_grace: Duration,
    /// How often an orchestrator checks whether it has been left without rounds.
    pub idle_check_interval: Duration,
    pub finalize_max_tries: usize,
    pub finalize_retry_delay: Duration,
    /// How long after a lottery ends its reward claim stays open.
    pub claim_window: Duration,
    pub claimable_duration_hours: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            finalize_grace: Duration::from_millis(5_000),
            idle_check_interval: Duration::from_secs(3_600),
            finalize_max_tries: 3,
            finalize_retry_delay: Duration::from_millis(1_000),
            claim_window: Duration::from_secs(72 * 3_600),
            claimable_duration_hours: 24 * 15,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            finalize_grace: Duration::from_millis(read_u64(
                "QUIZ_FINALIZE_GRACE_MS",
                defaults.finalize_grace.as_millis() as u64,
            )),
            idle_check_interval: Duration::from_secs(read_u64(
                "QUIZ_IDLE_CHECK_SECS",
                defaults.idle_check_interval.as_secs(),
            )),
            finalize_max_tries: read_u64(
                "QUIZ_FINALIZE_MAX_TRIES",
                defaults.finalize_max_tries as u64,
            ) as usize,
            finalize_retry_delay: Duration::from_millis(read_u64(
                "QUIZ_FINALIZE_RETRY_DELAY_MS",
                defaults.finalize_retry_delay.as_millis() as u64,
            )),
            claim_window: Duration::from_secs(
                read_u64("QUIZ_CLAIM_WINDOW_HOURS", defaults.claim_window.as_secs() / 3_600)
                    .saturating_mul(3_600),
            ),
            claimable_duration_hours: read_u64(
                "QUIZ_CLAIMABLE_HOURS",
                defaults.claimable_duration_hours,
            ),
        }
    }
}

fn read_u64(key: &str, fallback: u64) -> u64 {
    parse_u64(env::var(key).ok().as_deref(), fallback)
}

fn parse_u64(raw: Option<&str>, fallback: u64) -> u64 {
    raw.and_then(|raw| raw.trim().parse::<u64>().ok())
        .unwrap_or(fallback)
}

pub fn load() -> Result<Config> {
    let database_url =
        env::var("QUIZ_DB_PATH").unwrap_or_else(|_| "data/quiz_lottery.db".to_string());
    let chat_api_url =
        env::var("CHAT_API_URL").unwrap_or_else(|_| "https://discord.com/api/v10".to_string());
    let chat_bot_token = env::var("CHAT_BOT_TOKEN").unwrap_or_default();
    let redis_url = env::var("REDIS_URL").ok().filter(|url| !url.is_empty());

    Ok(Config {
        database_url,
        chat_api_url,
        chat_bot_token,
        redis_url,
        engine: EngineConfig::from_env(),
    })
}
