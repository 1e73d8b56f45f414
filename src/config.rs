use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::throttle::SkipConfig;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: &'static str,
    },
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Mentioning this name addresses the bot directly.
    pub bot_name: String,
    /// Chat whose pictures are on from the start.
    pub privileged_chat: String,
    pub chatter: SkipConfig,
    pub greeting_quiet: Duration,
    pub fetch_attempts: u32,
    pub poll_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bot_name: String::from("ковробот"),
            privileged_chat: String::from("svalo4ka"),
            chatter: SkipConfig::default(),
            greeting_quiet: Duration::from_secs(20),
            fetch_attempts: 10,
            poll_timeout: Duration::from_secs(10),
        }
    }
}

fn invalid(var: &'static str, value: &str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_owned(),
        reason,
    }
}

fn parse_number<T: FromStr>(var: &'static str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(var, value, "not a number"))
}

/// Parses `min-max` or a single number meaning `n-n`.
fn parse_range(var: &'static str, value: &str) -> Result<RangeInclusive<u32>, ConfigError> {
    let (min, max) = value.split_once('-').unwrap_or((value, value));
    let min = parse_number(var, min)?;
    let max = parse_number(var, max)?;
    if min > max {
        return Err(invalid(var, value, "minimum is larger than maximum"));
    }
    Ok(min..=max)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        if let Some(name) = lookup("KOVERBOT_NAME") {
            if name.trim().is_empty() {
                return Err(invalid("KOVERBOT_NAME", &name, "must not be empty"));
            }
            config.bot_name = name;
        }
        if let Some(chat) = lookup("KOVERBOT_PRIVILEGED_CHAT") {
            config.privileged_chat = chat;
        }
        if let Some(value) = lookup("KOVERBOT_CHATTER_SKIP") {
            let skip = parse_range("KOVERBOT_CHATTER_SKIP", &value)?;
            config.chatter.min_skip = *skip.start();
            config.chatter.max_skip = *skip.end();
        }
        if let Some(value) = lookup("KOVERBOT_CHATTER_WAIT") {
            let wait = parse_range("KOVERBOT_CHATTER_WAIT", &value)?;
            config.chatter.min_wait = Duration::from_secs((*wait.start()).into());
            config.chatter.max_wait = Duration::from_secs((*wait.end()).into());
        }
        if let Some(value) = lookup("KOVERBOT_GREETING_QUIET") {
            config.greeting_quiet = Duration::from_secs(parse_number("KOVERBOT_GREETING_QUIET", &value)?);
        }
        if let Some(value) = lookup("KOVERBOT_FETCH_ATTEMPTS") {
            let attempts = parse_number("KOVERBOT_FETCH_ATTEMPTS", &value)?;
            if attempts == 0 {
                return Err(invalid("KOVERBOT_FETCH_ATTEMPTS", &value, "must be at least 1"));
            }
            config.fetch_attempts = attempts;
        }
        if let Some(value) = lookup("KOVERBOT_POLL_TIMEOUT") {
            config.poll_timeout = Duration::from_secs(parse_number("KOVERBOT_POLL_TIMEOUT", &value)?);
        }

        Ok(config)
    }
}
