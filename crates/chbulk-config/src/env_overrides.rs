// Environment-variable overrides, highest priority in the layering.
//
// Every tunable is overridable through a CHBULK_* variable; the server list
// is comma-separated when supplied this way.

use anyhow::{Context, Result};

use crate::Config;

pub(crate) const ENV_PREFIX: &str = "CHBULK_";

/// Abstraction over the process environment so overrides are testable
/// without mutating global state.
pub(crate) trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;
}

pub(crate) struct StdEnvSource;

impl EnvSource for StdEnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(format!("{ENV_PREFIX}{key}")).ok()
    }
}

fn override_parsed<T: std::str::FromStr>(
    env: &impl EnvSource,
    key: &str,
    target: &mut T,
) -> Result<()>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    if let Some(raw) = env.get(key) {
        *target = raw
            .parse()
            .with_context(|| format!("invalid {ENV_PREFIX}{key} value: {raw}"))?;
    }
    Ok(())
}

pub(crate) fn apply(config: &mut Config, env: &impl EnvSource) -> Result<()> {
    override_parsed(env, "LISTEN", &mut config.listen)?;
    override_parsed(env, "FLUSH_COUNT", &mut config.flush_count)?;
    override_parsed(env, "FLUSH_INTERVAL_MS", &mut config.flush_interval_ms)?;
    override_parsed(env, "DUMP_DIR", &mut config.dump_dir)?;
    override_parsed(
        env,
        "DUMP_CHECK_INTERVAL_SECS",
        &mut config.dump_check_interval_secs,
    )?;
    override_parsed(env, "DEBUG", &mut config.debug)?;
    if let Some(raw) = env.get("LOG_FORMAT") {
        config.log_format = raw
            .parse()
            .with_context(|| format!("invalid {ENV_PREFIX}LOG_FORMAT value: {raw}"))?;
    }

    if let Some(raw) = env.get("SERVERS") {
        config.clickhouse.servers = raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    override_parsed(
        env,
        "DOWN_TIMEOUT_SECS",
        &mut config.clickhouse.down_timeout_secs,
    )?;
    if let Some(raw) = env.get("CONNECT_TIMEOUT_SECS") {
        let secs: u64 = raw
            .parse()
            .with_context(|| format!("invalid {ENV_PREFIX}CONNECT_TIMEOUT_SECS value: {raw}"))?;
        config.clickhouse.connect_timeout_secs = Some(secs);
    }

    override_parsed(env, "CACHE_SHARDS", &mut config.cache.shards)?;
    override_parsed(env, "CACHE_LIFE_WINDOW_MINS", &mut config.cache.life_window_mins)?;
    override_parsed(env, "CACHE_CLEAN_WINDOW_MINS", &mut config.cache.clean_window_mins)?;
    override_parsed(
        env,
        "CACHE_MAX_ENTRIES_IN_WINDOW",
        &mut config.cache.max_entries_in_window,
    )?;
    override_parsed(env, "CACHE_MAX_ENTRY_SIZE", &mut config.cache.max_entry_size)?;
    override_parsed(env, "CACHE_VERBOSE", &mut config.cache.verbose)?;
    override_parsed(env, "CACHE_MAX_SIZE_MB", &mut config.cache.max_cache_size_mb)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct FakeEnv(HashMap<&'static str, &'static str>);

    impl EnvSource for FakeEnv {
        fn get(&self, key: &str) -> Option<String> {
            self.0.get(key).map(|v| v.to_string())
        }
    }

    #[test]
    fn overrides_take_priority() {
        let mut config = Config::default();
        let env = FakeEnv(HashMap::from([
            ("FLUSH_COUNT", "42"),
            ("SERVERS", "http://a:8123, http://b:8123"),
            ("DUMP_CHECK_INTERVAL_SECS", "-1"),
            ("CACHE_VERBOSE", "true"),
            ("CONNECT_TIMEOUT_SECS", "5"),
            ("LOG_FORMAT", "json"),
        ]));

        apply(&mut config, &env).unwrap();

        assert_eq!(config.flush_count, 42);
        assert_eq!(
            config.clickhouse.servers,
            vec!["http://a:8123", "http://b:8123"]
        );
        assert_eq!(config.dump_check_interval(), None);
        assert!(config.cache.verbose);
        assert_eq!(config.clickhouse.connect_timeout_secs, Some(5));
        assert_eq!(config.log_format, crate::LogFormat::Json);
    }

    #[test]
    fn empty_env_changes_nothing() {
        let mut config = Config::default();
        apply(&mut config, &FakeEnv(HashMap::new())).unwrap();
        assert_eq!(config.flush_count, Config::default().flush_count);
    }

    #[test]
    fn malformed_value_is_an_error() {
        let mut config = Config::default();
        let env = FakeEnv(HashMap::from([("FLUSH_COUNT", "lots")]));
        let err = apply(&mut config, &env).unwrap_err();
        assert!(err.to_string().contains("CHBULK_FLUSH_COUNT"));
    }
}
