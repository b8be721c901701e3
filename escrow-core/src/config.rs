use std::{env, str::FromStr, time::Duration};

use anyhow::Context;
use escrow_std::Apply;

use crate::{
    constants::{
        DEFAULT_COOLDOWN_PAD, DEFAULT_MAX_BATCH_SIZE, DEFAULT_SCHEDULER_TICK,
        DEFAULT_TIME_BUFFER, DEFAULT_TX_STUCK,
    },
    network::Network,
    seal::SealKey,
};

/// Validated service configuration, read from the environment once at
/// startup. A missing or malformed required var is a fatal error; the
/// process refuses to start.
#[derive(Clone)]
pub struct Config {
    pub network: Network,
    /// Key under which hot-wallet seeds are sealed at rest.
    pub seal_key: SealKey,
    pub chain_api_url: String,
    pub chain_api_key: String,
    pub scheduler_tick: Duration,
    pub tx_stuck: Duration,
    pub max_batch_size: usize,
    /// Half-width of transaction validity windows.
    pub time_buffer: Duration,
    /// Pad added to party cooldowns on top of the source cooldown. Must
    /// exceed the worst-case finality horizon of the target network.
    pub cooldown_pad: Duration,
}

impl Config {
    /// Read and validate the full configuration from the environment.
    /// In dev, a `.env` file (if present) is loaded first.
    pub fn from_env() -> anyhow::Result<Self> {
        // Ignore a missing .env; env vars may be set directly.
        let _ = dotenvy::dotenv();

        let network = required_var("NETWORK")?
            .as_str()
            .apply(Network::from_str)
            .context("Invalid NETWORK")?;

        let seal_key = required_var("ENCRYPTION_KEY")?
            .as_str()
            .apply(SealKey::from_hex)
            .context("Invalid ENCRYPTION_KEY")?;

        let chain_api_url = required_var("CHAIN_API_URL")?;
        let chain_api_key = required_var("CHAIN_API_KEY")?;

        Ok(Self {
            network,
            seal_key,
            chain_api_url,
            chain_api_key,
            scheduler_tick: duration_ms_var(
                "SCHEDULER_TICK_MS",
                DEFAULT_SCHEDULER_TICK,
            )?,
            tx_stuck: duration_ms_var("TX_STUCK_MS", DEFAULT_TX_STUCK)?,
            max_batch_size: parsed_var(
                "MAX_BATCH_SIZE",
                DEFAULT_MAX_BATCH_SIZE,
            )?,
            time_buffer: duration_ms_var(
                "TIME_BUFFER_MS",
                DEFAULT_TIME_BUFFER,
            )?,
            cooldown_pad: duration_ms_var(
                "COOLDOWN_PAD_MS",
                DEFAULT_COOLDOWN_PAD,
            )?,
        })
    }
}

fn required_var(name: &str) -> anyhow::Result<String> {
    env::var(name).with_context(|| format!("{name} was not set"))
}

fn parsed_var<T: FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(s) => s
            .parse::<T>()
            .with_context(|| format!("Could not parse {name}")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(e) => Err(e).with_context(|| format!("Could not read {name}")),
    }
}

fn duration_ms_var(name: &str, default: Duration) -> anyhow::Result<Duration> {
    let default_ms = default.as_millis() as u64;
    parsed_var(name, default_ms).map(Duration::from_millis)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parsed_var_falls_back_to_default() {
        // SAFETY: test-only env mutation, var name is unique to this test.
        unsafe { env::remove_var("ESCROW_TEST_UNSET_VAR") };
        let got: usize = parsed_var("ESCROW_TEST_UNSET_VAR", 50).unwrap();
        assert_eq!(got, 50);
    }

    #[test]
    fn duration_var_parses_ms() {
        unsafe { env::set_var("ESCROW_TEST_TICK_MS", "15000") };
        let got =
            duration_ms_var("ESCROW_TEST_TICK_MS", DEFAULT_SCHEDULER_TICK)
                .unwrap();
        assert_eq!(got, Duration::from_secs(15));
    }
}
