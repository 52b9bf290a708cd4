use crate::errors::{RateError, RateResult};
use std::path::PathBuf;
use std::time::Duration;

const BTC_URL: &str = "https://api.kucoin.com/api/v1/market/stats?symbol=BTC-USDT";
const FIAT_URL: &str = "http://www.cbr.ru/scripts/XML_daily.asp";

#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    pub log_file: PathBuf,
    pub rest_addr: String,
    pub ws_addr: String,
    pub btc_url: String,
    pub fiat_url: String,
    pub btc_interval: Duration,
    pub fiat_interval: Duration,
}

impl Config {
    pub fn from_env() -> RateResult<Self> {
        dotenvy::dotenv().ok();

        let btc_poll_secs = env_var_or("BTC_POLL_SECS", "10")
            .parse::<u64>()
            .map_err(|e| RateError::Config(format!("BTC_POLL_SECS: {e}")))?;

        let fiat_poll_secs = env_var_or("FIAT_POLL_SECS", "86400")
            .parse::<u64>()
            .map_err(|e| RateError::Config(format!("FIAT_POLL_SECS: {e}")))?;

        Ok(Self {
            db_url: env_var("POSTGRES_DB_URL")?,
            log_file: PathBuf::from(env_var("LOG_FILE")?),
            rest_addr: env_var_or("REST_ADDR", "0.0.0.0:8080"),
            ws_addr: env_var_or("WS_ADDR", "0.0.0.0:8090"),
            btc_url: env_var_or("BTC_URL", BTC_URL),
            fiat_url: env_var_or("FIAT_URL", FIAT_URL),
            btc_interval: Duration::from_secs(btc_poll_secs),
            fiat_interval: Duration::from_secs(fiat_poll_secs),
        })
    }
}

fn env_var(key: &str) -> RateResult<String> {
    std::env::var(key).map_err(|_| RateError::Config(format!("environment variable {key} must be set")))
}

fn env_var_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
