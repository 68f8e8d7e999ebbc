//! Coordinator configuration.
//!
//! Built once at startup from CLI flags / environment (see the binary's
//! `Args`), validated here, then passed around immutably.

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use eyre::{eyre, Result};

use crate::store::StorePolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub signer_url: String,
    /// Optional bearer secret for the sealed signer.
    pub signer_secret: Option<String>,
    pub routing_url: String,

    /// How far out a successful publish schedules the next one.
    pub publish_interval: Duration,
    /// Entries per sign-batch request.
    pub batch_size: usize,
    /// Consecutive failures before a row is parked as stale.
    pub max_failures: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Hard timeout for each signer request.
    pub signer_timeout: Duration,
    pub publish_max_attempts: usize,
    /// How long a deposed signer epoch keeps being offered for re-sealing.
    pub grace_period: Duration,

    pub state_file: PathBuf,
    pub admin_listen: SocketAddr,
    /// Cadence of the scheduler loop.
    pub tick_interval: Duration,
    pub once: bool,
}

impl Config {
    #[allow(clippy::too_many_arguments)]
    pub fn from_cli(
        signer_url: String,
        signer_secret: Option<String>,
        routing_url: String,
        publish_interval_seconds: u64,
        batch_size: usize,
        max_failures: u32,
        base_backoff_seconds: u64,
        max_backoff_seconds: u64,
        signer_timeout_seconds: u64,
        publish_max_attempts: usize,
        grace_period_seconds: u64,
        state_file: PathBuf,
        admin_listen: SocketAddr,
        tick_seconds: u64,
        once: bool,
    ) -> Result<Self> {
        let signer_url = signer_url.trim_end_matches('/').to_string();
        let routing_url = routing_url.trim_end_matches('/').to_string();

        for (name, url) in [("signer url", &signer_url), ("routing url", &routing_url)] {
            if url.is_empty() {
                return Err(eyre!("{name} must not be empty"));
            }
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(eyre!("{name} '{url}' must start with http:// or https://"));
            }
        }

        if batch_size == 0 {
            return Err(eyre!("batch size must be > 0"));
        }
        if max_failures == 0 {
            return Err(eyre!("max failures must be > 0"));
        }
        if publish_max_attempts == 0 {
            return Err(eyre!("publish max attempts must be > 0"));
        }

        if signer_secret.as_deref().is_some_and(|s| s.trim().is_empty()) {
            tracing::warn!("SIGNER_SECRET is set but blank; sending no bearer token");
        }

        if base_backoff_seconds > max_backoff_seconds {
            tracing::warn!(
                base = base_backoff_seconds,
                max = max_backoff_seconds,
                "backoff base > max; clamping base to max"
            );
        }

        let max_backoff = Duration::from_secs(max_backoff_seconds.max(1));
        Ok(Self {
            signer_url,
            signer_secret: signer_secret.filter(|s| !s.trim().is_empty()),
            routing_url,
            publish_interval: Duration::from_secs(publish_interval_seconds.max(1)),
            batch_size,
            max_failures,
            base_backoff: Duration::from_secs(
                base_backoff_seconds.max(1).min(max_backoff.as_secs()),
            ),
            max_backoff,
            signer_timeout: Duration::from_secs(signer_timeout_seconds.max(1)),
            publish_max_attempts,
            grace_period: Duration::from_secs(grace_period_seconds),
            state_file,
            admin_listen,
            tick_interval: Duration::from_secs(tick_seconds.max(1)),
            once,
        })
    }

    /// The scheduling knobs the store applies on every mutation.
    pub fn policy(&self) -> StorePolicy {
        StorePolicy {
            publish_interval: self.publish_interval,
            base_backoff: self.base_backoff,
            max_backoff: self.max_backoff,
            max_failures: self.max_failures,
            grace_period: self.grace_period,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(signer_url: &str, batch_size: usize, base: u64, max: u64) -> Result<Config> {
        Config::from_cli(
            signer_url.to_string(),
            None,
            "https://delegated-ipfs.dev".to_string(),
            21_600,
            batch_size,
            10,
            base,
            max,
            30,
            3,
            2_419_200,
            PathBuf::from("state/republisher.json"),
            "127.0.0.1:3002".parse().unwrap(),
            60,
            false,
        )
    }

    #[test]
    fn accepts_defaults_and_strips_trailing_slashes() {
        let cfg = build("http://localhost:3001/", 50, 30, 3_600).unwrap();
        assert_eq!(cfg.signer_url, "http://localhost:3001");
        assert_eq!(cfg.publish_interval, Duration::from_secs(21_600));
        assert_eq!(cfg.policy().max_failures, 10);
    }

    #[test]
    fn rejects_bad_urls_and_zero_knobs() {
        assert!(build("", 50, 30, 3_600).is_err());
        assert!(build("localhost:3001", 50, 30, 3_600).is_err());
        assert!(build("http://localhost:3001", 0, 30, 3_600).is_err());
    }

    #[test]
    fn clamps_base_backoff_to_max() {
        let cfg = build("http://localhost:3001", 50, 7_200, 3_600).unwrap();
        assert_eq!(cfg.base_backoff, Duration::from_secs(3_600));
        assert_eq!(cfg.max_backoff, Duration::from_secs(3_600));
    }

    #[test]
    fn blank_secret_is_treated_as_absent() {
        let cfg = Config::from_cli(
            "http://localhost:3001".into(),
            Some("  ".into()),
            "https://delegated-ipfs.dev".into(),
            21_600,
            50,
            10,
            30,
            3_600,
            30,
            3,
            2_419_200,
            PathBuf::from("state/republisher.json"),
            "127.0.0.1:3002".parse().unwrap(),
            60,
            false,
        )
        .unwrap();
        assert!(cfg.signer_secret.is_none());
    }
}
