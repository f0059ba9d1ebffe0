use crate::{quorum::quorum, types::Limits, Error, ReplicaId, Sequence, View};
use serde::Deserialize;
use std::time::Duration;

/// Configuration for a [crate::Replica].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Identity of the local replica.
    pub me: ReplicaId,

    /// Total number of replicas.
    pub n: u32,

    /// Number of Byzantine replicas tolerated (requires `n >= 3f + 1`).
    pub f: u32,

    /// Number of executed sequence numbers between checkpoints (`K`).
    pub checkpoint_period: u64,

    /// Size of the watermark window as a multiple of the checkpoint period.
    pub log_multiplier: u64,

    /// Amount of time a backup waits for an outstanding request to execute before
    /// suspecting the primary.
    pub request_timeout: Duration,

    /// Amount of time to wait for a new view to be installed before moving to the next one.
    pub view_change_timeout: Duration,

    /// Amount of time to wait for an own checkpoint to become stable before re-broadcasting it.
    pub checkpoint_timeout: Duration,

    /// Maximum size (in bytes) of a request payload.
    pub max_request_size: usize,

    /// Maximum number of entries accepted in any repeated message field.
    pub max_entries: usize,
}

impl Config {
    /// Ensures the configuration can be used safely.
    pub fn validate(&self) -> Result<(), Error> {
        if (self.n as u64) < 3 * (self.f as u64) + 1 {
            return Err(Error::TooFewReplicas(self.n, self.f));
        }
        if self.me >= self.n {
            return Err(Error::UnknownReplica(self.me, self.n));
        }
        if self.checkpoint_period == 0 {
            return Err(Error::InvalidCheckpointPeriod);
        }
        if self.log_multiplier < 2 {
            return Err(Error::InvalidLogMultiplier(self.log_multiplier));
        }
        if self.checkpoint_period.checked_mul(self.log_multiplier).is_none() {
            return Err(Error::InvalidLogMultiplier(self.log_multiplier));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::InvalidTimeout("request"));
        }
        if self.view_change_timeout.is_zero() {
            return Err(Error::InvalidTimeout("view change"));
        }
        if self.checkpoint_timeout.is_zero() {
            return Err(Error::InvalidTimeout("checkpoint"));
        }
        if self.max_entries < self.window() as usize || self.max_entries < self.n as usize {
            return Err(Error::InvalidMaxEntries(self.max_entries));
        }
        Ok(())
    }

    /// Size of the watermark window (`L`).
    pub fn window(&self) -> Sequence {
        self.checkpoint_period * self.log_multiplier
    }

    /// Primary of `view` (round-robin).
    pub fn primary(&self, view: View) -> ReplicaId {
        (view % self.n as u64) as ReplicaId
    }

    /// Number of matching votes that forms a quorum.
    pub fn quorum(&self) -> usize {
        quorum(self.n as usize, self.f as usize)
    }

    /// Bounds used when decoding messages from peers.
    pub fn limits(&self) -> Limits {
        Limits {
            max_request_size: self.max_request_size,
            max_entries: self.max_entries,
        }
    }

    /// Parses a YAML configuration document for replica `me`.
    ///
    /// ```yaml
    /// general:
    ///   N: 4
    ///   f: 1
    ///   K: 10
    ///   logmultiplier: 4
    ///   timeout:
    ///     request: 2000
    ///     viewchange: 2000
    ///     checkpoint: 2000
    /// ```
    ///
    /// Timeouts are in milliseconds. The parsed configuration is validated.
    pub fn from_yaml(me: ReplicaId, document: &str) -> Result<Self, Error> {
        let file: File = serde_yaml::from_str(document)?;
        let general = file.general;
        let config = Self {
            me,
            n: general.n,
            f: general.f,
            checkpoint_period: general.k,
            log_multiplier: general.log_multiplier,
            request_timeout: Duration::from_millis(general.timeout.request),
            view_change_timeout: Duration::from_millis(general.timeout.view_change),
            checkpoint_timeout: Duration::from_millis(general.timeout.checkpoint),
            max_request_size: general.max_request_size,
            max_entries: general.max_entries.unwrap_or_else(|| {
                let window = general.k.saturating_mul(general.log_multiplier) as usize;
                window.max(general.n as usize)
            }),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Deserialize)]
struct File {
    general: General,
}

#[derive(Deserialize)]
struct General {
    #[serde(rename = "N")]
    n: u32,
    f: u32,
    #[serde(rename = "K")]
    k: u64,
    #[serde(rename = "logmultiplier", default = "default_log_multiplier")]
    log_multiplier: u64,
    #[serde(rename = "maxrequestsize", default = "default_max_request_size")]
    max_request_size: usize,
    #[serde(rename = "maxentries", default)]
    max_entries: Option<usize>,
    timeout: Timeouts,
}

#[derive(Deserialize)]
struct Timeouts {
    request: u64,
    #[serde(rename = "viewchange")]
    view_change: u64,
    #[serde(default = "default_checkpoint_timeout")]
    checkpoint: u64,
}

fn default_log_multiplier() -> u64 {
    4
}

fn default_max_request_size() -> usize {
    1024 * 1024
}

fn default_checkpoint_timeout() -> u64 {
    2_000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        Config {
            me: 0,
            n: 4,
            f: 1,
            checkpoint_period: 2,
            log_multiplier: 2,
            request_timeout: Duration::from_secs(1),
            view_change_timeout: Duration::from_secs(1),
            checkpoint_timeout: Duration::from_secs(1),
            max_request_size: 1024,
            max_entries: 64,
        }
    }

    #[test]
    fn test_valid() {
        let cfg = config();
        cfg.validate().unwrap();
        assert_eq!(cfg.window(), 4);
        assert_eq!(cfg.quorum(), 3);
        assert_eq!(cfg.primary(0), 0);
        assert_eq!(cfg.primary(5), 1);
    }

    #[test]
    fn test_too_few_replicas() {
        let cfg = Config { n: 3, ..config() };
        assert!(matches!(cfg.validate(), Err(Error::TooFewReplicas(3, 1))));
        let cfg = Config { n: 6, f: 2, ..config() };
        assert!(matches!(cfg.validate(), Err(Error::TooFewReplicas(6, 2))));
    }

    #[test]
    fn test_invalid_values() {
        let cfg = Config { me: 4, ..config() };
        assert!(matches!(cfg.validate(), Err(Error::UnknownReplica(4, 4))));
        let cfg = Config {
            checkpoint_period: 0,
            ..config()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidCheckpointPeriod)));
        let cfg = Config {
            log_multiplier: 1,
            ..config()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidLogMultiplier(1))));
        let cfg = Config {
            request_timeout: Duration::ZERO,
            ..config()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidTimeout("request"))));
        let cfg = Config {
            max_entries: 3,
            ..config()
        };
        assert!(matches!(cfg.validate(), Err(Error::InvalidMaxEntries(3))));
    }

    #[test]
    fn test_from_yaml() {
        let document = r#"
general:
  N: 4
  f: 1
  K: 10
  logmultiplier: 4
  timeout:
    request: 2000
    viewchange: 1500
"#;
        let cfg = Config::from_yaml(2, document).unwrap();
        assert_eq!(cfg.me, 2);
        assert_eq!(cfg.n, 4);
        assert_eq!(cfg.f, 1);
        assert_eq!(cfg.window(), 40);
        assert_eq!(cfg.request_timeout, Duration::from_millis(2000));
        assert_eq!(cfg.view_change_timeout, Duration::from_millis(1500));
        assert_eq!(cfg.checkpoint_timeout, Duration::from_millis(2000));
        assert_eq!(cfg.max_entries, 40);
    }

    #[test]
    fn test_from_yaml_invalid() {
        let document = r#"
general:
  N: 3
  f: 1
  K: 10
  timeout:
    request: 2000
    viewchange: 2000
"#;
        assert!(matches!(
            Config::from_yaml(0, document),
            Err(Error::TooFewReplicas(3, 1))
        ));
        assert!(matches!(
            Config::from_yaml(0, "general: ["),
            Err(Error::Yaml(_))
        ));
    }
}
