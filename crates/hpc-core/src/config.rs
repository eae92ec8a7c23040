//! hpcsched.toml configuration parser.
//!
//! Every field is optional; missing values fall back to the defaults
//! documented on each field.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::types::PreemptMode;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedConfig {
    #[serde(default)]
    pub scheduler: SchedulerPolicy,
    #[serde(default)]
    pub rm: Vec<RmConfig>,
}

/// Scheduling-iteration policy knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerPolicy {
    /// Jobs that may be started per iteration. Negative means unlimited.
    pub max_job_start_per_iteration: i64,
    /// Preemptions that may be initiated per iteration. Negative means
    /// unlimited; `0` disables preemption.
    pub max_job_preempt_per_iteration: i64,
    /// Resume already-preempted victims when a preemptor fails to start.
    pub resume_on_failed_preempt: bool,
    /// Forbid preemption between jobs of the same QoS.
    pub disable_same_qos_preemption: bool,
    /// Ignore the reservation retry timer when preempting.
    pub no_wait_preemption: bool,
    /// Minimum time between two preemptions by the same preemptor.
    pub reservation_retry_time_secs: u64,
    pub preempt_policy: PreemptMode,
    pub iteration_interval_secs: u64,
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self {
            max_job_start_per_iteration: -1,
            max_job_preempt_per_iteration: -1,
            resume_on_failed_preempt: false,
            disable_same_qos_preemption: false,
            no_wait_preemption: false,
            reservation_retry_time_secs: 0,
            preempt_policy: PreemptMode::Requeue,
            iteration_interval_secs: 30,
        }
    }
}

impl SchedulerPolicy {
    /// True once `count` has reached a non-negative `limit`.
    pub fn cap_reached(limit: i64, count: u32) -> bool {
        limit >= 0 && i64::from(count) >= limit
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthKind {
    #[default]
    None,
    Checksum,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChecksumAlgo {
    #[default]
    Des,
    HmacSha256,
}

/// Wire dialect spoken by the resource manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RmSubtype {
    #[default]
    Slurm,
    Wiki,
}

/// One external resource manager endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RmConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub backup_host: Option<String>,
    #[serde(default)]
    pub backup_port: Option<u16>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub auth: AuthKind,
    #[serde(default)]
    pub checksum_algo: ChecksumAlgo,
    #[serde(default)]
    pub checksum_key: Option<String>,
    #[serde(default)]
    pub subtype: RmSubtype,
    #[serde(default = "default_user")]
    pub user: String,
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_user() -> String {
    "root".to_string()
}

impl RmConfig {
    pub fn new(name: &str, host: &str, port: u16) -> Self {
        Self {
            name: name.to_string(),
            host: host.to_string(),
            port,
            backup_host: None,
            backup_port: None,
            timeout_ms: default_timeout_ms(),
            auth: AuthKind::None,
            checksum_algo: ChecksumAlgo::Des,
            checksum_key: None,
            subtype: RmSubtype::Slurm,
            user: default_user(),
        }
    }

    /// Effective socket timeout. Values below 1000 are taken as seconds.
    pub fn timeout(&self) -> std::time::Duration {
        if self.timeout_ms < 1000 {
            std::time::Duration::from_secs(self.timeout_ms)
        } else {
            std::time::Duration::from_millis(self.timeout_ms)
        }
    }

    /// The fallback endpoint, if a backup host is configured.
    pub fn backup_endpoint(&self) -> Option<(String, u16)> {
        self.backup_host
            .as_ref()
            .map(|h| (h.clone(), self.backup_port.unwrap_or(self.port)))
    }
}

impl SchedConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: SchedConfig = toml::from_str(content)?;
        for rm in &config.rm {
            if rm.auth == AuthKind::Checksum && rm.checksum_key.is_none() {
                anyhow::bail!("rm '{}': checksum auth requires checksum_key", rm.name);
            }
        }
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_config_uses_defaults() {
        let config = SchedConfig::parse("").unwrap();
        assert_eq!(config.scheduler, SchedulerPolicy::default());
        assert!(config.rm.is_empty());
        assert_eq!(config.scheduler.max_job_preempt_per_iteration, -1);
    }

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[scheduler]
max_job_preempt_per_iteration = 0
resume_on_failed_preempt = true
preempt_policy = "suspend"

[[rm]]
name = "slurm"
host = "head1"
port = 7321
backup_host = "head2"
auth = "checksum"
checksum_algo = "hmac-sha256"
checksum_key = "secret"
"#;
        let config = SchedConfig::parse(toml_str).unwrap();
        assert_eq!(config.scheduler.max_job_preempt_per_iteration, 0);
        assert!(config.scheduler.resume_on_failed_preempt);
        assert_eq!(config.scheduler.preempt_policy, PreemptMode::Suspend);

        let rm = &config.rm[0];
        assert_eq!(rm.checksum_algo, ChecksumAlgo::HmacSha256);
        assert_eq!(rm.backup_endpoint(), Some(("head2".to_string(), 7321)));
        assert_eq!(rm.timeout_ms, 5000);
    }

    #[test]
    fn checksum_without_key_is_rejected() {
        let toml_str = r#"
[[rm]]
name = "slurm"
host = "head1"
port = 7321
auth = "checksum"
"#;
        assert!(SchedConfig::parse(toml_str).is_err());
    }

    #[test]
    fn small_timeout_is_seconds() {
        let mut rm = RmConfig::new("x", "localhost", 1);
        rm.timeout_ms = 5;
        assert_eq!(rm.timeout(), std::time::Duration::from_secs(5));
        rm.timeout_ms = 2500;
        assert_eq!(rm.timeout(), std::time::Duration::from_millis(2500));
    }

    #[test]
    fn cap_semantics() {
        assert!(!SchedulerPolicy::cap_reached(-1, 1000));
        assert!(SchedulerPolicy::cap_reached(0, 0));
        assert!(!SchedulerPolicy::cap_reached(2, 1));
        assert!(SchedulerPolicy::cap_reached(2, 2));
    }

    #[test]
    fn from_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let config = SchedConfig {
            scheduler: SchedulerPolicy::default(),
            rm: vec![RmConfig::new("slurm", "head1", 7321)],
        };
        file.write_all(config.to_toml_string().unwrap().as_bytes()).unwrap();

        let loaded = SchedConfig::from_file(file.path()).unwrap();
        assert_eq!(loaded.rm, config.rm);
    }
}
