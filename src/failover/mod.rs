//! Remote failure budgeting
//!
//! Tracks consecutive remote connection failures. Once the budget of
//! `max_attempts` is spent the remote is skipped until `cooldown` has elapsed
//! since the last attempt. A network-free pre-check rejects endpoints that
//! cannot be reached from here.

use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;

/// Failover configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Consecutive remote failures before falling back to local
    pub max_attempts: u32,
    /// How long the remote is skipped once the budget is spent (e.g., "30s")
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    /// Skip the remote entirely
    pub prefer_local: bool,
    /// Treat loopback endpoints as unreachable (the process runs away from
    /// the broker host)
    pub loopback_unreachable: bool,
    /// Endpoint addresses known to be unreachable
    #[serde(default)]
    pub unreachable_cidrs: Vec<String>,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            cooldown: Duration::from_secs(30),
            prefer_local: false,
            loopback_unreachable: false,
            unreachable_cidrs: vec![],
        }
    }
}

/// Serializable snapshot of the tracker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureInfo {
    pub consecutive_failures: u32,
    pub max_attempts: u32,
    pub permanently_failed: bool,
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    /// Time left before the remote is tried again, if it is being skipped
    #[serde(with = "humantime_serde")]
    pub cooldown_remaining: Option<Duration>,
}

/// Consecutive failure counter with cooldown
pub struct FailureTracker {
    max_attempts: u32,
    cooldown: Duration,
    loopback_unreachable: bool,
    unreachable_cidrs: Vec<IpNet>,
    consecutive_failures: u32,
    last_attempt: Option<Instant>,
    permanently_failed: bool,
}

impl FailureTracker {
    pub fn new(config: &FailoverConfig) -> Self {
        let unreachable_cidrs: Vec<IpNet> = config
            .unreachable_cidrs
            .iter()
            .filter_map(|s| {
                s.parse().ok().or_else(|| {
                    warn!("Invalid unreachable CIDR: {}", s);
                    None
                })
            })
            .collect();

        debug!(
            "FailureTracker initialized: max_attempts={}, cooldown={:?}, loopback_unreachable={}, \
             unreachable_cidrs={}",
            config.max_attempts,
            config.cooldown,
            config.loopback_unreachable,
            unreachable_cidrs.len(),
        );

        Self {
            max_attempts: config.max_attempts.max(1),
            cooldown: config.cooldown,
            loopback_unreachable: config.loopback_unreachable,
            unreachable_cidrs,
            consecutive_failures: 0,
            last_attempt: None,
            permanently_failed: false,
        }
    }

    /// Whether the remote may be tried now
    ///
    /// Clears the failure state first when the cooldown has elapsed since the
    /// last attempt.
    pub fn should_attempt_remote(&mut self) -> bool {
        if self.consecutive_failures > 0 {
            if let Some(last) = self.last_attempt {
                if last.elapsed() >= self.cooldown {
                    info!(
                        "Failure tracker: cooldown of {:?} elapsed, remote eligible again",
                        self.cooldown
                    );
                    self.consecutive_failures = 0;
                    self.permanently_failed = false;
                }
            }
        }

        self.consecutive_failures < self.max_attempts
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_attempt = Some(Instant::now());

        if self.consecutive_failures >= self.max_attempts && !self.permanently_failed {
            self.permanently_failed = true;
            warn!(
                "Failure tracker: {} consecutive remote failures, skipping remote for {:?}",
                self.consecutive_failures, self.cooldown
            );
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.permanently_failed = false;
        self.last_attempt = Some(Instant::now());
    }

    /// Forget all failure state
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.permanently_failed = false;
        self.last_attempt = None;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn is_permanently_failed(&self) -> bool {
        self.permanently_failed
    }

    /// Network-free check for endpoints that cannot work from here
    ///
    /// True for malformed endpoints, loopback hosts when configured as
    /// unreachable, and literal IPs inside an unreachable CIDR.
    pub fn likely_unreachable(&self, broker: &BrokerConfig) -> bool {
        let endpoint = match broker.parse_endpoint() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                debug!("Failure tracker: endpoint '{}' is malformed: {}", broker.endpoint, e);
                return true;
            }
        };

        if self.loopback_unreachable && endpoint.is_loopback() {
            debug!("Failure tracker: loopback endpoint {} treated as unreachable", endpoint);
            return true;
        }

        if let Some(ip) = endpoint.ip() {
            if self.unreachable_cidrs.iter().any(|cidr| cidr.contains(&ip)) {
                debug!("Failure tracker: {} is in an unreachable range", ip);
                return true;
            }
        }

        false
    }

    pub fn info(&self) -> FailureInfo {
        let cooldown_remaining = match self.last_attempt {
            Some(last) if self.consecutive_failures >= self.max_attempts => {
                Some(self.cooldown.saturating_sub(last.elapsed()))
            }
            _ => None,
        };

        FailureInfo {
            consecutive_failures: self.consecutive_failures,
            max_attempts: self.max_attempts,
            permanently_failed: self.permanently_failed,
            cooldown: self.cooldown,
            cooldown_remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(max_attempts: u32, cooldown_secs: u64) -> FailureTracker {
        FailureTracker::new(&FailoverConfig {
            max_attempts,
            cooldown: Duration::from_secs(cooldown_secs),
            ..Default::default()
        })
    }

    fn broker(endpoint: &str) -> BrokerConfig {
        BrokerConfig {
            endpoint: endpoint.to_string(),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_tracker_allows_remote() {
        let mut tracker = tracker(1, 30);
        assert!(tracker.should_attempt_remote());
        assert!(!tracker.is_permanently_failed());
        assert_eq!(tracker.info().cooldown_remaining, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_then_cooldown() {
        let mut tracker = tracker(3, 30);

        tracker.record_failure();
        tracker.record_failure();
        assert!(tracker.should_attempt_remote());
        assert!(!tracker.is_permanently_failed());

        tracker.record_failure();
        assert!(tracker.is_permanently_failed());
        assert!(!tracker.should_attempt_remote());

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!tracker.should_attempt_remote());
        assert_eq!(
            tracker.info().cooldown_remaining,
            Some(Duration::from_secs(1))
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(tracker.should_attempt_remote());
        assert_eq!(tracker.consecutive_failures(), 0);
        assert!(!tracker.is_permanently_failed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_measured_from_last_attempt() {
        let mut tracker = tracker(1, 30);
        tracker.record_failure();

        tokio::time::advance(Duration::from_secs(20)).await;
        tracker.record_failure();

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!tracker.should_attempt_remote());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(tracker.should_attempt_remote());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_and_reset_clear_state() {
        let mut tracker = tracker(1, 30);
        tracker.record_failure();
        assert!(!tracker.should_attempt_remote());
        tracker.record_success();
        assert!(tracker.should_attempt_remote());

        tracker.record_failure();
        tracker.reset();
        let info = tracker.info();
        assert_eq!(info.consecutive_failures, 0);
        assert!(!info.permanently_failed);
        assert!(tracker.should_attempt_remote());
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_attempts_treated_as_one() {
        let mut tracker = tracker(0, 30);
        assert!(tracker.should_attempt_remote());
        tracker.record_failure();
        assert!(tracker.is_permanently_failed());
    }

    #[test]
    fn test_malformed_endpoint_unreachable() {
        let tracker = tracker(1, 30);
        assert!(tracker.likely_unreachable(&broker("ws://broker:8008")));
        assert!(tracker.likely_unreachable(&broker("mqtt://:1883")));
        assert!(tracker.likely_unreachable(&broker("mqtt://broker:notaport")));
        assert!(tracker.likely_unreachable(&broker("mqtt://::1")));
        assert!(tracker.likely_unreachable(&broker("mqtt://user@broker:1883")));
        assert!(!tracker.likely_unreachable(&broker("mqtt://broker.example.com:1883")));
    }

    #[test]
    fn test_loopback_only_when_configured() {
        let default = tracker(1, 30);
        assert!(!default.likely_unreachable(&broker("mqtt://127.0.0.1:1883")));

        let remote_context = FailureTracker::new(&FailoverConfig {
            loopback_unreachable: true,
            ..Default::default()
        });
        assert!(remote_context.likely_unreachable(&broker("mqtt://127.0.0.1:1883")));
        assert!(remote_context.likely_unreachable(&broker("mqtt://localhost")));
        assert!(remote_context.likely_unreachable(&broker("tcp://[::1]:1883")));
        assert!(!remote_context.likely_unreachable(&broker("mqtt://10.1.2.3:1883")));
    }

    #[test]
    fn test_unreachable_cidrs() {
        let tracker = FailureTracker::new(&FailoverConfig {
            unreachable_cidrs: vec!["10.0.0.0/8".to_string(), "not-a-cidr".to_string()],
            ..Default::default()
        });
        assert!(tracker.likely_unreachable(&broker("mqtt://10.20.30.40:1883")));
        assert!(!tracker.likely_unreachable(&broker("mqtt://192.168.1.10:1883")));
        assert!(!tracker.likely_unreachable(&broker("mqtt://broker.internal:1883")));
    }

    #[test]
    fn test_info_serializes() {
        let mut tracker = tracker(1, 30);
        tracker.record_failure();
        let json = serde_json::to_value(tracker.info()).unwrap();
        assert_eq!(json["consecutive_failures"], 1);
        assert_eq!(json["permanently_failed"], true);
        assert_eq!(json["cooldown"], "30s");
    }
}
