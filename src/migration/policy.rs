//! Data-check and disconnect policies
//!
//! Both decisions are pure functions of the policy, the history of
//! data-check cycles and the current time, so `advance()` gives the same
//! answer when called twice on the same records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::collaborators::{RemoteJobId, RemoteJobStatus};

/// When to run a data-check-and-repair cycle once every task streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DataCheckPolicy {
    /// Never verify.
    #[default]
    Never,
    /// Verify exactly once.
    Once,
    /// Verify again `interval_secs` after the previous cycle finished.
    Periodic {
        /// Pause between the end of one cycle and the start of the next.
        interval_secs: u64,
    },
}

/// Whether replication is stopped without an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    /// Disconnect once the last data check finished.
    #[default]
    Auto,
    /// Wait for `confirm_disconnect`.
    Manual,
}

/// One data-check-and-repair cycle, run as a remote job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataCheckRun {
    /// Remote job running the cycle.
    pub remote_job: RemoteJobId,
    /// When the cycle was submitted.
    pub started_at: DateTime<Utc>,
    /// When a terminal status was first observed.
    pub finished_at: Option<DateTime<Utc>>,
    /// Last observed status.
    pub status: RemoteJobStatus,
}

impl DataCheckRun {
    /// Start tracking a submitted cycle.
    pub fn submitted(remote_job: RemoteJobId, now: DateTime<Utc>) -> Self {
        Self {
            remote_job,
            started_at: now,
            finished_at: None,
            status: RemoteJobStatus::Pending,
        }
    }

    /// Whether the cycle reached a terminal status.
    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Record an observed status. The finish time is set once.
    pub fn observe(&mut self, status: RemoteJobStatus, now: DateTime<Utc>) {
        if status.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
        self.status = status;
    }
}

/// Whether a new data-check cycle should start, given the previous one.
///
/// A cycle that has not finished always blocks the next one.
pub fn should_start_check(policy: DataCheckPolicy, previous: Option<&DataCheckRun>, now: DateTime<Utc>) -> bool {
    if previous.is_some_and(|run| !run.is_finished()) {
        return false;
    }
    match policy {
        DataCheckPolicy::Never => false,
        DataCheckPolicy::Once => previous.is_none(),
        DataCheckPolicy::Periodic { interval_secs } => match previous.and_then(|run| run.finished_at) {
            None => true,
            Some(finished) => {
                let elapsed = now.signed_duration_since(finished).num_seconds();
                u64::try_from(elapsed).map(|e| e >= interval_secs).unwrap_or(false)
            }
        },
    }
}

/// Whether replication should be stopped now.
///
/// Periodic checking never disconnects on its own. A confirmation from an
/// operator is honoured under any policy once no cycle is running.
pub fn should_disconnect(
    check: DataCheckPolicy,
    disconnect: DisconnectPolicy,
    previous: Option<&DataCheckRun>,
    confirmed: bool,
) -> bool {
    if previous.is_some_and(|run| !run.is_finished()) {
        return false;
    }
    if confirmed {
        return true;
    }
    match (disconnect, check) {
        (DisconnectPolicy::Manual, _) => false,
        (DisconnectPolicy::Auto, DataCheckPolicy::Never) => true,
        (DisconnectPolicy::Auto, DataCheckPolicy::Once) => previous.is_some(),
        (DisconnectPolicy::Auto, DataCheckPolicy::Periodic { .. }) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn run(finished: Option<DateTime<Utc>>) -> DataCheckRun {
        let mut run = DataCheckRun::submitted(RemoteJobId("job-1".into()), Utc::now());
        if let Some(at) = finished {
            run.observe(RemoteJobStatus::Succeeded, at);
        }
        run
    }

    #[test]
    fn test_once_starts_exactly_one_cycle() {
        let now = Utc::now();
        assert!(should_start_check(DataCheckPolicy::Once, None, now));
        assert!(!should_start_check(DataCheckPolicy::Once, Some(&run(None)), now));
        assert!(!should_start_check(DataCheckPolicy::Once, Some(&run(Some(now))), now));
    }

    #[test]
    fn test_periodic_waits_for_interval() {
        let now = Utc::now();
        let policy = DataCheckPolicy::Periodic { interval_secs: 600 };
        assert!(should_start_check(policy, None, now));
        assert!(!should_start_check(policy, Some(&run(None)), now));
        assert!(!should_start_check(policy, Some(&run(Some(now - Duration::seconds(60)))), now));
        assert!(should_start_check(policy, Some(&run(Some(now - Duration::seconds(601)))), now));
    }

    #[test]
    fn test_never_checks() {
        assert!(!should_start_check(DataCheckPolicy::Never, None, Utc::now()));
    }

    #[test]
    fn test_auto_disconnect_after_single_check() {
        let now = Utc::now();
        assert!(!should_disconnect(DataCheckPolicy::Once, DisconnectPolicy::Auto, None, false));
        assert!(!should_disconnect(DataCheckPolicy::Once, DisconnectPolicy::Auto, Some(&run(None)), false));
        assert!(should_disconnect(DataCheckPolicy::Once, DisconnectPolicy::Auto, Some(&run(Some(now))), false));
        assert!(should_disconnect(DataCheckPolicy::Never, DisconnectPolicy::Auto, None, false));
    }

    #[test]
    fn test_periodic_and_manual_need_confirmation() {
        let policy = DataCheckPolicy::Periodic { interval_secs: 60 };
        let done = run(Some(Utc::now()));
        assert!(!should_disconnect(policy, DisconnectPolicy::Auto, Some(&done), false));
        assert!(should_disconnect(policy, DisconnectPolicy::Auto, Some(&done), true));
        assert!(!should_disconnect(DataCheckPolicy::Never, DisconnectPolicy::Manual, None, false));
        assert!(!should_disconnect(policy, DisconnectPolicy::Manual, Some(&run(None)), true));
    }

    #[test]
    fn test_policy_serde_shape() {
        let policy: DataCheckPolicy = serde_json::from_str(r#"{"mode":"periodic","interval_secs":30}"#).unwrap();
        assert_eq!(policy, DataCheckPolicy::Periodic { interval_secs: 30 });
        let manual: DisconnectPolicy = serde_json::from_str(r#""manual""#).unwrap();
        assert_eq!(manual, DisconnectPolicy::Manual);
    }
}
