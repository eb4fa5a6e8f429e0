//! Operation Report

use serde::Serialize;

use crate::outbox::DeliveryReport;
use crate::topology::ClusterId;

/// What a committed mutation did and which side effects are still owed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationReport {
    /// Cluster the operation applied to.
    pub cluster_id: ClusterId,
    /// Outbox sequence numbers staged by the operation.
    pub staged: Vec<u64>,
    /// Delivered right after commit.
    pub delivered: Vec<u64>,
    /// Failed delivery, still pending retry.
    pub pending: Vec<(u64, String)>,
    /// Parked as dead letters.
    pub dead_lettered: Vec<u64>,
    /// Hosts moved to the idle pool.
    pub released_hosts: Vec<String>,
}

impl OperationReport {
    pub(crate) fn new(
        cluster_id: ClusterId,
        staged: Vec<u64>,
        delivery: DeliveryReport,
        released_hosts: Vec<String>,
    ) -> Self {
        Self {
            cluster_id,
            staged,
            delivered: delivery.delivered,
            pending: delivery.deferred,
            dead_lettered: delivery.dead_lettered,
            released_hosts,
        }
    }

    /// The topology changed but at least one collaborator call is still
    /// owed. Retry the side effect, not the operation.
    pub fn partially_applied(&self) -> bool {
        !self.pending.is_empty() || !self.dead_lettered.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partially_applied() {
        let clean = OperationReport::new(
            ClusterId::new(),
            vec![1, 2],
            DeliveryReport {
                delivered: vec![1, 2],
                ..Default::default()
            },
            Vec::new(),
        );
        assert!(!clean.partially_applied());

        let stale = OperationReport::new(
            ClusterId::new(),
            vec![1, 2],
            DeliveryReport {
                delivered: vec![1],
                deferred: vec![(2, "dns 503".into())],
                dead_lettered: Vec::new(),
            },
            Vec::new(),
        );
        assert!(stale.partially_applied());
    }
}
