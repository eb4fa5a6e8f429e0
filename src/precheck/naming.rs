//! Naming rules: domain format and uniqueness, cluster key uniqueness.

use regex::Regex;
use std::sync::OnceLock;

use super::errors::{PrecheckError, PrecheckResult};
use crate::topology::{ClusterKey, TopologyGraph};

fn domain_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^(?i)[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?(\.[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?)+\.?$").ok()
        })
        .as_ref()
}

/// Domain must be a dotted DNS name of at most 253 characters.
pub fn check_domain_format(domain: &str) -> PrecheckResult<()> {
    let matches = domain_pattern().map(|p| p.is_match(domain)).unwrap_or(false);
    if domain.len() > 253 || !matches {
        return Err(PrecheckError::InvalidDomain {
            domain: domain.to_string(),
        });
    }
    Ok(())
}

/// Domain must not be owned by a cluster nor used as any entry name.
pub fn check_domain_available(graph: &TopologyGraph, domain: &str) -> PrecheckResult<()> {
    if graph.cluster_by_domain(domain).is_some() || graph.entry_name_in_use(domain) {
        return Err(PrecheckError::DomainExists {
            domain: domain.to_string(),
        });
    }
    Ok(())
}

/// `(business, name, type)` must be free.
pub fn check_cluster_key_available(graph: &TopologyGraph, key: &ClusterKey) -> PrecheckResult<()> {
    if graph.cluster_by_key(key).is_some() {
        return Err(PrecheckError::ClusterExists {
            business_id: key.business_id,
            name: key.name.clone(),
            cluster_type: key.cluster_type.clone(),
        });
    }
    Ok(())
}

/// An auxiliary entry name (VIP, registry name) must not be in use.
pub fn check_entry_name_available(graph: &TopologyGraph, name: &str) -> PrecheckResult<()> {
    if graph.entry_name_in_use(name) || graph.cluster_by_domain(name).is_some() {
        return Err(PrecheckError::EntryNameInUse { name: name.to_string() });
    }
    Ok(())
}
