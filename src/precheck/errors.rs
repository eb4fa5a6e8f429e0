//! Precheck Errors
//!
//! Every variant names the instance, cluster or domain involved so the
//! operator can fix the input and retry.

use thiserror::Error;

use crate::errors::ErrorClass;
use crate::topology::InstanceAddr;

/// Result type for precheck rules
pub type PrecheckResult<T> = Result<T, PrecheckError>;

/// Precheck violations. Raised before any write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PrecheckError {
    #[error("domain '{domain}' is not a valid domain name")]
    InvalidDomain { domain: String },

    #[error("domain '{domain}' already exists")]
    DomainExists { domain: String },

    #[error("cluster '{name}' of type {cluster_type} already exists for business {business_id}")]
    ClusterExists {
        business_id: u64,
        name: String,
        cluster_type: String,
    },

    #[error("instance {addr} already belongs to cluster {domain}")]
    InstanceAssigned { addr: InstanceAddr, domain: String },

    #[error("proxy {addr} already routes to {backends} backend(s)")]
    ProxyHasBackends { addr: InstanceAddr, backends: usize },

    #[error("address {addr} appears more than once in the request")]
    DuplicateAddress { addr: InstanceAddr },

    #[error("{what} must not be empty")]
    EmptyRequest { what: &'static str },

    #[error("cluster type {cluster_type} has no proxy tier")]
    ShapeHasNoProxies { cluster_type: String },

    #[error("{operation} is not supported for cluster type {cluster_type}")]
    UnsupportedShape {
        operation: &'static str,
        cluster_type: String,
    },

    #[error("proxy {addr} listens on {actual}, cluster proxies listen on {expected}")]
    ProxyPortMismatch {
        addr: InstanceAddr,
        expected: u16,
        actual: u16,
    },

    #[error("refusing to remove all {count} {role} instance(s) of {domain} without the whole-cluster flag")]
    FullMembership {
        domain: String,
        role: &'static str,
        count: usize,
    },

    #[error("instance {addr} is not a member of {domain}")]
    NotAMember { addr: String, domain: String },

    #[error("instance {addr} has inner role {inner_role}, master required")]
    NotMaster {
        addr: InstanceAddr,
        inner_role: &'static str,
    },

    #[error("replica {replica} points at {source_addr}, which is not a master in this request or cluster")]
    InvalidReplicaSource {
        replica: InstanceAddr,
        source_addr: InstanceAddr,
    },

    #[error("ejector {ejector} already has running receiver {receiver}")]
    ReceiverAlreadyRunning {
        ejector: InstanceAddr,
        receiver: InstanceAddr,
    },

    #[error("replication edge {ejector} -> {receiver} already exists")]
    EdgeExists {
        ejector: InstanceAddr,
        receiver: InstanceAddr,
    },

    #[error("a rebuild window is already open on {ejector}")]
    RebuildInProgress { ejector: InstanceAddr },

    #[error("no rebuild window is open on {ejector}")]
    NoRebuildWindow { ejector: InstanceAddr },

    #[error("cluster {domain} is already {phase}")]
    PhaseUnchanged { domain: String, phase: &'static str },

    #[error("cluster {domain} already has a load balancer {name}")]
    LoadBalancerAttached { domain: String, name: String },

    #[error("cluster {domain} has no load balancer attached")]
    NoLoadBalancer { domain: String },

    #[error("entry name '{name}' is already in use")]
    EntryNameInUse { name: String },
}

impl PrecheckError {
    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            PrecheckError::InvalidDomain { .. } => "TOPO_PRECHECK_INVALID_DOMAIN",
            PrecheckError::DomainExists { .. } => "TOPO_PRECHECK_DOMAIN_EXISTS",
            PrecheckError::ClusterExists { .. } => "TOPO_PRECHECK_CLUSTER_EXISTS",
            PrecheckError::InstanceAssigned { .. } => "TOPO_PRECHECK_INSTANCE_ASSIGNED",
            PrecheckError::ProxyHasBackends { .. } => "TOPO_PRECHECK_PROXY_HAS_BACKENDS",
            PrecheckError::DuplicateAddress { .. } => "TOPO_PRECHECK_DUPLICATE_ADDRESS",
            PrecheckError::EmptyRequest { .. } => "TOPO_PRECHECK_EMPTY_REQUEST",
            PrecheckError::ShapeHasNoProxies { .. } => "TOPO_PRECHECK_NO_PROXY_TIER",
            PrecheckError::UnsupportedShape { .. } => "TOPO_PRECHECK_UNSUPPORTED_SHAPE",
            PrecheckError::ProxyPortMismatch { .. } => "TOPO_PRECHECK_PROXY_PORT_MISMATCH",
            PrecheckError::FullMembership { .. } => "TOPO_PRECHECK_FULL_MEMBERSHIP",
            PrecheckError::NotAMember { .. } => "TOPO_PRECHECK_NOT_A_MEMBER",
            PrecheckError::NotMaster { .. } => "TOPO_PRECHECK_NOT_MASTER",
            PrecheckError::InvalidReplicaSource { .. } => "TOPO_PRECHECK_INVALID_REPLICA_SOURCE",
            PrecheckError::ReceiverAlreadyRunning { .. } => "TOPO_PRECHECK_RECEIVER_RUNNING",
            PrecheckError::EdgeExists { .. } => "TOPO_PRECHECK_EDGE_EXISTS",
            PrecheckError::RebuildInProgress { .. } => "TOPO_PRECHECK_REBUILD_IN_PROGRESS",
            PrecheckError::NoRebuildWindow { .. } => "TOPO_PRECHECK_NO_REBUILD_WINDOW",
            PrecheckError::PhaseUnchanged { .. } => "TOPO_PRECHECK_PHASE_UNCHANGED",
            PrecheckError::LoadBalancerAttached { .. } => "TOPO_PRECHECK_LB_ATTACHED",
            PrecheckError::NoLoadBalancer { .. } => "TOPO_PRECHECK_NO_LB",
            PrecheckError::EntryNameInUse { .. } => "TOPO_PRECHECK_ENTRY_NAME_IN_USE",
        }
    }

    /// Always `Precheck`.
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Precheck
    }
}
