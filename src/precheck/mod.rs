//! Precheck Library
//!
//! Pure validation rules evaluated against a topology graph before any
//! write. A rule never mutates anything; the mutation engine runs the rules
//! of an operation against the transaction's working copy, so a rejected
//! operation leaves the store exactly as it was.

mod errors;
mod membership;
mod naming;
mod replication;

pub use errors::{PrecheckError, PrecheckResult};
pub use membership::{
    check_addrs_distinct, check_not_empty, check_not_full_membership, check_proxies_empty_backends,
    check_proxies_member, check_proxies_unassigned, check_proxy_port_uniform, check_shape_accepts_proxies,
    check_storages_member, check_storages_unassigned,
};
pub use naming::{
    check_cluster_key_available, check_domain_available, check_domain_format, check_entry_name_available,
};
pub use replication::{
    check_inner_role_master, check_no_edge, check_no_rebuild_window, check_no_running_receiver,
    check_rebuild_window_open,
};
