//! Cluster Shapes
//!
//! The set of supported topology shapes is closed. Each variant carries only
//! the fields that make sense for it: a shape without proxies has no proxy
//! port, so "add a proxy to a proxy-less cluster" cannot be expressed as a
//! valid shape and is rejected by precheck instead of being half-applied.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Key-value storage engine family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KvEngine {
    /// In-memory Redis.
    Redis,
    /// Disk-backed TendisSSD.
    TendisSsd,
    /// RocksDB-backed Tendisplus with several internal kvstores.
    Tendisplus,
}

impl KvEngine {
    /// Engine name.
    pub fn as_str(&self) -> &'static str {
        match self {
            KvEngine::Redis => "redis",
            KvEngine::TendisSsd => "tendisssd",
            KvEngine::Tendisplus => "tendisplus",
        }
    }

    /// Engines whose per-instance footprint on disk is large enough that
    /// concurrent copies from one host must be throttled harder.
    pub fn has_large_footprint(&self) -> bool {
        matches!(self, KvEngine::TendisSsd | KvEngine::Tendisplus)
    }
}

impl fmt::Display for KvEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Supported cluster topology shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum ClusterShape {
    /// KV shards fronted by a uniform-port proxy tier.
    ProxiedKv {
        /// Storage engine behind the proxies.
        engine: KvEngine,
        /// Port every proxy of the cluster listens on.
        proxy_port: u16,
    },

    /// KV shards speaking the slot-based cluster protocol directly.
    NativeKvCluster {
        /// Storage engine.
        engine: KvEngine,
    },

    /// Relational primary/standby pairs behind a proxy tier.
    RelationalHa {
        /// Port every proxy of the cluster listens on.
        proxy_port: u16,
    },

    /// Single relational instance, clients connect directly.
    RelationalSingle,
}

impl ClusterShape {
    /// Stable type name, part of the cluster key.
    pub fn type_name(&self) -> &'static str {
        match self {
            ClusterShape::ProxiedKv { engine: KvEngine::Redis, .. } => "TwemproxyRedisInstance",
            ClusterShape::ProxiedKv { engine: KvEngine::TendisSsd, .. } => "TwemproxyTendisSSDInstance",
            ClusterShape::ProxiedKv { engine: KvEngine::Tendisplus, .. } => "PredixyTendisplusCluster",
            ClusterShape::NativeKvCluster { engine: KvEngine::Tendisplus } => "TendisplusCluster",
            ClusterShape::NativeKvCluster { .. } => "RedisCluster",
            ClusterShape::RelationalHa { .. } => "TenDBHA",
            ClusterShape::RelationalSingle => "TenDBSingle",
        }
    }

    /// Uniform proxy port, `None` for shapes without a proxy tier.
    pub fn proxy_port(&self) -> Option<u16> {
        match self {
            ClusterShape::ProxiedKv { proxy_port, .. } => Some(*proxy_port),
            ClusterShape::RelationalHa { proxy_port } => Some(*proxy_port),
            ClusterShape::NativeKvCluster { .. } | ClusterShape::RelationalSingle => None,
        }
    }

    /// Whether the shape has a proxy tier at all.
    pub fn has_proxies(&self) -> bool {
        self.proxy_port().is_some()
    }

    /// KV engine, `None` for relational shapes.
    pub fn kv_engine(&self) -> Option<KvEngine> {
        match self {
            ClusterShape::ProxiedKv { engine, .. } => Some(*engine),
            ClusterShape::NativeKvCluster { engine } => Some(*engine),
            _ => None,
        }
    }

    /// Slot-owning shards where each primary needs a registered replica.
    pub fn is_slot_sharded(&self) -> bool {
        matches!(
            self,
            ClusterShape::NativeKvCluster { .. }
                | ClusterShape::ProxiedKv { engine: KvEngine::Tendisplus, .. }
        )
    }

    /// Whether replication edges must be between two master-role endpoints
    /// before a tendis-style master swap is allowed.
    pub fn supports_master_swap(&self) -> bool {
        self.kv_engine().is_some()
    }
}

impl fmt::Display for ClusterShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_port_only_on_proxied_shapes() {
        let proxied = ClusterShape::ProxiedKv { engine: KvEngine::Redis, proxy_port: 50000 };
        assert_eq!(proxied.proxy_port(), Some(50000));
        assert!(proxied.has_proxies());

        let native = ClusterShape::NativeKvCluster { engine: KvEngine::Redis };
        assert_eq!(native.proxy_port(), None);
        assert!(!ClusterShape::RelationalSingle.has_proxies());
    }

    #[test]
    fn test_slot_sharded() {
        assert!(ClusterShape::NativeKvCluster { engine: KvEngine::Redis }.is_slot_sharded());
        assert!(!ClusterShape::ProxiedKv { engine: KvEngine::Redis, proxy_port: 1 }.is_slot_sharded());
        assert!(!ClusterShape::RelationalHa { proxy_port: 3306 }.is_slot_sharded());
    }

    #[test]
    fn test_type_names() {
        assert_eq!(
            ClusterShape::ProxiedKv { engine: KvEngine::TendisSsd, proxy_port: 1 }.type_name(),
            "TwemproxyTendisSSDInstance"
        );
        assert_eq!(
            ClusterShape::NativeKvCluster { engine: KvEngine::Tendisplus }.to_string(),
            "TendisplusCluster"
        );
    }

    #[test]
    fn test_shape_serde_tagged() {
        let shape = ClusterShape::RelationalHa { proxy_port: 3306 };
        let json = serde_json::to_value(shape).unwrap();
        assert_eq!(json["shape"], "relational_ha");
        let back: ClusterShape = serde_json::from_value(json).unwrap();
        assert_eq!(back, shape);
    }

    #[test]
    fn test_large_footprint() {
        assert!(KvEngine::Tendisplus.has_large_footprint());
        assert!(!KvEngine::Redis.has_large_footprint());
    }
}
