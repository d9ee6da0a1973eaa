//! Per-server configuration: baseline mapping, per-test overlay, and
//! on-disk serialization.

use crate::ids::IpAddress;
use serde_yaml::Value;
use std::collections::BTreeMap;

/// A semantic option->value mapping. Backed by a `BTreeMap` so serialized
/// output is deterministic even though the spec says insertion order is
/// immaterial for this format.
pub type ConfigMap = BTreeMap<String, Value>;

/// Builds the baseline config mapping for a freshly installed server.
pub fn baseline_config(
    workdir: &std::path::Path,
    host_addr: IpAddress,
    seed_addrs: &[IpAddress],
    cluster_name: &str,
) -> ConfigMap {
    let mut cfg = ConfigMap::new();
    let addr = host_addr.to_string();
    let seeds = if seed_addrs.is_empty() {
        addr.clone()
    } else {
        seed_addrs
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(",")
    };

    cfg.insert("cluster_name".into(), Value::String(cluster_name.to_string()));
    cfg.insert(
        "workdir".into(),
        Value::String(workdir.to_string_lossy().into_owned()),
    );
    cfg.insert("listen_address".into(), Value::String(addr.clone()));
    cfg.insert("rpc_address".into(), Value::String(addr.clone()));
    cfg.insert("api_address".into(), Value::String(addr.clone()));
    cfg.insert("prometheus_address".into(), Value::String(addr.clone()));
    cfg.insert("alternator_address".into(), Value::String(addr.clone()));
    cfg.insert(
        "seed_provider".into(),
        serde_yaml::to_value(serde_json::json!([{
            "class_name": "org.apache.cassandra.locator.SimpleSeedProvider",
            "parameters": [{"seeds": seeds}],
        }]))
        .expect("seed provider structure is always representable"),
    );
    cfg.insert("developer_mode".into(), Value::Bool(true));
    cfg.insert("enable_user_defined_functions".into(), Value::Bool(true));
    cfg.insert("experimental".into(), Value::Bool(true));
    cfg.insert(
        "experimental_features".into(),
        Value::Sequence(vec![
            Value::String("udf".into()),
            Value::String("consistent-topology-changes".into()),
        ]),
    );
    cfg.insert("consistent_cluster_management".into(), Value::Bool(true));
    cfg.insert(
        "skip_wait_for_gossip_to_settle".into(),
        Value::Number(0.into()),
    );
    cfg.insert("ring_delay_ms".into(), Value::Number(0.into()));
    cfg.insert("num_tokens".into(), Value::Number(16.into()));
    cfg.insert(
        "flush_schema_tables_after_modification".into(),
        Value::Bool(false),
    );
    cfg.insert("auto_snapshot".into(), Value::Bool(false));
    for key in [
        "read_request_timeout_in_ms",
        "write_request_timeout_in_ms",
        "range_request_timeout_in_ms",
        "counter_write_request_timeout_in_ms",
        "cas_contention_timeout_in_ms",
        "truncate_request_timeout_in_ms",
    ] {
        cfg.insert(key.into(), Value::Number(300_000.into()));
    }
    cfg.insert("strict_allow_filtering".into(), Value::Bool(true));
    cfg.insert("strict_is_not_null_in_views".into(), Value::Bool(true));
    cfg.insert(
        "permissions_update_interval_in_ms".into(),
        Value::Number(100.into()),
    );
    cfg.insert("permissions_validity_in_ms".into(), Value::Number(100.into()));
    cfg.insert(
        "reader_concurrency_semaphore_serialize_limit_multiplier".into(),
        Value::Number(0.into()),
    );
    cfg.insert(
        "reader_concurrency_semaphore_kill_limit_multiplier".into(),
        Value::Number(0.into()),
    );
    cfg.insert("force_schema_commit_log".into(), Value::Bool(true));
    cfg
}

/// Overlays `overlay` onto `base` key-by-key, replacing any key present in both.
pub fn apply_overlay(base: &mut ConfigMap, overlay: ConfigMap) {
    for (key, value) in overlay {
        base.insert(key, value);
    }
}

/// Rewrites the address-bearing keys after an IP change.
pub fn set_addresses(config: &mut ConfigMap, ip: IpAddress) {
    let addr = ip.to_string();
    for key in [
        "listen_address",
        "rpc_address",
        "api_address",
        "prometheus_address",
        "alternator_address",
    ] {
        config.insert(key.into(), Value::String(addr.clone()));
    }
}

/// Serializes the config mapping to the on-disk format the server binary reads.
pub fn to_file_contents(config: &ConfigMap) -> crate::error::Result<String> {
    Ok(serde_yaml::to_string(config)?)
}
