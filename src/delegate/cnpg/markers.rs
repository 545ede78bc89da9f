//! Side-channel markers written on the child Cluster record
//!
//! CloudNativePG has no typed API for restarts, hibernation, forced
//! switchovers or instance rebuilds. Operations request them by setting the
//! annotations below on the child record. The markers live only on the child;
//! nothing in the DatabaseCluster or OpsRequest records mirrors them.
//!
//! | Annotation                           | Value                   | Effect                                 |
//! |--------------------------------------|-------------------------|----------------------------------------|
//! | `cnpg.io/hibernation`                | `on` / `off`            | Stop / start every instance            |
//! | `kubectl.kubernetes.io/restartedAt`  | RFC 3339 timestamp      | Rolling restart, once per new value    |
//! | `cnpg.io/forceSwitchover`            | RFC 3339 timestamp      | Request a switchover, once per value   |
//! | `cnpg.io/switchoverTarget`           | instance name           | Instance to promote on switchover      |
//! | `cnpg.io/rebuildInstance`            | instance name           | Recreate that instance from a peer     |
//! | `cnpg.io/rebuildSource`              | instance name           | Peer to clone a rebuilt instance from  |
//!
//! Two more annotations record which spec fields an operation has taken
//! over, so that cluster passes do not revert them:
//!
//! | Annotation             | Value                                         |
//! |------------------------|-----------------------------------------------|
//! | `dbaas.io/ops-fields`  | comma-separated JSON pointers into the child  |
//! | `dbaas.io/ops-generation` | DatabaseCluster generation at the time     |
//!
//! The override holds until the DatabaseCluster's generation moves past the
//! recorded one, i.e. until the user edits the cluster spec again.

use std::collections::BTreeMap;

use kube::api::DynamicObject;

pub const HIBERNATION: &str = "cnpg.io/hibernation";
pub const RESTARTED_AT: &str = "kubectl.kubernetes.io/restartedAt";
pub const FORCE_SWITCHOVER: &str = "cnpg.io/forceSwitchover";
pub const SWITCHOVER_TARGET: &str = "cnpg.io/switchoverTarget";
pub const REBUILD_INSTANCE: &str = "cnpg.io/rebuildInstance";
pub const REBUILD_SOURCE: &str = "cnpg.io/rebuildSource";

pub const OPS_FIELDS: &str = "dbaas.io/ops-fields";
pub const OPS_GENERATION: &str = "dbaas.io/ops-generation";

pub const HIBERNATION_ON: &str = "on";
pub const HIBERNATION_OFF: &str = "off";

pub fn get<'a>(object: &'a DynamicObject, key: &str) -> Option<&'a str> {
    object
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
}

pub fn set(object: &mut DynamicObject, key: &str, value: impl Into<String>) {
    object
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.into());
}

/// Record that an operation now owns the field at `pointer`
pub fn claim_field(object: &mut DynamicObject, pointer: &str, generation: i64) {
    let mut fields = owned_fields(object, generation);
    if !fields.iter().any(|f| f == pointer) {
        fields.push(pointer.to_string());
    }
    set(object, OPS_FIELDS, fields.join(","));
    set(object, OPS_GENERATION, generation.to_string());
}

/// Fields owned by operations that are still in force at `generation`
pub fn owned_fields(object: &DynamicObject, generation: i64) -> Vec<String> {
    let recorded = get(object, OPS_GENERATION).and_then(|g| g.parse::<i64>().ok());
    match recorded {
        Some(recorded) if recorded >= generation => get(object, OPS_FIELDS)
            .map(|f| {
                f.split(',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}
