//! Checks an OpsRequest must pass before it is handed to a delegate
//!
//! A failure here fails the operation without any delegate call.

use crate::controller::error::{Error, Result};
use crate::crd::{DatabaseEngine, DatabaseEngineSpec, Operation};

/// Minimum number of instances a cluster can be scaled to
pub const MIN_REPLICAS: i32 = 1;

/// Maximum number of instances (arbitrary limit for safety)
pub const MAX_REPLICAS: i32 = 100;

/// Validate the payload of an operation on its own terms
pub fn validate_payload(op: &Operation<'_>) -> Result<()> {
    match op {
        Operation::HorizontalScaling(spec) => validate_replicas(spec.replicas),
        Operation::VolumeExpansion(spec) => validate_storage_size(&spec.size),
        Operation::Upgrade(spec) if spec.target_version.trim().is_empty() => Err(
            Error::ValidationError("upgrade targetVersion must be set".to_string()),
        ),
        Operation::Restore(spec) if spec.backup_name.trim().is_empty() => Err(
            Error::ValidationError("restore backupName must be set".to_string()),
        ),
        Operation::RebuildInstance(spec) if spec.instance_name.trim().is_empty() => Err(
            Error::ValidationError("rebuildInstance instanceName must be set".to_string()),
        ),
        Operation::Custom(spec) if spec.operation.trim().is_empty() => Err(
            Error::ValidationError("custom operation name must be set".to_string()),
        ),
        _ => Ok(()),
    }
}

fn validate_replicas(replicas: i32) -> Result<()> {
    if replicas < MIN_REPLICAS {
        return Err(Error::ValidationError(format!(
            "replica count {replicas} is below minimum {MIN_REPLICAS}"
        )));
    }
    if replicas > MAX_REPLICAS {
        return Err(Error::ValidationError(format!(
            "replica count {replicas} exceeds maximum {MAX_REPLICAS}"
        )));
    }
    Ok(())
}

/// Sizes are whole numbers with a binary suffix, e.g. "10Gi"
fn validate_storage_size(size: &str) -> Result<()> {
    if !size.ends_with("Gi") && !size.ends_with("Mi") && !size.ends_with("Ti") {
        return Err(Error::ValidationError(format!(
            "storage size must end with Gi, Mi, or Ti: {size}"
        )));
    }
    let number = size.trim_end_matches(char::is_alphabetic);
    number
        .parse::<u64>()
        .map_err(|_| Error::ValidationError(format!("invalid storage size number: {size}")))?;
    Ok(())
}

/// Pick the catalog entry describing a cluster's engine.
///
/// An explicit `engineRef` wins; otherwise the first entry whose type matches.
pub fn select_engine<'a>(
    engines: &'a [DatabaseEngine],
    engine_type: &str,
    engine_ref: Option<&str>,
) -> Option<&'a DatabaseEngine> {
    match engine_ref {
        Some(name) => engines
            .iter()
            .find(|e| e.metadata.name.as_deref() == Some(name)),
        None => engines.iter().find(|e| e.spec.type_ == engine_type),
    }
}

/// Reject operations the engine's catalog entry says it cannot perform
pub fn validate_capability(op: &Operation<'_>, engine: &DatabaseEngineSpec) -> Result<()> {
    let ops_type = op.ops_type();
    if let Some((feature, Some(false))) = engine.features.flag_for(ops_type) {
        return Err(Error::ValidationError(format!(
            "engine {} does not support {ops_type} ({feature} is disabled)",
            engine.type_
        )));
    }
    if let Operation::Restore(spec) = op
        && spec.point_in_time.is_some()
        && engine.features.pitr == Some(false)
    {
        return Err(Error::ValidationError(format!(
            "engine {} does not support point-in-time restore",
            engine.type_
        )));
    }
    if let Operation::Upgrade(spec) = op
        && !engine.supports_version(&spec.target_version)
    {
        return Err(Error::ValidationError(format!(
            "engine {} does not support version {}",
            engine.type_, spec.target_version
        )));
    }
    Ok(())
}
