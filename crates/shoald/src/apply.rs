//! Bring the fleet in line with the services declared in the config file.
//!
//! Runs once at startup, after the fleet has been restored from disk.
//! Unchanged services are left untouched so a restart does not start a
//! new rollout.

use tracing::{info, warn};

use shoal_controller::{CreateService, Fleet, FleetError, ServiceUpdate};
use shoal_state::{TaskDefinition, TaskDefinitionSpec};

use crate::config::DesiredService;

/// What `apply_services` did to one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
}

pub async fn apply_services(
    fleet: &Fleet,
    services: &[DesiredService],
) -> anyhow::Result<Vec<(String, Applied)>> {
    let mut out = Vec::with_capacity(services.len());
    for desired in services {
        let applied = apply_one(fleet, desired).await?;
        info!(service = %desired.name, ?applied, "service applied from config");
        out.push((desired.name.clone(), applied));
    }

    let declared: Vec<&str> = services.iter().map(|s| s.name.as_str()).collect();
    for id in fleet.list_services().await {
        if !declared.contains(&id.as_str()) {
            warn!(service = %id, "service in store is not declared in config; leaving it running");
        }
    }
    Ok(out)
}

async fn apply_one(fleet: &Fleet, desired: &DesiredService) -> anyhow::Result<Applied> {
    let snapshot = match fleet.describe_service(&desired.name).await {
        Ok(snapshot) => snapshot,
        Err(FleetError::ServiceNotFound(_)) => {
            let version = fleet.submit(desired.definition.clone())?;
            fleet
                .create_service(CreateService {
                    name: desired.name.clone(),
                    version,
                    desired: desired.desired,
                    rolling: desired.rolling,
                })
                .await?;
            if let Some(policy) = &desired.scaling {
                fleet.put_scaling_policy(&desired.name, policy.clone()).await?;
            }
            return Ok(Applied::Created);
        }
        Err(e) => return Err(e.into()),
    };

    let mut update = ServiceUpdate::default();
    let current = fleet.definitions().get(snapshot.target_version)?;
    if !same_definition(&current, &desired.definition) {
        update.version = Some(fleet.submit(desired.definition.clone())?);
    }
    // With a scaling policy the autoscaler owns the desired count.
    if desired.scaling.is_none() && snapshot.desired != desired.desired {
        update.desired = Some(desired.desired);
    }
    if snapshot.rolling != desired.rolling {
        update.rolling = Some(desired.rolling);
    }

    let mut changed = false;
    if update != ServiceUpdate::default() {
        fleet.update_service(&desired.name, update).await?;
        changed = true;
    }
    match (&desired.scaling, &snapshot.scaling_policy) {
        (Some(policy), current) if current.as_ref() != Some(policy) => {
            fleet.put_scaling_policy(&desired.name, policy.clone()).await?;
            changed = true;
        }
        (None, Some(_)) => {
            warn!(service = %desired.name, "scaling policy removed from config; the stored policy stays in effect");
        }
        _ => {}
    }

    Ok(if changed {
        Applied::Updated
    } else {
        Applied::Unchanged
    })
}

fn same_definition(current: &TaskDefinition, spec: &TaskDefinitionSpec) -> bool {
    current.image == spec.image
        && current.limits == spec.limits
        && current.env == spec.env
        && current.port == spec.port
        && current.health == spec.health
}
