//! The individual pipeline steps, in execution order.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use dra_core::device::DeviceKind;
use dra_core::OpContext;
use tracing::{debug, warn};

use crate::adapters::MigTransition;
use crate::cdi::{cdi_device_name, CdiDevice, CdiSpec, ContainerEdits};
use crate::config::{ConfigSource, DeviceConfig, MpsConfig, SharingStrategy, TimeSliceInterval, VfioConfig};
use crate::prepare::{PrepareState, PrepareStep, StepOutcome};

/// How long to wait before re-driving a MIG transition in flight.
const MIG_RETRY: Duration = Duration::from_secs(2);

/// The steps in their fixed order.
pub(crate) fn pipeline() -> Vec<Box<dyn PrepareStep>> {
    vec![
        Box::new(ResolveConfigs),
        Box::new(ApplyMigProfiles),
        Box::new(BindVfio),
        Box::new(ApplyTimeSlicing),
        Box::new(ApplyMps),
        Box::new(CheckDeviceHealth),
        Box::new(WriteCdiDescriptor),
    ]
}

/// Resolves every device's opaque config to a concrete variant: the
/// default for its device kind, overridden by class- then claim-level
/// configs, overridden by an explicit per-device config. A payload that
/// does not fit the device kind is a hard error.
struct ResolveConfigs;

#[async_trait]
impl PrepareStep for ResolveConfigs {
    fn name(&self) -> &'static str {
        "resolveConfigs"
    }

    async fn take(&self, _ctx: &OpContext, state: &mut PrepareState) -> anyhow::Result<StepOutcome> {
        let overrides = state.request.configs.clone();
        let vfio_requested = state.request.vfio;

        for i in 0..state.request.devices.len() {
            let device = &state.request.devices[i];
            let kind = device.kind();

            let mut config = match DeviceConfig::default_for(kind) {
                Some(config) => config,
                None => bail!(
                    "device {}: unknown device type, cannot pick a default config",
                    device.device
                ),
            };
            for source in [ConfigSource::Class, ConfigSource::Claim] {
                for over in overrides
                    .iter()
                    .filter(|o| o.source == source && o.applies_to(&device.request))
                {
                    config = over.config.clone();
                }
            }
            if let Some(explicit) = &device.config {
                config = explicit.clone();
            }

            if vfio_requested {
                match &config {
                    DeviceConfig::TimeSlicing(_) | DeviceConfig::Mps(_) => bail!(
                        "device {}: VFIO pass-through excludes time-slicing and MPS",
                        device.device
                    ),
                    DeviceConfig::Vfio(_) => {}
                    _ => {
                        if kind != DeviceKind::Physical {
                            bail!(
                                "device {}: VFIO pass-through requires a whole physical GPU",
                                device.device
                            );
                        }
                        config = DeviceConfig::Vfio(VfioConfig::default());
                    }
                }
            }

            if !config.compatible_with(kind) {
                bail!(
                    "device {}: config variant does not match the device type",
                    device.device
                );
            }

            debug!(device = %device.device, ?config, "resolved device config");
            state.states[i].strategy = Some(config.strategy());
            state.states[i].config = Some(config);
        }
        Ok(StepOutcome::Done)
    }
}

/// Materializes requested MIG profiles on the physical parents. Asking for
/// an already-present profile is a no-op on the adapter side; a transition
/// still in flight turns into a retry hint.
struct ApplyMigProfiles;

#[async_trait]
impl PrepareStep for ApplyMigProfiles {
    fn name(&self) -> &'static str {
        "mig"
    }

    async fn take(&self, ctx: &OpContext, state: &mut PrepareState) -> anyhow::Result<StepOutcome> {
        let mig = state.adapters.mig.clone();
        for i in 0..state.request.devices.len() {
            let profile_override = match &state.states[i].config {
                Some(DeviceConfig::MigDevice(cfg)) => cfg.profile.clone(),
                _ => continue,
            };
            let (name, parent, advertised) = {
                let device = &state.request.devices[i];
                (
                    device.device.clone(),
                    device.parent_uuid().map(str::to_string),
                    device.profile().map(str::to_string),
                )
            };
            let parent = parent
                .with_context(|| format!("device {}: MIG partition without a parent UUID", name))?;
            let profile = profile_override.or(advertised).with_context(|| {
                format!("device {}: no MIG profile requested or advertised", name)
            })?;

            let transition = mig
                .ensure(ctx, &parent, &profile)
                .await
                .with_context(|| format!("device {}: ensuring MIG profile {}", name, profile))?;
            match transition {
                MigTransition::Applied { created } => {
                    state.states[i].mig_created = state.states[i].mig_created || created;
                }
                MigTransition::InProgress => {
                    debug!(device = %name, profile = %profile, "MIG transition in progress");
                    return Ok(StepOutcome::Retry(MIG_RETRY));
                }
            }
        }
        Ok(StepOutcome::Done)
    }
}

/// Binds devices configured for pass-through to the VFIO driver.
struct BindVfio;

#[async_trait]
impl PrepareStep for BindVfio {
    fn name(&self) -> &'static str {
        "vfio"
    }

    async fn take(&self, ctx: &OpContext, state: &mut PrepareState) -> anyhow::Result<StepOutcome> {
        let vfio = state.adapters.vfio.clone();
        for i in 0..state.request.devices.len() {
            if !matches!(state.states[i].config, Some(DeviceConfig::Vfio(_))) {
                continue;
            }
            let (name, pci) = {
                let device = &state.request.devices[i];
                (device.device.clone(), device.pci_address().map(str::to_string))
            };
            let pci =
                pci.with_context(|| format!("device {}: no PCI address to bind to VFIO", name))?;
            vfio.bind(ctx, &pci)
                .await
                .with_context(|| format!("device {}: binding {} to VFIO", name, pci))?;
        }
        Ok(StepOutcome::Done)
    }
}

/// Applies time-slice scheduling, one adapter call per requested interval.
struct ApplyTimeSlicing;

#[async_trait]
impl PrepareStep for ApplyTimeSlicing {
    fn name(&self) -> &'static str {
        "timeSlicing"
    }

    async fn take(&self, ctx: &OpContext, state: &mut PrepareState) -> anyhow::Result<StepOutcome> {
        let mut groups: BTreeMap<TimeSliceInterval, Vec<String>> = BTreeMap::new();
        for i in 0..state.request.devices.len() {
            let interval = match state.states[i].strategy {
                Some(SharingStrategy::TimeSliced { interval }) => interval,
                _ => continue,
            };
            let device = &state.request.devices[i];
            let uuid = device.uuid().with_context(|| {
                format!("device {}: no UUID to apply time-slicing to", device.device)
            })?;
            groups.entry(interval).or_default().push(uuid.to_string());
        }
        let time_slicing = state.adapters.time_slicing.clone();
        for (interval, uuids) in groups {
            time_slicing
                .set_time_slice(ctx, &uuids, interval)
                .await
                .with_context(|| format!("applying {:?} time-slice to {} devices", interval, uuids.len()))?;
        }
        Ok(StepOutcome::Done)
    }
}

/// Configures the MPS server state, one adapter call per distinct config.
struct ApplyMps;

#[async_trait]
impl PrepareStep for ApplyMps {
    fn name(&self) -> &'static str {
        "mps"
    }

    async fn take(&self, ctx: &OpContext, state: &mut PrepareState) -> anyhow::Result<StepOutcome> {
        let mut groups: Vec<(MpsConfig, Vec<String>)> = Vec::new();
        for i in 0..state.request.devices.len() {
            let config = match &state.states[i].config {
                Some(DeviceConfig::Mps(config)) => config.clone(),
                _ => continue,
            };
            let device = &state.request.devices[i];
            let uuid = device
                .uuid()
                .with_context(|| format!("device {}: no UUID to configure MPS for", device.device))?
                .to_string();
            match groups.iter_mut().find(|(existing, _)| *existing == config) {
                Some((_, uuids)) => uuids.push(uuid),
                None => groups.push((config, vec![uuid])),
            }
        }
        let mps = state.adapters.mps.clone();
        for (config, uuids) in &groups {
            mps.configure(ctx, uuids, config)
                .await
                .with_context(|| format!("configuring MPS for {} devices", uuids.len()))?;
        }
        Ok(StepOutcome::Done)
    }
}

/// Probes device health when a checker is wired in. Never fatal: an
/// unhealthy or unreachable device is logged and preparation continues.
struct CheckDeviceHealth;

#[async_trait]
impl PrepareStep for CheckDeviceHealth {
    fn name(&self) -> &'static str {
        "health"
    }

    async fn take(&self, ctx: &OpContext, state: &mut PrepareState) -> anyhow::Result<StepOutcome> {
        let checker = match &state.adapters.checker {
            Some(checker) => checker.clone(),
            None => return Ok(StepOutcome::Done),
        };
        for device in &state.request.devices {
            let uuid = match device.uuid() {
                Some(uuid) => uuid,
                None => continue,
            };
            match checker.check(ctx, uuid).await {
                Ok(true) => {}
                Ok(false) => warn!(device = %device.device, uuid, "device reported unhealthy"),
                Err(e) => warn!(device = %device.device, error = %e, "health check unavailable"),
            }
        }
        Ok(StepOutcome::Done)
    }
}

/// Emits the CDI descriptor covering every prepared slot and records the
/// returned IDs.
struct WriteCdiDescriptor;

#[async_trait]
impl PrepareStep for WriteCdiDescriptor {
    fn name(&self) -> &'static str {
        "cdi"
    }

    async fn take(&self, ctx: &OpContext, state: &mut PrepareState) -> anyhow::Result<StepOutcome> {
        let mut spec = CdiSpec::new(&state.cdi_kind);
        for (i, device) in state.request.devices.iter().enumerate() {
            let name = cdi_device_name(
                &state.request.claim_uid,
                &device.device,
                device.share_id.as_deref(),
            );
            let mut env = Vec::new();
            if let Some(uuid) = device.uuid() {
                env.push(format!("GPU_DEVICE_{}={}", i, uuid));
            }
            if let Some(share) = &device.share_id {
                env.push(format!("GPU_DEVICE_{}_SHARE_ID={}", i, share));
            }
            match state.states[i].strategy {
                Some(SharingStrategy::TimeSliced { interval }) => {
                    env.push(format!("GPU_DEVICE_{}_SHARING_STRATEGY=time-slicing", i));
                    env.push(format!("GPU_DEVICE_{}_TIMESLICE_INTERVAL={:?}", i, interval));
                }
                Some(SharingStrategy::Mps) => {
                    env.push(format!("GPU_DEVICE_{}_SHARING_STRATEGY=mps", i));
                }
                _ => {}
            }
            spec.devices.push(CdiDevice {
                name,
                container_edits: ContainerEdits {
                    env,
                    device_nodes: Vec::new(),
                },
            });
        }

        let cdi = state.adapters.cdi.clone();
        let ids = cdi
            .write(ctx, &spec)
            .await
            .context("writing CDI descriptor")?;
        if ids.len() != state.request.devices.len() {
            bail!(
                "CDI writer returned {} ids for {} devices",
                ids.len(),
                state.request.devices.len()
            );
        }
        for (i, id) in ids.into_iter().enumerate() {
            state.states[i].cdi_ids = vec![id];
        }
        Ok(StepOutcome::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use dra_core::device::{AttributeValue, ATTR_PARENT_UUID, ATTR_PROFILE, ATTR_TYPE, ATTR_UUID};

    use crate::adapters::{
        Adapters, MockCdiWriter, MockGpuChecker, MockMigManager, MockMpsManager,
        MockTimeSlicingManager, MockVfioManager,
    };
    use crate::config::{ConfigOverride, GpuConfig, MigDeviceConfig, TimeSlicingConfig};
    use crate::prepare::{PrepareDevice, PrepareRequest};

    fn adapters() -> Adapters {
        Adapters {
            mig: Arc::new(MockMigManager::new()),
            vfio: Arc::new(MockVfioManager::new()),
            time_slicing: Arc::new(MockTimeSlicingManager::new()),
            mps: Arc::new(MockMpsManager::new()),
            checker: None,
            cdi: Arc::new(MockCdiWriter::new()),
        }
    }

    fn gpu_device(name: &str) -> PrepareDevice {
        let mut attributes = BTreeMap::new();
        attributes.insert(ATTR_TYPE.to_string(), AttributeValue::from("gpu"));
        attributes.insert(
            ATTR_UUID.to_string(),
            AttributeValue::from(format!("GPU-{}", name).as_str()),
        );
        PrepareDevice {
            request: "gpu".to_string(),
            pool: "pool-a".to_string(),
            device: name.to_string(),
            share_id: None,
            consumed_capacity: BTreeMap::new(),
            attributes,
            config: None,
        }
    }

    fn mig_device(name: &str, parent: &str, profile: &str) -> PrepareDevice {
        let mut device = gpu_device(name);
        device
            .attributes
            .insert(ATTR_TYPE.to_string(), AttributeValue::from("mig"));
        device
            .attributes
            .insert(ATTR_PARENT_UUID.to_string(), AttributeValue::from(parent));
        device
            .attributes
            .insert(ATTR_PROFILE.to_string(), AttributeValue::from(profile));
        device
    }

    fn state_with(devices: Vec<PrepareDevice>, adapters: Adapters) -> PrepareState {
        let request = PrepareRequest {
            claim_uid: "claim-1".to_string(),
            node: "node-1".to_string(),
            vfio: false,
            devices,
            configs: Vec::new(),
        };
        let states = vec![Default::default(); request.devices.len()];
        PrepareState {
            request,
            states,
            adapters,
            cdi_kind: "gpu.example.com/gpu".to_string(),
        }
    }

    #[tokio::test]
    async fn resolve_picks_defaults_by_kind() {
        let mut state = state_with(
            vec![gpu_device("dev-1"), mig_device("mig-1", "GPU-P", "1g.10gb")],
            adapters(),
        );
        let ctx = OpContext::background();
        ResolveConfigs.take(&ctx, &mut state).await.unwrap();
        assert_eq!(
            state.states[0].config,
            Some(DeviceConfig::Gpu(GpuConfig::default()))
        );
        assert_eq!(
            state.states[1].config,
            Some(DeviceConfig::MigDevice(MigDeviceConfig::default()))
        );
        assert_eq!(state.states[0].strategy, Some(SharingStrategy::Exclusive));
    }

    #[tokio::test]
    async fn resolve_rejects_unknown_device_types() {
        let mut unknown = gpu_device("dev-1");
        unknown.attributes.remove(ATTR_TYPE);
        let mut state = state_with(vec![unknown], adapters());
        let ctx = OpContext::background();
        assert!(ResolveConfigs.take(&ctx, &mut state).await.is_err());
    }

    #[tokio::test]
    async fn claim_overrides_win_over_class_overrides() {
        let mut state = state_with(vec![gpu_device("dev-1")], adapters());
        state.request.configs = vec![
            ConfigOverride {
                requests: Vec::new(),
                config: DeviceConfig::TimeSlicing(TimeSlicingConfig {
                    interval: TimeSliceInterval::Short,
                }),
                source: ConfigSource::Class,
            },
            ConfigOverride {
                requests: vec!["gpu".to_string()],
                config: DeviceConfig::TimeSlicing(TimeSlicingConfig {
                    interval: TimeSliceInterval::Long,
                }),
                source: ConfigSource::Claim,
            },
        ];
        let ctx = OpContext::background();
        ResolveConfigs.take(&ctx, &mut state).await.unwrap();
        assert_eq!(
            state.states[0].strategy,
            Some(SharingStrategy::TimeSliced {
                interval: TimeSliceInterval::Long,
            })
        );
    }

    #[tokio::test]
    async fn mismatched_config_payload_is_a_hard_error() {
        let mut state = state_with(vec![gpu_device("dev-1")], adapters());
        state.request.devices[0].config =
            Some(DeviceConfig::MigDevice(MigDeviceConfig::default()));
        let ctx = OpContext::background();
        assert!(ResolveConfigs.take(&ctx, &mut state).await.is_err());
    }

    #[tokio::test]
    async fn vfio_flag_forces_the_vfio_config() {
        let mut state = state_with(vec![gpu_device("dev-1")], adapters());
        state.request.vfio = true;
        let ctx = OpContext::background();
        ResolveConfigs.take(&ctx, &mut state).await.unwrap();
        assert!(matches!(
            state.states[0].config,
            Some(DeviceConfig::Vfio(_))
        ));
    }

    #[tokio::test]
    async fn vfio_flag_conflicts_with_sharing_configs() {
        let mut state = state_with(vec![gpu_device("dev-1")], adapters());
        state.request.vfio = true;
        state.request.devices[0].config =
            Some(DeviceConfig::TimeSlicing(TimeSlicingConfig::default()));
        let ctx = OpContext::background();
        assert!(ResolveConfigs.take(&ctx, &mut state).await.is_err());
    }

    #[tokio::test]
    async fn mig_step_retries_while_the_transition_is_in_flight() {
        let mut mig = MockMigManager::new();
        mig.expect_ensure()
            .times(1)
            .returning(|_, _, _| Ok(MigTransition::InProgress));
        let mut adapters = adapters();
        adapters.mig = Arc::new(mig);

        let mut state = state_with(vec![mig_device("mig-1", "GPU-P", "1g.10gb")], adapters);
        let ctx = OpContext::background();
        ResolveConfigs.take(&ctx, &mut state).await.unwrap();
        let outcome = ApplyMigProfiles.take(&ctx, &mut state).await.unwrap();
        assert_eq!(outcome, StepOutcome::Retry(MIG_RETRY));
    }

    #[tokio::test]
    async fn mig_step_records_who_created_the_profile() {
        let mut mig = MockMigManager::new();
        mig.expect_ensure()
            .withf(|_, parent, profile| parent == "GPU-P" && profile == "1g.10gb")
            .times(1)
            .returning(|_, _, _| Ok(MigTransition::Applied { created: true }));
        let mut adapters = adapters();
        adapters.mig = Arc::new(mig);

        let mut state = state_with(vec![mig_device("mig-1", "GPU-P", "1g.10gb")], adapters);
        let ctx = OpContext::background();
        ResolveConfigs.take(&ctx, &mut state).await.unwrap();
        ApplyMigProfiles.take(&ctx, &mut state).await.unwrap();
        assert!(state.states[0].mig_created);
    }

    #[tokio::test]
    async fn time_slicing_groups_devices_by_interval() {
        let mut slicing = MockTimeSlicingManager::new();
        slicing
            .expect_set_time_slice()
            .withf(|_, uuids, interval| uuids.len() == 2 && *interval == TimeSliceInterval::Short)
            .times(1)
            .returning(|_, _, _| Ok(()));
        slicing
            .expect_set_time_slice()
            .withf(|_, uuids, interval| uuids.len() == 1 && *interval == TimeSliceInterval::Long)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let mut adapters = adapters();
        adapters.time_slicing = Arc::new(slicing);

        let mut state = state_with(
            vec![gpu_device("dev-1"), gpu_device("dev-2"), gpu_device("dev-3")],
            adapters,
        );
        for (i, interval) in [
            TimeSliceInterval::Short,
            TimeSliceInterval::Short,
            TimeSliceInterval::Long,
        ]
        .into_iter()
        .enumerate()
        {
            state.request.devices[i].config =
                Some(DeviceConfig::TimeSlicing(TimeSlicingConfig { interval }));
        }
        let ctx = OpContext::background();
        ResolveConfigs.take(&ctx, &mut state).await.unwrap();
        ApplyTimeSlicing.take(&ctx, &mut state).await.unwrap();
    }

    #[tokio::test]
    async fn cdi_step_assigns_ids_in_descriptor_order() {
        let mut cdi = MockCdiWriter::new();
        cdi.expect_write()
            .times(1)
            .returning(|_, spec| Ok(spec.device_ids()));
        let mut adapters = adapters();
        adapters.cdi = Arc::new(cdi);

        let mut state = state_with(vec![gpu_device("dev-1"), gpu_device("dev-2")], adapters);
        let ctx = OpContext::background();
        ResolveConfigs.take(&ctx, &mut state).await.unwrap();
        WriteCdiDescriptor.take(&ctx, &mut state).await.unwrap();
        assert_eq!(
            state.states[0].cdi_ids,
            vec!["gpu.example.com/gpu=claim-1--dev-1".to_string()]
        );
        assert_eq!(
            state.states[1].cdi_ids,
            vec!["gpu.example.com/gpu=claim-1--dev-2".to_string()]
        );
    }

    #[tokio::test]
    async fn health_check_failures_are_not_fatal() {
        let mut checker = MockGpuChecker::new();
        checker
            .expect_check()
            .returning(|_, _| Err(anyhow::anyhow!("nvml unreachable")));
        let mut adapters = adapters();
        adapters.checker = Some(Arc::new(checker));

        let mut state = state_with(vec![gpu_device("dev-1")], adapters);
        let ctx = OpContext::background();
        let outcome = CheckDeviceHealth.take(&ctx, &mut state).await.unwrap();
        assert_eq!(outcome, StepOutcome::Done);
    }
}
