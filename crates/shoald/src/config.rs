//! shoald.toml configuration.
//!
//! ```toml
//! [controller]
//! tick_interval = "2s"
//! health_interval = "1s"
//! autoscale_interval = "60s"
//! max_launch_attempts = 5
//! launch_backoff = "1s"
//! launch_backoff_max = "60s"
//!
//! [runtime]
//! first_port = 20000
//! ports = 1000
//!
//! [[service]]
//! name = "web"
//! desired = 3
//! max_percent = 200
//! min_healthy_percent = 100
//!
//! [service.definition]
//! image = "exec python3 -m http.server $PORT"
//! port = 8080
//! env = { MODE = "prod" }
//!
//! [service.definition.health]
//! command = ["sh", "-c", "curl -sf http://$TASK_HOST:$TASK_PORT/"]
//! interval = "10s"
//!
//! [service.scaling]
//! target_value = 50.0
//! min = 1
//! max = 10
//! ```
//!
//! Durations are strings such as `"500ms"`, `"30s"` or `"5m"`. Every
//! section except `[[service]]` may be omitted.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use shoal_controller::ControllerConfig;
use shoal_state::duration::parse_duration;
use shoal_state::{
    Backoff, HealthProbeSpec, ResourceLimits, RollingUpdatePolicy, ScalingPolicy,
    TaskDefinitionSpec, validate_service_name,
};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShoalConfig {
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub runtime: RuntimeSection,
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerSection {
    pub tick_interval: Option<String>,
    pub health_interval: Option<String>,
    pub autoscale_interval: Option<String>,
    pub max_launch_attempts: Option<u32>,
    pub launch_backoff: Option<String>,
    pub launch_backoff_max: Option<String>,
    pub registration_backoff: Option<String>,
    pub registration_backoff_max: Option<String>,
    /// Time a deregistered task keeps running before it is stopped.
    pub drain: Option<String>,
    /// Directory holding `<service>.metric` files for the autoscaler.
    pub metrics_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeSection {
    #[serde(default = "default_first_port")]
    pub first_port: u16,
    #[serde(default = "default_port_count")]
    pub ports: u16,
    #[serde(default = "default_host")]
    pub host: String,
}

impl Default for RuntimeSection {
    fn default() -> Self {
        Self {
            first_port: default_first_port(),
            ports: default_port_count(),
            host: default_host(),
        }
    }
}

fn default_first_port() -> u16 {
    20_000
}

fn default_port_count() -> u16 {
    1_000
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServiceSection {
    pub name: String,
    pub desired: u32,
    #[serde(default = "default_max_percent")]
    pub max_percent: u32,
    #[serde(default = "default_min_healthy_percent")]
    pub min_healthy_percent: u32,
    pub definition: DefinitionSection,
    pub scaling: Option<ScalingSection>,
}

fn default_max_percent() -> u32 {
    200
}

fn default_min_healthy_percent() -> u32 {
    100
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DefinitionSection {
    /// Shell command line the local runtime executes.
    pub image: String,
    #[serde(default = "default_cpu_units")]
    pub cpu_units: u32,
    #[serde(default = "default_memory_mib")]
    pub memory_mib: u32,
    pub port: u16,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub health: HealthSection,
}

fn default_cpu_units() -> u32 {
    256
}

fn default_memory_mib() -> u32 {
    512
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthSection {
    pub command: Vec<String>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub retries: Option<u32>,
    pub start_period: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScalingSection {
    pub target_value: f64,
    pub min: u32,
    pub max: u32,
    pub cooldown: Option<String>,
    pub scale_out_cooldown: Option<String>,
    pub scale_in_cooldown: Option<String>,
}

/// A service as the daemon should run it, fully validated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DesiredService {
    pub name: String,
    pub desired: u32,
    pub rolling: RollingUpdatePolicy,
    pub definition: TaskDefinitionSpec,
    pub scaling: Option<ScalingPolicy>,
}

impl ShoalConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("loading {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: ShoalConfig = toml::from_str(content)?;
        // Surface every conversion error at load rather than at first use.
        config.controller()?;
        config.desired_services()?;
        Ok(config)
    }

    pub fn controller(&self) -> anyhow::Result<ControllerConfig> {
        let c = &self.controller;
        let defaults = ControllerConfig::default();
        let config = ControllerConfig {
            tick_interval: duration_or(&c.tick_interval, defaults.tick_interval, "tick_interval")?,
            health_interval: duration_or(
                &c.health_interval,
                defaults.health_interval,
                "health_interval",
            )?,
            autoscale_interval: duration_or(
                &c.autoscale_interval,
                defaults.autoscale_interval,
                "autoscale_interval",
            )?,
            max_launch_attempts: c.max_launch_attempts.unwrap_or(defaults.max_launch_attempts),
            launch_backoff: Backoff::new(
                duration_or(&c.launch_backoff, defaults.launch_backoff.base, "launch_backoff")?,
                duration_or(
                    &c.launch_backoff_max,
                    defaults.launch_backoff.max,
                    "launch_backoff_max",
                )?,
            ),
            registration_backoff: Backoff::new(
                duration_or(
                    &c.registration_backoff,
                    defaults.registration_backoff.base,
                    "registration_backoff",
                )?,
                duration_or(
                    &c.registration_backoff_max,
                    defaults.registration_backoff.max,
                    "registration_backoff_max",
                )?,
            ),
            drain: duration_or(&c.drain, defaults.drain, "drain")?,
        };

        for (name, value) in [
            ("tick_interval", config.tick_interval),
            ("health_interval", config.health_interval),
            ("autoscale_interval", config.autoscale_interval),
        ] {
            if value.is_zero() {
                bail!("controller.{name} must be greater than zero");
            }
        }
        if config.max_launch_attempts == 0 {
            bail!("controller.max_launch_attempts must be at least 1");
        }
        Ok(config)
    }

    pub fn desired_services(&self) -> anyhow::Result<Vec<DesiredService>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::with_capacity(self.services.len());
        for section in &self.services {
            if !seen.insert(section.name.as_str()) {
                bail!("service {:?} is declared twice", section.name);
            }
            let service = section
                .resolve()
                .with_context(|| format!("service {:?}", section.name))?;
            out.push(service);
        }
        Ok(out)
    }
}

impl ServiceSection {
    fn resolve(&self) -> anyhow::Result<DesiredService> {
        validate_service_name(&self.name)?;

        let rolling = RollingUpdatePolicy {
            max_percent: self.max_percent,
            min_healthy_percent: self.min_healthy_percent,
        };
        rolling.validate()?;

        let d = &self.definition;
        let h = &d.health;
        let definition = TaskDefinitionSpec {
            image: d.image.clone(),
            limits: ResourceLimits {
                cpu_units: d.cpu_units,
                memory_mib: d.memory_mib,
            },
            env: d.env.clone(),
            port: d.port,
            health: HealthProbeSpec {
                command: h.command.clone(),
                interval: duration_or(&h.interval, Duration::from_secs(30), "health.interval")?,
                timeout: duration_or(&h.timeout, Duration::from_secs(5), "health.timeout")?,
                retries: h.retries.unwrap_or(3),
                start_period: duration_or(&h.start_period, Duration::ZERO, "health.start_period")?,
            },
        };
        definition.validate()?;

        let scaling = match &self.scaling {
            Some(s) => {
                let cooldown = duration_or(&s.cooldown, Duration::from_secs(300), "scaling.cooldown")?;
                let policy = ScalingPolicy {
                    target_value: s.target_value,
                    min_capacity: s.min,
                    max_capacity: s.max,
                    scale_out_cooldown: duration_or(
                        &s.scale_out_cooldown,
                        cooldown,
                        "scaling.scale_out_cooldown",
                    )?,
                    scale_in_cooldown: duration_or(
                        &s.scale_in_cooldown,
                        cooldown,
                        "scaling.scale_in_cooldown",
                    )?,
                };
                policy.validate()?;
                Some(policy)
            }
            None => None,
        };

        Ok(DesiredService {
            name: self.name.clone(),
            desired: self.desired,
            rolling,
            definition,
            scaling,
        })
    }
}

fn duration_or(value: &Option<String>, default: Duration, field: &str) -> anyhow::Result<Duration> {
    match value {
        Some(s) => parse_duration(s).with_context(|| format!("field {field}")),
        None => Ok(default),
    }
}
