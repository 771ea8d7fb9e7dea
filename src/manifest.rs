//! Component C: Manifest Planner. Parses the merged compose YAML
//! returned by the Compose Invoker's `config` subcommand, classifies
//! services by role, resolves deploy labels, and computes the ordered
//! [`DeployPlan`] and [`HostGroup`] table.
//!
//! Label lookups walk the `serde_yaml::Value` tree by hand, the same
//! defensive `Value::Mapping`/`Value::String` matching style the teacher
//! uses in `get_service_to_image` — compose manifests are external input
//! and a malformed label block must produce a named [`ConfigError`], not
//! a panic.

use crate::error::ConfigError;
use serde::Serialize;
use serde_yaml::Value;
use std::collections::BTreeMap;
use std::time::Duration;

const DEFAULT_ORDER: i64 = 100;
const DEFAULT_DRAIN_SECS: u64 = 30;
const DEFAULT_HEALTHCHECK_TIMEOUT_SECS: u64 = 120;
const DEFAULT_HEALTHCHECK_POLL_SECS: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    App,
    Accessory,
    None,
}

impl Role {
    fn parse(raw: Option<&str>) -> Role {
        match raw {
            Some("app") => Role::App,
            Some("accessory") => Role::Accessory,
            _ => Role::None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    pub role: Role,
    pub order: i64,
    pub drain: Duration,
    pub healthcheck_timeout: Duration,
    pub healthcheck_poll: Duration,
    pub host: Option<String>,
    pub user: Option<String>,
    pub dir: Option<String>,
    pub has_healthcheck: bool,
    pub image_reference: Option<String>,
    /// Position in the merged manifest's `services` mapping; used only to
    /// break ties when two app services share the same `order`.
    pub manifest_position: usize,
}

/// The ordered sequence of app-role services for one run.
#[derive(Debug, Clone, Default)]
pub struct DeployPlan {
    pub services: Vec<Service>,
}

impl DeployPlan {
    pub fn names(&self) -> Vec<&str> {
        self.services.iter().map(|s| s.name.as_str()).collect()
    }
}

/// `(host, user, dir) -> ordered service names`, consumed by an external
/// fleet orchestrator fanning out deploys host by host.
#[derive(Debug, Clone, Serialize)]
pub struct HostGroup {
    pub host: String,
    pub user: String,
    pub dir: String,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct DeployDefaults {
    host: Option<String>,
    user: Option<String>,
    dir: Option<String>,
}

#[derive(Debug)]
pub struct Planner {
    /// All services in the manifest, in declaration order, regardless of
    /// role (needed by `status`, which shows accessories too).
    pub all_services: Vec<Service>,
}

impl Planner {
    /// Parses the merged compose YAML per spec.md §4.C steps 1-4.
    pub fn parse(config: &Value) -> Result<Planner, ConfigError> {
        let root = config
            .as_mapping()
            .ok_or_else(|| ConfigError::Manifest("merged config root is not a mapping".into()))?;

        let defaults = parse_x_deploy(root);

        let services_value = root.get("services").ok_or_else(|| {
            ConfigError::Manifest("merged config has no top-level `services` key".into())
        })?;
        let services_map = services_value
            .as_mapping()
            .ok_or_else(|| ConfigError::Manifest("`services` is not a mapping".into()))?;

        let mut all_services = Vec::with_capacity(services_map.len());
        let mut order_seen: BTreeMap<i64, Vec<String>> = BTreeMap::new();

        for (position, (name_value, service_value)) in services_map.iter().enumerate() {
            let name = name_value
                .as_str()
                .ok_or_else(|| ConfigError::Manifest("non-string service name".into()))?
                .to_string();

            let service = parse_service(&name, position, service_value, &defaults)?;

            if service.role == Role::App {
                order_seen.entry(service.order).or_default().push(name.clone());
            }

            all_services.push(service);
        }

        for (order, names) in order_seen {
            if names.len() > 1 {
                tracing::warn!(
                    order,
                    services = ?names,
                    "multiple app services share deploy.order; ties broken by manifest position"
                );
            }
        }

        Ok(Planner { all_services })
    }

    /// Builds the ordered [`DeployPlan`], optionally restricted to a
    /// `--service` filter (spec.md §4.C step 6).
    pub fn plan(&self, service_filter: &[String]) -> Result<DeployPlan, ConfigError> {
        for requested in service_filter {
            match self.all_services.iter().find(|s| &s.name == requested) {
                None => return Err(ConfigError::UnknownService { name: requested.clone() }),
                Some(s) if s.role != Role::App => {
                    return Err(ConfigError::NotAnAppService { name: requested.clone() })
                }
                Some(_) => {}
            }
        }

        let mut services: Vec<Service> = self
            .all_services
            .iter()
            .filter(|s| s.role == Role::App)
            .filter(|s| service_filter.is_empty() || service_filter.contains(&s.name))
            .cloned()
            .collect();

        services.sort_by_key(|s| (s.order, s.manifest_position));

        for service in &services {
            if !service.has_healthcheck {
                return Err(ConfigError::MissingHealthcheck {
                    service: service.name.clone(),
                });
            }
        }

        Ok(DeployPlan { services })
    }

    /// Builds the `HostGroup` table for the external orchestrator. Unlike
    /// the single-node plan, this requires host/user/dir to be resolvable
    /// for every app service (spec.md §4.C step 5).
    pub fn host_groups(&self) -> Result<Vec<HostGroup>, ConfigError> {
        let mut groups: BTreeMap<(String, String, String), Vec<String>> = BTreeMap::new();

        for service in self.all_services.iter().filter(|s| s.role == Role::App) {
            let host = service.host.clone().ok_or_else(|| ConfigError::MissingHostGroup {
                service: service.name.clone(),
            })?;
            let user = service.user.clone().ok_or_else(|| ConfigError::MissingHostGroup {
                service: service.name.clone(),
            })?;
            let dir = service.dir.clone().ok_or_else(|| ConfigError::MissingHostGroup {
                service: service.name.clone(),
            })?;

            groups.entry((host, user, dir)).or_default().push(service.name.clone());
        }

        Ok(groups
            .into_iter()
            .map(|((host, user, dir), services)| HostGroup { host, user, dir, services })
            .collect())
    }
}

fn parse_x_deploy(root: &serde_yaml::Mapping) -> DeployDefaults {
    let Some(Value::Mapping(x_deploy)) = root.get("x-deploy") else {
        return DeployDefaults::default();
    };
    DeployDefaults {
        host: x_deploy.get("host").and_then(Value::as_str).map(str::to_string),
        user: x_deploy.get("user").and_then(Value::as_str).map(str::to_string),
        dir: x_deploy.get("dir").and_then(Value::as_str).map(str::to_string),
    }
}

fn parse_service(
    name: &str,
    position: usize,
    service_value: &Value,
    defaults: &DeployDefaults,
) -> Result<Service, ConfigError> {
    let mapping = service_value
        .as_mapping()
        .ok_or_else(|| ConfigError::Manifest(format!("service '{name}' is not a mapping")))?;

    let labels = labels_of(mapping);
    let label = |key: &str| labels.get(key).map(|s| s.as_str());

    let role = Role::parse(label("deploy.role"));
    let order = parse_int_label(name, "order", label("deploy.order"), DEFAULT_ORDER)?;
    let drain = Duration::from_secs(parse_int_label(
        name,
        "drain",
        label("deploy.drain"),
        DEFAULT_DRAIN_SECS as i64,
    )? as u64);
    let healthcheck_timeout = Duration::from_secs(parse_int_label(
        name,
        "healthcheck.timeout",
        label("deploy.healthcheck.timeout"),
        DEFAULT_HEALTHCHECK_TIMEOUT_SECS as i64,
    )? as u64);
    let healthcheck_poll = Duration::from_secs(parse_int_label(
        name,
        "healthcheck.poll",
        label("deploy.healthcheck.poll"),
        DEFAULT_HEALTHCHECK_POLL_SECS as i64,
    )? as u64);

    let host = label("deploy.host").map(str::to_string).or_else(|| defaults.host.clone());
    let user = label("deploy.user").map(str::to_string).or_else(|| defaults.user.clone());
    let dir = label("deploy.dir").map(str::to_string).or_else(|| defaults.dir.clone());

    let has_healthcheck = mapping.get("healthcheck").is_some();
    let image_reference = mapping.get("image").and_then(Value::as_str).map(str::to_string);

    Ok(Service {
        name: name.to_string(),
        role,
        order,
        drain,
        healthcheck_timeout,
        healthcheck_poll,
        host,
        user,
        dir,
        has_healthcheck,
        image_reference,
        manifest_position: position,
    })
}

fn labels_of(mapping: &serde_yaml::Mapping) -> BTreeMap<String, String> {
    let mut result = BTreeMap::new();
    match mapping.get("labels") {
        Some(Value::Mapping(labels)) => {
            for (key, value) in labels {
                if let (Some(key), Some(value)) = (key.as_str(), value.as_str()) {
                    result.insert(key.to_string(), value.to_string());
                }
            }
        }
        Some(Value::Sequence(labels)) => {
            for entry in labels {
                if let Some(entry) = entry.as_str() {
                    if let Some((key, value)) = entry.split_once('=') {
                        result.insert(key.to_string(), value.to_string());
                    }
                }
            }
        }
        _ => {}
    }
    result
}

fn parse_int_label(
    service: &str,
    label_name: &str,
    raw: Option<&str>,
    default: i64,
) -> Result<i64, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value.trim().parse::<i64>().map_err(|_| ConfigError::BadLabel {
            service: service.to_string(),
            label: label_name.to_string(),
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(src: &str) -> Value {
        serde_yaml::from_str(src).unwrap()
    }

    #[test]
    fn plan_orders_by_order_then_position() {
        let config = yaml(
            r#"
services:
  worker:
    image: app:latest
    healthcheck:
      test: ["CMD", "true"]
    labels:
      deploy.role: app
      deploy.order: "20"
  web:
    image: app:latest
    healthcheck:
      test: ["CMD", "true"]
    labels:
      deploy.role: app
      deploy.order: "10"
"#,
        );
        let planner = Planner::parse(&config).unwrap();
        let plan = planner.plan(&[]).unwrap();
        assert_eq!(plan.names(), vec!["web", "worker"]);
    }

    #[test]
    fn missing_healthcheck_on_app_service_is_rejected() {
        let config = yaml(
            r#"
services:
  web:
    image: app:latest
    labels:
      deploy.role: app
"#,
        );
        let planner = Planner::parse(&config).unwrap();
        let err = planner.plan(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingHealthcheck { .. }));
    }

    #[test]
    fn accessory_is_excluded_from_plan_but_kept_for_status() {
        let config = yaml(
            r#"
services:
  web:
    image: app:latest
    healthcheck:
      test: ["CMD", "true"]
    labels:
      deploy.role: app
  redis:
    image: redis:7
    labels:
      deploy.role: accessory
"#,
        );
        let planner = Planner::parse(&config).unwrap();
        let plan = planner.plan(&[]).unwrap();
        assert_eq!(plan.names(), vec!["web"]);
        assert_eq!(planner.all_services.len(), 2);
    }

    #[test]
    fn filter_naming_accessory_is_an_error() {
        let config = yaml(
            r#"
services:
  web:
    image: app:latest
    healthcheck:
      test: ["CMD", "true"]
    labels:
      deploy.role: app
  redis:
    image: redis:7
    labels:
      deploy.role: accessory
"#,
        );
        let planner = Planner::parse(&config).unwrap();
        let err = planner.plan(&["redis".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::NotAnAppService { .. }));
    }

    #[test]
    fn bad_numeric_label_names_service_and_label() {
        let config = yaml(
            r#"
services:
  web:
    image: app:latest
    healthcheck:
      test: ["CMD", "true"]
    labels:
      deploy.role: app
      deploy.order: "not-a-number"
"#,
        );
        let err = Planner::parse(&config).unwrap_err();
        match err {
            ConfigError::BadLabel { service, label, .. } => {
                assert_eq!(service, "web");
                assert_eq!(label, "order");
            }
            other => panic!("expected BadLabel, got {other:?}"),
        }
    }

    #[test]
    fn host_group_resolves_x_deploy_defaults_with_per_service_override() {
        let config = yaml(
            r#"
x-deploy:
  host: prod.example.com
  user: deploy
  dir: /srv/app
services:
  web:
    image: app:latest
    healthcheck:
      test: ["CMD", "true"]
    labels:
      deploy.role: app
  worker:
    image: app:latest
    healthcheck:
      test: ["CMD", "true"]
    labels:
      deploy.role: app
      deploy.host: other.example.com
      deploy.user: deploy
      deploy.dir: /srv/app
"#,
        );
        let planner = Planner::parse(&config).unwrap();
        let groups = planner.host_groups().unwrap();
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn host_group_requires_host_when_no_default_given() {
        let config = yaml(
            r#"
services:
  web:
    image: app:latest
    healthcheck:
      test: ["CMD", "true"]
    labels:
      deploy.role: app
"#,
        );
        let planner = Planner::parse(&config).unwrap();
        let err = planner.host_groups().unwrap_err();
        assert!(matches!(err, ConfigError::MissingHostGroup { .. }));
    }
}
