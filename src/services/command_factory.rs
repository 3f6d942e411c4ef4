//! Builds commands from the local cache family.
//!
//! Status checks and recovery actions are synthesized here so that they have
//! the same shape as coordinator-issued commands.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::warn;

use crate::domain::models::command::{
    Command, CommandParams, CommandType, JsonMap, RoleCommand,
};
use crate::domain::models::recovery::RecoveryAction;
use crate::infrastructure::cache::{CacheFamily, COMMON_CLUSTER_ID};

/// A component placed on this host by the topology.
#[derive(Debug, Clone, PartialEq)]
pub struct HostComponent {
    /// Cluster the topology entry belongs to.
    pub cluster_id: String,
    /// Owning service.
    pub service_name: String,
    /// Component name, also used as the command role.
    pub component_name: String,
    /// Status commands to run for it, usually just `STATUS`.
    pub status_commands: Vec<String>,
    /// Script and timeout for commands built for it.
    pub command_params: JsonMap,
    /// Merged into `hostLevelParams` of its commands.
    pub component_level_params: JsonMap,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Topology {
    #[serde(default)]
    hosts: Vec<TopologyHost>,
    #[serde(default)]
    components: Vec<TopologyComponent>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopologyHost {
    host_id: u64,
    host_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopologyComponent {
    service_name: String,
    component_name: String,
    #[serde(default)]
    host_ids: Vec<u64>,
    #[serde(default)]
    status_commands_to_run: Vec<String>,
    #[serde(default)]
    command_params: JsonMap,
    #[serde(default)]
    component_level_params: JsonMap,
}

/// Builds status and recovery commands for the components on this host.
pub struct CommandFactory {
    caches: CacheFamily,
    hostname: String,
}

impl CommandFactory {
    /// Factory reading from `caches`, for the host named `hostname`.
    pub const fn new(caches: CacheFamily, hostname: String) -> Self {
        Self { caches, hostname }
    }

    /// Host the factory builds commands for.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Caches commands are built from.
    pub const fn caches(&self) -> &CacheFamily {
        &self.caches
    }

    /// Clusters currently present in the topology.
    pub fn cluster_ids(&self) -> Vec<String> {
        self.caches.topology.get_cluster_ids()
    }

    /// Whether the topology knows `cluster_id`.
    pub fn has_cluster(&self, cluster_id: &str) -> bool {
        self.caches.topology.get(cluster_id).is_some()
    }

    fn topology(&self, cluster_id: &str) -> Option<Topology> {
        let raw = self.caches.topology.get(cluster_id)?;
        match Topology::deserialize(raw.as_ref()) {
            Ok(topology) => Some(topology),
            Err(err) => {
                warn!(cluster_id, error = %err, "topology entry is malformed");
                None
            }
        }
    }

    /// Components of `cluster_id` that run on this host.
    pub fn host_components(&self, cluster_id: &str) -> Vec<HostComponent> {
        let Some(topology) = self.topology(cluster_id) else {
            return Vec::new();
        };
        let Some(host_id) = topology
            .hosts
            .iter()
            .find(|h| h.host_name.eq_ignore_ascii_case(&self.hostname))
            .map(|h| h.host_id)
        else {
            return Vec::new();
        };

        topology
            .components
            .into_iter()
            .filter(|c| c.host_ids.contains(&host_id))
            .map(|c| HostComponent {
                cluster_id: cluster_id.to_string(),
                service_name: c.service_name,
                component_name: c.component_name,
                status_commands: c.status_commands_to_run,
                command_params: c.command_params,
                component_level_params: c.component_level_params,
            })
            .collect()
    }

    /// Every component on this host across all known clusters.
    pub fn all_host_components(&self) -> Vec<HostComponent> {
        self.cluster_ids()
            .iter()
            .flat_map(|id| self.host_components(id))
            .collect()
    }

    /// Component `component_name` of `cluster_id`, when it runs on this host.
    pub fn find_component(&self, cluster_id: &str, component_name: &str) -> Option<HostComponent> {
        self.host_components(cluster_id)
            .into_iter()
            .find(|c| c.component_name.eq_ignore_ascii_case(component_name))
    }

    /// STATUS command for one of the component's status commands.
    pub fn status_command(&self, component: &HostComponent, status_command: &str) -> Command {
        let mut cmd = self.build(
            component,
            CommandType::StatusCommand,
            RoleCommand::Status,
            format!("status-{}", component.component_name),
            0,
        );
        if status_command != RoleCommand::Status.as_str() {
            cmd.host_level_params
                .insert("custom_command".into(), Value::String(status_command.to_string()));
        }
        cmd
    }

    /// Locally issued recovery command.
    pub fn auto_command(
        &self,
        component: &HostComponent,
        role_command: RoleCommand,
        task_id: u64,
    ) -> Command {
        self.build(
            component,
            CommandType::AutoExecutionCommand,
            role_command,
            format!("auto-{task_id}"),
            task_id,
        )
    }

    /// Command carrying a recovery action; a restart goes out as
    /// `CUSTOM_COMMAND` named by `hostLevelParams.custom_command`.
    pub fn recovery_command(
        &self,
        component: &HostComponent,
        action: RecoveryAction,
        task_id: u64,
    ) -> Command {
        let mut cmd = self.auto_command(component, action.role_command(), task_id);
        if let Some(name) = action.custom_command() {
            cmd.host_level_params
                .insert("custom_command".to_string(), Value::String(name.to_string()));
        }
        cmd
    }

    fn build(
        &self,
        component: &HostComponent,
        command_type: CommandType,
        role_command: RoleCommand,
        command_id: String,
        task_id: u64,
    ) -> Command {
        let cluster_id = component.cluster_id.as_str();

        let (configurations, configuration_tags) = self.configurations(cluster_id);

        let mut host_level_params = JsonMap::new();
        for cache in [&self.caches.host_level_params, &self.caches.metadata] {
            for id in [COMMON_CLUSTER_ID, cluster_id] {
                if let Some(entry) = cache.get(id) {
                    merge_object(&mut host_level_params, params_of(&entry));
                }
            }
        }
        host_level_params.extend(component.component_level_params.clone());

        let command_params: CommandParams =
            match serde_json::from_value(Value::Object(component.command_params.clone())) {
                Ok(params) => params,
                Err(err) => {
                    warn!(
                        component = %component.component_name,
                        error = %err,
                        "component commandParams are malformed; using defaults"
                    );
                    CommandParams::default()
                }
            };

        let cluster_name = self
            .caches
            .metadata
            .get(cluster_id)
            .and_then(|m| m.get("clusterName").and_then(Value::as_str).map(str::to_string));

        Command {
            command_id,
            task_id,
            command_type,
            cluster_id: cluster_id.to_string(),
            cluster_name,
            hostname: self.hostname.clone(),
            role: component.component_name.clone(),
            role_command,
            service_name: component.service_name.clone(),
            component_name: Some(component.component_name.clone()),
            configurations,
            configuration_tags,
            host_level_params,
            cluster_host_info: self.cluster_host_info(cluster_id),
            command_params,
        }
    }

    fn configurations(&self, cluster_id: &str) -> (JsonMap, JsonMap) {
        let Some(entry) = self.caches.configurations.get(cluster_id) else {
            return (JsonMap::new(), JsonMap::new());
        };
        let configurations = match entry.get("configurations") {
            Some(Value::Object(map)) => map.clone(),
            _ => entry.as_object().cloned().unwrap_or_default(),
        };
        let tags = match entry.get("configurationTags") {
            Some(Value::Object(map)) => map.clone(),
            _ => JsonMap::new(),
        };
        (configurations, tags)
    }

    /// `<component>_hosts` lists derived from the topology.
    fn cluster_host_info(&self, cluster_id: &str) -> JsonMap {
        let Some(topology) = self.topology(cluster_id) else {
            return JsonMap::new();
        };
        let names: BTreeMap<u64, &str> = topology
            .hosts
            .iter()
            .map(|h| (h.host_id, h.host_name.as_str()))
            .collect();

        topology
            .components
            .iter()
            .map(|c| {
                let hosts = c
                    .host_ids
                    .iter()
                    .filter_map(|id| names.get(id))
                    .map(|name| Value::String((*name).to_string()))
                    .collect();
                (
                    format!("{}_hosts", c.component_name.to_lowercase()),
                    Value::Array(hosts),
                )
            })
            .collect()
    }
}

fn params_of(entry: &Value) -> &Value {
    entry
        .get("hostLevelParams")
        .or_else(|| entry.get("clusterLevelParams"))
        .unwrap_or(entry)
}

fn merge_object(target: &mut Map<String, Value>, source: &Value) {
    if let Value::Object(map) = source {
        for (key, value) in map {
            target.insert(key.clone(), value.clone());
        }
    }
}
