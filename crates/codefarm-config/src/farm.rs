//! Farm configuration parsing.

use crate::{ConfigError, ConfigResult};
use codefarm_core::{Job, Slave, TagCriteria};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Complete farm configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FarmConfig {
    pub scheduler: SchedulerConfig,
    pub logging: LoggingConfig,
    pub executor: ExecutorConfig,
    /// Service name (`artifactrepo`, `logrepo`, ...) to base URL.
    pub services: HashMap<String, Url>,
    pub slaves: Vec<SlaveDef>,
    pub jobs: Vec<JobDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Capacity of the in-process event bus.
    pub event_capacity: usize,
    /// Upper bound on slave verification. `None` waits indefinitely.
    pub verify_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            event_capacity: 1024,
            verify_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Settings for the local process executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    pub work_dir: PathBuf,
    pub shell: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("codefarm"),
            shell: "/bin/sh".to_string(),
        }
    }
}

/// A slave to register at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaveDef {
    pub id: String,
    pub uri: Url,
    pub executors: usize,
    pub tags: Vec<String>,
    pub offline: bool,
}

impl SlaveDef {
    pub fn to_slave(&self) -> Slave {
        let mut slave = Slave::new(
            self.id.as_str(),
            self.uri.clone(),
            self.tags.clone(),
            self.executors,
        );
        slave.offline = self.offline;
        slave
    }
}

/// A job to queue at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDef {
    pub name: String,
    pub script: String,
    pub criteria: String,
    pub requeue_on_failure: bool,
}

impl JobDef {
    pub fn to_job(&self) -> Job {
        Job::new(&self.name, &self.script, &self.criteria)
            .with_requeue_on_failure(self.requeue_on_failure)
    }
}

/// Read and parse a farm configuration file.
pub fn load_farm_config(path: impl AsRef<Path>) -> ConfigResult<FarmConfig> {
    let text = std::fs::read_to_string(path)?;
    parse_farm_config(&text)
}

/// Parse a farm configuration from KDL text.
pub fn parse_farm_config(kdl: &str) -> ConfigResult<FarmConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = FarmConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "scheduler" => config.scheduler = parse_scheduler(node)?,
            "logging" => config.logging = parse_logging(node)?,
            "executor" => config.executor = parse_executor(node),
            "services" => config.services = parse_services(node)?,
            "slave" => config.slaves.push(parse_slave(node)?),
            "job" => config.jobs.push(parse_job(node)?),
            _ => {} // Ignore unknown nodes
        }
    }

    let mut seen = HashSet::new();
    for slave in &config.slaves {
        if !seen.insert(slave.id.as_str()) {
            return Err(ConfigError::Duplicate(format!("slave '{}'", slave.id)));
        }
    }

    Ok(config)
}

fn parse_scheduler(node: &KdlNode) -> ConfigResult<SchedulerConfig> {
    let mut config = SchedulerConfig::default();

    if let Some(capacity) = get_int_prop(node, "event-capacity") {
        config.event_capacity = usize::try_from(capacity)
            .ok()
            .filter(|c| *c > 0)
            .ok_or_else(|| invalid("scheduler event-capacity", "must be a positive integer"))?;
    }
    if let Some(secs) = get_int_prop(node, "verify-timeout-secs") {
        let secs = u64::try_from(secs)
            .map_err(|_| invalid("scheduler verify-timeout-secs", "must not be negative"))?;
        config.verify_timeout = Some(Duration::from_secs(secs));
    }

    Ok(config)
}

fn parse_logging(node: &KdlNode) -> ConfigResult<LoggingConfig> {
    let mut config = LoggingConfig::default();

    if let Some(level) = get_string_prop(node, "level") {
        config.level = level;
    }
    config.format = match get_string_prop(node, "format").as_deref() {
        None | Some("pretty") => LogFormat::Pretty,
        Some("json") => LogFormat::Json,
        Some(other) => {
            return Err(invalid(
                "logging format",
                &format!("unknown format: {}", other),
            ));
        }
    };

    Ok(config)
}

fn parse_executor(node: &KdlNode) -> ExecutorConfig {
    let mut config = ExecutorConfig::default();
    if let Some(dir) = get_string_prop(node, "work-dir") {
        config.work_dir = PathBuf::from(dir);
    }
    if let Some(shell) = get_string_prop(node, "shell") {
        config.shell = shell;
    }
    config
}

fn parse_services(node: &KdlNode) -> ConfigResult<HashMap<String, Url>> {
    let mut services = HashMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            let name = child.name().value().to_string();
            let url = get_first_string_arg(child)
                .ok_or_else(|| ConfigError::MissingField(format!("url for service '{}'", name)))?;
            let url = parse_url(&format!("service {}", name), &url)?;
            if services.insert(name.clone(), url).is_some() {
                return Err(ConfigError::Duplicate(format!("service '{}'", name)));
            }
        }
    }

    Ok(services)
}

fn parse_slave(node: &KdlNode) -> ConfigResult<SlaveDef> {
    let id = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("slave id".to_string()))?;

    let uri = match get_string_prop(node, "uri") {
        Some(uri) => parse_url(&format!("uri of slave '{}'", id), &uri)?,
        None => parse_url("slave uri", "local://localhost")?,
    };
    let executors = match get_int_prop(node, "executors") {
        Some(n) => usize::try_from(n).map_err(|_| {
            invalid(&format!("executors of slave '{}'", id), "must not be negative")
        })?,
        None => 1,
    };
    let offline = get_bool_prop(node, "offline").unwrap_or(false);
    let tags = get_string_list_prop(node, "tags");

    Ok(SlaveDef {
        id,
        uri,
        executors,
        tags,
        offline,
    })
}

fn parse_job(node: &KdlNode) -> ConfigResult<JobDef> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;

    let criteria = get_string_prop(node, "criteria").unwrap_or_default();
    if let Err(source) = TagCriteria::parse(&criteria) {
        return Err(ConfigError::InvalidCriteria { job: name, source });
    }
    let requeue_on_failure = get_bool_prop(node, "requeue-on-failure").unwrap_or(false);

    let mut script = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "script" {
                script.extend(get_all_string_args(child));
            }
        }
    }
    if script.is_empty() {
        return Err(ConfigError::MissingField(format!(
            "script for job '{}'",
            name
        )));
    }

    Ok(JobDef {
        name,
        script: script.join("\n"),
        criteria,
        requeue_on_failure,
    })
}

fn parse_url(field: &str, value: &str) -> ConfigResult<Url> {
    Url::parse(value).map_err(|e| invalid(field, &e.to_string()))
}

fn invalid(field: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        message: message.to_string(),
    }
}

// Helper functions for extracting values from KDL nodes

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_all_string_args(node: &KdlNode) -> Vec<String> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect()
}

fn get_string_prop(node: &KdlNode, name: &str) -> Option<String> {
    node.get(name)
        .and_then(|v| v.as_string())
        .map(|s| s.to_string())
}

fn get_bool_prop(node: &KdlNode, name: &str) -> Option<bool> {
    node.get(name).and_then(|v| v.as_bool())
}

fn get_int_prop(node: &KdlNode, name: &str) -> Option<i128> {
    node.get(name).and_then(|v| v.as_integer())
}

/// Values of `name` given either as repeated properties or as a child node.
fn get_string_list_prop(node: &KdlNode, name: &str) -> Vec<String> {
    let result: Vec<String> = node
        .entries()
        .iter()
        .filter(|e| e.name().map(|n| n.value() == name).unwrap_or(false))
        .filter_map(|e| e.value().as_string())
        .map(|s| s.to_string())
        .collect();

    if !result.is_empty() {
        return result;
    }

    node.children()
        .and_then(|children| {
            children
                .nodes()
                .iter()
                .find(|child| child.name().value() == name)
        })
        .map(get_all_string_args)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let kdl = r#"
            scheduler event-capacity=64 verify-timeout-secs=30
            logging level="debug" format="json"
            executor work-dir="/var/lib/codefarm" shell="/bin/bash"

            services {
                artifactrepo "http://localhost:9001"
                logrepo "http://localhost:9002"
            }

            slave "builder-1" uri="local://localhost" executors=2 {
                tags "linux" "x86_64"
            }

            job "hello" criteria="linux AND x86_64" requeue-on-failure=#true {
                script "echo hello"
            }
        "#;

        let config = parse_farm_config(kdl).unwrap();
        assert_eq!(config.scheduler.event_capacity, 64);
        assert_eq!(
            config.scheduler.verify_timeout,
            Some(Duration::from_secs(30))
        );
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.executor.work_dir, PathBuf::from("/var/lib/codefarm"));
        assert_eq!(config.executor.shell, "/bin/bash");
        assert_eq!(
            config.services["artifactrepo"].as_str(),
            "http://localhost:9001/"
        );

        assert_eq!(config.slaves.len(), 1);
        assert_eq!(config.slaves[0].executors, 2);
        assert_eq!(config.slaves[0].tags, vec!["linux", "x86_64"]);

        assert_eq!(config.jobs.len(), 1);
        assert_eq!(config.jobs[0].criteria, "linux AND x86_64");
        assert!(config.jobs[0].requeue_on_failure);
        assert_eq!(config.jobs[0].script, "echo hello");
    }

    #[test]
    fn test_defaults() {
        let config = parse_farm_config("").unwrap();
        assert_eq!(config.scheduler.event_capacity, 1024);
        assert_eq!(config.scheduler.verify_timeout, None);
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.executor.shell, "/bin/sh");
        assert!(config.slaves.is_empty());
    }

    #[test]
    fn test_seed_conversion() {
        let kdl = r#"
            slave "s1" executors=3 offline=#true {
                tags "a"
            }
            job "j1" criteria="a OR b" {
                script "make"
                script "make test"
            }
        "#;

        let config = parse_farm_config(kdl).unwrap();
        let slave = config.slaves[0].to_slave();
        assert_eq!(slave.uri.scheme(), "local");
        assert_eq!(slave.executors, 3);
        assert!(slave.offline);
        assert!(slave.tags().contains(&"s1".to_string()));

        let job = config.jobs[0].to_job();
        assert_eq!(job.script, "make\nmake test");
        assert!(!job.requeue_on_failure);
        assert_eq!(job.status, codefarm_core::JobStatus::Queued);
    }

    #[test]
    fn test_invalid_criteria_rejected() {
        let kdl = r#"
            job "bad" criteria="a b" {
                script "true"
            }
        "#;

        let result = parse_farm_config(kdl);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidCriteria { .. }
        ));
    }

    #[test]
    fn test_job_without_script() {
        let result = parse_farm_config(r#"job "empty" criteria="a""#);
        assert!(matches!(result.unwrap_err(), ConfigError::MissingField(_)));
    }

    #[test]
    fn test_duplicate_slave() {
        let kdl = r#"
            slave "s1"
            slave "s1"
        "#;
        assert!(matches!(
            parse_farm_config(kdl).unwrap_err(),
            ConfigError::Duplicate(_)
        ));
    }

    #[test]
    fn test_unknown_log_format() {
        let result = parse_farm_config(r#"logging format="xml""#);
        assert!(matches!(
            result.unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }
}
