//! Job-scoped node layout
//!
//! Every persisted path is `/{job_name}/{relative}`. The layout is part of
//! the on-store format and must stay stable across releases.

/// Build the absolute path of a job node
pub fn path(job_name: &str, relative: &str) -> String {
    if relative.is_empty() {
        format!("/{}", job_name)
    } else {
        format!("/{}/{}", job_name, relative)
    }
}

pub const SERVERS: &str = "servers";
pub const INSTANCES: &str = "instances";
pub const LEADER_INSTANCE: &str = "leader/election/instance";
pub const LEADER_LATCH: &str = "leader/election/latch";
pub const SHARDING_PROCESSING: &str = "leader/sharding/processing";
pub const SHARDING: &str = "sharding";
pub const SHARDING_NECESSARY: &str = "sharding/necessary";
pub const EXECUTION: &str = "execution";
pub const FAILOVER: &str = "failover";
pub const CONFIG: &str = "config";

/// Path builder and classifier for one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNodePath {
    job_name: String,
    root: String,
}

impl JobNodePath {
    pub fn new(job_name: impl Into<String>) -> Self {
        let job_name = job_name.into();
        let root = path(&job_name, "");
        Self { job_name, root }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// `/{job_name}`
    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn full_path(&self, relative: &str) -> String {
        path(&self.job_name, relative)
    }

    /// Strip the job root from an absolute path
    pub fn relative<'a>(&self, full: &'a str) -> Option<&'a str> {
        full.strip_prefix(self.root.as_str())?.strip_prefix('/')
    }

    pub fn server_node(ip: &str) -> String {
        format!("{}/{}", SERVERS, ip)
    }

    pub fn instance_node(instance_id: &str) -> String {
        format!("{}/{}", INSTANCES, instance_id)
    }

    pub fn sharding_item_node(item: u32) -> String {
        format!("{}/{}", SHARDING, item)
    }

    pub fn execution_item_node(item: u32) -> String {
        format!("{}/{}", EXECUTION, item)
    }

    pub fn running_node(item: u32) -> String {
        format!("{}/{}/running", EXECUTION, item)
    }

    pub fn misfire_node(item: u32) -> String {
        format!("{}/{}/misfire", EXECUTION, item)
    }

    pub fn failover_item_node(item: u32) -> String {
        format!("{}/{}", FAILOVER, item)
    }

    pub fn failover_instance_node(item: u32) -> String {
        format!("{}/{}/instance", FAILOVER, item)
    }

    pub fn config_field_node(field: &str) -> String {
        format!("{}/{}", CONFIG, field)
    }

    /// Instance id when `full` is `instances/{id}`
    pub fn instance_id_of<'a>(&self, full: &'a str) -> Option<&'a str> {
        self.direct_child(full, INSTANCES)
    }

    /// Server IP when `full` is `servers/{ip}`
    pub fn server_ip_of<'a>(&self, full: &'a str) -> Option<&'a str> {
        self.direct_child(full, SERVERS)
    }

    /// Field name when `full` is `config/{field}`
    pub fn config_field_of<'a>(&self, full: &'a str) -> Option<&'a str> {
        self.direct_child(full, CONFIG)
    }

    pub fn is_leader_instance_path(&self, full: &str) -> bool {
        self.relative(full) == Some(LEADER_INSTANCE)
    }

    fn direct_child<'a>(&self, full: &'a str, parent: &str) -> Option<&'a str> {
        let child = self.relative(full)?.strip_prefix(parent)?.strip_prefix('/')?;
        (!child.is_empty() && !child.contains('/')).then_some(child)
    }
}

/// Parse a shard item node name, skipping markers such as `necessary`
pub fn parse_item(name: &str) -> Option<u32> {
    name.parse().ok()
}
