//! Database object model: categories, feature selection, dependency
//! ordering, and the adapter seam the pipelines drive.

pub mod apply;
pub mod mysql;
pub mod values;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// The seven object kinds the engine may emit, in emission-rank order:
/// DDL before data, base tables before views, views before functions,
/// procedures and triggers after tables, events last.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ObjectCategory {
    Tables,
    Data,
    Views,
    Functions,
    Procedures,
    Triggers,
    Events,
}

impl ObjectCategory {
    pub const ALL: [ObjectCategory; 7] = [
        ObjectCategory::Tables,
        ObjectCategory::Data,
        ObjectCategory::Views,
        ObjectCategory::Functions,
        ObjectCategory::Procedures,
        ObjectCategory::Triggers,
        ObjectCategory::Events,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectCategory::Tables => "tables",
            ObjectCategory::Data => "data",
            ObjectCategory::Views => "views",
            ObjectCategory::Functions => "functions",
            ObjectCategory::Procedures => "procedures",
            ObjectCategory::Triggers => "triggers",
            ObjectCategory::Events => "events",
        }
    }

    /// Archive member / artifact file name in multiple-files mode.
    pub fn member_name(&self) -> String {
        format!("{}.sql", self.as_str())
    }

    /// Position in the backup emission order.
    pub fn rank(&self) -> usize {
        Self::ALL.iter().position(|c| c == self).unwrap_or(usize::MAX)
    }

    /// Position in the restore apply order. Data lands after all table and
    /// view DDL and before trigger creation, so bulk inserts cannot fire
    /// triggers that reference absent state.
    pub fn apply_rank(&self) -> usize {
        match self {
            ObjectCategory::Tables => 0,
            ObjectCategory::Views => 1,
            ObjectCategory::Functions => 2,
            ObjectCategory::Procedures => 3,
            ObjectCategory::Data => 4,
            ObjectCategory::Triggers => 5,
            ObjectCategory::Events => 6,
        }
    }

    pub fn from_member_name(name: &str) -> Option<ObjectCategory> {
        let stem = name.strip_suffix(".sql").or_else(|| name.strip_suffix(".backy"))?;
        Self::ALL.iter().copied().find(|c| c.as_str() == stem)
    }
}

impl std::fmt::Display for ObjectCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-category backup toggles. Defaults to schema + data only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    #[serde(default = "enabled")]
    pub tables: bool,
    #[serde(default = "enabled")]
    pub data: bool,
    #[serde(default)]
    pub views: bool,
    #[serde(default)]
    pub functions: bool,
    #[serde(default)]
    pub procedures: bool,
    #[serde(default)]
    pub triggers: bool,
    #[serde(default)]
    pub events: bool,
}

fn enabled() -> bool {
    true
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self {
            tables: true,
            data: true,
            views: false,
            functions: false,
            procedures: false,
            triggers: false,
            events: false,
        }
    }
}

impl FeatureSet {
    pub fn all() -> Self {
        Self {
            tables: true,
            data: true,
            views: true,
            functions: true,
            procedures: true,
            triggers: true,
            events: true,
        }
    }

    pub fn contains(&self, category: ObjectCategory) -> bool {
        match category {
            ObjectCategory::Tables => self.tables,
            ObjectCategory::Data => self.data,
            ObjectCategory::Views => self.views,
            ObjectCategory::Functions => self.functions,
            ObjectCategory::Procedures => self.procedures,
            ObjectCategory::Triggers => self.triggers,
            ObjectCategory::Events => self.events,
        }
    }

    /// Enabled categories in emission-rank order.
    pub fn enabled(&self) -> Vec<ObjectCategory> {
        ObjectCategory::ALL
            .iter()
            .copied()
            .filter(|c| self.contains(*c))
            .collect()
    }

    pub fn none_enabled(&self) -> bool {
        self.enabled().is_empty()
    }
}

/// Source engine identity recorded in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub version: String,
}

impl EngineInfo {
    /// Major component of the server version, e.g. 8 for "8.0.36".
    pub fn major(&self) -> Option<u32> {
        self.version
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .and_then(|s| s.parse().ok())
    }
}

/// Summary of a restore apply pass.
#[derive(Debug, Default)]
pub struct ApplyReport {
    pub executed: usize,
    /// Statements skipped under best-effort mode, verbatim.
    pub skipped: Vec<String>,
}

/// Database-specific adapter driven by the orchestrator. One adapter holds
/// exactly one connection for the lifetime of a job.
#[async_trait]
pub trait SchemaAdapter: Send {
    /// Engine identity of the live server.
    async fn engine(&mut self) -> Result<EngineInfo>;

    /// Dump one object category as re-ingestable SQL, or `None` when the
    /// database holds no such objects.
    async fn dump_category(&mut self, category: ObjectCategory) -> Result<Option<String>>;

    /// Drop existing objects in reverse dependency order: events, triggers,
    /// procedures, functions, views, then tables.
    async fn drop_all_objects(&mut self) -> Result<()>;

    /// Split and execute a dump script. Fatal errors surface the offending
    /// statement; with `best_effort` set, failed statements are recorded and
    /// skipped instead.
    async fn apply_script(&mut self, script: &str, best_effort: bool) -> Result<ApplyReport>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Deterministic topological sort (referenced before referencing).
///
/// `deps[x]` lists the nodes `x` depends on. Nodes left over by a cycle are
/// appended in lexicographic order; restore of genuinely cyclic definitions
/// is not supported.
pub fn topo_sort(nodes: &[String], deps: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    let mut remaining: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for node in nodes {
        let node_deps = deps
            .get(node)
            .map(|d| {
                d.iter()
                    .filter(|p| nodes.iter().any(|n| n == *p) && *p != node)
                    .map(String::as_str)
                    .collect()
            })
            .unwrap_or_default();
        remaining.insert(node.as_str(), node_deps);
    }

    let mut sorted = Vec::with_capacity(nodes.len());
    let mut ready: VecDeque<&str> = remaining
        .iter()
        .filter(|(_, d)| d.is_empty())
        .map(|(n, _)| *n)
        .collect();

    while let Some(node) = ready.pop_front() {
        remaining.remove(node);
        sorted.push(node.to_string());
        for (n, d) in remaining.iter_mut() {
            if d.is_empty() {
                // Already queued.
                continue;
            }
            d.retain(|p| *p != node);
            if d.is_empty() {
                ready.push_back(*n);
            }
        }
    }

    // Cycle remainder, stable order.
    let mut leftover: Vec<String> = remaining.keys().map(|n| n.to_string()).collect();
    leftover.sort();
    sorted.extend(leftover);
    sorted
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emission_rank_puts_ddl_before_data_and_events_last() {
        assert!(ObjectCategory::Tables.rank() < ObjectCategory::Data.rank());
        assert!(ObjectCategory::Data.rank() < ObjectCategory::Views.rank());
        assert!(ObjectCategory::Views.rank() < ObjectCategory::Functions.rank());
        assert_eq!(ObjectCategory::Events.rank(), 6);
    }

    #[test]
    fn apply_rank_inserts_data_after_views_and_before_triggers() {
        assert!(ObjectCategory::Views.apply_rank() < ObjectCategory::Data.apply_rank());
        assert!(ObjectCategory::Data.apply_rank() < ObjectCategory::Triggers.apply_rank());
        assert!(ObjectCategory::Tables.apply_rank() < ObjectCategory::Views.apply_rank());
    }

    #[test]
    fn member_names_round_trip() {
        for c in ObjectCategory::ALL {
            assert_eq!(ObjectCategory::from_member_name(&c.member_name()), Some(c));
        }
        assert_eq!(
            ObjectCategory::from_member_name("tables.backy"),
            Some(ObjectCategory::Tables)
        );
        assert_eq!(ObjectCategory::from_member_name("dump.sql"), None);
    }

    #[test]
    fn default_features_are_tables_and_data() {
        let f = FeatureSet::default();
        assert_eq!(
            f.enabled(),
            vec![ObjectCategory::Tables, ObjectCategory::Data]
        );
    }

    #[test]
    fn readme_example_feature_members() {
        // All features minus procedures and triggers.
        let mut f = FeatureSet::all();
        f.procedures = false;
        f.triggers = false;
        let members: Vec<String> = f.enabled().iter().map(|c| c.member_name()).collect();
        assert_eq!(
            members,
            vec!["tables.sql", "data.sql", "views.sql", "functions.sql", "events.sql"]
        );
    }

    #[test]
    fn topo_sort_orders_referenced_first() {
        let nodes = vec![
            "employees".to_string(),
            "departments".to_string(),
            "projects".to_string(),
        ];
        let mut deps = BTreeMap::new();
        deps.insert("employees".to_string(), vec!["departments".to_string()]);
        deps.insert(
            "projects".to_string(),
            vec!["employees".to_string(), "departments".to_string()],
        );
        let sorted = topo_sort(&nodes, &deps);
        let pos = |n: &str| sorted.iter().position(|s| s == n).unwrap();
        assert!(pos("departments") < pos("employees"));
        assert!(pos("employees") < pos("projects"));
    }

    #[test]
    fn topo_sort_is_deterministic_without_dependencies() {
        let nodes = vec!["b".to_string(), "a".to_string(), "c".to_string()];
        let sorted = topo_sort(&nodes, &BTreeMap::new());
        assert_eq!(sorted, vec!["a", "b", "c"]);
    }

    #[test]
    fn topo_sort_appends_cycles_in_stable_order() {
        let nodes = vec!["x".to_string(), "y".to_string(), "z".to_string()];
        let mut deps = BTreeMap::new();
        deps.insert("x".to_string(), vec!["y".to_string()]);
        deps.insert("y".to_string(), vec!["x".to_string()]);
        let sorted = topo_sort(&nodes, &deps);
        assert_eq!(sorted[0], "z");
        assert_eq!(sorted[1..], ["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn engine_major_version_parses() {
        let e = EngineInfo {
            kind: "mysql".into(),
            version: "8.0.36-debian".into(),
        };
        assert_eq!(e.major(), Some(8));
    }
}
