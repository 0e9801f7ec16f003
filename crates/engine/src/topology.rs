use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Directed `caller -> callee` edge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallEdge {
    pub caller: String,
    pub callee: String,
}

impl CallEdge {
    pub fn new(caller: impl Into<String>, callee: impl Into<String>) -> Self {
        Self {
            caller: caller.into(),
            callee: callee.into(),
        }
    }
}

const DEMO_SHOP_EDGES: &[(&str, &str)] = &[
    ("load-generator", "frontend-proxy"),
    ("frontend-web", "frontend-proxy"),
    ("frontend-proxy", "image-provider"),
    ("frontend-proxy", "frontend"),
    ("frontend", "ad"),
    ("frontend", "recommendation"),
    ("frontend", "product-catalog"),
    ("frontend", "checkout"),
    ("frontend", "cart"),
    ("frontend", "currency"),
    ("recommendation", "product-catalog"),
    ("cart", "inventory"),
    ("checkout", "product-catalog"),
    ("checkout", "cart"),
    ("checkout", "payment"),
    ("checkout", "shipping"),
    ("checkout", "email"),
    ("checkout", "currency"),
    ("shipping", "quote"),
];

pub fn default_edges() -> Vec<CallEdge> {
    DEMO_SHOP_EDGES
        .iter()
        .map(|(caller, callee)| CallEdge::new(*caller, *callee))
        .collect()
}

pub fn default_denylist() -> Vec<String> {
    vec!["load-generator".to_owned()]
}

/// Immutable service call graph.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    callees: BTreeMap<String, BTreeSet<String>>,
    callers: BTreeMap<String, BTreeSet<String>>,
    denylist: BTreeSet<String>,
}

impl Topology {
    pub fn new(edges: &[CallEdge], denylist: &[String]) -> Self {
        let mut topology = Self {
            denylist: denylist.iter().cloned().collect(),
            ..Self::default()
        };
        for edge in edges {
            topology
                .callees
                .entry(edge.caller.clone())
                .or_default()
                .insert(edge.callee.clone());
            topology
                .callers
                .entry(edge.callee.clone())
                .or_default()
                .insert(edge.caller.clone());
        }
        topology
    }

    pub fn demo_shop() -> Self {
        Self::new(&default_edges(), &default_denylist())
    }

    pub fn callees(&self, service: &str) -> BTreeSet<String> {
        self.callees.get(service).cloned().unwrap_or_default()
    }

    pub fn callers(&self, service: &str) -> BTreeSet<String> {
        self.callers.get(service).cloned().unwrap_or_default()
    }

    /// Direct callees of `service` that are also in `within`.
    pub fn downstream_of(&self, service: &str, within: &BTreeSet<String>) -> BTreeSet<String> {
        self.callees
            .get(service)
            .map(|callees| callees.intersection(within).cloned().collect())
            .unwrap_or_default()
    }

    /// Candidates that call no other candidate.
    pub fn most_downstream(&self, candidates: &BTreeSet<String>) -> BTreeSet<String> {
        candidates
            .iter()
            .filter(|service| self.downstream_of(service, candidates).is_empty())
            .cloned()
            .collect()
    }

    pub fn is_denied(&self, service: &str) -> bool {
        self.denylist.contains(service) || is_host(service) || is_data_store(service)
    }

    pub fn is_host(&self, service: &str) -> bool {
        is_host(service)
    }
}

/// Cloud host ids look like `i-xxxx`.
pub fn is_host(entity: &str) -> bool {
    entity.chars().nth(1) == Some('-')
}

fn is_data_store(entity: &str) -> bool {
    entity.starts_with("rm-") || entity.starts_with("r-")
}
