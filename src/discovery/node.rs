//! Discovery tree nodes
//!
//! The tree is rooted at a synthetic `Universe` node whose children are one
//! realm node per discovery backend. Interior nodes group targets by the
//! platform's own topology; leaves wrap exactly one [`ServiceRef`].

use crate::target::ServiceRef;
use serde::Serialize;
use std::collections::BTreeMap;

/// Kind of a node in the discovery tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum NodeType {
    /// Synthetic root
    Universe,
    /// One discovery backend
    Realm,
    /// Kubernetes namespace
    Namespace,
    /// Kubernetes StatefulSet
    StatefulSet,
    /// Kubernetes DaemonSet
    DaemonSet,
    /// Kubernetes Deployment
    Deployment,
    /// OpenShift DeploymentConfig
    DeploymentConfig,
    /// Kubernetes ReplicaSet
    ReplicaSet,
    /// Kubernetes ReplicationController
    ReplicationController,
    /// Kubernetes or Podman pod
    Pod,
    /// Kubernetes endpoint address
    Endpoint,
    /// Container engine container
    Container,
    /// Plain JVM found by network discovery or added by hand
    #[serde(rename = "JVM")]
    Jvm,
}

impl NodeType {
    /// Maps a Kubernetes object kind onto a node type, when the kind is part
    /// of a recognised owner chain
    pub fn from_kube_kind(kind: &str) -> Option<NodeType> {
        match kind {
            "Namespace" => Some(NodeType::Namespace),
            "StatefulSet" => Some(NodeType::StatefulSet),
            "DaemonSet" => Some(NodeType::DaemonSet),
            "Deployment" => Some(NodeType::Deployment),
            "DeploymentConfig" => Some(NodeType::DeploymentConfig),
            "ReplicaSet" => Some(NodeType::ReplicaSet),
            "ReplicationController" => Some(NodeType::ReplicationController),
            "Pod" => Some(NodeType::Pod),
            "Endpoint" => Some(NodeType::Endpoint),
            _ => None,
        }
    }

    /// Kind string of this node type
    pub fn kind(&self) -> &'static str {
        match self {
            NodeType::Universe => "Universe",
            NodeType::Realm => "Realm",
            NodeType::Namespace => "Namespace",
            NodeType::StatefulSet => "StatefulSet",
            NodeType::DaemonSet => "DaemonSet",
            NodeType::Deployment => "Deployment",
            NodeType::DeploymentConfig => "DeploymentConfig",
            NodeType::ReplicaSet => "ReplicaSet",
            NodeType::ReplicationController => "ReplicationController",
            NodeType::Pod => "Pod",
            NodeType::Endpoint => "Endpoint",
            NodeType::Container => "Container",
            NodeType::Jvm => "JVM",
        }
    }
}

/// Any node of the discovery tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum AbstractNode {
    /// Interior grouping node
    Environment(EnvironmentNode),
    /// Leaf wrapping one target
    Target(TargetNode),
}

impl AbstractNode {
    /// Name used for ordering siblings
    pub fn name(&self) -> &str {
        match self {
            AbstractNode::Environment(node) => &node.name,
            AbstractNode::Target(node) => node.target.display_name(),
        }
    }

    /// Node type
    pub fn node_type(&self) -> NodeType {
        match self {
            AbstractNode::Environment(node) => node.node_type,
            AbstractNode::Target(node) => node.node_type,
        }
    }
}

/// Interior node of the discovery tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentNode {
    /// Display name
    pub name: String,
    /// Node type
    pub node_type: NodeType,
    /// Platform labels of the grouped object
    pub labels: BTreeMap<String, String>,
    /// Child nodes
    pub children: Vec<AbstractNode>,
}

impl EnvironmentNode {
    /// Creates an empty node
    pub fn new(name: impl Into<String>, node_type: NodeType) -> Self {
        Self {
            name: name.into(),
            node_type,
            labels: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    /// Synthetic root node
    pub fn universe() -> Self {
        Self::new("Universe", NodeType::Universe)
    }

    /// Realm node for one discovery backend
    pub fn realm(name: impl Into<String>) -> Self {
        Self::new(name, NodeType::Realm)
    }

    /// Sets labels
    pub fn with_labels(mut self, labels: BTreeMap<String, String>) -> Self {
        self.labels = labels;
        self
    }

    /// Appends a child
    pub fn add_child(&mut self, child: AbstractNode) {
        self.children.push(child);
    }

    /// Appends a leaf for the given target
    pub fn add_target(&mut self, node_type: NodeType, target: ServiceRef) {
        self.children
            .push(AbstractNode::Target(TargetNode::new(node_type, target)));
    }

    /// Sorts children by type then name, recursively, so equal topologies
    /// produce equal trees
    pub fn sort_recursive(&mut self) {
        for child in &mut self.children {
            if let AbstractNode::Environment(node) = child {
                node.sort_recursive();
            }
        }
        self.children.sort_by(|a, b| {
            (a.node_type(), a.name()).cmp(&(b.node_type(), b.name()))
        });
    }

    /// Depth-first search for an interior node
    pub fn find(&self, node_type: NodeType, name: &str) -> Option<&EnvironmentNode> {
        if self.node_type == node_type && self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| match child {
            AbstractNode::Environment(node) => node.find(node_type, name),
            AbstractNode::Target(_) => None,
        })
    }

    /// Every target below this node
    pub fn targets(&self) -> Vec<&ServiceRef> {
        let mut out = Vec::new();
        self.collect_targets(&mut out);
        out
    }

    fn collect_targets<'a>(&'a self, out: &mut Vec<&'a ServiceRef>) {
        for child in &self.children {
            match child {
                AbstractNode::Environment(node) => node.collect_targets(out),
                AbstractNode::Target(node) => out.push(&node.target),
            }
        }
    }
}

/// Leaf node wrapping one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetNode {
    /// Node type
    pub node_type: NodeType,
    /// The wrapped target
    pub target: ServiceRef,
}

impl TargetNode {
    /// Wraps a target
    pub fn new(node_type: NodeType, target: ServiceRef) -> Self {
        Self { node_type, target }
    }
}
