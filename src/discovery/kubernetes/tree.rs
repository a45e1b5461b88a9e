//! Endpoint derivation and owner-chain tree construction
//!
//! Every build gets its own [`ObjectCache`], so an object is fetched at most
//! once per build and nothing leaks between builds.

use super::api::{EndpointPort, Endpoints, KubeApi, ObjectMeta, ObjectReference};
use super::REALM;
use crate::config::KubernetesConfig;
use crate::discovery::{AbstractNode, EnvironmentNode, NodeType};
use crate::target::{jmx_service_url, AnnotationKey, ServiceRef};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::warn;

/// Bound on owner-reference hops walked from a pod
const MAX_OWNER_DEPTH: usize = 16;

/// Allow-list of JMX ports by name or number
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortFilter {
    names: Vec<String>,
    numbers: Vec<u16>,
}

impl PortFilter {
    /// Creates a filter
    pub fn new(names: Vec<String>, numbers: Vec<u16>) -> Self {
        Self { names, numbers }
    }

    /// Filter configured for a cluster
    pub fn from_config(config: &KubernetesConfig) -> Self {
        Self::new(config.port_names.clone(), config.port_numbers.clone())
    }

    /// Whether a port is on the allow-list
    pub fn matches(&self, port: &EndpointPort) -> bool {
        self.numbers.contains(&port.port)
            || port
                .name
                .as_ref()
                .is_some_and(|name| self.names.iter().any(|n| n == name))
    }
}

/// Object metadata lookups memoized by `(namespace, kind, name)`
pub struct ObjectCache<'a> {
    api: &'a dyn KubeApi,
    objects: HashMap<(String, String, String), Option<ObjectMeta>>,
}

impl<'a> ObjectCache<'a> {
    /// Creates an empty cache
    pub fn new(api: &'a dyn KubeApi) -> Self {
        Self {
            api,
            objects: HashMap::new(),
        }
    }

    /// Fetches object metadata, at most once per key
    ///
    /// Lookup failures and missing objects are logged and cached as `None`.
    pub async fn get(&mut self, namespace: &str, kind: &str, name: &str) -> Option<ObjectMeta> {
        let key = (namespace.to_string(), kind.to_string(), name.to_string());
        if let Some(cached) = self.objects.get(&key) {
            return cached.clone();
        }
        let meta = match self.api.get_object(namespace, kind, name).await {
            Ok(Some(meta)) => Some(meta),
            Ok(None) => {
                warn!(namespace, kind, name, "Referenced object not found");
                None
            }
            Err(e) => {
                warn!(namespace, kind, name, error = %e, "Failed to resolve referenced object");
                None
            }
        };
        self.objects.insert(key, meta.clone());
        meta
    }
}

/// One allow-listed address/port pair of an Endpoints object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedEndpoint {
    /// Object the address points at
    pub target_ref: Option<ObjectReference>,
    /// Derived target
    pub service_ref: ServiceRef,
}

/// Derives targets from every allow-listed address/port pair
pub async fn matched_endpoints(
    endpoints: &Endpoints,
    namespace: &str,
    filter: &PortFilter,
    cache: &mut ObjectCache<'_>,
) -> Vec<MatchedEndpoint> {
    let mut matched = Vec::new();
    for subset in &endpoints.subsets {
        let ports: Vec<&EndpointPort> = subset.ports.iter().filter(|p| filter.matches(p)).collect();
        if ports.is_empty() {
            continue;
        }
        for address in &subset.addresses {
            let pod = match pod_name(address.target_ref.as_ref()) {
                Some(name) => cache.get(namespace, "Pod", name).await,
                None => None,
            };
            for port in &ports {
                let alias = address
                    .target_ref
                    .as_ref()
                    .and_then(|r| r.name.clone())
                    .unwrap_or_else(|| address.ip.clone());
                let mut service_ref = ServiceRef::new(jmx_service_url(&address.ip, port.port))
                    .with_alias(alias)
                    .with_cryostat_annotation(AnnotationKey::Realm, REALM)
                    .with_cryostat_annotation(AnnotationKey::Host, address.ip.clone())
                    .with_cryostat_annotation(AnnotationKey::Port, port.port.to_string())
                    .with_cryostat_annotation(AnnotationKey::Namespace, namespace);
                if let Some(name) = pod_name(address.target_ref.as_ref()) {
                    service_ref = service_ref.with_cryostat_annotation(AnnotationKey::PodName, name);
                }
                if let Some(pod) = &pod {
                    service_ref = service_ref
                        .with_labels(pod.labels.clone())
                        .with_platform_annotations(pod.annotations.clone());
                }
                matched.push(MatchedEndpoint {
                    target_ref: address.target_ref.clone(),
                    service_ref,
                });
            }
        }
    }
    matched
}

fn pod_name(target_ref: Option<&ObjectReference>) -> Option<&str> {
    let target_ref = target_ref?;
    if target_ref.kind.as_deref() == Some("Pod") {
        target_ref.name.as_deref()
    } else {
        None
    }
}

/// Owner kinds followed upward from a pod
fn owner_node_type(kind: &str) -> Option<NodeType> {
    match NodeType::from_kube_kind(kind)? {
        t @ (NodeType::StatefulSet
        | NodeType::DaemonSet
        | NodeType::Deployment
        | NodeType::DeploymentConfig
        | NodeType::ReplicaSet
        | NodeType::ReplicationController) => Some(t),
        _ => None,
    }
}

/// Content hash over every watched store
pub fn store_hash(stores: &[(String, Vec<Endpoints>)]) -> String {
    let mut hasher = Sha256::new();
    for (namespace, items) in stores {
        hasher.update(namespace.as_bytes());
        hasher.update([0u8]);
        for endpoints in items {
            // Serialization of these plain structs cannot fail.
            if let Ok(bytes) = serde_json::to_vec(endpoints) {
                hasher.update(&bytes);
            }
            hasher.update([0u8]);
        }
        hasher.update([0xffu8]);
    }
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct NodeKey {
    namespace: String,
    node_type: NodeType,
    name: String,
}

#[derive(Default)]
struct Arena {
    nodes: HashMap<NodeKey, EnvironmentNode>,
    children: HashMap<NodeKey, BTreeSet<NodeKey>>,
    leaves: HashMap<NodeKey, Vec<ServiceRef>>,
}

impl Arena {
    fn ensure(&mut self, key: &NodeKey, labels: &BTreeMap<String, String>) {
        self.nodes.entry(key.clone()).or_insert_with(|| {
            EnvironmentNode::new(key.name.clone(), key.node_type).with_labels(labels.clone())
        });
    }

    fn link(&mut self, parent: &NodeKey, child: &NodeKey) {
        self.children.entry(parent.clone()).or_default().insert(child.clone());
    }

    fn assemble(&self, key: &NodeKey, depth: usize) -> EnvironmentNode {
        let mut node = self
            .nodes
            .get(key)
            .cloned()
            .unwrap_or_else(|| EnvironmentNode::new(key.name.clone(), key.node_type));
        if depth <= MAX_OWNER_DEPTH + 2 {
            for child in self.children.get(key).into_iter().flatten() {
                node.add_child(AbstractNode::Environment(self.assemble(child, depth + 1)));
            }
        }
        for target in self.leaves.get(key).into_iter().flatten() {
            node.add_target(NodeType::Endpoint, target.clone());
        }
        node
    }
}

/// Builds the realm subtree: Namespace, owner chain, Pod, then Endpoint leaves
///
/// An object that cannot be resolved still gets a node carrying only its
/// name; the lookup failure is logged by [`ObjectCache`].
pub async fn build_tree(
    stores: &[(String, Vec<Endpoints>)],
    filter: &PortFilter,
    api: &dyn KubeApi,
) -> EnvironmentNode {
    let mut cache = ObjectCache::new(api);
    let mut arena = Arena::default();
    let mut namespaces = Vec::new();
    let empty = BTreeMap::new();

    for (namespace, items) in stores {
        let ns_key = NodeKey {
            namespace: namespace.clone(),
            node_type: NodeType::Namespace,
            name: namespace.clone(),
        };
        arena.ensure(&ns_key, &empty);
        namespaces.push(ns_key.clone());

        for endpoints in items {
            for matched in matched_endpoints(endpoints, namespace, filter, &mut cache).await {
                let Some(pod) = pod_name(matched.target_ref.as_ref()) else {
                    arena.leaves.entry(ns_key.clone()).or_default().push(matched.service_ref);
                    continue;
                };

                let pod_meta = cache.get(namespace, "Pod", pod).await;
                let mut chain = vec![(
                    NodeType::Pod,
                    pod.to_string(),
                    pod_meta.as_ref().map(|m| m.labels.clone()).unwrap_or_default(),
                )];
                let mut current = pod_meta;
                while chain.len() <= MAX_OWNER_DEPTH {
                    let Some(meta) = current.take() else { break };
                    let Some((node_type, owner)) = meta
                        .owner_references
                        .iter()
                        .find_map(|o| owner_node_type(&o.kind).map(|t| (t, o)))
                    else {
                        break;
                    };
                    if chain.iter().any(|(t, n, _)| *t == node_type && *n == owner.name) {
                        warn!(namespace, kind = %owner.kind, name = %owner.name, "Owner reference cycle");
                        break;
                    }
                    let owner_meta = cache.get(namespace, &owner.kind, &owner.name).await;
                    chain.push((
                        node_type,
                        owner.name.clone(),
                        owner_meta.as_ref().map(|m| m.labels.clone()).unwrap_or_default(),
                    ));
                    current = owner_meta;
                }

                let mut parent = ns_key.clone();
                for (node_type, name, labels) in chain.iter().rev() {
                    let key = NodeKey {
                        namespace: namespace.clone(),
                        node_type: *node_type,
                        name: name.clone(),
                    };
                    arena.ensure(&key, labels);
                    arena.link(&parent, &key);
                    parent = key;
                }
                arena.leaves.entry(parent).or_default().push(matched.service_ref);
            }
        }
    }

    let mut realm = EnvironmentNode::realm(REALM);
    for ns_key in &namespaces {
        realm.add_child(AbstractNode::Environment(arena.assemble(ns_key, 0)));
    }
    realm.sort_recursive();
    realm
}

#[cfg(test)]
mod tests {
    use super::super::api::{EndpointAddress, EndpointSubset, OwnerReference};
    use super::super::test_support::FakeKubeApi;
    use super::*;

    fn endpoints(name: &str, pod: &str, ip: &str, port: u16) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta {
                name: name.to_string(),
                ..Default::default()
            },
            subsets: vec![EndpointSubset {
                addresses: vec![EndpointAddress {
                    ip: ip.to_string(),
                    target_ref: Some(ObjectReference {
                        kind: Some("Pod".to_string()),
                        name: Some(pod.to_string()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ports: vec![
                    EndpointPort {
                        name: Some("jfr-jmx".to_string()),
                        port,
                        protocol: None,
                    },
                    EndpointPort {
                        name: Some("http".to_string()),
                        port: 8080,
                        protocol: None,
                    },
                ],
            }],
        }
    }

    fn meta(name: &str, owner: Option<(&str, &str)>) -> ObjectMeta {
        ObjectMeta {
            name: name.to_string(),
            labels: BTreeMap::from([("app".to_string(), "demo".to_string())]),
            owner_references: owner
                .map(|(kind, name)| {
                    vec![OwnerReference {
                        kind: kind.to_string(),
                        name: name.to_string(),
                        ..Default::default()
                    }]
                })
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    fn filter() -> PortFilter {
        PortFilter::new(vec!["jfr-jmx".to_string()], vec![9091])
    }

    #[test]
    fn test_port_filter() {
        let f = filter();
        assert!(f.matches(&EndpointPort {
            name: Some("jfr-jmx".to_string()),
            port: 1,
            protocol: None
        }));
        assert!(f.matches(&EndpointPort {
            name: None,
            port: 9091,
            protocol: None
        }));
        assert!(!f.matches(&EndpointPort {
            name: Some("http".to_string()),
            port: 8080,
            protocol: None
        }));
    }

    #[tokio::test]
    async fn test_matched_endpoints_carry_pod_metadata() {
        let api = FakeKubeApi::default();
        api.insert_object("ns", "Pod", meta("pod-1", None));
        let mut cache = ObjectCache::new(&api);
        let matched = matched_endpoints(&endpoints("svc", "pod-1", "10.0.0.5", 9091), "ns", &filter(), &mut cache).await;
        assert_eq!(matched.len(), 1);
        let target = &matched[0].service_ref;
        assert_eq!(target.service_uri, "service:jmx:rmi:///jndi/rmi://10.0.0.5:9091/jmxrmi");
        assert_eq!(target.alias.as_deref(), Some("pod-1"));
        assert_eq!(target.labels.get("app").map(String::as_str), Some("demo"));
        assert_eq!(target.cryostat_annotation(AnnotationKey::Namespace), Some("ns"));
        assert_eq!(target.cryostat_annotation(AnnotationKey::PodName), Some("pod-1"));
    }

    #[tokio::test]
    async fn test_owner_chain_is_walked_to_root() {
        let api = FakeKubeApi::default();
        api.insert_object("ns", "Pod", meta("pod-1", Some(("ReplicaSet", "rs-1"))));
        api.insert_object("ns", "ReplicaSet", meta("rs-1", Some(("Deployment", "dep"))));
        api.insert_object("ns", "Deployment", meta("dep", None));

        let stores = vec![("ns".to_string(), vec![endpoints("svc", "pod-1", "10.0.0.5", 9091)])];
        let tree = build_tree(&stores, &filter(), &api).await;

        let ns = tree.find(NodeType::Namespace, "ns").unwrap();
        let dep = ns.find(NodeType::Deployment, "dep").unwrap();
        let rs = dep.find(NodeType::ReplicaSet, "rs-1").unwrap();
        let pod = rs.find(NodeType::Pod, "pod-1").unwrap();
        assert_eq!(pod.targets().len(), 1);
        assert_eq!(dep.labels.get("app").map(String::as_str), Some("demo"));
        // pod, replica set and deployment each fetched once
        assert_eq!(api.object_lookups(), 3);
    }

    #[tokio::test]
    async fn test_unresolvable_owner_still_gets_a_node() {
        let api = FakeKubeApi::default();
        api.insert_object("ns", "Pod", meta("pod-1", Some(("StatefulSet", "gone"))));

        let stores = vec![("ns".to_string(), vec![endpoints("svc", "pod-1", "10.0.0.5", 9091)])];
        let tree = build_tree(&stores, &filter(), &api).await;
        let sts = tree.find(NodeType::StatefulSet, "gone").unwrap();
        assert!(sts.labels.is_empty());
        assert!(sts.find(NodeType::Pod, "pod-1").is_some());
    }

    #[tokio::test]
    async fn test_unrecognized_owner_kind_stops_walk() {
        let api = FakeKubeApi::default();
        api.insert_object("ns", "Pod", meta("pod-1", Some(("Job", "job-1"))));

        let stores = vec![("ns".to_string(), vec![endpoints("svc", "pod-1", "10.0.0.5", 9091)])];
        let tree = build_tree(&stores, &filter(), &api).await;
        let ns = tree.find(NodeType::Namespace, "ns").unwrap();
        assert_eq!(ns.children.len(), 1);
        assert_eq!(ns.children[0].node_type(), NodeType::Pod);
    }

    #[tokio::test]
    async fn test_pods_sharing_an_owner_share_the_node() {
        let api = FakeKubeApi::default();
        api.insert_object("ns", "Pod", meta("pod-1", Some(("ReplicaSet", "rs-1"))));
        api.insert_object("ns", "Pod", meta("pod-2", Some(("ReplicaSet", "rs-1"))));
        api.insert_object("ns", "ReplicaSet", meta("rs-1", None));

        let stores = vec![(
            "ns".to_string(),
            vec![
                endpoints("a", "pod-1", "10.0.0.5", 9091),
                endpoints("b", "pod-2", "10.0.0.6", 9091),
            ],
        )];
        let tree = build_tree(&stores, &filter(), &api).await;
        let ns = tree.find(NodeType::Namespace, "ns").unwrap();
        assert_eq!(ns.children.len(), 1);
        let rs = ns.find(NodeType::ReplicaSet, "rs-1").unwrap();
        assert_eq!(rs.children.len(), 2);
    }

    #[test]
    fn test_store_hash_tracks_content() {
        let a = vec![("ns".to_string(), vec![endpoints("svc", "pod-1", "10.0.0.5", 9091)])];
        let b = vec![("ns".to_string(), vec![endpoints("svc", "pod-1", "10.0.0.6", 9091)])];
        assert_eq!(store_hash(&a), store_hash(&a.clone()));
        assert_ne!(store_hash(&a), store_hash(&b));
    }
}
