use serde_json::{json, Value};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("cryostat.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

/// Endpoints object with one address backed by a pod and one JMX port
#[allow(dead_code)]
pub fn endpoints_json(name: &str, pod: &str, ip: &str, port: u16) -> Value {
    json!({
        "metadata": { "name": name, "namespace": "apps", "resourceVersion": "7" },
        "subsets": [{
            "addresses": [{
                "ip": ip,
                "targetRef": { "kind": "Pod", "namespace": "apps", "name": pod }
            }],
            "ports": [{ "name": "jfr-jmx", "port": port, "protocol": "TCP" }]
        }]
    })
}

/// Object wrapper carrying only metadata, optionally with a controller owner
#[allow(dead_code)]
pub fn object_json(name: &str, owner: Option<(&str, &str)>) -> Value {
    let owners: Vec<Value> = owner
        .into_iter()
        .map(|(kind, owner_name)| {
            json!({
                "apiVersion": "apps/v1",
                "kind": kind,
                "name": owner_name,
                "uid": format!("uid-{}", owner_name),
                "controller": true
            })
        })
        .collect();
    json!({
        "metadata": {
            "name": name,
            "namespace": "apps",
            "uid": format!("uid-{}", name),
            "labels": { "app": "demo" },
            "annotations": { "team": "perf" },
            "ownerReferences": owners
        }
    })
}
