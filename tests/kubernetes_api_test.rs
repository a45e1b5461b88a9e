mod common;

use common::{endpoints_json, object_json};
use cryostat::discovery::kubernetes::api::{HttpKubeApi, KubeApi, WatchEvent};
use cryostat::discovery::kubernetes::tree::PortFilter;
use cryostat::discovery::{KubeApiPlatformClient, NodeType, PlatformClient};
use cryostat::target::AnnotationKey;
use futures::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn api(server: &MockServer) -> HttpKubeApi {
    HttpKubeApi::new(&server.uri(), Some("sekret".to_string()), None, Duration::from_secs(2))
        .expect("build api client")
}

#[tokio::test]
async fn test_list_endpoints_sends_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/apps/endpoints"))
        .and(header("authorization", "Bearer sekret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "metadata": { "resourceVersion": "42" },
            "items": [endpoints_json("demo", "demo-abc-1", "10.0.0.5", 9091)]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let list = api(&server).list_endpoints("apps").await.expect("list endpoints");
    assert_eq!(list.metadata.resource_version.as_deref(), Some("42"));
    assert_eq!(list.items.len(), 1);
    assert_eq!(list.items[0].subsets[0].addresses[0].ip, "10.0.0.5");
    assert_eq!(list.items[0].subsets[0].ports[0].port, 9091);
}

#[tokio::test]
async fn test_list_endpoints_reports_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/apps/endpoints"))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .mount(&server)
        .await;

    let err = api(&server).list_endpoints("apps").await.unwrap_err();
    assert!(err.to_string().contains("403"));
}

#[tokio::test]
async fn test_get_object_missing_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/apis/apps/v1/namespaces/apps/replicasets/gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/apps/pods/demo-abc-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(object_json("demo-abc-1", Some(("ReplicaSet", "demo-abc")))),
        )
        .mount(&server)
        .await;

    let api = api(&server);
    assert!(api.get_object("apps", "ReplicaSet", "gone").await.unwrap().is_none());

    let pod = api
        .get_object("apps", "Pod", "demo-abc-1")
        .await
        .unwrap()
        .expect("pod exists");
    assert_eq!(pod.labels.get("app").map(String::as_str), Some("demo"));
    assert_eq!(pod.owner_references[0].kind, "ReplicaSet");
    assert_eq!(pod.owner_references[0].name, "demo-abc");
}

#[tokio::test]
async fn test_ping_uses_version_endpoint() {
    let server = MockServer::start().await;
    assert!(!api(&server).ping().await);

    Mock::given(method("GET"))
        .and(path("/version"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "gitVersion": "v1.29.0" })))
        .mount(&server)
        .await;
    assert!(api(&server).ping().await);
}

#[tokio::test]
async fn test_watch_parses_newline_delimited_events() {
    let server = MockServer::start().await;
    let body = [
        json!({ "type": "ADDED", "object": endpoints_json("demo", "demo-abc-1", "10.0.0.5", 9091) }),
        json!({ "type": "BOOKMARK", "object": { "metadata": { "resourceVersion": "50" } } }),
        json!({ "type": "DELETED", "object": endpoints_json("demo", "demo-abc-1", "10.0.0.5", 9091) }),
    ]
    .iter()
    .map(|event| event.to_string())
    .collect::<Vec<_>>()
    .join("\n");
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/apps/endpoints"))
        .and(query_param("watch", "true"))
        .and(query_param("resourceVersion", "42"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let stream = api(&server)
        .watch_endpoints("apps", "42")
        .await
        .expect("open watch");
    let events: Vec<WatchEvent> = stream.map(|event| event.expect("parse event")).collect().await;

    assert_eq!(events.len(), 3);
    assert!(matches!(&events[0], WatchEvent::Added(e) if e.metadata.name == "demo"));
    assert_eq!(events[1], WatchEvent::Bookmark("50".to_string()));
    assert!(matches!(&events[2], WatchEvent::Deleted(_)));
}

#[tokio::test]
async fn test_client_discovers_and_builds_owner_chain() {
    let server = MockServer::start().await;
    // Watches end immediately with no events; the informer keeps its listed state.
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/apps/endpoints"))
        .and(query_param("watch", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/apps/endpoints"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "metadata": { "resourceVersion": "42" },
            "items": [endpoints_json("demo", "demo-abc-1", "10.0.0.5", 9091)]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/apps/pods/demo-abc-1"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(object_json("demo-abc-1", Some(("ReplicaSet", "demo-abc")))),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/apis/apps/v1/namespaces/apps/replicasets/demo-abc"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(object_json("demo-abc", Some(("Deployment", "demo")))),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/apis/apps/v1/namespaces/apps/deployments/demo"))
        .respond_with(ResponseTemplate::new(200).set_body_json(object_json("demo", None)))
        .mount(&server)
        .await;

    let client = KubeApiPlatformClient::new(
        Arc::new(api(&server)),
        vec!["apps".to_string()],
        PortFilter::new(vec!["jfr-jmx".to_string()], vec![]),
    );
    client.start().await.expect("start client");

    let mut services = Vec::new();
    for _ in 0..100 {
        services = client.list_discoverable_services().await.unwrap();
        if !services.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(services.len(), 1);
    let target = &services[0];
    assert_eq!(target.alias.as_deref(), Some("demo-abc-1"));
    assert_eq!(target.labels.get("app").map(String::as_str), Some("demo"));
    assert_eq!(target.cryostat_annotation(AnnotationKey::Namespace), Some("apps"));
    assert_eq!(target.cryostat_annotation(AnnotationKey::PodName), Some("demo-abc-1"));

    let tree = client.discovery_tree().await.unwrap();
    let deployment = tree
        .find(NodeType::Deployment, "demo")
        .expect("deployment node");
    let replica_set = deployment
        .find(NodeType::ReplicaSet, "demo-abc")
        .expect("replica set below deployment");
    let pod = replica_set
        .find(NodeType::Pod, "demo-abc-1")
        .expect("pod below replica set");
    assert_eq!(pod.targets().len(), 1);
    assert_eq!(pod.targets()[0].service_uri, target.service_uri);

    client.stop().await.unwrap();
}
