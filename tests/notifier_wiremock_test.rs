//! Pipeline-tracking protocol tests using wiremock
//!
//! | Request | Expectation |
//! |---------|-------------|
//! | `POST /pipelines` | `{name, nodes}`; 201 + JSON id |
//! | `PUT /pipelines/{id}` | `[{_id, state?, children?}]`, one per update |

use batchpipe::notify::{
    self, NodeState, Notifier, NoopNotifier, PipelineDefinition, RemoteNotifier, PREP_NODE,
    ROOT_NODE, WORKERS_NODE,
};
use batchpipe::error::BatchError;
use serde_json::{json, Value};
use wiremock::matchers::{body_json, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// HELPERS
// =============================================================================

async fn tracking_service(id: Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pipelines"))
        .respond_with(ResponseTemplate::new(201).set_body_json(id))
        .mount(&server)
        .await;
    server
}

async fn put_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .filter(|r| r.method.as_str() == "PUT")
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

// =============================================================================
// REGISTRATION
// =============================================================================

#[tokio::test]
async fn register_posts_the_node_tree() {
    let server = MockServer::start().await;
    let definition = PipelineDefinition::standard("pfs-test");
    Mock::given(method("POST"))
        .and(path("/pipelines"))
        .and(header_exists("user-agent"))
        .and(body_json(json!({
            "name": "pfs-test",
            "nodes": {
                "root": {"type": "SERIAL", "children": ["pre_process", "process_spectra"]},
                "pre_process": {"type": "TASK", "name": "pre_process"},
                "process_spectra": {"type": "PARALLEL", "name": "process_spectra"}
            }
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!("abc123")))
        .expect(1)
        .mount(&server)
        .await;

    let remote = RemoteNotifier::register(&server.uri(), &definition)
        .await
        .unwrap();
    assert_eq!(
        remote.pipeline_url(),
        Some(format!("{}/pipelines/abc123", server.uri()).as_str())
    );
}

#[tokio::test]
async fn numeric_pipeline_id_is_accepted() {
    let server = tracking_service(json!(42)).await;
    let remote = RemoteNotifier::register(&server.uri(), &PipelineDefinition::standard("x"))
        .await
        .unwrap();
    assert!(remote.pipeline_url().unwrap().ends_with("/pipelines/42"));
}

#[tokio::test]
async fn trailing_slash_in_base_url_is_ignored() {
    let server = tracking_service(json!("p1")).await;
    let base = format!("{}/", server.uri());
    let remote = RemoteNotifier::register(&base, &PipelineDefinition::standard("x"))
        .await
        .unwrap();
    assert_eq!(
        remote.pipeline_url(),
        Some(format!("{}/pipelines/p1", server.uri()).as_str())
    );
}

#[tokio::test]
async fn non_created_status_is_a_registration_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pipelines"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!("abc")))
        .mount(&server)
        .await;

    let err = RemoteNotifier::register(&server.uri(), &PipelineDefinition::standard("x"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BatchError::Notification { .. }));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn server_error_falls_back_to_noop() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/pipelines"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = notify::connect(Some(server.uri().as_str()), &PipelineDefinition::standard("x")).await;
    assert!(notifier.pipeline_url().is_none());

    // The fallback never retries and never talks to the server
    notifier.set_state(ROOT_NODE, NodeState::Running).await;
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn unreachable_service_falls_back_to_noop() {
    // Port 9 (discard) is closed on test machines
    let notifier = notify::connect(Some("http://127.0.0.1:9"), &PipelineDefinition::standard("x")).await;
    assert!(notifier.pipeline_url().is_none());
}

// =============================================================================
// UPDATES
// =============================================================================

#[tokio::test]
async fn updates_are_put_as_single_element_arrays() {
    let server = tracking_service(json!("run-1")).await;
    Mock::given(method("PUT"))
        .and(path("/pipelines/run-1"))
        .respond_with(ResponseTemplate::new(200))
        .expect(2)
        .mount(&server)
        .await;

    let remote = RemoteNotifier::register(&server.uri(), &PipelineDefinition::standard("x"))
        .await
        .unwrap();
    remote.set_state(PREP_NODE, NodeState::Running).await;
    remote
        .set_children(
            WORKERS_NODE,
            vec!["process_spectra-1".to_string(), "process_spectra-2".to_string()],
        )
        .await;

    assert_eq!(
        put_bodies(&server).await,
        vec![
            json!([{"_id": "pre_process", "state": "RUNNING"}]),
            json!([{"_id": "process_spectra", "children": ["process_spectra-1", "process_spectra-2"]}]),
        ]
    );
}

#[tokio::test]
async fn regressions_and_empty_updates_are_not_sent() {
    let server = tracking_service(json!("run-2")).await;
    Mock::given(method("PUT"))
        .and(path("/pipelines/run-2"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let remote = RemoteNotifier::register(&server.uri(), &PipelineDefinition::standard("x"))
        .await
        .unwrap();
    remote.set_state(ROOT_NODE, NodeState::Running).await;
    remote.set_state(ROOT_NODE, NodeState::Success).await;
    remote.set_state(ROOT_NODE, NodeState::Running).await;
    remote.set_state(ROOT_NODE, NodeState::Error).await;
    remote.set_children(WORKERS_NODE, Vec::new()).await;

    let bodies = put_bodies(&server).await;
    assert_eq!(bodies.len(), 2);
    assert_eq!(remote.state_of(ROOT_NODE), Some(NodeState::Success));
}

#[tokio::test]
async fn rejected_updates_are_swallowed() {
    let server = tracking_service(json!("run-3")).await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let remote = RemoteNotifier::register(&server.uri(), &PipelineDefinition::standard("x"))
        .await
        .unwrap();
    remote.set_state(ROOT_NODE, NodeState::Running).await;
    remote.set_state(ROOT_NODE, NodeState::Error).await;
}

#[tokio::test]
async fn noop_notifier_sends_nothing() {
    let server = MockServer::start().await;
    let noop = NoopNotifier::new();
    noop.set_state(ROOT_NODE, NodeState::Running).await;
    noop.set_children(WORKERS_NODE, vec!["process_spectra-1".to_string()])
        .await;
    assert!(server.received_requests().await.unwrap().is_empty());
}
