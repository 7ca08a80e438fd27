use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tower::ServiceExt;

use push_deploy::config::{BusyPolicy, DeployConfig, DeployMode, WebhookSecret};
use push_deploy::executor::{DeployTarget, DeploymentExecutor};
use push_deploy::pipeline::fake::{FakeOp, FakePipeline};
use push_deploy::signature::{SignatureVerifier, compute_signature};
use push_deploy::status::{RecordStatus, StatusFile};
use push_deploy::{AppState, SharedState, router};

const SECRET: &str = "test-secret-key-for-hmac-validation";

struct TestApp {
    app: Router,
    state: SharedState,
    fake: FakePipeline,
    dir: TempDir,
}

impl TestApp {
    fn new(fake: FakePipeline, mode: DeployMode) -> Self {
        Self::with_policy(fake, mode, BusyPolicy::Queue)
    }

    fn with_policy(fake: FakePipeline, mode: DeployMode, busy_policy: BusyPolicy) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let config = DeployConfig {
            status_file: dir.path().join("deploy.json").to_string_lossy().into_owned(),
            mode,
            busy_policy,
            ..DeployConfig::default()
        };

        let shared = Arc::new(fake.clone());
        let executor = Arc::new(DeploymentExecutor::new(
            DeployTarget::from(&config),
            Duration::from_secs(5),
            shared.clone(),
            shared.clone(),
            shared,
        ));
        let verifier = SignatureVerifier::new(WebhookSecret::new(SECRET).unwrap());
        let state = Arc::new(AppState::new(verifier, executor, &config));

        Self {
            app: router(state.clone()),
            state,
            fake,
            dir,
        }
    }

    fn status_file(&self) -> StatusFile {
        StatusFile::new(self.dir.path().join("deploy.json"))
    }

    /// Wait for background deployments to reach the history
    async fn wait_for_history(&self, count: usize) {
        for _ in 0..100 {
            if self.state.history.lock().await.len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("expected {} finished deployments", count);
    }

    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }
}

fn push_body(git_ref: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "ref": git_ref,
        "after": "abc123",
        "repository": {"name": "site"},
        "pusher": {"name": "octocat"},
    }))
    .unwrap()
}

fn webhook_request(event: &str, body: Vec<u8>, signature: Option<String>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/json")
        .header("X-GitHub-Event", event);
    if let Some(sig) = signature {
        builder = builder.header("X-Hub-Signature-256", sig);
    }
    builder.body(Body::from(body)).unwrap()
}

fn signed(event: &str, body: Vec<u8>) -> Request<Body> {
    let sig = compute_signature(SECRET.as_bytes(), &body).unwrap();
    webhook_request(event, body, Some(sig))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn signed_push_deploys_the_pushed_branch() {
    let t = TestApp::new(FakePipeline::new(), DeployMode::Sync);

    let (status, body) = t.send(signed("push", push_body("refs/heads/release"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["deployment"]["status"]["status"], "succeeded");
    assert_eq!(body["deployment"]["event"]["branch"], "release");
    assert_eq!(t.fake.calls()[0], "pull release");

    let record = t.status_file().read().await.unwrap();
    assert_eq!(record.status, RecordStatus::Succeeded);
    assert_eq!(record.branch.as_deref(), Some("release"));
    assert_eq!(record.author.as_deref(), Some("octocat"));
}

#[tokio::test]
async fn bad_signature_never_reaches_the_pipeline() {
    let t = TestApp::new(FakePipeline::new(), DeployMode::Sync);
    let body = push_body("refs/heads/main");
    let forged = compute_signature(b"wrong secret", &body).unwrap();

    let (status, json) = t.send(webhook_request("push", body, Some(forged))).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["status"], "error");
    assert!(!json.to_string().contains(SECRET));
    assert!(t.fake.calls().is_empty());
    assert!(t.status_file().read().await.is_err());
}

#[tokio::test]
async fn missing_signature_is_unauthorized() {
    let t = TestApp::new(FakePipeline::new(), DeployMode::Sync);

    let (status, _) = t
        .send(webhook_request("push", push_body("refs/heads/main"), None))
        .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(t.fake.calls().is_empty());
}

#[tokio::test]
async fn body_modified_after_signing_is_unauthorized() {
    let t = TestApp::new(FakePipeline::new(), DeployMode::Sync);
    let sig = compute_signature(SECRET.as_bytes(), &push_body("refs/heads/main")).unwrap();

    let (status, _) = t
        .send(webhook_request("push", push_body("refs/heads/evil"), Some(sig)))
        .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(t.fake.calls().is_empty());
}

#[tokio::test]
async fn other_events_are_acknowledged_and_ignored() {
    let t = TestApp::new(FakePipeline::new(), DeployMode::Sync);

    let (status, body) = t.send(signed("ping", b"{}".to_vec())).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "ignored ping event");
    assert!(t.fake.calls().is_empty());
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let t = TestApp::new(FakePipeline::new(), DeployMode::Sync);

    let (status, body) = t.send(signed("push", b"{\"ref\": ".to_vec())).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert!(t.fake.calls().is_empty());
}

#[tokio::test]
async fn non_json_content_type_is_a_bad_request() {
    let t = TestApp::new(FakePipeline::new(), DeployMode::Sync);
    let body = b"payload=%7B%7D".to_vec();
    let sig = compute_signature(SECRET.as_bytes(), &body).unwrap();
    let request = Request::builder()
        .method("POST")
        .uri("/webhook")
        .header("content-type", "application/x-www-form-urlencoded")
        .header("X-GitHub-Event", "push")
        .header("X-Hub-Signature-256", sig)
        .body(Body::from(body))
        .unwrap();

    let (status, _) = t.send(request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(t.fake.calls().is_empty());
}

#[tokio::test]
async fn failed_step_is_reported_as_server_error() {
    let t = TestApp::new(FakePipeline::new().failing_on(FakeOp::Build), DeployMode::Sync);

    let (status, body) = t.send(signed("push", push_body("refs/heads/main"))).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["status"], "error");
    let message = body["message"].as_str().unwrap();
    assert!(message.contains("step 2 (image_build)"), "{}", message);
    assert_eq!(t.fake.calls().len(), 2);

    let record = t.status_file().read().await.unwrap();
    assert_eq!(record.status, RecordStatus::Failed);
}

#[tokio::test]
async fn health_reports_configuration_and_partial_state() {
    let t = TestApp::new(FakePipeline::new().failing_on(FakeOp::Run), DeployMode::Sync);

    let (status, before) = t.send(get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(before["status"], "ok");
    assert_eq!(before["secretConfigured"], true);
    assert_eq!(before["deploying"], false);
    assert_eq!(before["partialState"], false);
    assert!(before["lastDeployment"].is_null());
    assert!(!before.to_string().contains(SECRET));

    let (status, _) = t.send(signed("push", push_body("refs/heads/main"))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (_, after) = t.send(get("/health")).await;
    assert_eq!(after["partialState"], true);
    assert_eq!(after["lastDeployment"]["status"]["step"], "start");
    assert_eq!(after["pipelineState"]["state"], "failed");
}

#[tokio::test]
async fn partial_state_survives_an_earlier_failure() {
    let t = TestApp::new(FakePipeline::new().failing_on(FakeOp::Run), DeployMode::Sync);

    let (status, _) = t.send(signed("push", push_body("refs/heads/main"))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let (_, health) = t.send(get("/health")).await;
    assert_eq!(health["partialState"], true);

    t.fake.set_failing(Some(FakeOp::Pull));
    let (status, _) = t.send(signed("push", push_body("refs/heads/main"))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let (_, health) = t.send(get("/health")).await;
    assert_eq!(health["lastDeployment"]["status"]["step"], "source_update");
    assert_eq!(health["partialState"], true);
    assert!(!t.fake.container_present());

    t.fake.set_failing(None);
    let (status, _) = t.send(signed("push", push_body("refs/heads/main"))).await;
    assert_eq!(status, StatusCode::OK);
    let (_, health) = t.send(get("/health")).await;
    assert_eq!(health["partialState"], false);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deliveries_run_one_after_the_other() {
    let t = TestApp::new(
        FakePipeline::new().with_delay(Duration::from_millis(10)),
        DeployMode::Sync,
    );

    let ((status_a, _), (status_b, _)) = tokio::join!(
        t.send(signed("push", push_body("refs/heads/a"))),
        t.send(signed("push", push_body("refs/heads/b"))),
    );
    assert_eq!(status_a, StatusCode::OK);
    assert_eq!(status_b, StatusCode::OK);

    let calls = t.fake.calls();
    assert_eq!(calls.len(), 12);
    for run in calls.chunks(6) {
        assert!(run[0].starts_with("pull "), "{:?}", calls);
        assert!(run[5].starts_with("run "), "{:?}", calls);
    }
    let journal = t.fake.journal();
    for pair in journal.chunks(2) {
        assert_eq!(
            pair[0].strip_prefix("begin "),
            pair[1].strip_prefix("end "),
            "{:?}",
            journal
        );
    }

    let history = t.state.history.lock().await;
    assert_eq!(history.len(), 2);
    let latest = history.latest().unwrap();
    let record = t.status_file().read().await.unwrap();
    assert_eq!(record.status, RecordStatus::Succeeded);
    assert_eq!(record.deployment_id.as_deref(), Some(latest.id.as_str()));
    assert_eq!(record.branch.as_deref(), Some(latest.event.branch.as_str()));
}

#[tokio::test]
async fn reject_policy_answers_conflict_while_busy() {
    let fake = FakePipeline::new().stalling_on(FakeOp::Build, Duration::from_millis(200));
    let t = TestApp::with_policy(fake, DeployMode::Background, BusyPolicy::Reject);

    let (status, _) = t.send(signed("push", push_body("refs/heads/main"))).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = t.send(signed("push", push_body("refs/heads/main"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["message"], "deployment in progress");

    t.wait_for_history(1).await;
    assert_eq!(t.fake.calls().len(), 6);
    assert_eq!(t.state.history.lock().await.len(), 1);
}

#[tokio::test]
async fn burst_of_pushes_queues_a_single_follow_up() {
    let fake = FakePipeline::new().stalling_on(FakeOp::Build, Duration::from_millis(200));
    let t = TestApp::new(fake, DeployMode::Background);

    let (first, _) = t.send(signed("push", push_body("refs/heads/main"))).await;
    let (second, _) = t.send(signed("push", push_body("refs/heads/main"))).await;
    let (third, body) = t.send(signed("push", push_body("refs/heads/main"))).await;
    assert_eq!(first, StatusCode::OK);
    assert_eq!(second, StatusCode::OK);
    assert_eq!(third, StatusCode::ACCEPTED);
    assert_eq!(body["message"], "deployment already queued");

    t.wait_for_history(2).await;
    // give a stray third run the chance to show up
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(t.fake.calls().len(), 12);
    assert_eq!(t.state.history.lock().await.len(), 2);
}

#[tokio::test]
async fn background_mode_returns_before_the_pipeline_finishes() {
    let fake = FakePipeline::new().stalling_on(FakeOp::Build, Duration::from_millis(200));
    let t = TestApp::new(fake, DeployMode::Background);

    let (status, body) = t.send(signed("push", push_body("refs/heads/main"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "deployment started");

    let mut pending = None;
    for _ in 0..25 {
        if let Ok(record) = t.status_file().read().await {
            pending = Some(record);
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(pending.map(|r| r.status), Some(RecordStatus::Pending));

    t.wait_for_history(1).await;
    let record = t.status_file().read().await.unwrap();
    assert_eq!(record.status, RecordStatus::Succeeded);

    let (_, listing) = t.send(get("/deployments")).await;
    assert_eq!(listing["count"], 1);
    assert_eq!(listing["deployments"][0]["event"]["commit_sha"], "abc123");
}
