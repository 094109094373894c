use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tempfile::TempDir;
use warp::http::StatusCode;

use orchestrator::cluster::KubeconfigGateway;
use orchestrator::registry::Registry;
use orchestrator::routes::{AppState, routes};

fn state(token: Option<&str>, home: &Path) -> AppState {
  let home = home.display().to_string();
  AppState {
    registry: Arc::new(Registry::new()),
    token: token.map(str::to_string),
    host: "test-host".to_string(),
    gateway: Arc::new(KubeconfigGateway::with_lookup(move |key| {
      (key == "HOME").then(|| home.clone())
    })),
  }
}

fn body<B: AsRef<[u8]>>(resp: &warp::http::Response<B>) -> Value {
  serde_json::from_slice(resp.body().as_ref()).unwrap()
}

#[tokio::test]
async fn health_reports_host() {
  let home = TempDir::new().unwrap();
  let api = routes(state(None, home.path()));

  let resp = warp::test::request().method("GET").path("/health").reply(&api).await;
  assert_eq!(resp.status(), StatusCode::OK);
  assert_eq!(body(&resp), json!({"status": "ok", "host": "test-host"}));
}

#[tokio::test]
async fn schedule_then_claim_hands_out_the_task_once() {
  let home = TempDir::new().unwrap();
  let api = routes(state(None, home.path()));

  let resp = warp::test::request()
    .method("POST")
    .path("/schedule")
    .json(&json!({"org": "acme", "task": "build the thing"}))
    .reply(&api)
    .await;
  assert_eq!(resp.status(), StatusCode::OK);
  let scheduled = body(&resp);
  assert_eq!(scheduled["status"], "scheduled");
  let id = scheduled["id"].as_str().unwrap().to_string();

  let claim = || {
    warp::test::request()
      .method("POST")
      .path("/tasks/claim")
      .json(&json!({"org": "acme", "agentID": "host-1"}))
  };

  let resp = claim().reply(&api).await;
  assert_eq!(resp.status(), StatusCode::OK);
  let claimed = body(&resp);
  assert_eq!(claimed["id"], id.as_str());
  assert_eq!(claimed["status"], "running");
  assert_eq!(claimed["agentId"], "host-1");

  let resp = claim().reply(&api).await;
  assert_eq!(body(&resp), json!({"task": null}));
}

#[tokio::test]
async fn claim_for_another_org_finds_nothing() {
  let home = TempDir::new().unwrap();
  let state = state(None, home.path());
  state.registry.schedule_task("acme", "x", None).unwrap();
  let api = routes(state);

  let resp = warp::test::request()
    .method("POST")
    .path("/tasks/claim")
    .json(&json!({"org": "globex", "agentId": "host-1"}))
    .reply(&api)
    .await;
  assert_eq!(body(&resp), json!({"task": null}));
}

#[tokio::test]
async fn configured_token_guards_mutations() {
  let home = TempDir::new().unwrap();
  let state = state(Some("s3cret"), home.path());
  let registry = state.registry.clone();
  let api = routes(state);

  let resp = warp::test::request()
    .method("POST")
    .path("/schedule")
    .json(&json!({"org": "acme", "task": "x"}))
    .reply(&api)
    .await;
  assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
  assert_eq!(body(&resp), json!({"error": "unauthorized"}));
  assert!(registry.list_tasks().is_empty());

  let resp = warp::test::request()
    .method("POST")
    .path("/schedule")
    .header("x-auth-token", "s3cret")
    .json(&json!({"org": "acme", "task": "x"}))
    .reply(&api)
    .await;
  assert_eq!(resp.status(), StatusCode::OK);

  let resp = warp::test::request()
    .method("POST")
    .path("/schedule")
    .header("authorization", "Bearer s3cret")
    .json(&json!({"org": "acme", "task": "y"}))
    .reply(&api)
    .await;
  assert_eq!(resp.status(), StatusCode::OK);
  assert_eq!(registry.list_tasks().len(), 2);

  // Reads stay open.
  let resp = warp::test::request().method("GET").path("/tasks").reply(&api).await;
  assert_eq!(resp.status(), StatusCode::OK);
  assert_eq!(body(&resp).as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn malformed_requests_are_rejected() {
  let home = TempDir::new().unwrap();
  let api = routes(state(None, home.path()));

  let resp = warp::test::request()
    .method("POST")
    .path("/schedule")
    .json(&json!({"org": "acme"}))
    .reply(&api)
    .await;
  assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
  assert!(body(&resp)["error"].as_str().unwrap().contains("missing"));

  let resp = warp::test::request()
    .method("POST")
    .path("/schedule")
    .header("content-type", "application/json")
    .body("{not json")
    .reply(&api)
    .await;
  assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

  let resp = warp::test::request().method("GET").path("/schedule").reply(&api).await;
  assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);

  let resp = warp::test::request().method("GET").path("/nope").reply(&api).await;
  assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn update_validates_id_and_status() {
  let home = TempDir::new().unwrap();
  let state = state(None, home.path());
  let task = state.registry.schedule_task("acme", "x", None).unwrap();
  let api = routes(state);

  let update = |body: Value| warp::test::request().method("POST").path("/tasks/update").json(&body);

  let resp = update(json!({"id": "missing", "status": "completed"})).reply(&api).await;
  assert_eq!(resp.status(), StatusCode::NOT_FOUND);

  let resp = update(json!({"id": task.id, "status": "exploded"})).reply(&api).await;
  assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

  let resp = update(json!({"id": task.id})).reply(&api).await;
  assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

  let resp = update(json!({"id": task.id, "status": "completed"})).reply(&api).await;
  assert_eq!(resp.status(), StatusCode::OK);
  assert_eq!(body(&resp)["status"], "completed");
}

#[tokio::test]
async fn task_logs_round_trip() {
  let home = TempDir::new().unwrap();
  let api = routes(state(None, home.path()));

  let post = |line: &str| {
    warp::test::request()
      .method("POST")
      .path("/tasks/log")
      .json(&json!({"id": "t1", "line": line}))
  };
  assert_eq!(post("first").reply(&api).await.status(), StatusCode::NO_CONTENT);
  assert_eq!(post("").reply(&api).await.status(), StatusCode::NO_CONTENT);
  assert_eq!(post("second").reply(&api).await.status(), StatusCode::NO_CONTENT);

  let resp = warp::test::request().method("GET").path("/tasks/logs?id=t1").reply(&api).await;
  assert_eq!(resp.status(), StatusCode::OK);
  let logs = body(&resp);
  assert_eq!(logs["id"], "t1");
  let lines = logs["lines"].as_array().unwrap();
  assert_eq!(lines.len(), 2);
  assert!(lines[0].as_str().unwrap().ends_with(" first"));
  assert!(lines[1].as_str().unwrap().ends_with(" second"));

  let resp = warp::test::request().method("GET").path("/tasks/logs").reply(&api).await;
  assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

  let resp = warp::test::request().method("GET").path("/tasks/logs?id=unknown").reply(&api).await;
  assert_eq!(body(&resp)["lines"], json!([]));
}

#[tokio::test]
async fn status_and_cancel() {
  let home = TempDir::new().unwrap();
  let state = state(None, home.path());
  let open = state.registry.schedule_task("acme", "x", None).unwrap();
  let done = state.registry.schedule_task("acme", "y", None).unwrap();
  state
    .registry
    .update_status(&done.id, orchestrator::models::TaskStatus::Completed)
    .unwrap();
  let api = routes(state);

  let resp = warp::test::request()
    .method("GET")
    .path(&format!("/tasks/status?id={}", open.id))
    .reply(&api)
    .await;
  assert_eq!(resp.status(), StatusCode::OK);
  assert_eq!(body(&resp)["task"]["status"], "scheduled");

  let resp = warp::test::request().method("GET").path("/tasks/status?id=nope").reply(&api).await;
  assert_eq!(resp.status(), StatusCode::NOT_FOUND);

  let cancel = |id: &str| {
    warp::test::request()
      .method("POST")
      .path("/tasks/cancel")
      .json(&json!({ "id": id }))
  };
  for _ in 0..2 {
    let resp = cancel(&open.id).reply(&api).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body(&resp)["status"], "cancelled");
  }
  assert_eq!(cancel(&done.id).reply(&api).await.status(), StatusCode::BAD_REQUEST);
  assert_eq!(cancel("nope").reply(&api).await.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn agents_register_heartbeat_and_log() {
  let home = TempDir::new().unwrap();
  let api = routes(state(None, home.path()));

  let resp = warp::test::request()
    .method("POST")
    .path("/agents/register")
    .json(&json!({"name": "host-1", "org": "acme", "labels": {"zone": "a"}}))
    .reply(&api)
    .await;
  assert_eq!(resp.status(), StatusCode::OK);
  assert_eq!(body(&resp)["status"], "idle");

  let resp = warp::test::request()
    .method("POST")
    .path("/agents/heartbeat")
    .json(&json!({"name": "host-1", "status": "running"}))
    .reply(&api)
    .await;
  assert_eq!(body(&resp), json!({"ok": "1"}));

  let resp = warp::test::request()
    .method("POST")
    .path("/agents/register")
    .json(&json!({"name": "host-2"}))
    .reply(&api)
    .await;
  assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

  let resp = warp::test::request().method("GET").path("/agents").reply(&api).await;
  let agents = body(&resp);
  assert_eq!(agents.as_array().unwrap().len(), 1);
  assert_eq!(agents[0]["status"], "running");
  assert_eq!(agents[0]["org"], "acme");
  assert_eq!(agents[0]["labels"]["zone"], "a");

  let resp = warp::test::request()
    .method("POST")
    .path("/agents/log")
    .json(&json!({"name": "host-1", "line": "context pulled"}))
    .reply(&api)
    .await;
  assert_eq!(resp.status(), StatusCode::NO_CONTENT);

  let resp = warp::test::request().method("GET").path("/agents/logs?name=host-1").reply(&api).await;
  let logs = body(&resp);
  assert_eq!(logs["name"], "host-1");
  assert!(logs["lines"][0].as_str().unwrap().ends_with(" context pulled"));
}

#[tokio::test]
async fn prepare_checks_auth_input_and_credentials() {
  let home = TempDir::new().unwrap();
  let api = routes(state(Some("s3cret"), home.path()));

  let prepare = |org: Option<&str>| {
    let req = warp::test::request().method("POST").path("/k8s/prepare");
    match org {
      Some(org) => req.header("x-auth-token", "s3cret").json(&json!({ "org": org })),
      None => req.header("x-auth-token", "s3cret").json(&json!({})),
    }
  };

  let resp = warp::test::request()
    .method("POST")
    .path("/k8s/prepare")
    .json(&json!({"org": "acme"}))
    .reply(&api)
    .await;
  assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

  let resp = prepare(None).reply(&api).await;
  assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
  assert_eq!(body(&resp)["error"], "missing org");

  let resp = prepare(Some("acme")).reply(&api).await;
  assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
  assert!(body(&resp)["error"].as_str().unwrap().contains("acme"));
}

#[tokio::test]
async fn cluster_reads_require_org_and_name() {
  let home = TempDir::new().unwrap();
  let api = routes(state(None, home.path()));

  let resp = warp::test::request().method("GET").path("/k8s/status?org=acme").reply(&api).await;
  assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

  let resp = warp::test::request()
    .method("GET")
    .path("/k8s/status?org=acme&name=agent&wait=5")
    .reply(&api)
    .await;
  assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
  assert!(body(&resp)["error"].as_str().unwrap().contains("acme"));

  let resp = warp::test::request().method("GET").path("/agenttasks?name=t").reply(&api).await;
  assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

  let resp = warp::test::request()
    .method("POST")
    .path("/agenttasks")
    .json(&json!({"org": "acme"}))
    .reply(&api)
    .await;
  assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
  assert_eq!(body(&resp)["error"], "missing task");
}

#[tokio::test]
async fn task_events_stream_backlog_then_live_lines() {
  let home = TempDir::new().unwrap();
  let state = state(None, home.path());
  let registry = state.registry.clone();
  registry.append_task_log("t1", "before");

  let (addr, server) = warp::serve(routes(state)).bind_ephemeral(([127, 0, 0, 1], 0));
  tokio::spawn(server);

  let mut resp = reqwest::get(format!("http://{}/events/tasks?id=t1", addr)).await.unwrap();
  assert_eq!(resp.status(), reqwest::StatusCode::OK);
  assert!(
    resp.headers()["content-type"]
      .to_str()
      .unwrap()
      .starts_with("text/event-stream")
  );

  let mut received = String::new();
  let read = async {
    let mut sent = false;
    while !received.contains("after") {
      let Some(chunk) = resp.chunk().await.unwrap() else {
        break;
      };
      received.push_str(&String::from_utf8_lossy(&chunk));
      if !sent && received.contains("before") {
        registry.append_task_log("t1", "after");
        sent = true;
      }
    }
  };
  tokio::time::timeout(Duration::from_secs(5), read).await.unwrap();

  let before = received.find("before").unwrap();
  let after = received.find("after").unwrap();
  assert!(before < after);
  assert!(received.contains("data:"));
}
