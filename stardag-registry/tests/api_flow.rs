//! End-to-end scenarios against a served registry: build lifecycle, task
//! deduplication, lock contention and the concurrency cap, over HTTP with
//! API-key and internal-token auth.

use std::path::PathBuf;

use serde_json::{json, Value};
use tempfile::TempDir;

use stardag_registry::api::{app, AppState};
use stardag_registry::auth::internal::mint_internal_token;
use stardag_registry::config::ServerConfig;
use stardag_registry::store::orgs::{DEFAULT_ENVIRONMENT_ID, DEFAULT_WORKSPACE_ID};
use stardag_registry::store::Store;

const TEST_SECRET: &str = "test-internal-secret";

struct TestServer {
    _dir: TempDir,
    base_url: String,
    store: Store,
    client: reqwest::Client,
    api_key: String,
}

impl TestServer {
    async fn spawn() -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("registry.redb");
        let store = Store::open(&db_path).unwrap();

        let config = ServerConfig {
            bind_addr: String::new(),
            db_path: PathBuf::from(db_path),
            oidc_issuer: "https://issuer.invalid".to_string(),
            oidc_client_id: "stardag-test".to_string(),
            oidc_audience: "stardag-test".to_string(),
            internal_token_secret: TEST_SECRET.to_string(),
            internal_token_ttl_seconds: 600,
            max_workspaces_per_user: 10,
        };
        let state = AppState::new(store.clone(), config);
        let router = app(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let (_, api_key) = store
            .create_api_key(DEFAULT_ENVIRONMENT_ID, "tests", None)
            .unwrap();

        Self {
            _dir: dir,
            base_url: format!("http://{addr}/api/v1"),
            store,
            client: reqwest::Client::new(),
            api_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("x-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn post_empty(&self, path: &str) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header("x-api-key", &self.api_key)
            .json(&json!({}))
            .send()
            .await
            .unwrap()
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .unwrap()
    }

    async fn create_build(&self, roots: &[&str]) -> String {
        let response = self
            .post("/builds", json!({ "root_task_ids": roots }))
            .await;
        assert_eq!(response.status(), 201);
        response.json::<Value>().await.unwrap()["id"]
            .as_str()
            .unwrap()
            .to_string()
    }

    async fn register_task(&self, build_id: &str, task_id: &str, deps: &[&str]) {
        let response = self
            .post(
                &format!("/builds/{build_id}/tasks"),
                json!({
                    "task_id": task_id,
                    "task_namespace": "demo",
                    "task_name": format!("Task-{task_id}"),
                    "task_data": { "id": task_id },
                    "dependency_task_ids": deps,
                }),
            )
            .await;
        assert_eq!(response.status(), 201);
    }
}

#[tokio::test]
async fn health_needs_no_auth() {
    let server = TestServer::spawn().await;
    let response = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn sdk_routes_reject_missing_and_bogus_credentials() {
    let server = TestServer::spawn().await;

    let bare = reqwest::get(server.url("/builds")).await.unwrap();
    assert_eq!(bare.status(), 401);

    let bogus = server
        .client
        .get(server.url("/builds"))
        .header("x-api-key", "sk_bogus0-not-real")
        .send()
        .await
        .unwrap();
    assert_eq!(bogus.status(), 401);
}

#[tokio::test]
async fn full_build_flow_with_graph() {
    let server = TestServer::spawn().await;
    let build_id = server.create_build(&["a", "b"]).await;

    server.register_task(&build_id, "a", &[]).await;
    server.register_task(&build_id, "b", &["a"]).await;

    for task in ["a", "b"] {
        let started = server
            .post_empty(&format!("/builds/{build_id}/tasks/{task}/start"))
            .await;
        assert_eq!(started.status(), 200);
        let completed = server
            .post_empty(&format!("/builds/{build_id}/tasks/{task}/complete"))
            .await;
        assert_eq!(completed.status(), 200);
        let body: Value = completed.json().await.unwrap();
        assert_eq!(body["status"], "completed");
    }

    let done = server
        .post_empty(&format!("/builds/{build_id}/complete"))
        .await;
    assert_eq!(done.status(), 200);

    let build: Value = server
        .get(&format!("/builds/{build_id}"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(build["status"], "completed");
    assert!(build["started_at"].is_string());
    assert!(build["completed_at"].is_string());

    let graph: Value = server
        .get(&format!("/builds/{build_id}/graph"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(graph["nodes"].as_array().unwrap().len(), 2);
    let edges = graph["edges"].as_array().unwrap();
    assert_eq!(edges.len(), 1);
    assert_eq!(edges[0]["upstream"], "a");
    assert_eq!(edges[0]["downstream"], "b");

    let events: Value = server
        .get(&format!("/builds/{build_id}/events"))
        .await
        .json()
        .await
        .unwrap();
    let kinds: Vec<&str> = events
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();
    assert_eq!(kinds.first(), Some(&"BUILD_STARTED"));
    assert_eq!(kinds.last(), Some(&"BUILD_COMPLETED"));
}

#[tokio::test]
async fn failed_task_marks_build_failed() {
    let server = TestServer::spawn().await;
    let build_id = server.create_build(&["t"]).await;
    server.register_task(&build_id, "t", &[]).await;

    server
        .post_empty(&format!("/builds/{build_id}/tasks/t/start"))
        .await;
    let failed = server
        .post_empty(&format!(
            "/builds/{build_id}/tasks/t/fail?error_message=boom"
        ))
        .await;
    assert_eq!(failed.status(), 200);
    let body: Value = failed.json().await.unwrap();
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error_message"], "boom");

    server
        .post_empty(&format!("/builds/{build_id}/fail?error_message=boom"))
        .await;
    let build: Value = server
        .get(&format!("/builds/{build_id}"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(build["status"], "failed");
}

#[tokio::test]
async fn task_registration_deduplicates_across_builds() {
    let server = TestServer::spawn().await;
    let first = server.create_build(&["abc"]).await;
    let second = server.create_build(&["abc"]).await;
    server.register_task(&first, "abc", &[]).await;
    server.register_task(&second, "abc", &[]).await;

    let tasks: Value = server.get("/tasks").await.json().await.unwrap();
    assert_eq!(tasks["total"], 1);
    assert_eq!(tasks["tasks"][0]["task_id"], "abc");
}

#[tokio::test]
async fn lock_contention_and_handoff() {
    let server = TestServer::spawn().await;

    let acquired = server
        .post(
            "/locks/task-x/acquire",
            json!({ "owner_id": "u1", "ttl_seconds": 60 }),
        )
        .await;
    assert_eq!(acquired.status(), 200);
    let body: Value = acquired.json().await.unwrap();
    assert_eq!(body["status"], "acquired");
    assert_eq!(body["acquired"], true);

    let contended = server
        .post(
            "/locks/task-x/acquire",
            json!({ "owner_id": "u2", "ttl_seconds": 60 }),
        )
        .await;
    assert_eq!(contended.status(), 423);
    let body: Value = contended.json().await.unwrap();
    assert_eq!(body["status"], "held_by_other");

    // Non-owner release is a conflict; owner release frees the lock.
    let wrong = server
        .post("/locks/task-x/release", json!({ "owner_id": "u2" }))
        .await;
    assert_eq!(wrong.status(), 409);
    let released = server
        .post("/locks/task-x/release", json!({ "owner_id": "u1" }))
        .await;
    assert_eq!(released.status(), 204);

    let retried = server
        .post(
            "/locks/task-x/acquire",
            json!({ "owner_id": "u2", "ttl_seconds": 60 }),
        )
        .await;
    assert_eq!(retried.status(), 200);

    let fetched: Value = server.get("/locks/task-x").await.json().await.unwrap();
    assert_eq!(fetched["owner_id"], "u2");
    assert_eq!(server.get("/locks/absent").await.status(), 404);
}

#[tokio::test]
async fn release_with_completion_records_the_event() {
    let server = TestServer::spawn().await;
    let build_id = server.create_build(&["t"]).await;
    server.register_task(&build_id, "t", &[]).await;

    server
        .post(
            "/locks/t/acquire",
            json!({ "owner_id": "u1", "ttl_seconds": 60 }),
        )
        .await;
    let released = server
        .post(
            "/locks/t/release",
            json!({ "owner_id": "u1", "completed_build_id": build_id }),
        )
        .await;
    assert_eq!(released.status(), 204);

    let tasks: Value = server
        .get(&format!("/builds/{build_id}/tasks"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(tasks[0]["status"], "completed");

    let completion: Value = server
        .get("/locks/tasks/t/completion-status")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(completion["is_completed"], true);

    // A later build skips the task via the completion check.
    let skip = server
        .post(
            "/locks/t/acquire",
            json!({ "owner_id": "u2", "ttl_seconds": 60, "check_task_completion": true }),
        )
        .await;
    assert_eq!(skip.status(), 200);
    let body: Value = skip.json().await.unwrap();
    assert_eq!(body["status"], "already_completed");
    assert_eq!(body["acquired"], false);
}

#[tokio::test]
async fn concurrency_cap_applies_to_foreign_owners_only() {
    let server = TestServer::spawn().await;
    let env = server
        .store
        .create_environment(
            DEFAULT_WORKSPACE_ID,
            &stardag_types::CreateEnvironmentRequest {
                name: "Capped".to_string(),
                slug: "capped".to_string(),
                description: None,
                owner_user_id: None,
                max_concurrent_locks: Some(2),
            },
        )
        .unwrap();
    let (_, capped_key) = server.store.create_api_key(&env.id, "capped", None).unwrap();

    let acquire = |name: &str, owner: &str| {
        let client = server.client.clone();
        let url = server.url(&format!("/locks/{name}/acquire"));
        let key = capped_key.clone();
        let owner = owner.to_string();
        async move {
            client
                .post(url)
                .header("x-api-key", key)
                .json(&json!({ "owner_id": owner, "ttl_seconds": 60 }))
                .send()
                .await
                .unwrap()
        }
    };

    assert_eq!(acquire("l1", "u1").await.status(), 200);
    assert_eq!(acquire("l2", "u2").await.status(), 200);
    assert_eq!(acquire("l3", "u3").await.status(), 429);
    // Re-entrant reacquire of an already-held lock is exempt.
    assert_eq!(acquire("l1", "u1").await.status(), 200);
}

#[tokio::test]
async fn internal_token_auth_requires_matching_environment() {
    let server = TestServer::spawn().await;
    let token = mint_internal_token(
        TEST_SECRET,
        stardag_registry::store::orgs::DEFAULT_USER_ID,
        DEFAULT_WORKSPACE_ID,
        600,
    )
    .unwrap();

    // Token auth without an environment id is a validation error.
    let missing = server
        .client
        .get(server.url("/builds"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 400);

    let listed = server
        .client
        .get(server.url(&format!(
            "/builds?environment_id={DEFAULT_ENVIRONMENT_ID}"
        )))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(listed.status(), 200);

    // UI surface: the token's workspace must match the path.
    let me = server
        .client
        .get(server.url("/ui/me"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(me.status(), 200);
    let body: Value = me.json().await.unwrap();
    assert_eq!(body["user"]["email"], "dev@localhost");

    let foreign = server
        .client
        .get(server.url("/ui/workspaces/some-other-workspace"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(foreign.status(), 403);
}

#[tokio::test]
async fn search_over_http_with_filters() {
    let server = TestServer::spawn().await;
    let build_id = server.create_build(&["t1", "t2"]).await;
    server.register_task(&build_id, "t1", &[]).await;
    server.register_task(&build_id, "t2", &[]).await;
    server
        .post_empty(&format!("/builds/{build_id}/tasks/t1/start"))
        .await;
    server
        .post_empty(&format!("/builds/{build_id}/tasks/t1/complete"))
        .await;

    let results: Value = server
        .get("/tasks/search?filter=status:=:completed")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(results["total"], 1);
    assert_eq!(results["tasks"][0]["task_id"], "t1");

    let keys: Value = server
        .get("/tasks/search/keys?prefix=param.")
        .await
        .json()
        .await
        .unwrap();
    assert!(keys["keys"]
        .as_array()
        .unwrap()
        .iter()
        .any(|k| k["key"] == "param.id"));

    let columns: Value = server
        .get("/tasks/search/columns")
        .await
        .json()
        .await
        .unwrap();
    assert!(columns["core"]
        .as_array()
        .unwrap()
        .iter()
        .any(|c| c == "task_name"));
}
