use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};

use super::router;
use crate::{
    repositories::Repositories,
    services::{
        spawn_services,
        verification::{CodeNotifier, CodePurpose},
        ServiceError,
    },
    settings::Settings,
    utils::SystemClock,
};

#[derive(Default)]
struct Outbox {
    codes: Mutex<Vec<(String, String)>>,
}

impl Outbox {
    fn code_for(&self, email: &str) -> String {
        self.codes
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(to, _)| to == email)
            .map(|(_, code)| code.clone())
            .unwrap()
    }
}

#[async_trait]
impl CodeNotifier for Outbox {
    async fn deliver(&self, email: &str, code: &str, _: CodePurpose) -> Result<(), ServiceError> {
        self.codes
            .lock()
            .unwrap()
            .push((email.to_string(), code.to_string()));
        Ok(())
    }
}

struct TestServer {
    base: String,
    client: Client,
    outbox: Arc<Outbox>,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(configure: impl FnOnce(&mut Settings)) -> Self {
        let mut settings = Settings::defaults().unwrap();
        settings.auth.hash_memory_kib = 1024;
        settings.auth.hash_iterations = 1;
        configure(&mut settings);

        let outbox = Arc::new(Outbox::default());
        let state = spawn_services(
            &Repositories::in_memory(),
            &settings,
            Arc::new(SystemClock),
            outbox.clone(),
        )
        .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });

        TestServer {
            base: format!("http://{}", address),
            client: Client::new(),
            outbox,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn post(&self, path: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut request = self.client.post(self.url(path)).json(&body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        read(request.send().await.unwrap()).await
    }

    async fn put(&self, path: &str, token: &str, body: Value) -> (StatusCode, Value) {
        let response = self
            .client
            .put(self.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap();
        read(response).await
    }

    async fn get(&self, path: &str, token: Option<&str>) -> (StatusCode, Value) {
        let mut request = self.client.get(self.url(path));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        read(request.send().await.unwrap()).await
    }

    /// Registers an account and returns `(token, user id)`.
    async fn register(&self, email: &str, role: &str) -> (String, String) {
        let (status, body) = self
            .post(
                "/api/auth/register",
                None,
                json!({"name": "Ada", "email": email, "password": "pw", "role": role}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);

        (
            body["token"].as_str().unwrap().to_string(),
            body["userId"].as_str().unwrap().to_string(),
        )
    }

    async fn create_campaign(&self, token: &str, goal: Value) -> String {
        let (status, body) = self
            .post(
                "/api/campaigns",
                Some(token),
                json!({
                    "title": "Clean water",
                    "description": "Wells for the valley",
                    "goal": goal,
                    "category": "community",
                    "imageKey": "well.png"
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);

        body["id"].as_str().unwrap().to_string()
    }
}

async fn read(response: reqwest::Response) -> (StatusCode, Value) {
    let status = response.status();
    let body = response.json::<Value>().await.unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn root_and_health_respond() {
    let server = TestServer::start().await;

    let (status, body) = server.get("/", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Welcome to Funderr API");

    let (status, body) = server.get("/api/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok", "storage": "memory"}));
}

#[tokio::test]
async fn duplicate_registration_is_refused() {
    let server = TestServer::start().await;
    server.register("ada@x.com", "donor").await;

    let (status, body) = server
        .post(
            "/api/auth/register",
            None,
            json!({"name": "Ada", "email": "ada@x.com", "password": "pw"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Email already in use");

    let (status, _) = server
        .post("/api/auth/register", None, json!({"email": "b@x.com"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn malformed_bodies_are_not_reported_as_missing() {
    let server = TestServer::start().await;

    let (status, body) = server
        .post(
            "/api/auth/register",
            None,
            json!({"name": "Ada", "email": "ada@x.com", "password": "pw", "role": "user"}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let text = body["message"].as_str().unwrap();
    assert!(text.starts_with("Invalid request body"), "{}", text);
    assert!(text.contains("role"), "{}", text);

    let response = server
        .client
        .post(server.url("/api/auth/login"))
        .header("content-type", "application/json")
        .body("{\"email\": ")
        .send()
        .await
        .unwrap();
    let (status, body) = read(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().starts_with("Invalid request body"));

    let response = server
        .client
        .post(server.url("/api/auth/login"))
        .send()
        .await
        .unwrap();
    let (status, body) = read(response).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid request: missing body");
}

#[tokio::test]
async fn login_with_wrong_password_gets_no_token() {
    let server = TestServer::start().await;
    server.register("ada@x.com", "donor").await;

    let (status, body) = server
        .post(
            "/api/auth/login",
            None,
            json!({"email": "ada@x.com", "password": "wrong"}),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body.get("token").is_none());

    let (status, body) = server
        .post(
            "/api/auth/login",
            None,
            json!({"email": "ada@x.com", "password": "pw"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["role"], "donor");

    let token = body["token"].as_str().unwrap();
    let (status, body) = server
        .post("/api/auth/verify-token", None, json!({"token": token}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["valid"], true);

    let (status, body) = server
        .post("/api/auth/verify-token", None, json!({"token": "garbage"}))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["valid"], false);
}

#[tokio::test]
async fn protected_routes_need_a_valid_token() {
    let server = TestServer::start().await;

    let (status, body) = server.get("/api/campaigns", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Authorization token required");

    let (status, body) = server.get("/api/campaigns", Some("nope")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["message"], "Invalid or expired token");
}

#[tokio::test]
async fn non_admin_cannot_approve() {
    let server = TestServer::start().await;
    let (creator, _) = server.register("creator@x.com", "campaign_creator").await;
    let id = server.create_campaign(&creator, json!(100)).await;

    let (status, _) = server
        .put(&format!("/api/campaigns/{}/approve", id), &creator, json!({}))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (_, campaigns) = server.get("/api/campaigns", Some(&creator)).await;
    assert_eq!(campaigns[0]["status"], "pending");
}

#[tokio::test]
async fn moderation_moves_pending_campaigns_once() {
    let server = TestServer::start().await;
    let (admin, _) = server.register("admin@x.com", "admin").await;
    let (creator, creator_id) = server.register("creator@x.com", "campaign_creator").await;
    let first = server.create_campaign(&creator, json!(100)).await;
    let second = server.create_campaign(&creator, json!("50")).await;

    let (status, body) = server
        .put(&format!("/api/campaigns/{}/approve", first), &admin, json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "approved");

    let (status, _) = server
        .put(&format!("/api/campaigns/{}/reject", first), &admin, json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = server
        .put(&format!("/api/campaigns/{}/reject", second), &admin, json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["rejectionReason"], "Not approved by admin");

    let (status, _) = server
        .put("/api/campaigns/missing/approve", &admin, json!({}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, approved) = server
        .get("/api/campaigns?status=approved", Some(&creator))
        .await;
    assert_eq!(approved.as_array().unwrap().len(), 1);
    assert_eq!(approved[0]["id"], first.as_str());

    let (status, _) = server
        .get("/api/campaigns?status=finished", Some(&creator))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, mine) = server
        .get(&format!("/api/campaigns/user/{}", creator_id), Some(&creator))
        .await;
    assert_eq!(mine.as_array().unwrap().len(), 2);
    // Newest first.
    assert_eq!(mine[0]["id"], second.as_str());
}

#[tokio::test]
async fn resubmission_is_off_by_default() {
    let server = TestServer::start().await;
    let (admin, _) = server.register("admin@x.com", "admin").await;
    let (creator, _) = server.register("creator@x.com", "campaign_creator").await;
    let id = server.create_campaign(&creator, json!(100)).await;
    server
        .put(&format!("/api/campaigns/{}/reject", id), &admin, json!({"reason": "Blurry photo"}))
        .await;

    let (status, _) = server
        .put(&format!("/api/campaigns/{}/resubmit", id), &creator, json!({}))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let enabled = TestServer::start_with(|s| s.campaigns.allow_resubmission = true).await;
    let (admin, _) = enabled.register("admin@x.com", "admin").await;
    let (creator, _) = enabled.register("creator@x.com", "campaign_creator").await;
    let id = enabled.create_campaign(&creator, json!(100)).await;
    enabled
        .put(&format!("/api/campaigns/{}/reject", id), &admin, json!({}))
        .await;

    let (status, body) = enabled
        .put(&format!("/api/campaigns/{}/resubmit", id), &creator, json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending");
}

#[tokio::test]
async fn donations_fill_and_retire_a_campaign() {
    let server = TestServer::start().await;
    let (creator, _) = server.register("creator@x.com", "campaign_creator").await;
    let (donor, _) = server.register("donor@x.com", "donor").await;
    let id = server.create_campaign(&creator, json!(100)).await;
    let donate = format!("/api/campaigns/{}/donate", id);

    let (status, body) = server.post(&donate, Some(&donor), json!({"amount": 80})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["campaign"]["raised"], 80.0);
    assert_eq!(body["completed"], false);

    let (_, listed) = server.get("/api/campaigns", Some(&donor)).await;
    assert_eq!(listed.as_array().unwrap().len(), 1);

    let (status, _) = server.post(&donate, Some(&donor), json!({"amount": 30})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = server.post(&donate, Some(&donor), json!({"amount": 0})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = server.post(&donate, Some(&donor), json!({"amount": 20})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["campaign"]["raised"], 100.0);
    assert_eq!(body["completed"], true);

    let (_, listed) = server.get("/api/campaigns", Some(&donor)).await;
    assert!(listed.as_array().unwrap().is_empty());

    let (status, _) = server.post(&donate, Some(&donor), json!({"amount": 1})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn rejected_campaigns_refuse_donations() {
    let server = TestServer::start().await;
    let (admin, _) = server.register("admin@x.com", "admin").await;
    let (creator, creator_id) = server.register("creator@x.com", "campaign_creator").await;
    let (donor, _) = server.register("donor@x.com", "donor").await;
    let id = server.create_campaign(&creator, json!(100)).await;

    let (status, _) = server
        .put(&format!("/api/campaigns/{}/reject", id), &admin, json!({}))
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = server
        .post(
            &format!("/api/campaigns/{}/donate", id),
            Some(&donor),
            json!({"amount": 100}),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["message"], "Campaign is rejected and cannot take donations");

    let (_, mine) = server
        .get(&format!("/api/campaigns/user/{}", creator_id), Some(&creator))
        .await;
    assert_eq!(mine.as_array().unwrap().len(), 1);
    assert_eq!(mine[0]["status"], "rejected");
    assert_eq!(mine[0]["raised"], 0.0);
}

#[tokio::test]
async fn profiles_are_private_to_their_owner() {
    let server = TestServer::start().await;
    let (ada, ada_id) = server.register("ada@x.com", "donor").await;
    let (_, bob_id) = server.register("bob@x.com", "donor").await;

    let (status, body) = server.get(&format!("/api/users/{}", ada_id), Some(&ada)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["email"], "ada@x.com");
    assert!(body.get("passwordHash").is_none());
    assert!(body.get("password_hash").is_none());

    let (status, body) = server.get(&format!("/api/users/{}", bob_id), Some(&ada)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["message"], "Access denied");

    let (status, body) = server
        .put(
            &format!("/api/users/{}", ada_id),
            &ada,
            json!({"organization": "Analytical Engines", "email": "evil@x.com"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["organization"], "Analytical Engines");
    assert_eq!(body["email"], "ada@x.com");
}

#[tokio::test]
async fn password_reset_round_trip() {
    let server = TestServer::start().await;
    server.register("ada@x.com", "donor").await;

    let (status, _) = server
        .post(
            "/api/auth/request-password-reset",
            None,
            json!({"email": "ghost@x.com"}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server
        .post(
            "/api/auth/request-password-reset",
            None,
            json!({"email": "ada@x.com"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let code = server.outbox.code_for("ada@x.com");

    let (status, _) = server
        .post(
            "/api/auth/verify-reset-code",
            None,
            json!({"email": "ada@x.com", "code": code}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let reset = json!({"email": "ada@x.com", "code": code, "newPassword": "fresh"});
    let (status, body) = server.post("/api/auth/reset-password", None, reset.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Password reset successful");

    let (status, body) = server.post("/api/auth/reset-password", None, reset).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid or expired code");

    let (status, _) = server
        .post(
            "/api/auth/login",
            None,
            json!({"email": "ada@x.com", "password": "fresh"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn signup_code_flow() {
    let server = TestServer::start().await;
    server.register("taken@x.com", "donor").await;

    let (status, body) = server
        .post("/api/auth/send-signup-code", None, json!({"email": "taken@x.com"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Email already in use");

    let (status, _) = server
        .post("/api/auth/send-signup-code", None, json!({"email": "new@x.com"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    let code = server.outbox.code_for("new@x.com");

    let (status, _) = server
        .post(
            "/api/auth/verify-signup-code",
            None,
            json!({"email": "new@x.com", "code": code}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = server
        .post(
            "/api/auth/verify-signup-code",
            None,
            json!({"email": "other@x.com", "code": code}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "Invalid or expired code");
}
