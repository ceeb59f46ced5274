use std::sync::Arc;
use std::time::Duration;

use auth::{PermissionLookup, SESSION_TOKEN_HEADER, SessionValidator, TokenProvider};
use axum::body::{Body, to_bytes};
use axum::extract::Path;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use discovery::{StaticHosts, Url};
use schema::{SchemaVersionRange, record_from_json};
use serde_json::{Value, json};
use store::{MemoryStore, StorePool};
use tower::ServiceExt;
use whisperer::clients::{self, GatekeeperClient, SeagullClient, ShorelineClient};
use whisperer::groups::GroupResolver;
use whisperer::{Gateway, PipelineSettings, transport_axum::router};

const SERVER_SECRET: &str = "s3cret";
const GATEWAY_TOKEN: &str = "gateway-token";

async fn spawn_upstream(app: Router) -> Url {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have an address");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Url::parse(&format!("http://{addr}/")).expect("upstream url should parse")
}

fn carries_gateway_token(headers: &HeaderMap) -> bool {
    headers
        .get(SESSION_TOKEN_HEADER)
        .is_some_and(|value| value == GATEWAY_TOKEN)
}

fn session_service() -> Router {
    async fn server_login(headers: HeaderMap) -> Response {
        let name_ok = headers
            .get(clients::SERVER_NAME_HEADER)
            .is_some_and(|value| value == "tide-whisperer");
        let secret_ok = headers
            .get(clients::SERVER_SECRET_HEADER)
            .is_some_and(|value| value == SERVER_SECRET);
        if name_ok && secret_ok {
            (StatusCode::OK, [(SESSION_TOKEN_HEADER, GATEWAY_TOKEN)]).into_response()
        } else {
            StatusCode::UNAUTHORIZED.into_response()
        }
    }

    async fn check_token(Path(token): Path<String>, headers: HeaderMap) -> Response {
        if !carries_gateway_token(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        match token.as_str() {
            "alice-token" => Json(json!({"userid": "alice", "isserver": false})).into_response(),
            "bob-token" => Json(json!({"userid": "bob", "isserver": false})).into_response(),
            "carol-token" => Json(json!({"userid": "carol", "isserver": false})).into_response(),
            "uploader-token" => Json(json!({"userid": "uploader", "isserver": true})).into_response(),
            "odd/token?v=1" => Json(json!({"userid": "odd", "isserver": false})).into_response(),
            _ => StatusCode::NOT_FOUND.into_response(),
        }
    }

    Router::new()
        .route("/serverlogin", post(server_login))
        .route("/token/:token", get(check_token))
}

fn permission_service() -> Router {
    async fn access(Path((group_id, user_id)): Path<(String, String)>, headers: HeaderMap) -> Response {
        if !carries_gateway_token(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        match (group_id.as_str(), user_id.as_str()) {
            ("alice", "bob") => Json(json!({"view": {}})).into_response(),
            ("alice", "carol") => Json(json!({"note": {}})).into_response(),
            _ => StatusCode::NOT_FOUND.into_response(),
        }
    }

    Router::new().route("/access/:group_id/:user_id", get(access))
}

fn metadata_service() -> Router {
    async fn private_pair(Path((user_id, hash_name)): Path<(String, String)>, headers: HeaderMap) -> Response {
        if !carries_gateway_token(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        match (user_id.as_str(), hash_name.as_str()) {
            ("alice", "uploads") => Json(json!({"ID": "g-alice", "Value": "hashed"})).into_response(),
            ("blank", "uploads") => Json(json!({"ID": "", "Value": ""})).into_response(),
            _ => StatusCode::NOT_FOUND.into_response(),
        }
    }

    Router::new().route("/:user_id/private/:hash_name", get(private_pair))
}

struct Upstreams {
    shoreline: Arc<ShorelineClient>,
    gatekeeper: Arc<GatekeeperClient>,
    seagull: Arc<SeagullClient>,
}

async fn upstreams(secret: &str) -> Upstreams {
    let http = clients::http_client(Duration::from_secs(2)).expect("http client should build");
    let shoreline = Arc::new(ShorelineClient::new(
        Arc::new(StaticHosts::single(spawn_upstream(session_service()).await)),
        http.clone(),
        "tide-whisperer",
        secret,
    ));
    let gatekeeper = Arc::new(GatekeeperClient::new(
        Arc::new(StaticHosts::single(spawn_upstream(permission_service()).await)),
        http.clone(),
        shoreline.clone(),
    ));
    let seagull = Arc::new(SeagullClient::new(
        Arc::new(StaticHosts::single(spawn_upstream(metadata_service()).await)),
        http,
    ));
    Upstreams {
        shoreline,
        gatekeeper,
        seagull,
    }
}

fn gateway(upstreams: &Upstreams) -> Arc<Gateway> {
    let store = MemoryStore::with_documents([
        record_from_json(json!({
            "_id": "d-1", "_groupId": "g-alice", "_active": true, "_schemaVersion": 1,
            "type": "smbg", "value": 5.5, "time": "2015-10-01T00:00:00.000Z"
        }))
        .expect("fixture"),
    ]);
    Arc::new(Gateway::new(
        upstreams.shoreline.clone(),
        upstreams.shoreline.clone(),
        upstreams.gatekeeper.clone(),
        upstreams.seagull.clone(),
        StorePool::new(Arc::new(store), 2),
        PipelineSettings {
            schema_versions: SchemaVersionRange::new(0, 99).expect("valid range"),
            upstream_timeout: Duration::from_secs(2),
            store_timeout: Duration::from_secs(2),
        },
    ))
}

async fn get_data(gateway: Arc<Gateway>, uri: &str, token: &str) -> (StatusCode, Value) {
    let response = router(gateway)
        .oneshot(
            Request::builder()
                .uri(uri)
                .header(SESSION_TOKEN_HEADER, token)
                .body(Body::empty())
                .expect("request should build"),
        )
        .await
        .expect("router should respond");
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should collect");
    (status, serde_json::from_slice(&body).expect("body should be JSON"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn server_login_stores_token_from_response_header() {
    let upstreams = upstreams(SERVER_SECRET).await;
    assert_eq!(upstreams.shoreline.server_token(), None);

    upstreams.shoreline.login().await.expect("login should succeed");
    assert_eq!(upstreams.shoreline.server_token().as_deref(), Some(GATEWAY_TOKEN));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_secret_leaves_gateway_without_token() {
    let upstreams = upstreams("wrong").await;
    assert!(upstreams.shoreline.login().await.is_err());
    assert_eq!(upstreams.shoreline.server_token(), None);

    // Without a server token no caller token can be checked.
    assert_eq!(upstreams.shoreline.validate("alice-token").await, None);
    let (status, body) = get_data(gateway(&upstreams), "/alice", "alice-token").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "data_cant_view");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_check_distinguishes_users_and_servers() {
    let upstreams = upstreams(SERVER_SECRET).await;
    upstreams.shoreline.login().await.expect("login should succeed");

    let alice = upstreams
        .shoreline
        .check_token("alice-token")
        .await
        .expect("check should succeed")
        .expect("alice should be recognised");
    assert_eq!(alice.subject_user_id, "alice");
    assert!(!alice.is_server);

    let uploader = upstreams
        .shoreline
        .validate("uploader-token")
        .await
        .expect("uploader should be recognised");
    assert!(uploader.is_server);

    assert_eq!(upstreams.shoreline.validate("forged").await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn token_with_reserved_characters_stays_in_one_path_segment() {
    let upstreams = upstreams(SERVER_SECRET).await;
    upstreams.shoreline.login().await.expect("login should succeed");

    let odd = upstreams
        .shoreline
        .validate("odd/token?v=1")
        .await
        .expect("encoded token should reach the token route intact");
    assert_eq!(odd.subject_user_id, "odd");

    // Unencoded, this would have asked for `/token/alice-token`.
    assert_eq!(upstreams.shoreline.validate("x/../alice-token").await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn permission_lookup_treats_not_found_as_no_permissions() {
    let upstreams = upstreams(SERVER_SECRET).await;
    upstreams.shoreline.login().await.expect("login should succeed");

    let granted = upstreams
        .gatekeeper
        .user_in_group("bob", "alice")
        .await
        .expect("lookup should succeed");
    assert!(granted.grants("view"));

    let none = upstreams
        .gatekeeper
        .user_in_group("mallory", "alice")
        .await
        .expect("not found should be an empty set");
    assert!(none.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn group_resolution_reads_uploads_pair() {
    let upstreams = upstreams(SERVER_SECRET).await;

    let group = upstreams
        .seagull
        .resolve_group_id("alice", GATEWAY_TOKEN)
        .await
        .expect("alice has a group");
    assert_eq!(group.as_str(), "g-alice");

    assert_eq!(upstreams.seagull.resolve_group_id("blank", GATEWAY_TOKEN).await, None);
    assert_eq!(upstreams.seagull.resolve_group_id("ghost", GATEWAY_TOKEN).await, None);
    assert_eq!(upstreams.seagull.resolve_group_id("alice", "not-a-server").await, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shared_viewer_reads_data_through_real_clients() {
    let upstreams = upstreams(SERVER_SECRET).await;
    upstreams.shoreline.login().await.expect("login should succeed");

    let (status, body) = get_data(gateway(&upstreams), "/alice", "bob-token").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([{"type": "smbg", "value": 5.5, "time": "2015-10-01T00:00:00.000Z"}])
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn viewer_without_view_grant_is_forbidden() {
    let upstreams = upstreams(SERVER_SECRET).await;
    upstreams.shoreline.login().await.expect("login should succeed");

    let (status, body) = get_data(gateway(&upstreams), "/alice", "carol-token").await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "data_cant_view");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_uploads_pair_is_a_permissions_error() {
    let upstreams = upstreams(SERVER_SECRET).await;
    upstreams.shoreline.login().await.expect("login should succeed");

    let (status, body) = get_data(gateway(&upstreams), "/ghost", "uploader-token").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["code"], "data_perms_error");
}
