// REST surface over the memory store and broker
//
// Verifies:
// - Bearer token required, participants only
// - Thread creation deduplicates direct threads
// - Durable send is idempotent on the client token (201 then 200)
// - History paging, cursor validation
// - Read cursor and unread count
// - Archived threads reject sends

use actix_web::{http::StatusCode, test, web, App};
use dm_sync_service::broker::MemoryBroker;
use dm_sync_service::config::Config;
use dm_sync_service::middleware::{Claims, JwtVerifier};
use dm_sync_service::routes::configure_routes;
use dm_sync_service::state::AppState;
use dm_sync_service::store::MemoryMessageStore;
use error_types::ErrorResponse;
use event_schema::{MessageDto, MessagePage, ReceiptAdvance, ThreadDto, UnreadCount};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

const SECRET: &str = "test-secret";

fn token_for(user: Uuid) -> String {
    let claims = Claims {
        sub: user.to_string(),
        exp: (chrono::Utc::now().timestamp() + 3600) as usize,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .unwrap()
}

fn bearer(user: Uuid) -> (&'static str, String) {
    ("Authorization", format!("Bearer {}", token_for(user)))
}

fn test_state() -> AppState {
    let config = Config::test_defaults();
    let jwt = JwtVerifier::from_key(&config.jwt_key).unwrap();
    AppState::new(
        Arc::new(MemoryMessageStore::new()),
        Arc::new(MemoryBroker::new()),
        jwt,
        Arc::new(config),
    )
}

macro_rules! app {
    ($state:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($state.clone()))
                .configure(configure_routes),
        )
        .await
    };
}

#[actix_web::test]
async fn test_health() {
    let state = test_state();
    let app = app!(state);
    let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[actix_web::test]
async fn test_requests_without_token_are_unauthorized() {
    let state = test_state();
    let app = app!(state);
    let req = test::TestRequest::get()
        .uri(&format!("/threads/{}/messages", Uuid::new_v4()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let req = test::TestRequest::get()
        .uri(&format!("/threads/{}/messages", Uuid::new_v4()))
        .insert_header(("Authorization", "Bearer not-a-jwt"))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
}

macro_rules! create_thread {
    ($app:expr, $creator:expr, $other:expr) => {{
        let req = test::TestRequest::post()
            .uri("/threads")
            .insert_header(bearer($creator))
            .set_json(json!({ "participant_ids": [$other] }))
            .to_request();
        let thread: ThreadDto = test::call_and_read_body_json(&$app, req).await;
        thread
    }};
}

#[actix_web::test]
async fn test_direct_thread_is_created_once() {
    let state = test_state();
    let app = app!(state);
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

    let first = create_thread!(app, a, b);
    let second = create_thread!(app, b, a);

    assert_eq!(first.id, second.id);
    let mut participants = first.participant_ids.clone();
    participants.sort();
    let mut expected = vec![a, b];
    expected.sort();
    assert_eq!(participants, expected);
}

#[actix_web::test]
async fn test_send_is_idempotent_on_client_token() {
    let state = test_state();
    let app = app!(state);
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let thread = create_thread!(app, a, b);
    let client_msg_id = Uuid::new_v4();
    let send = || {
        test::TestRequest::post()
            .uri(&format!("/threads/{}/messages", thread.id))
            .insert_header(bearer(a))
            .set_json(json!({ "client_msg_id": client_msg_id, "body": "hi" }))
            .to_request()
    };

    let resp = test::call_service(&app, send()).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let first: MessageDto = test::read_body_json(resp).await;

    let resp = test::call_service(&app, send()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let second: MessageDto = test::read_body_json(resp).await;

    assert_eq!(first, second);
    assert_eq!(first.client_msg_id, client_msg_id);
}

#[actix_web::test]
async fn test_non_participant_is_forbidden() {
    let state = test_state();
    let app = app!(state);
    let thread = create_thread!(app, Uuid::new_v4(), Uuid::new_v4());

    let req = test::TestRequest::get()
        .uri(&format!("/threads/{}/messages", thread.id))
        .insert_header(bearer(Uuid::new_v4()))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: ErrorResponse = test::read_body_json(resp).await;
    assert_eq!(body.code, "NOT_THREAD_PARTICIPANT");
}

#[actix_web::test]
async fn test_history_pages_backwards() {
    let state = test_state();
    let app = app!(state);
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let thread = create_thread!(app, a, b);

    for body in ["one", "two", "three"] {
        let req = test::TestRequest::post()
            .uri(&format!("/threads/{}/messages", thread.id))
            .insert_header(bearer(a))
            .set_json(json!({ "client_msg_id": Uuid::new_v4(), "body": body }))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::CREATED);
    }

    let req = test::TestRequest::get()
        .uri(&format!("/threads/{}/messages?limit=2", thread.id))
        .insert_header(bearer(b))
        .to_request();
    let newest: MessagePage = test::call_and_read_body_json(&app, req).await;
    let bodies: Vec<&str> = newest.messages.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["two", "three"]);
    assert!(newest.has_more);

    let cursor = newest.oldest_cursor().unwrap().encode();
    let req = test::TestRequest::get()
        .uri(&format!("/threads/{}/messages?before={cursor}", thread.id))
        .insert_header(bearer(b))
        .to_request();
    let older: MessagePage = test::call_and_read_body_json(&app, req).await;
    let bodies: Vec<&str> = older.messages.iter().map(|m| m.body.as_str()).collect();
    assert_eq!(bodies, vec!["one"]);
    assert!(!older.has_more);
}

#[actix_web::test]
async fn test_bad_cursor_and_combined_directions_are_rejected() {
    let state = test_state();
    let app = app!(state);
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let thread = create_thread!(app, a, b);

    let req = test::TestRequest::get()
        .uri(&format!("/threads/{}/messages?before=garbage", thread.id))
        .insert_header(bearer(a))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: ErrorResponse = test::read_body_json(resp).await;
    assert_eq!(body.code, "INVALID_CURSOR");

    let req = test::TestRequest::get()
        .uri(&format!(
            "/threads/{}/messages?before=1_1&after=1_1",
            thread.id
        ))
        .insert_header(bearer(a))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_read_cursor_clears_unread_count() {
    let state = test_state();
    let app = app!(state);
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let thread = create_thread!(app, a, b);

    let mut last: Option<MessageDto> = None;
    for body in ["ping", "ping again"] {
        let req = test::TestRequest::post()
            .uri(&format!("/threads/{}/messages", thread.id))
            .insert_header(bearer(a))
            .set_json(json!({ "client_msg_id": Uuid::new_v4(), "body": body }))
            .to_request();
        last = Some(test::call_and_read_body_json(&app, req).await);
    }
    let last = last.unwrap();

    let unread = || {
        test::TestRequest::get()
            .uri(&format!("/threads/{}/unread", thread.id))
            .insert_header(bearer(b))
            .to_request()
    };
    let count: UnreadCount = test::call_and_read_body_json(&app, unread()).await;
    assert_eq!(count.unread, 2);

    let req = test::TestRequest::post()
        .uri(&format!("/threads/{}/read", thread.id))
        .insert_header(bearer(b))
        .set_json(json!({ "up_to_message_id": last.id }))
        .to_request();
    let advance: ReceiptAdvance = test::call_and_read_body_json(&app, req).await;
    assert!(advance.cursor_advanced);

    let count: UnreadCount = test::call_and_read_body_json(&app, unread()).await;
    assert_eq!(count.unread, 0);
    assert_eq!(count.last_read_message_id, Some(last.id));
}

#[actix_web::test]
async fn test_archived_thread_rejects_sends() {
    let state = test_state();
    let app = app!(state);
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let thread = create_thread!(app, a, b);

    let req = test::TestRequest::post()
        .uri(&format!("/threads/{}/archive", thread.id))
        .insert_header(bearer(a))
        .to_request();
    let archived: ThreadDto = test::call_and_read_body_json(&app, req).await;
    assert!(archived.archived_at.is_some());

    let req = test::TestRequest::post()
        .uri(&format!("/threads/{}/messages", thread.id))
        .insert_header(bearer(a))
        .set_json(json!({ "client_msg_id": Uuid::new_v4(), "body": "late" }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::CONFLICT);
    let body: ErrorResponse = test::read_body_json(resp).await;
    assert_eq!(body.code, "THREAD_ARCHIVED");
}
