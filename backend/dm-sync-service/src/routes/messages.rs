use actix_web::{get, http::StatusCode, post, web, HttpResponse};
use event_schema::{Cursor, SendMessageRequest};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::AuthUser;
use crate::models::PageQuery;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// Cursor in `<micros>_<id>` form; returns messages strictly older
    pub before: Option<String>,
    /// Cursor in `<micros>_<id>` form; returns messages strictly newer
    pub after: Option<String>,
    pub limit: Option<i64>,
}

fn parse_cursor(raw: &str) -> Result<Cursor, AppError> {
    Cursor::decode(raw).map_err(|e| AppError::InvalidCursor(e.to_string()))
}

/// GET /threads/{thread_id}/messages
/// Pages are ascending by cursor in every direction
#[get("/threads/{thread_id}/messages")]
pub async fn list_messages(
    state: web::Data<AppState>,
    thread_id: web::Path<Uuid>,
    user: AuthUser,
    query: web::Query<HistoryQuery>,
) -> Result<HttpResponse, AppError> {
    let thread_id = thread_id.into_inner();
    state.gateway.authorize(thread_id, user.id).await?;

    let limit = state.page_size(query.limit);
    let page_query = match (query.before.as_deref(), query.after.as_deref()) {
        (Some(_), Some(_)) => {
            return Err(AppError::BadRequest(
                "before and after cannot be combined".into(),
            ))
        }
        (Some(raw), None) => PageQuery::Before {
            cursor: parse_cursor(raw)?,
            limit,
        },
        (None, Some(raw)) => PageQuery::After {
            cursor: parse_cursor(raw)?,
            limit,
        },
        (None, None) => PageQuery::Latest { limit },
    };

    let page = state.store.list_messages(thread_id, page_query).await?;
    Ok(HttpResponse::Ok().json(page))
}

/// POST /threads/{thread_id}/messages
/// Fallback send without a push connection. 201 on first insert, 200 when the
/// idempotency token was already stored.
#[post("/threads/{thread_id}/messages")]
pub async fn send_message(
    state: web::Data<AppState>,
    thread_id: web::Path<Uuid>,
    user: AuthUser,
    body: web::Json<SendMessageRequest>,
) -> Result<HttpResponse, AppError> {
    let req = body.into_inner();
    let outcome = state
        .gateway
        .send_durable(thread_id.into_inner(), user.id, req.body, req.client_msg_id)
        .await?;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok(HttpResponse::build(status).json(outcome.message))
}
