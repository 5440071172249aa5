use actix_web::{get, post, web, HttpResponse};
use event_schema::{MarkReceiptRequest, ReceiptBatchRequest};
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::AuthUser;
use crate::state::AppState;

/// POST /threads/{thread_id}/read
#[post("/threads/{thread_id}/read")]
pub async fn mark_read(
    state: web::Data<AppState>,
    thread_id: web::Path<Uuid>,
    user: AuthUser,
    body: web::Json<MarkReceiptRequest>,
) -> Result<HttpResponse, AppError> {
    let advance = state
        .gateway
        .mark_read(thread_id.into_inner(), user.id, body.up_to_message_id)
        .await?;
    Ok(HttpResponse::Ok().json(advance))
}

/// POST /threads/{thread_id}/delivered
#[post("/threads/{thread_id}/delivered")]
pub async fn mark_delivered(
    state: web::Data<AppState>,
    thread_id: web::Path<Uuid>,
    user: AuthUser,
    body: web::Json<MarkReceiptRequest>,
) -> Result<HttpResponse, AppError> {
    let advance = state
        .gateway
        .mark_delivered(thread_id.into_inner(), user.id, body.up_to_message_id)
        .await?;
    Ok(HttpResponse::Ok().json(advance))
}

/// POST /threads/{thread_id}/receipts
#[post("/threads/{thread_id}/receipts")]
pub async fn batch_receipts(
    state: web::Data<AppState>,
    thread_id: web::Path<Uuid>,
    user: AuthUser,
    body: web::Json<ReceiptBatchRequest>,
) -> Result<HttpResponse, AppError> {
    let receipts = state
        .gateway
        .receipts(thread_id.into_inner(), user.id, &body.message_ids)
        .await?;
    Ok(HttpResponse::Ok().json(receipts))
}

/// GET /threads/{thread_id}/unread
#[get("/threads/{thread_id}/unread")]
pub async fn unread_count(
    state: web::Data<AppState>,
    thread_id: web::Path<Uuid>,
    user: AuthUser,
) -> Result<HttpResponse, AppError> {
    let thread_id = thread_id.into_inner();
    state.gateway.authorize(thread_id, user.id).await?;
    let unread = state.store.unread_count(thread_id, user.id).await?;
    Ok(HttpResponse::Ok().json(unread))
}
