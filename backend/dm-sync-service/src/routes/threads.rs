use actix_web::{get, post, web, HttpResponse};
use event_schema::CreateThreadRequest;
use uuid::Uuid;

use crate::error::AppError;
use crate::middleware::AuthUser;
use crate::state::AppState;

/// POST /threads
/// The caller is always a participant. Asking for an existing 1:1 thread
/// returns it instead of creating a second one.
#[post("/threads")]
pub async fn create_thread(
    state: web::Data<AppState>,
    user: AuthUser,
    body: web::Json<CreateThreadRequest>,
) -> Result<HttpResponse, AppError> {
    let thread = state
        .store
        .create_thread(user.id, &body.participant_ids)
        .await?;
    tracing::info!(
        thread_id = %thread.id,
        participants = thread.participant_ids.len(),
        "thread ready"
    );
    Ok(HttpResponse::Ok().json(thread.to_dto()))
}

/// GET /threads/{thread_id}
#[get("/threads/{thread_id}")]
pub async fn get_thread(
    state: web::Data<AppState>,
    thread_id: web::Path<Uuid>,
    user: AuthUser,
) -> Result<HttpResponse, AppError> {
    let thread = state
        .gateway
        .authorize(thread_id.into_inner(), user.id)
        .await?;
    Ok(HttpResponse::Ok().json(thread.to_dto()))
}

/// POST /threads/{thread_id}/archive
/// Threads are never deleted; archiving stops new sends
#[post("/threads/{thread_id}/archive")]
pub async fn archive_thread(
    state: web::Data<AppState>,
    thread_id: web::Path<Uuid>,
    user: AuthUser,
) -> Result<HttpResponse, AppError> {
    let thread_id = thread_id.into_inner();
    state.gateway.authorize(thread_id, user.id).await?;
    let thread = state.store.archive_thread(thread_id).await?;
    Ok(HttpResponse::Ok().json(thread.to_dto()))
}
