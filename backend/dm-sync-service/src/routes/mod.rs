pub mod messages;
pub mod receipts;
pub mod threads;
pub mod wsroute;

use actix_web::{web, HttpResponse};

use crate::metrics;

async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(threads::create_thread)
        .service(threads::get_thread)
        .service(threads::archive_thread)
        .service(messages::list_messages)
        .service(messages::send_message)
        .service(receipts::mark_read)
        .service(receipts::mark_delivered)
        .service(receipts::batch_receipts)
        .service(receipts::unread_count)
        .service(wsroute::ws_handler)
        .route("/health", web::get().to(health))
        .route("/metrics", web::get().to(metrics::metrics_handler));
}
