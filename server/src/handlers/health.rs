use actix_web::{web, HttpResponse, Responder};
use system::serde_json::json;

pub fn configure_health_handlers(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(get)));
}

async fn get() -> impl Responder {
    HttpResponse::Ok().json(json!({ "status": "ok" }))
}
