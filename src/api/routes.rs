// API route configuration

use crate::api::handlers;
use actix_web::web;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Health check (no auth required)
        .route("/health", web::get().to(handlers::health_check))
        .route("/", web::get().to(handlers::health_check))
        // Batch jobs (bearer auth)
        .service(
            web::scope("/api/v1/jobs")
                .route("/price-update", web::post().to(handlers::price_update))
                .route("/import", web::post().to(handlers::import_theme))
                .route("/enrich", web::post().to(handlers::enrich))
                .route("/theme-images", web::post().to(handlers::theme_images))
                .route("/aggregate", web::post().to(handlers::aggregate)),
        );
}
