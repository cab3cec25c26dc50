use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};

use crate::config::Config;
use crate::connection::ConnectionCounter;
use crate::gateway::GatewayTx;
use crate::handlers;

fn cors(config: &Config) -> Cors {
    let origins = config.cors_origins();
    if origins.is_empty() {
        return Cors::permissive();
    }
    origins
        .iter()
        .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
        .allow_any_method()
        .allow_any_header()
}

/// Serves the websocket endpoint and the admin surface until shutdown.
pub async fn run_server(config: Config, gateway_tx: GatewayTx) -> std::io::Result<()> {
    let address = config.server_address();
    let gateway_tx = web::Data::new(gateway_tx);
    let counter = web::Data::new(ConnectionCounter::default());
    let config = web::Data::new(config);

    log::info!("Server started on {}", address);
    HttpServer::new(move || {
        App::new()
            .wrap(cors(&config))
            .wrap(Logger::default())
            .app_data(gateway_tx.clone())
            .app_data(counter.clone())
            .app_data(config.clone())
            .configure(handlers::root)
    })
    .bind(address)?
    .run()
    .await
}
