use actix_web::{middleware, web, App, HttpServer};
use std::io;

use crate::ai::ExplanationClient;
use crate::handlers::{analyze, example_sql, health_check, index};

/// Start the HTTP server
pub async fn start_server(
    host: &str,
    port: u16,
    workers: usize,
    client: ExplanationClient,
) -> io::Result<()> {
    let bind_addr = format!("{}:{}", host, port);

    tracing::info!("Starting server on {} with {} workers", bind_addr, workers);

    let client = web::Data::new(client);
    HttpServer::new(move || {
        App::new()
            .app_data(client.clone())
            .wrap(middleware::Logger::default())
            .route("/", web::get().to(index))
            .route("/health", web::get().to(health_check))
            .route("/analyze", web::post().to(analyze))
            .route(
                "/sql_examples/sql_lineage_test.sql",
                web::get().to(example_sql),
            )
    })
    .workers(workers)
    .bind(&bind_addr)?
    .run()
    .await
}
