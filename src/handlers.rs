use actix_web::{web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};

use crate::ai::{ExplanationClient, DEFAULT_PROMPT};
use crate::LineageResult;

/// Form payload for lineage analysis
#[derive(Debug, Deserialize)]
pub struct AnalyzeForm {
    #[serde(default)]
    pub sql_text: String,
}

/// Response model combining lineage and the AI explanation
#[derive(Debug, Serialize)]
pub struct AnalyzeResponse {
    pub lineage: LineageResult,
    pub explanation: String,
}

/// Error response model
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Render the main page
pub async fn index() -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .body(include_str!("../static/index.html"))
}

/// Handler for SQL lineage analysis
pub async fn analyze(
    client: web::Data<ExplanationClient>,
    form: web::Form<AnalyzeForm>,
) -> impl Responder {
    if form.sql_text.is_empty() {
        return HttpResponse::BadRequest().json(ErrorResponse {
            error: "No SQL provided".to_string(),
        });
    }

    tracing::info!("Analyzing SQL script ({} bytes)", form.sql_text.len());

    let lineage = crate::analyze(&form.sql_text);
    let explanation = client.explain(&form.sql_text, DEFAULT_PROMPT).await;

    HttpResponse::Ok().json(AnalyzeResponse {
        lineage,
        explanation,
    })
}

/// Serve the bundled example SQL script
pub async fn example_sql() -> impl Responder {
    HttpResponse::Ok()
        .content_type("text/plain; charset=utf-8")
        .body(include_str!("../sql_examples/sql_lineage_test.sql"))
}

/// Health check handler
pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().body("OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{body::to_bytes, http::StatusCode};

    fn offline_client() -> web::Data<ExplanationClient> {
        let client = ExplanationClient::new(None, &crate::config::AiConfig::default()).unwrap();
        web::Data::new(client)
    }

    #[actix_web::test]
    async fn test_analyze_rejects_empty_sql() {
        let response = analyze(
            offline_client(),
            web::Form(AnalyzeForm {
                sql_text: String::new(),
            }),
        )
        .await
        .respond_to(&actix_web::test::TestRequest::default().to_http_request());
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = to_bytes(response.into_body())
            .await
            .unwrap_or_else(|_| panic!("failed to read response body"));
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"], "No SQL provided");
    }

    #[actix_web::test]
    async fn test_analyze_returns_lineage_and_degraded_explanation() {
        let response = analyze(
            offline_client(),
            web::Form(AnalyzeForm {
                sql_text: "SELECT * FROM raw.events;".to_string(),
            }),
        )
        .await
        .respond_to(&actix_web::test::TestRequest::default().to_http_request());
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body())
            .await
            .unwrap_or_else(|_| panic!("failed to read response body"));
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["lineage"]["sources"][0], "raw.events");
        assert!(value["explanation"].as_str().unwrap().contains("API key"));
    }
}
