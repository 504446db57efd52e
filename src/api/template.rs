//! Template listing endpoint.

use axum::{extract::State, Json};
use serde::Serialize;

use crate::error::Result;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct TemplateListResponse {
    pub templates: Vec<String>,
    pub total: usize,
}

/// GET /templates - Names of the templates under the template root
#[tracing::instrument(name = "http.list_templates", skip(state))]
pub async fn list_templates(State(state): State<AppState>) -> Result<Json<TemplateListResponse>> {
    let templates = state.renderer.list_templates().await?;
    let total = templates.len();

    Ok(Json(TemplateListResponse { templates, total }))
}
