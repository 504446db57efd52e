//! Stored notification queries and export.

use axum::{
    extract::{rejection::QueryRejection, Query, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::notification::{Notification, NotificationStatus};
use crate::server::AppState;
use crate::store::{ListFilter, OrderField, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT};

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    pub channel: Option<String>,
    pub status: Option<String>,
    pub recipient: Option<String>,
    pub limit: Option<usize>,
    pub order_by: Option<String>,
    /// `asc` or `desc`
    pub order: Option<String>,
}

impl ListQuery {
    fn into_filter(self, default_limit: usize) -> Result<ListFilter> {
        let status = self
            .status
            .as_deref()
            .map(str::parse::<NotificationStatus>)
            .transpose()
            .map_err(AppError::Validation)?;
        let order_by = self
            .order_by
            .as_deref()
            .map(str::parse::<OrderField>)
            .transpose()
            .map_err(AppError::Validation)?
            .unwrap_or_default();
        let descending = match self.order.as_deref() {
            None | Some("desc") => true,
            Some("asc") => false,
            Some(other) => {
                return Err(AppError::Validation(format!(
                    "order must be 'asc' or 'desc', got '{}'",
                    other
                )))
            }
        };

        Ok(ListFilter {
            channel: self.channel.filter(|c| !c.is_empty()),
            status,
            recipient: self.recipient.filter(|r| !r.is_empty()),
            limit: self.limit.unwrap_or(default_limit),
            order_by,
            descending,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExportQuery {
    pub format: Option<String>,
    pub channel: Option<String>,
    pub status: Option<String>,
    pub recipient: Option<String>,
    pub limit: Option<usize>,
    pub order_by: Option<String>,
    pub order: Option<String>,
}

impl From<ExportQuery> for ListQuery {
    fn from(query: ExportQuery) -> Self {
        Self {
            channel: query.channel,
            status: query.status,
            recipient: query.recipient,
            limit: query.limit,
            order_by: query.order_by,
            order: query.order,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct NotificationListResponse {
    pub notifications: Vec<Notification>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub notifications: Vec<Notification>,
    pub count: usize,
}

fn parse_query<T>(query: std::result::Result<Query<T>, QueryRejection>) -> Result<T> {
    query
        .map(|Query(value)| value)
        .map_err(|e| AppError::Validation(e.body_text()))
}

/// GET /notifications - List stored notifications
#[tracing::instrument(name = "http.list_notifications", skip(state, query))]
pub async fn list_notifications(
    State(state): State<AppState>,
    query: std::result::Result<Query<ListQuery>, QueryRejection>,
) -> Result<Json<NotificationListResponse>> {
    let filter = parse_query(query)?.into_filter(DEFAULT_LIST_LIMIT)?;
    let notifications = state.store.list_notifications(&filter).await?;

    Ok(Json(NotificationListResponse {
        count: notifications.len(),
        notifications,
    }))
}

/// GET /notifications/search?q= - Case-insensitive subject/message search
#[tracing::instrument(name = "http.search_notifications", skip(state, query))]
pub async fn search_notifications(
    State(state): State<AppState>,
    query: std::result::Result<Query<SearchQuery>, QueryRejection>,
) -> Result<Json<SearchResponse>> {
    let query = parse_query(query)?;
    let needle = query.q.trim();
    if needle.is_empty() {
        return Err(AppError::Validation("query parameter 'q' is required".to_string()));
    }

    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    let notifications = state.store.search(needle, limit).await?;

    Ok(Json(SearchResponse {
        query: needle.to_string(),
        count: notifications.len(),
        notifications,
    }))
}

/// GET /notifications/export?format=json|csv - Download stored notifications
#[tracing::instrument(name = "http.export_notifications", skip(state, query))]
pub async fn export_notifications(
    State(state): State<AppState>,
    query: std::result::Result<Query<ExportQuery>, QueryRejection>,
) -> Result<Response> {
    let mut query = parse_query(query)?;
    let format = query.format.take().unwrap_or_else(|| "json".to_string());
    let filter = ListQuery::from(query).into_filter(MAX_LIST_LIMIT)?;
    let notifications = state.store.list_notifications(&filter).await?;

    tracing::info!(format = %format, count = notifications.len(), "Exporting notifications");

    match format.as_str() {
        "json" => Ok((
            [(header::CONTENT_DISPOSITION, "attachment; filename=\"notifications.json\"")],
            Json(notifications),
        )
            .into_response()),
        "csv" => Ok((
            [
                (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
                (header::CONTENT_DISPOSITION, "attachment; filename=\"notifications.csv\""),
            ],
            to_csv(&notifications),
        )
            .into_response()),
        other => Err(AppError::Validation(format!(
            "unsupported export format '{}', expected json or csv",
            other
        ))),
    }
}

const CSV_HEADER: &str = "id,channel,recipient,subject,status,error,created_at,sent_at";

fn to_csv(notifications: &[Notification]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');
    for n in notifications {
        let fields = [
            n.id.map(|id| id.to_string()).unwrap_or_default(),
            n.channel.clone(),
            n.recipient.clone(),
            n.subject.clone(),
            n.status.to_string(),
            n.error.clone().unwrap_or_default(),
            n.created_at.to_rfc3339(),
            n.sent_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        ];
        let row: Vec<String> = fields.iter().map(|f| csv_field(f)).collect();
        out.push_str(&row.join(","));
        out.push('\n');
    }
    out
}

/// Quote a CSV cell and neutralize spreadsheet formulas.
fn csv_field(value: &str) -> String {
    let value = if value.starts_with(['=', '+', '-', '@', '\t', '\r']) {
        format!("'{}", value)
    } else {
        value.to_string()
    };
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value
    }
}
