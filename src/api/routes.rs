// Route handlers for the ZipCase API

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::api::auth::AuthUser;
use crate::api::error::ApiError;
use crate::api::AppState;
use crate::domain::{NameSearchData, SearchResult};
use crate::services::name_search::{NameSearchRequest, NameSearchSubmit};

const XLSX_CONTENT_TYPE: &str =
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

// Body fields are optional at the serde layer so that missing fields come
// back as a 400 from our validation rather than a serde rejection.
#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub search: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResultsResponse {
    pub results: BTreeMap<String, SearchResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameSearchBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<String>,
    #[serde(default)]
    pub sounds_like: bool,
    #[serde(default)]
    pub criminal_only: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NameSearchAccepted {
    pub search_id: String,
    pub results: BTreeMap<String, SearchResult>,
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct NameSearchRejected {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NameSearchResponse {
    #[serde(flatten)]
    pub data: NameSearchData,
    pub results: BTreeMap<String, SearchResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRequest {
    #[serde(default)]
    pub case_numbers: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /search: seed cases from free text and return the current view.
pub async fn submit_search(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    headers: HeaderMap,
    Json(body): Json<SearchRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let search = body.search.unwrap_or_default();
    if search.trim().is_empty() {
        return Err(ApiError::Validation("search is required".to_string()));
    }

    let results = state
        .case_search
        .submit(&search, &user_id, client_user_agent(&headers))
        .await?;

    Ok((StatusCode::ACCEPTED, Json(ResultsResponse { results })))
}

/// POST /name-search: queue a party-name search.
pub async fn submit_name_search(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    headers: HeaderMap,
    Json(body): Json<NameSearchBody>,
) -> Result<impl IntoResponse, ApiError> {
    let name = body.name.unwrap_or_default();
    if name.trim().is_empty() {
        return Err(ApiError::Validation("name is required".to_string()));
    }

    let outcome = state
        .name_search
        .submit(
            NameSearchRequest {
                name,
                date_of_birth: body.date_of_birth,
                sounds_like: body.sounds_like,
                criminal_only: body.criminal_only,
            },
            &user_id,
            client_user_agent(&headers),
        )
        .await?;

    Ok(match outcome {
        NameSearchSubmit::Accepted { search_id } => (
            StatusCode::ACCEPTED,
            Json(NameSearchAccepted {
                search_id,
                results: BTreeMap::new(),
                success: true,
            }),
        )
            .into_response(),
        NameSearchSubmit::Rejected { error } => (
            StatusCode::BAD_REQUEST,
            Json(NameSearchRejected {
                success: false,
                error,
            }),
        )
            .into_response(),
    })
}

/// GET /name-search/{searchId}: search record merged with case results.
pub async fn get_name_search(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(search_id): Path<String>,
) -> Result<Json<NameSearchResponse>, ApiError> {
    let view = state
        .name_search
        .get(&search_id, &user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no name search {}", search_id)))?;

    Ok(Json(NameSearchResponse {
        data: view.data,
        results: view.results,
    }))
}

/// POST /status: batch view over previously seeded cases.
pub async fn get_status(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(body): Json<StatusRequest>,
) -> Result<Json<ResultsResponse>, ApiError> {
    let case_numbers = body
        .case_numbers
        .ok_or_else(|| ApiError::Validation("caseNumbers is required".to_string()))?;

    let results = state.status.get_status(&case_numbers, &user_id).await?;
    Ok(Json(ResultsResponse { results }))
}

/// GET /case/{caseNumber}: single case view.
pub async fn get_case(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Path(case_number): Path<String>,
) -> Result<Json<SearchResult>, ApiError> {
    let case_number = case_number.trim().to_uppercase();
    let result = state
        .status
        .get_case(&case_number, &user_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no case {}", case_number)))?;
    Ok(Json(result))
}

/// POST /export: spreadsheet download of the requested cases.
pub async fn export_cases(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(_user_id)): Extension<AuthUser>,
    Json(body): Json<StatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let case_numbers = body
        .case_numbers
        .filter(|numbers| !numbers.is_empty())
        .ok_or_else(|| ApiError::Validation("caseNumbers is required".to_string()))?;

    let export = state.export.export_xlsx(&case_numbers).await?;
    let disposition = format!("attachment; filename=\"{}\"", export.filename);

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, XLSX_CONTENT_TYPE.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        export.bytes,
    ))
}

/// PUT /credentials: store portal credentials; clears the bad flag.
pub async fn save_credentials(
    State(state): State<Arc<AppState>>,
    Extension(AuthUser(user_id)): Extension<AuthUser>,
    Json(body): Json<CredentialsRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (username, password) = match (body.username, body.password) {
        (Some(username), Some(password))
            if !username.trim().is_empty() && !password.is_empty() =>
        {
            (username, password)
        }
        _ => {
            return Err(ApiError::Validation(
                "username and password are required".to_string(),
            ));
        }
    };

    state
        .credentials
        .save_credentials(&user_id, &username, &password)
        .await?;

    Ok(Json(serde_json::json!({ "success": true })))
}

fn client_user_agent(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .filter(|agent| !agent.is_empty())
}
