//! Service document, deposit, metadata and file-set endpoints.

use crate::{
    errors::AppError,
    handlers::{created, deposit_request, json_ld, parse_id},
    routes::routes::AppState,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};

pub async fn get_service_document(State(state): State<AppState>) -> Response {
    json_ld(StatusCode::OK, state.deposits.service_document())
}

/// `POST /service-document`
///
/// Creates a deposit from whatever the request carries (nothing, a metadata
/// document, a by-reference document, or a file) and answers `201 Created`
/// with the status document.
pub async fn create_deposit(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let request = deposit_request(&headers, body)?;
    let deposit = state.deposits.create_deposit(request).await?;
    let status = state.deposits.status_document(deposit.id).await?;
    created(&state.deposits.urls().deposit(deposit.id), status)
}

pub async fn get_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = parse_id(&id)?;
    let status = state.deposits.status_document(id).await?;
    Ok(json_ld(StatusCode::OK, status))
}

async fn update_deposit(
    state: AppState,
    id: String,
    headers: HeaderMap,
    body: Body,
    replace: bool,
) -> Result<Response, AppError> {
    let id = parse_id(&id)?;
    let request = deposit_request(&headers, body)?;
    state.deposits.update_deposit(id, request, replace).await?;
    let status = state.deposits.status_document(id).await?;
    Ok(json_ld(StatusCode::OK, status))
}

pub async fn append_deposit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    update_deposit(state, id, headers, body, false).await
}

pub async fn replace_deposit(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    update_deposit(state, id, headers, body, true).await
}

pub async fn delete_deposit(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.deposits.delete_deposit(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /deposit/{id}/metadata`
///
/// Serves the stored document in its own format, with the canonical `@id`.
pub async fn get_metadata(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let (format, document) = state.deposits.metadata_document(parse_id(&id)?).await?;
    let mut response = (StatusCode::OK, document).into_response();
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(format.content_type()),
    );
    headers.insert("metadata-format", HeaderValue::from_static(format.uri()));
    Ok(response)
}

pub async fn append_metadata(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, AppError> {
    let request = deposit_request(&headers, body)?;
    state
        .deposits
        .update_metadata(parse_id(&id)?, request, false)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn replace_metadata(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, AppError> {
    let request = deposit_request(&headers, body)?;
    state
        .deposits
        .update_metadata(parse_id(&id)?, request, true)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_metadata(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.deposits.delete_metadata(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn append_fileset(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, AppError> {
    let request = deposit_request(&headers, body)?;
    state
        .deposits
        .update_fileset(parse_id(&id)?, request, false)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn replace_fileset(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, AppError> {
    let request = deposit_request(&headers, body)?;
    state
        .deposits
        .update_fileset(parse_id(&id)?, request, true)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_fileset(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.deposits.delete_fileset(parse_id(&id)?).await?;
    Ok(StatusCode::NO_CONTENT)
}
