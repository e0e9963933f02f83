//! HTTP handlers. Request headers are parsed here; everything else is
//! delegated to the services.

pub mod deposit_handlers;
pub mod file_handlers;
pub mod health_handlers;
pub mod staging_handlers;

use crate::{
    errors::AppError,
    headers::{ContentDisposition, OptionsHeader, parse_in_progress},
    services::deposit_service::DepositRequest,
};
use axum::{
    Json,
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::{StreamExt, TryStreamExt};
use serde_json::Value;
use std::io;
use uuid::Uuid;

pub const JSON_LD: &str = "application/ld+json";

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

/// Identifiers that do not parse cannot name an existing resource.
pub(crate) fn parse_id(raw: &str) -> Result<Uuid, AppError> {
    raw.parse()
        .map_err(|_| AppError::not_found(format!("`{raw}` not found")))
}

/// Whether the request carries content worth reading.
fn has_body(headers: &HeaderMap) -> bool {
    match header_str(headers, header::CONTENT_LENGTH.as_str()) {
        Some(length) => length.parse::<u64>().map_or(true, |length| length > 0),
        None => {
            headers.contains_key(header::CONTENT_TYPE)
                || headers.contains_key(header::TRANSFER_ENCODING)
        }
    }
}

/// Turn SWORD request headers and the body into a [`DepositRequest`].
pub(crate) fn deposit_request(headers: &HeaderMap, body: Body) -> Result<DepositRequest, AppError> {
    let disposition = ContentDisposition::parse(
        header_str(headers, header::CONTENT_DISPOSITION.as_str()).unwrap_or_default(),
    );
    let content_type = header_str(headers, header::CONTENT_TYPE.as_str()).map(OptionsHeader::parse);
    let in_progress =
        parse_in_progress(header_str(headers, "in-progress")).map_err(|message| {
            AppError::BadRequest {
                message,
                errors: vec!["In-Progress".into()],
            }
        })?;

    let body = has_body(headers).then(|| {
        body.into_data_stream()
            .map_err(io::Error::other)
            .boxed()
    });

    Ok(DepositRequest {
        disposition,
        content_type: content_type
            .as_ref()
            .map(|content_type| content_type.value.clone())
            .filter(|value| !value.is_empty()),
        charset: content_type
            .as_ref()
            .and_then(|content_type| content_type.param("charset"))
            .map(str::to_string),
        packaging: header_str(headers, "packaging").map(str::to_string),
        metadata_format: header_str(headers, "metadata-format").map(str::to_string),
        in_progress,
        body,
    })
}

/// A JSON-LD response.
pub(crate) fn json_ld(status: StatusCode, body: Value) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(JSON_LD));
    response
}

/// `201 Created` pointing at `location`.
pub(crate) fn created(location: &str, body: Value) -> Result<Response, AppError> {
    let mut response = json_ld(StatusCode::CREATED, body);
    let location = HeaderValue::from_str(location)
        .map_err(|err| AppError::internal(format!("invalid Location header: {err}")))?;
    response.headers_mut().insert(header::LOCATION, location);
    Ok(response)
}
