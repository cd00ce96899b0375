use std::path::Path;

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use library::LibraryError;

use crate::state::ErrorResponse;

pub fn json_error(
    status: StatusCode,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

pub fn json_error_response(status: StatusCode, message: impl Into<String>) -> Response {
    json_error(status, message).into_response()
}

/// Caller-scoped failures get their own status; everything else is a 500.
pub fn library_error(err: LibraryError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        LibraryError::TrackNotFound(_) | LibraryError::EntryNotFound(_) => StatusCode::NOT_FOUND,
        LibraryError::InvalidTransition { .. } => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!("Request failed: {}", err);
    }
    json_error(status, err.to_string())
}

pub fn file_response(bytes: Vec<u8>, path: &Path) -> Response {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    let mut response = Response::new(Body::from(bytes));
    if let Ok(value) = HeaderValue::from_str(mime.as_ref()) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=3600"),
    );
    response
}

/// Keeps only the final component of a client-supplied name.
pub fn sanitize_file_name(name: &str) -> Option<String> {
    let name = Path::new(name.trim()).file_name()?.to_str()?.trim();
    if name.is_empty() || name.starts_with('.') {
        return None;
    }
    Some(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::TrackStatus;

    #[test]
    fn errors_map_to_statuses() {
        assert_eq!(library_error(LibraryError::TrackNotFound(7)).0, StatusCode::NOT_FOUND);
        assert_eq!(library_error(LibraryError::EntryNotFound(7)).0, StatusCode::NOT_FOUND);
        let conflict = LibraryError::InvalidTransition {
            id: 1,
            current: TrackStatus::Complete,
            requested: TrackStatus::Pending,
        };
        assert_eq!(library_error(conflict).0, StatusCode::CONFLICT);
    }

    #[test]
    fn file_names_lose_their_directories() {
        assert_eq!(sanitize_file_name("../../etc/song.mp3").as_deref(), Some("song.mp3"));
        assert_eq!(sanitize_file_name("a b.flac").as_deref(), Some("a b.flac"));
        assert_eq!(sanitize_file_name(".hidden"), None);
        assert_eq!(sanitize_file_name(".."), None);
        assert_eq!(sanitize_file_name(""), None);
    }
}
