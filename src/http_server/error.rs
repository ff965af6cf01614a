use axum::{
    body::Body,
    http::{Response, StatusCode},
    response::IntoResponse,
};

/// Handler error: anything convertible into a `color_eyre::Report` becomes a
/// 500 with the details only in the log.
pub struct Report(color_eyre::Report);

impl std::fmt::Debug for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl<E> From<E> for Report
where
    E: Into<color_eyre::Report>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for Report {
    fn into_response(self) -> Response<Body> {
        tracing::error!(error = ?self.0, "Request failed");

        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "The migration store is unavailable".to_string(),
        )
            .into_response()
    }
}
