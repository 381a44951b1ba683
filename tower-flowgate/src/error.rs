/// Errors produced by the flow control middleware.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GateError {
    /// The request was rejected by a flow rule before reaching the inner
    /// service.
    ///
    /// When the `axum` feature is enabled, this converts to
    /// `429 Too Many Requests`.
    #[error("request blocked by flow control: {message}")]
    Blocked {
        /// Human-readable description of the rejecting rule.
        message: String,
    },

    /// An unexpected error occurred in the inner service.
    ///
    /// The string contains the `Display` representation of the inner error.
    /// When the `axum` feature is enabled, this converts to
    /// `500 Internal Server Error`.
    #[error("internal service error: {0}")]
    Inner(String),
}

#[cfg(feature = "axum")]
impl axum::response::IntoResponse for GateError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match self {
            Self::Blocked { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Inner(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
