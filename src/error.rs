use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Response},
};
use maud::{html, DOCTYPE};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("Not found")]
    NotFound,
    #[error("Unauthorized")]
    Unauthorized,
    #[error("{0}")]
    BadRequest(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::NotFound => page(
                StatusCode::NOT_FOUND,
                "404 Not Found",
                "The requested page could not be found.",
            ),
            // Plain text, matching the original admin-endpoint responses.
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "You are not authorized to do this.",
            )
                .into_response(),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()).into_response(),
            AppError::Io(e) => {
                tracing::error!("IO error: {}", e);
                apology()
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                apology()
            }
        }
    }
}

/// The generic apologetic page served for any unexpected failure during
/// content resolution. Never exposes the underlying error.
fn apology() -> Response {
    page(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Something went wrong",
        "Sorry, something went wrong on our side. Please try again later.",
    )
}

fn page(status: StatusCode, title: &str, message: &str) -> Response {
    let body = html! {
        (DOCTYPE)
        html lang="en" {
            head {
                meta charset="utf-8";
                title { (title) }
            }
            body {
                h1 { (title) }
                p { (message) }
                p { a href="/" { "Back to the start page" } }
            }
        }
    };

    (status, Html(body.into_string())).into_response()
}
