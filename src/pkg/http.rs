// This file is part of Alpenhorn and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

//! HTTP surface of the PKG. One endpoint per operation, JSON bodies capped
//! at [`MAX_REQUEST_SIZE`](super::MAX_REQUEST_SIZE). Errors cross the wire
//! as `{code, message}` objects; internal errors are logged here with
//! round, username, and code, and masked on the wire.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use tracing::error;

use super::{Error, ErrorResponse, ExtractArgs, RegisterArgs, Server, MAX_REQUEST_SIZE};

/// Builds the PKG service router.
pub fn router(server: Arc<Server>) -> Router {
    Router::new()
        .route("/extract", post(extract_handler))
        .route("/register", post(register_handler))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_SIZE))
        .with_state(server)
}

fn error_response(err: &Error) -> Response {
    let status = if err.is_internal() {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, axum::Json(ErrorResponse::from(err))).into_response()
}

async fn extract_handler(State(server): State<Arc<Server>>, body: Bytes) -> Response {
    let mut args: ExtractArgs = match serde_json::from_slice(&body) {
        Ok(args) => args,
        Err(e) => return error_response(&Error::BadRequestJson(e.to_string())),
    };
    args.server_signing_key = server.public_key().to_bytes();
    let (round, username) = (args.round, args.username.clone());

    let result = tokio::task::spawn_blocking(move || server.extract(&args))
        .await
        .expect("extract task panicked");

    match result {
        Ok(reply) => {
            let bytes = serde_json::to_vec(&reply).expect("marshal extract reply");
            (
                [(header::CONTENT_TYPE, "application/json")],
                bytes,
            )
                .into_response()
        }
        Err(err) => {
            if err.is_internal() {
                error!(
                    round,
                    username = %username,
                    code = err.code(),
                    "extraction failed: {}",
                    err
                );
            }
            error_response(&err)
        }
    }
}

async fn register_handler(State(server): State<Arc<Server>>, body: Bytes) -> Response {
    let args: RegisterArgs = match serde_json::from_slice(&body) {
        Ok(args) => args,
        Err(e) => return error_response(&Error::BadRequestJson(e.to_string())),
    };
    let result =
        tokio::task::spawn_blocking(move || server.register(&args.username, args.login_key))
            .await
            .expect("register task panicked");
    match result {
        Ok(()) => StatusCode::OK.into_response(),
        Err(err) => {
            if err.is_internal() {
                error!(code = err.code(), "registration failed: {}", err);
            }
            error_response(&err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg::db::Db;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    #[tokio::test]
    async fn extract_rejects_garbage_json() {
        let server = Arc::new(Server::new(
            SigningKey::generate(&mut OsRng),
            Db::open_in_memory().unwrap(),
        ));
        let resp = extract_handler(State(server), Bytes::from_static(b"{nope")).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn register_then_duplicate() {
        let server = Arc::new(Server::new(
            SigningKey::generate(&mut OsRng),
            Db::open_in_memory().unwrap(),
        ));
        let body = serde_json::to_vec(&RegisterArgs {
            username: "alice".into(),
            login_key: [1u8; 32],
        })
        .unwrap();
        let resp = register_handler(State(server.clone()), Bytes::from(body.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = register_handler(State(server), Bytes::from(body)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn body_cap_matches_protocol() {
        assert_eq!(MAX_REQUEST_SIZE, 1024);
    }
}
