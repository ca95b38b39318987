//! Local HTTP server the client's integration tests run against.
//!
//! Every route is stateless and answers with JSON unless it exists to test
//! something else (plain text, non-JSON bodies, file downloads, redirects,
//! challenges).

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{multipart::MultipartError, Multipart, Path, Query, Request},
    http::{
        header::{AUTHORIZATION, CONTENT_DISPOSITION, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE},
        HeaderMap, StatusCode,
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Form, Json, Router,
};
use base64::prelude::*;
use log::info;
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use uuid::Uuid;

/// The only bearer token `/protected` accepts.
pub const FRESH_TOKEN: &str = "fresh-token";

/// Plain-text body served by `/text`.
pub const TEXT_BODY: &str = "some text received";

pub fn app() -> Router {
    Router::new()
        .route("/json", get(echo_query).post(echo_json).put(echo_json).delete(echo_query))
        .route("/form", post(echo_form).put(echo_form))
        .route("/text", get(text))
        .route("/not-json", get(not_json))
        .route("/empty", get(empty))
        .route("/status/{code}", any(status))
        .route("/protected", any(protected))
        .route("/multipart", post(multipart))
        .route("/upload", post(upload).put(upload))
        .route("/files/{name}", get(file))
        .route("/basic-auth/{user}/{password}", get(basic_auth))
        .route("/redirect", get(redirect))
        .route("/slow", get(slow))
        .layer(middleware::from_fn(log_request))
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let response = next.run(request).await;
    info!("{method} {uri} -> {}", response.status());
    response
}

/// Collect decoded pairs into a JSON object; repeated keys become arrays.
pub fn pairs_to_object(pairs: Vec<(String, String)>) -> Value {
    let mut object = Map::new();
    for (key, value) in pairs {
        match object.get_mut(&key) {
            None => {
                object.insert(key, Value::String(value));
            }
            Some(Value::Array(values)) => values.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
        }
    }
    Value::Object(object)
}

async fn echo_query(Query(pairs): Query<Vec<(String, String)>>) -> Json<Value> {
    Json(pairs_to_object(pairs))
}

async fn echo_json(Json(body): Json<Value>) -> Json<Value> {
    Json(body)
}

async fn echo_form(Form(pairs): Form<Vec<(String, String)>>) -> Json<Value> {
    Json(pairs_to_object(pairs))
}

async fn text() -> &'static str {
    TEXT_BODY
}

async fn not_json() -> Response {
    ([(CONTENT_TYPE, "text/html")], "<html>definitely not json</html>").into_response()
}

async fn empty() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn status(Path(code): Path<u16>) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let status = StatusCode::from_u16(code).map_err(|_| StatusCode::BAD_REQUEST)?;
    Ok((status, Json(json!({ "status": code }))))
}

async fn protected(headers: HeaderMap) -> Response {
    let expected = format!("Bearer {FRESH_TOKEN}");
    match headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        Some(value) if value == expected => Json(json!({ "authorized": true })).into_response(),
        _ => (StatusCode::UNAUTHORIZED, Json(json!({ "error": "token expired" }))).into_response(),
    }
}

async fn multipart(mut multipart: Multipart) -> Result<Json<Value>, (StatusCode, String)> {
    let mut fields = Map::new();
    while let Some(field) = multipart.next_field().await.map_err(rejected)? {
        let name = field.name().unwrap_or_default().to_string();
        let filename = field.file_name().map(str::to_string);
        let content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await.map_err(rejected)?;
        let text = String::from_utf8_lossy(&data).into_owned();

        let value = match filename {
            Some(filename) => json!({
                "filename": filename,
                "content_type": content_type,
                "size": data.len(),
                "content": text,
            }),
            None => Value::String(text),
        };
        fields.insert(name, value);
    }
    Ok(Json(Value::Object(fields)))
}

fn rejected(err: MultipartError) -> (StatusCode, String) {
    (err.status(), err.body_text())
}

async fn upload(body: Bytes) -> (StatusCode, Json<Value>) {
    (
        StatusCode::CREATED,
        Json(json!({ "id": Uuid::new_v4(), "size": body.len() })),
    )
}

async fn file(Path(name): Path<String>) -> Response {
    if name == "missing.txt" {
        return (StatusCode::NOT_FOUND, "no such file").into_response();
    }
    let disposition = format!("attachment; filename=\"{name}\"");
    (
        [
            (CONTENT_TYPE, "application/octet-stream".to_string()),
            (CONTENT_DISPOSITION, disposition),
        ],
        format!("contents of {name}\n"),
    )
        .into_response()
}

async fn basic_auth(Path((user, password)): Path<(String, String)>, headers: HeaderMap) -> Response {
    let expected = format!("Basic {}", BASE64_STANDARD.encode(format!("{user}:{password}")));
    let supplied = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    if supplied == Some(expected.as_str()) {
        return Json(json!({ "authenticated": true, "user": user })).into_response();
    }
    (
        StatusCode::UNAUTHORIZED,
        [(WWW_AUTHENTICATE, "Basic realm=\"mock\"")],
        Json(json!({ "authenticated": false })),
    )
        .into_response()
}

async fn redirect() -> Response {
    (StatusCode::FOUND, [(LOCATION, "/json?redirected=true")]).into_response()
}

async fn slow() -> &'static str {
    tokio::time::sleep(Duration::from_secs(5)).await;
    "finally"
}
