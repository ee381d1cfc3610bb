//! axum router serving any [`FileSystem`] over REST.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;

use crate::error::{FsError, FsResult};
use crate::fs::{FileSystem, NO_LIMIT};
use crate::http::ErrorBody;
use crate::metadata::FileMetadata;
use crate::stream::ByteSource;

type SharedFs = Arc<dyn FileSystem>;

struct ApiError(FsError);

impl From<FsError> for ApiError {
    fn from(e: FsError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorBody {
                error_code: self.0.code(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn router(fs: SharedFs) -> Router {
    Router::new()
        .route("/upload/{*name}", post(upload))
        .route("/append/{*name}", post(append))
        .route("/download/{*name}", get(download))
        .route("/list", get(list))
        .route("/info/{*name}", get(info))
        .route("/infoAll", post(info_all))
        .route("/ping", get(ping))
        .route("/copy", post(copy))
        .route("/copyAll", post(copy_all))
        .route("/move", post(rename))
        .route("/moveAll", post(rename_all))
        .route("/delete/{*name}", delete(delete_one))
        .route("/deleteAll", post(delete_all))
        .with_state(fs)
}

#[derive(Deserialize)]
struct UploadQuery {
    size: Option<u64>,
}

async fn upload(
    State(fs): State<SharedFs>,
    Path(name): Path<String>,
    Query(query): Query<UploadQuery>,
    request: Request,
) -> ApiResult<StatusCode> {
    let mut sink = fs.upload(&name, query.size).await?;
    let mut body = request.into_body().into_data_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| FsError::Io(std::io::Error::other(e)))?;
        sink.push(chunk).await?;
    }
    sink.finish().await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct AppendQuery {
    offset: Option<u64>,
}

async fn append(
    State(fs): State<SharedFs>,
    Path(name): Path<String>,
    Query(query): Query<AppendQuery>,
    request: Request,
) -> ApiResult<StatusCode> {
    let mut sink = fs.append(&name, query.offset.unwrap_or(0)).await?;
    let mut body = request.into_body().into_data_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(|e| FsError::Io(std::io::Error::other(e)))?;
        sink.push(chunk).await?;
    }
    sink.finish().await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct DownloadQuery {
    offset: Option<u64>,
    limit: Option<u64>,
}

fn parse_range(value: &str) -> FsResult<(u64, u64)> {
    let range = value
        .strip_prefix("bytes=")
        .ok_or(FsError::BadRange)?
        .trim();
    let (start, end) = range.split_once('-').ok_or(FsError::BadRange)?;
    let offset: u64 = start.parse().map_err(|_| FsError::BadRange)?;
    let limit = if end.is_empty() {
        NO_LIMIT
    } else {
        let end: u64 = end.parse().map_err(|_| FsError::BadRange)?;
        if end < offset {
            return Err(FsError::BadRange);
        }
        end - offset + 1
    };
    Ok((offset, limit))
}

fn body_stream(source: ByteSource) -> Body {
    Body::from_stream(futures::stream::unfold(source, |mut source| async move {
        match source.pull().await {
            Ok(Some(buf)) => Some((Ok::<Bytes, std::io::Error>(buf), source)),
            Ok(None) => {
                source.finish(Ok(()));
                None
            }
            Err(e) => Some((Err(std::io::Error::other(e)), source)),
        }
    }))
}

async fn download(
    State(fs): State<SharedFs>,
    Path(name): Path<String>,
    Query(query): Query<DownloadQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let range = headers
        .get(header::RANGE)
        .map(|value| {
            let value = value.to_str().map_err(|_| FsError::BadRange)?;
            parse_range(value)
        })
        .transpose()?;
    let (offset, limit, partial) = match range {
        Some((offset, limit)) => (offset, limit, true),
        None => (
            query.offset.unwrap_or(0),
            query.limit.unwrap_or(NO_LIMIT),
            false,
        ),
    };

    let meta = fs
        .info(&name)
        .await?
        .ok_or_else(|| FsError::FileNotFound(name.clone()))?;
    let clamped = limit.min(meta.size.saturating_sub(offset));
    let source = fs.download(&name, offset, clamped).await?;

    let mut response = Response::builder()
        .status(if partial {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        })
        .header(header::CONTENT_LENGTH, clamped);
    if partial {
        let last = if clamped == 0 { offset } else { offset + clamped - 1 };
        response = response.header(
            header::CONTENT_RANGE,
            format!("bytes {offset}-{last}/{}", meta.size),
        );
    }
    response
        .body(body_stream(source))
        .map_err(|e| ApiError(FsError::Protocol(e.to_string())))
}

#[derive(Deserialize)]
struct ListQuery {
    glob: Option<String>,
}

async fn list(
    State(fs): State<SharedFs>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<HashMap<String, FileMetadata>>> {
    let pattern = query.glob.as_deref().unwrap_or("**");
    Ok(Json(fs.list(pattern).await?))
}

async fn info(
    State(fs): State<SharedFs>,
    Path(name): Path<String>,
) -> ApiResult<Json<Option<FileMetadata>>> {
    Ok(Json(fs.info(&name).await?))
}

async fn info_all(
    State(fs): State<SharedFs>,
    Json(names): Json<Vec<String>>,
) -> ApiResult<Json<HashMap<String, FileMetadata>>> {
    Ok(Json(fs.info_all(&names).await?))
}

async fn ping(State(fs): State<SharedFs>) -> ApiResult<StatusCode> {
    fs.ping().await?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct TransferQuery {
    name: String,
    target: String,
}

async fn copy(
    State(fs): State<SharedFs>,
    Query(query): Query<TransferQuery>,
) -> ApiResult<StatusCode> {
    fs.copy(&query.name, &query.target).await?;
    Ok(StatusCode::OK)
}

async fn copy_all(
    State(fs): State<SharedFs>,
    Json(pairs): Json<HashMap<String, String>>,
) -> ApiResult<StatusCode> {
    fs.copy_all(&pairs).await?;
    Ok(StatusCode::OK)
}

async fn rename(
    State(fs): State<SharedFs>,
    Query(query): Query<TransferQuery>,
) -> ApiResult<StatusCode> {
    fs.rename(&query.name, &query.target).await?;
    Ok(StatusCode::OK)
}

async fn rename_all(
    State(fs): State<SharedFs>,
    Json(pairs): Json<HashMap<String, String>>,
) -> ApiResult<StatusCode> {
    fs.rename_all(&pairs).await?;
    Ok(StatusCode::OK)
}

async fn delete_one(State(fs): State<SharedFs>, Path(name): Path<String>) -> ApiResult<StatusCode> {
    fs.delete(&name).await?;
    Ok(StatusCode::OK)
}

async fn delete_all(
    State(fs): State<SharedFs>,
    Json(names): Json<Vec<String>>,
) -> ApiResult<StatusCode> {
    fs.delete_all(&names).await?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_parsing() {
        assert_eq!(parse_range("bytes=0-4").unwrap(), (0, 5));
        assert_eq!(parse_range("bytes=10-").unwrap(), (10, NO_LIMIT));
        assert!(parse_range("bytes=5-2").is_err());
        assert!(parse_range("lines=0-4").is_err());
        assert!(parse_range("bytes=a-b").is_err());
    }
}
