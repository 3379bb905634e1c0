use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Multipart, Path, Query},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::net::TcpListener;
use uuid::Uuid;

/// Items per page of `/v1/items`.
pub const PAGE_SIZE: u32 = 3;
/// Chunk size for streamed file bodies.
pub const CHUNK_SIZE: usize = 1024;
/// Port used when `PORT` is unset or unusable.
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub item_id: u32,
    pub display_name: String,
    pub unit_price: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemPage {
    pub page: u32,
    pub items: Vec<Item>,
    pub next_page: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub upload_id: Uuid,
    pub bytes_received: usize,
    pub checksum: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilePart {
    pub field_name: String,
    pub content_type: String,
    pub size: usize,
    pub checksum: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MultipartReceipt {
    pub fields: BTreeMap<String, String>,
    pub field_order: Vec<String>,
    pub file: Option<FilePart>,
}

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default = "first_page")]
    pub page: u32,
}

fn first_page() -> u32 {
    1
}

#[derive(Deserialize)]
pub struct BlobQuery {
    pub size: usize,
    /// Bytes sent before the connection is dropped.
    pub cut: Option<usize>,
}

pub fn app() -> Router {
    Router::new()
        .route("/v1/items", get(list_items))
        .route("/v1/echo", post(echo).put(echo))
        .route("/v1/upload", post(upload).put(upload))
        .route("/v1/multipart", post(multipart_upload))
        .route("/status/{code}", get(status).post(status))
        .route("/files/blob", get(blob))
        .route("/files/stream", get(stream_blob))
        .route("/files/flaky", get(flaky_blob))
}

/// Loopback address for a `PORT` value. `Some("0")` picks a free port.
pub fn listen_addr(port: Option<&str>) -> SocketAddr {
    let port = port.and_then(|p| p.trim().parse().ok()).unwrap_or(DEFAULT_PORT);
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    axum::serve(listener, app()).await
}

/// Deterministic content of a `size`-byte file.
pub fn blob_bytes(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

/// Sum of all bytes, used to check uploads arrived intact.
pub fn checksum(bytes: &[u8]) -> u64 {
    bytes.iter().map(|&b| u64::from(b)).sum()
}

/// ETag of a `size`-byte blob.
pub fn blob_etag(size: usize) -> String {
    format!("\"blob-{size}\"")
}

async fn list_items(Query(query): Query<PageQuery>) -> Json<ItemPage> {
    let first = (query.page.saturating_sub(1)) * PAGE_SIZE + 1;
    let items = (first..first + PAGE_SIZE)
        .map(|id| Item {
            item_id: id,
            display_name: format!("Item {id}"),
            unit_price: f64::from(id) * 1.5,
        })
        .collect();
    Json(ItemPage {
        page: query.page,
        items,
        next_page: Some(query.page + 1),
    })
}

async fn echo(Json(body): Json<Value>) -> Json<Value> {
    Json(body)
}

async fn upload(body: Bytes) -> Json<UploadReceipt> {
    Json(UploadReceipt {
        upload_id: Uuid::new_v4(),
        bytes_received: body.len(),
        checksum: checksum(&body),
    })
}

async fn multipart_upload(mut multipart: Multipart) -> Result<Json<MultipartReceipt>, (StatusCode, String)> {
    let mut receipt = MultipartReceipt {
        fields: BTreeMap::new(),
        field_order: Vec::new(),
        file: None,
    };
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (e.status(), e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let content_type = field.content_type().unwrap_or("text/plain").to_string();
        receipt.field_order.push(name.clone());

        if content_type.starts_with("text/plain") {
            let value = field.text().await.map_err(|e| (e.status(), e.body_text()))?;
            receipt.fields.insert(name, value);
        } else {
            let data = field.bytes().await.map_err(|e| (e.status(), e.body_text()))?;
            receipt.file = Some(FilePart {
                field_name: name,
                content_type,
                size: data.len(),
                checksum: checksum(&data),
            });
        }
    }
    Ok(Json(receipt))
}

async fn status(Path(code): Path<u16>) -> Response {
    let Ok(status) = StatusCode::from_u16(code) else {
        return (StatusCode::BAD_REQUEST, "unknown status").into_response();
    };
    if status == StatusCode::NO_CONTENT {
        return status.into_response();
    }
    (status, "oops").into_response()
}

/// First byte requested by `Range: bytes=N-` or `bytes=N-M`.
fn range_start(headers: &HeaderMap) -> Option<usize> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let range = value.strip_prefix("bytes=")?;
    let (start, _) = range.split_once('-')?;
    start.trim().parse().ok()
}

fn chunked(data: Vec<u8>) -> impl futures_util::Stream<Item = Result<Bytes, Infallible>> {
    let chunks: Vec<_> = data
        .chunks(CHUNK_SIZE)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    stream::iter(chunks)
}

/// Full or ranged response for a blob, honouring `Range` when present.
fn ranged(size: usize, headers: &HeaderMap) -> Response {
    let data = blob_bytes(size);
    let etag = blob_etag(size);
    match range_start(headers) {
        Some(start) if start >= size => (
            StatusCode::RANGE_NOT_SATISFIABLE,
            [(header::CONTENT_RANGE, format!("bytes */{size}"))],
        )
            .into_response(),
        Some(start) => (
            StatusCode::PARTIAL_CONTENT,
            [
                (header::CONTENT_RANGE, format!("bytes {start}-{}/{size}", size - 1)),
                (header::ETAG, etag),
                (header::ACCEPT_RANGES, "bytes".to_string()),
            ],
            data[start..].to_vec(),
        )
            .into_response(),
        None => (
            StatusCode::OK,
            [(header::ETAG, etag), (header::ACCEPT_RANGES, "bytes".to_string())],
            data,
        )
            .into_response(),
    }
}

async fn blob(Query(query): Query<BlobQuery>, headers: HeaderMap) -> Response {
    ranged(query.size, &headers)
}

/// Blob sent as a chunked stream with no `Content-Length`.
async fn stream_blob(Query(query): Query<BlobQuery>) -> Response {
    Body::from_stream(chunked(blob_bytes(query.size))).into_response()
}

/// Announces the full length but drops the connection after `cut` bytes.
/// Ranged requests are served in full.
async fn flaky_blob(Query(query): Query<BlobQuery>, headers: HeaderMap) -> Response {
    if range_start(&headers).is_some() {
        return ranged(query.size, &headers);
    }
    let data = blob_bytes(query.size);
    let cut = query.cut.unwrap_or(query.size / 2).min(query.size);
    let head: Vec<Result<Bytes, std::io::Error>> = data[..cut]
        .chunks(CHUNK_SIZE)
        .map(|chunk| Ok(Bytes::copy_from_slice(chunk)))
        .collect();
    let body = stream::iter(head).chain(stream::once(async {
        // Let the head reach the socket before the connection is torn down.
        tokio::time::sleep(Duration::from_millis(50)).await;
        Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "dropped"))
    }));
    (
        StatusCode::OK,
        [
            (header::CONTENT_LENGTH, query.size.to_string()),
            (header::ETAG, blob_etag(query.size)),
        ],
        Body::from_stream(body),
    )
        .into_response()
}
