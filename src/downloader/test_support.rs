// 测试用的本地 HTTP 文件服务器（支持 Range 与故障注入）

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::{header, HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// 生成确定性的测试内容
pub fn test_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 251) as u8).collect()
}

/// 记录的请求
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: Method,
    pub range: Option<(u64, Option<u64>)>,
}

impl RecordedRequest {
    pub fn range_start(&self) -> Option<u64> {
        self.range.map(|(start, _)| start)
    }
}

/// 注入的断连故障：起始偏移落在 [from, to] 的请求在发送 after_bytes 字节后断开
#[derive(Debug, Clone)]
struct Fault {
    from: u64,
    to: u64,
    after_bytes: usize,
    remaining: Option<u32>,
}

pub struct TestServerState {
    body: Vec<u8>,
    range_support: AtomicBool,
    head_allowed: AtomicBool,
    chunk_delay_ms: AtomicU64,
    status_override: Mutex<Option<u16>>,
    etag: Mutex<String>,
    content_disposition: Mutex<Option<String>>,
    faults: Mutex<Vec<Fault>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl TestServerState {
    fn new(body: Vec<u8>) -> Self {
        Self {
            body,
            range_support: AtomicBool::new(true),
            head_allowed: AtomicBool::new(true),
            chunk_delay_ms: AtomicU64::new(0),
            status_override: Mutex::new(None),
            etag: Mutex::new("\"v1\"".to_string()),
            content_disposition: Mutex::new(None),
            faults: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_range_support(&self, enabled: bool) {
        self.range_support.store(enabled, Ordering::SeqCst);
    }

    pub fn set_head_allowed(&self, allowed: bool) {
        self.head_allowed.store(allowed, Ordering::SeqCst);
    }

    /// 每发送 8KB 休眠的毫秒数
    pub fn set_chunk_delay_ms(&self, delay: u64) {
        self.chunk_delay_ms.store(delay, Ordering::SeqCst);
    }

    pub fn set_status_override(&self, status: Option<u16>) {
        *self.status_override.lock() = status;
    }

    pub fn set_etag(&self, etag: &str) {
        *self.etag.lock() = etag.to_string();
    }

    pub fn set_content_disposition(&self, value: Option<&str>) {
        *self.content_disposition.lock() = value.map(str::to_string);
    }

    /// 注入断连故障，times 为 None 表示每次都断开
    pub fn add_fault(&self, from: u64, to: u64, after_bytes: usize, times: Option<u32>) {
        self.faults.lock().push(Fault {
            from,
            to,
            after_bytes,
            remaining: times,
        });
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn get_requests(&self) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == Method::GET)
            .collect()
    }

    pub fn clear_requests(&self) {
        self.requests.lock().clear();
    }

    fn take_fault(&self, start: u64) -> Option<usize> {
        let mut faults = self.faults.lock();
        let fault = faults.iter_mut().find(|f| {
            f.from <= start && start <= f.to && f.remaining.map_or(true, |n| n > 0)
        })?;
        if let Some(n) = fault.remaining.as_mut() {
            *n -= 1;
        }
        Some(fault.after_bytes)
    }
}

fn parse_range(headers: &HeaderMap) -> Option<(u64, Option<u64>)> {
    let value = headers.get(header::RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start = start.parse().ok()?;
    let end = if end.is_empty() {
        None
    } else {
        Some(end.parse().ok()?)
    };
    Some((start, end))
}

fn body_stream(
    data: Vec<u8>,
    fail_after: Option<usize>,
    delay_ms: u64,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> {
    const CHUNK: usize = 8 * 1024;
    let limit = fail_after.unwrap_or(usize::MAX);

    futures::stream::unfold((0usize, data), move |(pos, data)| async move {
        if pos >= data.len() {
            return None;
        }
        if pos >= limit {
            let err = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "injected fault");
            let len = data.len();
            return Some((Err(err), (len, data)));
        }
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        let end = (pos + CHUNK).min(data.len()).min(limit);
        let chunk = Bytes::copy_from_slice(&data[pos..end]);
        Some((Ok(chunk), (end, data)))
    })
}

async fn serve_file(
    State(state): State<Arc<TestServerState>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let range = parse_range(&headers);
    state.requests.lock().push(RecordedRequest {
        method: method.clone(),
        range,
    });

    if let Some(code) = *state.status_override.lock() {
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return status.into_response();
    }

    let total = state.body.len() as u64;
    let etag = state.etag.lock().clone();
    let disposition = state.content_disposition.lock().clone();
    let range_support = state.range_support.load(Ordering::SeqCst);

    if method == Method::HEAD {
        if !state.head_allowed.load(Ordering::SeqCst) {
            return StatusCode::METHOD_NOT_ALLOWED.into_response();
        }
        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, total)
            .header(header::ETAG, etag);
        if range_support {
            builder = builder.header(header::ACCEPT_RANGES, "bytes");
        }
        if let Some(value) = &disposition {
            builder = builder.header(header::CONTENT_DISPOSITION, value.as_str());
        }
        return builder.body(Body::empty()).unwrap();
    }

    let (status, start, end) = match range {
        Some((start, end)) if range_support => {
            let end = end.unwrap_or(total - 1).min(total - 1);
            if start > end {
                return StatusCode::RANGE_NOT_SATISFIABLE.into_response();
            }
            (StatusCode::PARTIAL_CONTENT, start, end)
        }
        _ => (StatusCode::OK, 0, total - 1),
    };

    let slice = state.body[start as usize..=end as usize].to_vec();
    let len = slice.len();
    let fault = state.take_fault(start);
    let delay = state.chunk_delay_ms.load(Ordering::SeqCst);

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_LENGTH, len)
        .header(header::ETAG, etag);
    if let Some(value) = &disposition {
        builder = builder.header(header::CONTENT_DISPOSITION, value.as_str());
    }
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder
            .header(header::ACCEPT_RANGES, "bytes")
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", start, end, total),
            );
    }
    builder
        .body(Body::from_stream(body_stream(slice, fault, delay)))
        .unwrap()
}

pub struct TestServer {
    pub state: Arc<TestServerState>,
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start(len: usize) -> Self {
        let state = Arc::new(TestServerState::new(test_body(len)));
        let app = Router::new()
            .route("/file.bin", get(serve_file).head(serve_file))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self {
            state,
            addr,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/file.bin", self.addr)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
