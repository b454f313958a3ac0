//! Static HTTP server for a local image mirror
//!
//! Serves a directory tree read-only over plain HTTP/1.1:
//! - `GET` and `HEAD` only; anything else is 405
//! - directories serve their `index.html`, or a generated listing
//! - files are streamed in chunks, never read whole into memory
//! - request paths are percent-decoded and confined to the root

use bytes::Bytes;
use futures::stream;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use hyper::body::Frame;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use vmimg_core::digest::CHUNK_SIZE;

/// Response body: either a small buffer or a streamed file
pub type Body = UnsyncBoxBody<Bytes, std::io::Error>;

/// Server errors
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// A bound, not yet running, image server
pub struct ImageServer {
    listener: TcpListener,
    addr: SocketAddr,
    root: Arc<PathBuf>,
}

impl ImageServer {
    /// Bind `host:port` (port 0 picks a free port) to serve `root`.
    pub async fn bind(host: &str, port: u16, root: impl Into<PathBuf>) -> Result<Self> {
        let target = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };
        let listener = TcpListener::bind(&target)
            .await
            .map_err(|source| ServerError::Bind {
                addr: target.clone(),
                source,
            })?;
        let addr = listener.local_addr()?;
        Ok(Self {
            listener,
            addr,
            root: Arc::new(root.into()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// URL of the served root, using the actually bound address
    pub fn base_url(&self) -> String {
        base_url(self.addr)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Serve until the accept loop fails.
    pub async fn serve(self) -> Result<()> {
        self.serve_with_shutdown(std::future::pending()).await
    }

    /// Serve until `shutdown` resolves. Connections already accepted keep
    /// running on their own tasks.
    pub async fn serve_with_shutdown<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!("Serving {} on {}", self.root.display(), self.base_url());
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Stopped accepting connections on {}", self.addr);
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, peer) = accepted?;
                    let root = self.root.clone();
                    let io = TokioIo::new(stream);

                    tokio::spawn(async move {
                        let service = service_fn(move |req| handle_request(req, root.clone()));
                        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                            debug!("Error serving connection from {}: {:?}", peer, e);
                        }
                    });
                }
            }
        }
    }

    /// Run on a background task. Dropping the handle also stops the server.
    pub fn spawn(self) -> ServerHandle {
        let (tx, rx) = oneshot::channel::<()>();
        let addr = self.addr;
        let task = tokio::spawn(async move {
            let shutdown = async {
                let _ = rx.await;
            };
            if let Err(e) = self.serve_with_shutdown(shutdown).await {
                error!("Image server on {} failed: {}", addr, e);
            }
        });
        ServerHandle {
            addr,
            shutdown: tx,
            task,
        }
    }
}

/// Handle to a running [`ImageServer`]
pub struct ServerHandle {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        base_url(self.addr)
    }

    /// Stop accepting connections and wait for the accept loop to exit.
    /// In-flight requests are not interrupted.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            error!("Image server task on {} panicked: {}", self.addr, e);
        }
    }
}

fn base_url(addr: SocketAddr) -> String {
    format!("http://{}", addr)
}

/// Handle one HTTP request against `root`.
pub async fn handle_request<B>(
    req: Request<B>,
    root: Arc<PathBuf>,
) -> std::result::Result<Response<Body>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let response = respond(&root, &method, &path).await;
    info!("{} {} {}", method, path, response.status().as_u16());
    Ok(response)
}

/// Build the response for `method` on `uri_path` (still percent-encoded).
pub async fn respond(root: &Path, method: &Method, uri_path: &str) -> Response<Body> {
    match method {
        &Method::GET => serve_path(root, uri_path, false).await,
        &Method::HEAD => serve_path(root, uri_path, true).await,
        _ => {
            let mut resp = text_response(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed\n");
            resp.headers_mut()
                .insert(header::ALLOW, HeaderValue::from_static("GET, HEAD"));
            resp
        }
    }
}

async fn serve_path(root: &Path, uri_path: &str, head: bool) -> Response<Body> {
    let Some(path) = resolve(root, uri_path) else {
        return not_found();
    };
    let Ok(meta) = tokio::fs::metadata(&path).await else {
        return not_found();
    };
    // symlinks may not lead out of the root either
    match (
        tokio::fs::canonicalize(&path).await,
        tokio::fs::canonicalize(root).await,
    ) {
        (Ok(real), Ok(real_root)) if real.starts_with(&real_root) => {}
        _ => return not_found(),
    }

    if meta.is_dir() {
        if !uri_path.ends_with('/') {
            return redirect(&format!("{}/", uri_path));
        }
        let index = path.join("index.html");
        if let Ok(m) = tokio::fs::metadata(&index).await {
            if m.is_file() {
                return serve_file(&index, m.len(), head).await;
            }
        }
        return match listing(&path, uri_path).await {
            Ok(html) => {
                let len = html.len() as u64;
                let body = if head { empty() } else { full(html) };
                with_headers(StatusCode::OK, "text/html; charset=utf-8", len, body)
            }
            Err(e) => internal_error(e),
        };
    }

    serve_file(&path, meta.len(), head).await
}

async fn serve_file(path: &Path, len: u64, head: bool) -> Response<Body> {
    let body = if head {
        empty()
    } else {
        match tokio::fs::File::open(path).await {
            Ok(file) => file_body(file),
            Err(e) => return internal_error(e),
        }
    };
    with_headers(StatusCode::OK, content_type(path), len, body)
}

/// Stream a file in fixed-size chunks.
fn file_body(file: tokio::fs::File) -> Body {
    let chunks = stream::try_unfold(file, |mut file| async move {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        buf.truncate(n);
        Ok(Some((Frame::data(Bytes::from(buf)), file)))
    });
    StreamBody::new(chunks).boxed_unsync()
}

async fn listing(dir: &Path, uri_path: &str) -> std::io::Result<String> {
    let mut names = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await?.is_dir() {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();

    let shown = percent_decode(uri_path).unwrap_or_else(|| uri_path.to_string());
    let title = html_escape(&shown);
    let mut html = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Index of {0}</title></head>\n<body>\n<h1>Index of {0}</h1>\n<ul>\n",
        title
    );
    for name in &names {
        html.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>\n",
            percent_encode(name),
            html_escape(name)
        ));
    }
    html.push_str("</ul>\n</body>\n</html>\n");
    Ok(html)
}

/// Map a request path onto the filesystem under `root`. `None` if it is not
/// valid percent-encoded UTF-8 or tries to climb out with `..`.
pub fn resolve(root: &Path, uri_path: &str) -> Option<PathBuf> {
    let decoded = percent_decode(uri_path)?;
    let mut out = root.to_path_buf();
    for part in decoded.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            p if p.contains('\0') || p.contains('\\') => return None,
            p => out.push(p),
        }
    }
    Some(out)
}

/// Decode `%XX` escapes. `None` for truncated escapes or invalid UTF-8.
pub fn percent_decode(s: &str) -> Option<String> {
    let mut out = Vec::with_capacity(s.len());
    let mut bytes = s.bytes();
    while let Some(b) = bytes.next() {
        if b == b'%' {
            let hi = hex_val(bytes.next()?)?;
            let lo = hex_val(bytes.next()?)?;
            out.push(hi << 4 | lo);
        } else {
            out.push(b);
        }
    }
    String::from_utf8(out).ok()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Escape everything but unreserved characters and `/`.
pub fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'/' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// Content type by file extension
pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "json" => "application/json",
        "sjson" | "txt" | "asc" => "text/plain; charset=utf-8",
        "html" | "htm" => "text/html; charset=utf-8",
        "gz" => "application/gzip",
        "xz" => "application/x-xz",
        "bz2" => "application/x-bzip2",
        "tar" => "application/x-tar",
        "iso" => "application/x-iso9660-image",
        _ => "application/octet-stream",
    }
}

fn full(data: impl Into<Bytes>) -> Body {
    Full::new(data.into())
        .map_err(|never: Infallible| match never {})
        .boxed_unsync()
}

fn empty() -> Body {
    Empty::<Bytes>::new()
        .map_err(|never: Infallible| match never {})
        .boxed_unsync()
}

fn with_headers(status: StatusCode, content_type: &'static str, len: u64, body: Body) -> Response<Body> {
    let mut resp = Response::new(body);
    *resp.status_mut() = status;
    let headers = resp.headers_mut();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    resp
}

fn text_response(status: StatusCode, text: &'static str) -> Response<Body> {
    with_headers(status, "text/plain; charset=utf-8", text.len() as u64, full(text))
}

fn not_found() -> Response<Body> {
    text_response(StatusCode::NOT_FOUND, "Not found\n")
}

fn internal_error(e: std::io::Error) -> Response<Body> {
    error!("Failed to serve file: {}", e);
    text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error\n")
}

fn redirect(location: &str) -> Response<Body> {
    let mut resp = text_response(StatusCode::MOVED_PERMANENTLY, "Moved\n");
    if let Ok(value) = HeaderValue::from_str(location) {
        resp.headers_mut().insert(header::LOCATION, value);
    }
    resp
}
