//! Image server integration tests over real TCP connections

use std::fs;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use vmimg_server::ImageServer;

fn mirror() -> TempDir {
    let tmp = TempDir::new().unwrap();
    fs::create_dir_all(tmp.path().join("focal/amd64/20200301")).unwrap();
    fs::create_dir_all(tmp.path().join("streams/v1")).unwrap();
    // larger than one read chunk so the body is streamed in pieces
    let image: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    fs::write(tmp.path().join("focal/amd64/20200301/root-image.gz"), &image).unwrap();
    fs::write(tmp.path().join("streams/v1/vmtest.json"), br#"{"format": "products:1.0"}"#).unwrap();
    tmp
}

/// Send a raw request line, bypassing client-side path normalization.
async fn raw_status(addr: std::net::SocketAddr, request_line: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let req = format!("{}\r\nHost: localhost\r\nConnection: close\r\n\r\n", request_line);
    stream.write_all(req.as_bytes()).await.unwrap();
    let mut resp = Vec::new();
    stream.read_to_end(&mut resp).await.unwrap();
    let text = String::from_utf8_lossy(&resp);
    text.lines().next().unwrap_or_default().to_string()
}

#[tokio::test]
async fn test_ephemeral_port_base_url() {
    let dir = mirror();
    let server = ImageServer::bind("127.0.0.1", 0, dir.path()).await.unwrap();
    let port = server.local_addr().port();
    assert_ne!(port, 0);
    assert_eq!(server.base_url(), format!("http://127.0.0.1:{}", port));
}

#[tokio::test]
async fn test_serves_files_streamed() {
    let dir = mirror();
    let handle = ImageServer::bind("127.0.0.1", 0, dir.path()).await.unwrap().spawn();
    let base = handle.base_url();

    let resp = reqwest::get(format!("{}/focal/amd64/20200301/root-image.gz", base))
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-type"], "application/gzip");
    let body = resp.bytes().await.unwrap();
    assert_eq!(body.len(), 200_000);
    assert_eq!(body[..], fs::read(dir.path().join("focal/amd64/20200301/root-image.gz")).unwrap()[..]);

    let resp = reqwest::get(format!("{}/streams/v1/vmtest.json", base)).await.unwrap();
    assert_eq!(resp.headers()["content-type"], "application/json");

    let resp = reqwest::Client::new()
        .head(format!("{}/focal/amd64/20200301/root-image.gz", base))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["content-length"], "200000");

    handle.stop().await;
}

#[tokio::test]
async fn test_errors_and_listing() {
    let dir = mirror();
    let handle = ImageServer::bind("127.0.0.1", 0, dir.path()).await.unwrap().spawn();
    let base = handle.base_url();
    let client = reqwest::Client::new();

    let resp = client.get(format!("{}/nope.img", base)).send().await.unwrap();
    assert_eq!(resp.status(), 404);

    let resp = client.post(format!("{}/streams/v1/vmtest.json", base)).send().await.unwrap();
    assert_eq!(resp.status(), 405);

    let listing = client.get(format!("{}/focal/amd64/", base)).send().await.unwrap();
    assert_eq!(listing.status(), 200);
    assert!(listing.text().await.unwrap().contains("20200301/"));

    let status = raw_status(handle.local_addr(), "GET /../../etc/passwd HTTP/1.1").await;
    assert!(status.contains("404"), "got {status:?}");
    let status = raw_status(handle.local_addr(), "GET /focal/%2e%2e/%2e%2e/x HTTP/1.1").await;
    assert!(status.contains("404"), "got {status:?}");

    handle.stop().await;
}

#[tokio::test]
async fn test_stop_refuses_new_connections() {
    let dir = mirror();
    let handle = ImageServer::bind("127.0.0.1", 0, dir.path()).await.unwrap().spawn();
    let addr = handle.local_addr();
    assert!(TcpStream::connect(addr).await.is_ok());

    handle.stop().await;
    assert!(TcpStream::connect(addr).await.is_err());
}
