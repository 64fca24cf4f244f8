//! HTTP fixtures and appender doubles shared by the scrape tests.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

use common::error::{Error, Result};

use crate::appender::{Appender, Sample};

/// Minimal HTTP/1.1 test endpoint backed by a raw TCP listener. Every
/// connection gets the same response; request heads are captured for
/// assertions on paths, query strings and headers.
pub(crate) struct TestServer {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    pub async fn serve(body: impl Into<String>) -> Self {
        Self::respond(200, body.into(), Duration::ZERO).await
    }

    pub async fn respond(status: u16, body: String, delay: Duration) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&requests);

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let captured = Arc::clone(&captured);
                let body = body.clone();
                tokio::spawn(async move {
                    let head = read_request_head(&mut socket).await;
                    captured.lock().unwrap().push(head);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    write_response(&mut socket, status, &body).await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self) -> String {
        format!("http://{}/metrics", self.addr)
    }
}

pub(crate) async fn read_request_head<S>(socket: &mut S) -> String
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                head.extend_from_slice(&buf[..n]);
                if head.windows(4).any(|window| window == b"\r\n\r\n") {
                    break;
                }
            }
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

pub(crate) async fn write_response<S>(socket: &mut S, status: u16, body: &str)
where
    S: AsyncWrite + Unpin,
{
    let reason = match status {
        200 => "OK",
        404 => "Not Found",
        _ => "",
    };
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len(),
    );
    let _ = socket.write_all(response.as_bytes()).await;
    let _ = socket.shutdown().await;
}

/// Collects every appended sample for later assertions.
#[derive(Default)]
pub(crate) struct CollectAppender {
    samples: Mutex<Vec<Sample>>,
}

impl CollectAppender {
    pub fn collected(&self) -> Vec<Sample> {
        self.samples.lock().unwrap().clone()
    }
}

#[async_trait]
impl Appender for CollectAppender {
    async fn append(&self, sample: Sample) -> Result<()> {
        self.samples.lock().unwrap().push(sample);
        Ok(())
    }
}

/// Discards everything.
pub(crate) struct NopAppender;

#[async_trait]
impl Appender for NopAppender {
    async fn append(&self, _sample: Sample) -> Result<()> {
        Ok(())
    }
}

/// Rejects every sample.
pub(crate) struct FailingAppender;

#[async_trait]
impl Appender for FailingAppender {
    async fn append(&self, _sample: Sample) -> Result<()> {
        Err(Error::Append("sink rejected sample".into()))
    }
}
