#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use swerve::server::ServerOptions;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn loopback() -> ServerOptions {
    ServerOptions {
        addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..ServerOptions::port(0)
    }
}

/// Raw HTTP client that keeps whatever it read past the last response.
pub struct Client {
    stream: TcpStream,
    buf: Vec<u8>,
}

pub struct RawResponse {
    pub head: String,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn status_line(&self) -> &str {
        self.head.lines().next().unwrap_or_default()
    }

    pub fn has_header(&self, line: &str) -> bool {
        self.head.split("\r\n").any(|l| l == line)
    }
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            buf: Vec::new(),
        }
    }

    pub async fn send(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    async fn fill(&mut self) -> usize {
        let mut chunk = [0u8; 4096];
        let n = tokio::time::timeout(TIMEOUT, self.stream.read(&mut chunk))
            .await
            .expect("timed out waiting for the server")
            .unwrap_or(0);
        self.buf.extend_from_slice(&chunk[..n]);
        n
    }

    /// Reads one response framed by its Content-Length.
    pub async fn response(&mut self) -> RawResponse {
        let head_end = loop {
            if let Some(at) = self.buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break at + 4;
            }
            assert!(self.fill().await > 0, "connection closed before a response");
        };

        let head = String::from_utf8(self.buf[..head_end].to_vec()).unwrap();
        let len = head
            .split("\r\n")
            .find_map(|line| line.strip_prefix("Content-Length: "))
            .map(|v| v.parse::<usize>().unwrap())
            .unwrap_or(0);

        while self.buf.len() < head_end + len {
            assert!(self.fill().await > 0, "connection closed mid-body");
        }

        let body = self.buf[head_end..head_end + len].to_vec();
        self.buf.drain(..head_end + len);
        RawResponse { head, body }
    }

    /// Reads until the server closes, returning everything not yet consumed.
    pub async fn rest(&mut self) -> Vec<u8> {
        while self.fill().await > 0 {}
        std::mem::take(&mut self.buf)
    }
}
