//! In-process fake CouchDB for HTTP tests
//!
//! A raw `TcpListener` that answers each request from a route function and
//! closes the connection, so response bodies end at EOF. Replies are written
//! in separate chunks to exercise incremental line decoding.

#![allow(dead_code)]

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Reply of the fake server
pub struct Reply {
    pub status: u16,
    pub chunks: Vec<String>,
}

impl Reply {
    pub fn json(value: Value) -> Self {
        Self {
            status: 200,
            chunks: vec![value.to_string()],
        }
    }

    pub fn status(status: u16, body: &str) -> Self {
        Self {
            status,
            chunks: vec![body.to_string()],
        }
    }

    /// A continuous feed body, one chunk per line
    pub fn lines(lines: impl IntoIterator<Item = String>) -> Self {
        Self {
            status: 200,
            chunks: lines.into_iter().map(|l| format!("{}\n", l)).collect(),
        }
    }
}

type Route = dyn Fn(&str) -> Reply + Send + Sync;

pub struct FakeCouch {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl FakeCouch {
    pub async fn start<F>(route: F) -> Self
    where
        F: Fn(&str) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let route: Arc<Route> = Arc::new(route);

        let seen = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let route = route.clone();
                let seen = seen.clone();

                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    loop {
                        match socket.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }

                    let request = String::from_utf8_lossy(&buf);
                    let target = request
                        .lines()
                        .next()
                        .and_then(|line| line.split_whitespace().nth(1))
                        .unwrap_or("/")
                        .to_string();
                    seen.lock().push(target.clone());

                    let reply = route(&target);
                    let head = format!(
                        "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nConnection: close\r\n\r\n",
                        reply.status
                    );
                    if socket.write_all(head.as_bytes()).await.is_err() {
                        return;
                    }
                    for chunk in reply.chunks {
                        if socket.write_all(chunk.as_bytes()).await.is_err() {
                            return;
                        }
                        let _ = socket.flush().await;
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self, db: &str) -> String {
        format!("http://{}/{}", self.addr, db)
    }

    /// Request targets (path and query) in arrival order
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }
}

/// One `_changes` row
pub fn change_row(seq: u64, with_doc: bool) -> String {
    let id = format!("pkg-{}", seq);
    let mut row = json!({
        "seq": seq,
        "id": id,
        "changes": [{"rev": format!("1-{:x}", seq)}],
    });
    if with_doc {
        row["doc"] = json!({"_id": id, "_rev": format!("1-{:x}", seq), "name": id});
    }
    row.to_string()
}
