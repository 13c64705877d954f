mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use swerve::http::request::Method;
use swerve::http::router::HttpServer;
use swerve::server::ServerState;
use tokio::sync::mpsc;

use common::{Client, TIMEOUT, loopback};

const GREETING: &str = "This is a test.";

fn with_greeting(server: &HttpServer) {
    server.add_handler(Method::Get, "/", false, |_request, mut response| {
        response.add_header("Content-Type", "text/plain");
        response.add_header("Content-Length", GREETING.len());
        response.write_str(GREETING);
        response.finish();
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn test_exact_path_handler() {
    let mut server = HttpServer::new(loopback());
    with_greeting(&server);
    let addr = server.start().unwrap();
    assert_eq!(server.state(), ServerState::Running);

    let mut client = Client::connect(addr).await;
    client.send(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").await;

    let reply = client.rest().await;
    let text = String::from_utf8(reply).unwrap();
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
    assert!(text.contains("\r\nContent-Type: text/plain\r\n"));
    assert!(text.contains("\r\nContent-Length: 15\r\n"));
    assert!(text.ends_with("\r\n\r\nThis is a test."));

    server.stop().unwrap();
    assert_eq!(server.state(), ServerState::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pattern_handler_captures() {
    let mut server = HttpServer::new(loopback());
    let (tx, mut rx) = mpsc::unbounded_channel();
    server
        .add_pattern_handler(Method::Get, "^/Downloads/(.+)$", false, move |values, _request, response| {
            let _ = tx.send(values);
            response.close();
        })
        .unwrap();
    let addr = server.start().unwrap();

    let mut client = Client::connect(addr).await;
    client.send(b"GET /Downloads/cat.png HTTP/1.1\r\n\r\n").await;

    let values = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(values, vec!["/Downloads/cat.png", "cat.png"]);
    assert!(client.rest().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_form_body_handler_runs_once() {
    let mut server = HttpServer::new(loopback());
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let counter = Arc::clone(&calls);
    server.add_handler(Method::Post, "/upload/url-form", true, move |request, mut response| {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(request.values.clone());
        response.add_header("Content-Length", 4);
        response.write_str("done");
        response.finish();
    });
    let addr = server.start().unwrap();

    let mut client = Client::connect(addr).await;
    client
        .send(
            b"POST /upload/url-form HTTP/1.1\r\n\
              Content-Type: application/x-www-form-urlencoded\r\n\
              Content-Length: 7\r\n\
              Connection: keep-alive\r\n\r\n",
        )
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.send(b"a=1&b=2").await;

    let values = tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .unwrap()
        .unwrap()
        .expect("form values");
    assert_eq!(values.len(), 2);
    assert_eq!(values["a"], "1");
    assert_eq!(values["b"], "2");

    let reply = client.response().await;
    assert_eq!(reply.status_line(), "HTTP/1.1 200 OK");
    assert_eq!(reply.body, b"done");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unmatched_path_closes_without_response() {
    let mut server = HttpServer::new(loopback());
    with_greeting(&server);
    let addr = server.start().unwrap();

    let mut client = Client::connect(addr).await;
    client.send(b"GET /nothing-here HTTP/1.1\r\nConnection: keep-alive\r\n\r\n").await;
    assert!(client.rest().await.is_empty());

    let mut client = Client::connect(addr).await;
    client.send(b"POST / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n").await;
    assert!(client.rest().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_request_line_closes() {
    let mut server = HttpServer::new(loopback());
    with_greeting(&server);
    let addr = server.start().unwrap();

    let mut client = Client::connect(addr).await;
    client.send(b"GET /\r\n\r\n").await;
    assert!(client.rest().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pipelined_requests_answer_in_order() {
    let mut server = HttpServer::new(loopback());
    let log = Arc::new(Mutex::new(Vec::new()));

    let slow_log = Arc::clone(&log);
    server.add_handler(Method::Get, "/slow", false, move |_request, mut response| {
        slow_log.lock().push("slow start");
        std::thread::sleep(Duration::from_millis(200));
        response.add_header("Content-Length", 4);
        response.write_str("slow");
        slow_log.lock().push("slow finish");
        response.finish();
    });

    let fast_log = Arc::clone(&log);
    server.add_handler(Method::Get, "/fast", false, move |_request, mut response| {
        fast_log.lock().push("fast start");
        response.add_header("Content-Length", 4);
        response.write_str("fast");
        response.finish();
    });
    let addr = server.start().unwrap();

    let mut client = Client::connect(addr).await;
    client
        .send(
            b"GET /slow HTTP/1.1\r\nConnection: keep-alive\r\n\r\n\
              GET /fast HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
        )
        .await;

    assert_eq!(client.response().await.body, b"slow");
    assert_eq!(client.response().await.body, b"fast");
    assert_eq!(*log.lock(), vec!["slow start", "slow finish", "fast start"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_split_across_writes() {
    let mut server = HttpServer::new(loopback());
    with_greeting(&server);
    let addr = server.start().unwrap();

    let mut client = Client::connect(addr).await;
    for piece in [&b"GET / HT"[..], b"TP/1.1\r", b"\nConnection: keep-alive\r\n\r", b"\n"] {
        client.send(piece).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    let reply = client.response().await;
    assert_eq!(reply.status_line(), "HTTP/1.1 200 OK");
    assert_eq!(reply.body, GREETING.as_bytes());

    // keep-alive: the same connection answers again
    client.send(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n").await;
    assert_eq!(client.response().await.body, GREETING.as_bytes());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_body_skipped_for_immediate_handler() {
    let mut server = HttpServer::new(loopback());
    with_greeting(&server);
    server.add_handler(Method::Post, "/ignore", false, |request, mut response| {
        assert!(request.values.is_none());
        response.add_header("Content-Length", 2);
        response.write_str("ok");
        response.finish();
    });
    let addr = server.start().unwrap();

    let mut client = Client::connect(addr).await;
    client
        .send(
            b"POST /ignore HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: 9\r\n\r\nGET / bad\
              GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
        )
        .await;

    assert_eq!(client.response().await.body, b"ok");
    assert_eq!(client.response().await.body, GREETING.as_bytes());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unsupported_body_type_gets_415() {
    let mut server = HttpServer::new(loopback());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    server.add_handler(Method::Put, "/upload", true, move |_request, response| {
        counter.fetch_add(1, Ordering::SeqCst);
        response.finish();
    });
    let addr = server.start().unwrap();

    let mut client = Client::connect(addr).await;
    client
        .send(
            b"PUT /upload HTTP/1.1\r\nConnection: keep-alive\r\n\
              Content-Type: application/json\r\nContent-Length: 2\r\n\r\n{}",
        )
        .await;

    let reply = client.response().await;
    assert_eq!(reply.status_line(), "HTTP/1.1 415 Unsupported Media Type");
    assert!(reply.has_header("Content-Length: 0"));
    assert!(client.rest().await.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_response_closes_connection() {
    let mut server = HttpServer::new(loopback());
    server.add_handler(Method::Get, "/forgetful", false, |_request, _response| {});
    let addr = server.start().unwrap();

    let mut client = Client::connect(addr).await;
    client.send(b"GET /forgetful HTTP/1.1\r\nConnection: keep-alive\r\n\r\n").await;
    assert!(client.rest().await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_repeated_response_headers_are_joined() {
    let mut server = HttpServer::new(loopback());
    server.add_handler(Method::Get, "/h", false, |_request, mut response| {
        response.add_header("Cache-Control", "no-cache");
        response.add_header("Cache-Control", "no-store");
        response.add_header("Content-Length", 0);
        response.write_str("");
        response.finish();
    });
    let addr = server.start().unwrap();

    let mut client = Client::connect(addr).await;
    client.send(b"GET /h HTTP/1.1\r\nConnection: keep-alive\r\n\r\n").await;

    let reply = client.response().await;
    assert!(reply.has_header("Cache-Control: no-cache; no-store"));
    assert!(reply.body.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_closes_open_connections() {
    let mut server = HttpServer::new(loopback());
    with_greeting(&server);
    let addr = server.start().unwrap();

    let mut client = Client::connect(addr).await;
    client.send(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n").await;
    client.response().await;
    assert_eq!(server.connection_count(), 1);

    server.stop().unwrap();
    assert!(client.rest().await.is_empty());
    assert_eq!(server.connection_count(), 0);
}

fn reply_with(server: &HttpServer, method: Method, path: &str, body: &'static str, delay: Duration) {
    server.add_handler(method, path, false, move |_request, mut response| {
        std::thread::sleep(delay);
        response.add_header("Content-Length", body.len());
        response.write_str(body);
        response.finish();
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn test_body_request_arriving_behind_in_flight_one() {
    let mut server = HttpServer::new(loopback());
    reply_with(&server, Method::Get, "/a", "a", Duration::from_millis(30));
    reply_with(&server, Method::Post, "/b", "b", Duration::ZERO);
    reply_with(&server, Method::Get, "/c", "c", Duration::ZERO);
    let addr = server.start().unwrap();

    let mut client = Client::connect(addr).await;
    client.send(b"GET /a HTTP/1.1\r\nConnection: keep-alive\r\n\r\n").await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    client
        .send(b"POST /b HTTP/1.1\r\nConnection: keep-alive\r\nContent-Length: 2\r\n\r\nxy")
        .await;
    client.send(b"GET /c HTTP/1.1\r\nConnection: keep-alive\r\n\r\n").await;

    assert_eq!(client.response().await.body, b"a");
    assert_eq!(client.response().await.body, b"b");
    assert_eq!(client.response().await.body, b"c");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_queued_form_body_waits_for_its_turn() {
    let mut server = HttpServer::new(loopback());
    with_greeting(&server);
    reply_with(&server, Method::Get, "/slow", "slow", Duration::from_millis(100));

    let (tx, mut rx) = mpsc::unbounded_channel();
    server.add_handler(Method::Post, "/form", true, move |request, mut response| {
        let _ = tx.send(request.value("a").map(str::to_string));
        response.add_header("Content-Length", 2);
        response.write_str("ok");
        response.finish();
    });
    let addr = server.start().unwrap();

    let mut client = Client::connect(addr).await;
    client
        .send(
            b"GET /slow HTTP/1.1\r\nConnection: keep-alive\r\n\r\n\
              POST /form HTTP/1.1\r\nConnection: keep-alive\r\n\
              Content-Type: application/x-www-form-urlencoded\r\nContent-Length: 3\r\n\r\na=1\
              GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n",
        )
        .await;

    assert_eq!(client.response().await.body, b"slow");
    let value = tokio::time::timeout(TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(value.as_deref(), Some("1"));
    assert_eq!(client.response().await.body, b"ok");
    assert_eq!(client.response().await.body, GREETING.as_bytes());
}
