use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;

use fiberio::http::{parse_response, HttpServer, Response, Status};
use fiberio::io::IoManager;
use fiberio::server::TcpServer;
use fiberio::sync::Semaphore;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn read_until_response(stream: &mut TcpStream) -> (fiberio::http::Response, Vec<u8>) {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some((response, consumed)) = parse_response(&buf).unwrap() {
            let body_len: usize = response
                .header("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            while buf.len() < consumed + body_len {
                let n = stream.read(&mut chunk).unwrap();
                assert!(n > 0, "eof inside body");
                buf.extend_from_slice(&chunk[..n]);
            }
            return (response, buf[consumed..consumed + body_len].to_vec());
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "eof inside head");
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[test]
fn echo_server_scenario() {
    init();
    let io = IoManager::new(2, false, "echo");
    let closed = Arc::new(AtomicUsize::new(0));
    let closed2 = closed.clone();

    let server = TcpServer::with_name(
        &io,
        move |mut client: fiberio::coio::CoStream| {
            let mut buf = [0u8; 1024];
            loop {
                match client.read(&mut buf) {
                    Ok(0) => {
                        log::info!("client close: {:?}", client);
                        closed2.fetch_add(1, Ordering::SeqCst);
                        break;
                    }
                    Ok(n) => {
                        if client.write_all(&buf[..n]).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::info!("client error: {}", e);
                        break;
                    }
                }
            }
        },
        "echo",
    );
    let addr = server.bind("127.0.0.1:0").unwrap();
    server.start();

    // Two clients, each sends "hello" and reads it back.
    let mut clients = Vec::new();
    for _ in 0..2 {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        clients.push(stream);
    }
    drop(clients);

    // Both closes are observed by the handler fibers.
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while closed.load(Ordering::SeqCst) < 2 {
        assert!(std::time::Instant::now() < deadline, "close not observed");
        std::thread::sleep(Duration::from_millis(10));
    }

    server.stop();
    std::thread::sleep(Duration::from_millis(50));
    io.stop();
}

#[test]
fn http_requests_roundtrip() {
    init();
    let io = IoManager::new(2, false, "http");
    let hits = Arc::new(AtomicUsize::new(0));
    let hits2 = hits.clone();

    let server = HttpServer::new(&io, move |request| {
        hits2.fetch_add(1, Ordering::SeqCst);
        let mut response = Response::with_status(Status::Ok);
        response.set_header("content-type", "text/plain");
        response.body = format!("{} {}", request.method, request.path).into_bytes();
        response
    });
    let addr = server.bind("127.0.0.1:0").unwrap();
    server.start();

    let mut stream = TcpStream::connect(addr).unwrap();

    // Two keep-alive requests on one connection.
    stream
        .write_all(b"GET /alpha HTTP/1.1\r\nconnection: keep-alive\r\n\r\n")
        .unwrap();
    let (response, body) = read_until_response(&mut stream);
    assert_eq!(response.status, Status::Ok);
    assert!(!response.close);
    assert_eq!(body, b"GET /alpha");

    stream
        .write_all(b"POST /beta HTTP/1.1\r\ncontent-length: 3\r\nconnection: close\r\n\r\nxyz")
        .unwrap();
    let (response, body) = read_until_response(&mut stream);
    assert_eq!(response.status, Status::Ok);
    assert!(response.close);
    assert_eq!(body, b"POST /beta");

    // The server honored connection: close.
    let mut rest = Vec::new();
    assert_eq!(stream.read_to_end(&mut rest).unwrap(), 0);
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    server.stop();
    std::thread::sleep(Duration::from_millis(50));
    io.stop();
}

#[test]
fn malformed_request_gets_bad_request() {
    init();
    let io = IoManager::new(1, false, "badreq");
    let server = HttpServer::with_default_handler(&io);
    let addr = server.bind("127.0.0.1:0").unwrap();
    server.start();

    let mut stream = TcpStream::connect(addr).unwrap();
    stream.write_all(b"NOT-HTTP nonsense\r\n\r\n").unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    let text = String::from_utf8_lossy(&reply);
    assert!(text.starts_with("HTTP/1.1 400 Bad Request"), "got: {}", text);

    server.stop();
    std::thread::sleep(Duration::from_millis(50));
    io.stop();
}

#[test]
fn accept_continues_after_handler_panic() {
    init();
    let io = IoManager::new(2, false, "panics");
    let ok = Arc::new(Semaphore::new(0));
    let ok2 = ok.clone();
    let first = Arc::new(AtomicUsize::new(0));

    let server = TcpServer::new(&io, move |mut client: fiberio::coio::CoStream| {
        if first.fetch_add(1, Ordering::SeqCst) == 0 {
            panic!("handler crashed");
        }
        let _ = client.write_all(b"ok");
        ok2.notify();
    });
    let addr = server.bind("127.0.0.1:0").unwrap();
    server.start();

    // First connection blows up the handler fiber...
    drop(TcpStream::connect(addr).unwrap());
    // ...the server keeps accepting regardless.
    let mut stream = TcpStream::connect(addr).unwrap();
    ok.wait();
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"ok");

    server.stop();
    std::thread::sleep(Duration::from_millis(50));
    io.stop();
}
