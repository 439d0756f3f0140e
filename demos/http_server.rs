//! Minimal HTTP server demo on port 8020.
//!
//! ```text
//! cargo run --example http_server
//! curl -v http://127.0.0.1:8020/hello
//! ```

use fiberio::http::{HttpServer, Response, Status};
use fiberio::io::IoManager;

fn main() {
    env_logger::init();

    let io = IoManager::new(2, false, "http");
    let server = HttpServer::new(&io, |request| {
        let mut response = Response::with_status(Status::Ok);
        response.set_header("content-type", "text/plain");
        response.body = format!("you asked for {} {}\r\n", request.method, request.path)
            .into_bytes();
        response
    });
    server
        .bind("0.0.0.0:8020")
        .expect("bind 0.0.0.0:8020 failed");
    server.start();
    log::info!("serving on 0.0.0.0:8020");

    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}
