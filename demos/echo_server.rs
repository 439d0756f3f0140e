//! Echo server demo: prints everything a client sends (as text with `-t`,
//! as a hex dump with `-b`) and echoes it back.
//!
//! ```text
//! cargo run --example echo_server -- -t
//! ```

use std::io::{Read, Write};

use fiberio::coio::{self, CoStream};
use fiberio::io::IoManager;
use fiberio::server::TcpServer;
use std::time::Duration;

fn hex_dump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 && i % 16 == 0 {
            out.push('\n');
        }
        out.push_str(&format!("{:02x} ", byte));
    }
    out
}

fn handle_client(mut client: CoStream, binary: bool) {
    log::info!("handle client {:?}", client);
    let mut buf = [0u8; 1024];
    loop {
        match client.read(&mut buf) {
            Ok(0) => {
                log::info!("client close: {:?}", client);
                break;
            }
            Ok(n) => {
                if binary {
                    println!("{}", hex_dump(&buf[..n]));
                } else {
                    print!("{}", String::from_utf8_lossy(&buf[..n]));
                }
                let _ = std::io::stdout().flush();
                if let Err(e) = client.write_all(&buf[..n]) {
                    log::error!("echo write failed: {}", e);
                    break;
                }
            }
            Err(e) => {
                log::info!("client error: {}", e);
                break;
            }
        }
    }
}

fn main() {
    env_logger::init();

    let binary = match std::env::args().nth(1).as_deref() {
        Some("-b") => true,
        Some("-t") => false,
        _ => {
            eprintln!("usage: echo_server [-t|-b]");
            return;
        }
    };

    let io = IoManager::new(2, false, "echo");
    let io2 = io.clone();
    io.schedule(move || {
        let server = TcpServer::with_name(
            &io2,
            move |client: CoStream| handle_client(client, binary),
            "echo",
        );
        while server.bind("0.0.0.0:8020").is_err() {
            log::warn!("bind 0.0.0.0:8020 failed, retrying");
            coio::sleep(Duration::from_secs(2));
        }
        server.start();
    });

    // Serve until interrupted.
    loop {
        std::thread::sleep(Duration::from_secs(3600));
    }
}
