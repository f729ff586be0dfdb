//! Hello World responder.
//!
//! Answers every request with an HTML page listing the request parameters
//! and the size of the request body.
//!
//! # Running behind nginx
//!
//! ```text
//! cargo run --example hello_world
//!
//! location / {
//!     fastcgi_pass 127.0.0.1:16948;
//!     fastcgi_keep_conn on;
//!     include fastcgi_params;
//! }
//! ```

use std::fmt::Write as _;
use std::io::{Read, Write};
use std::net::TcpListener;

use fcgi_mux::{ResponderContext, Service, SocketConnection};

const LISTEN_ADDR: &str = "127.0.0.1:16948";

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn hello(ctx: &mut ResponderContext) -> fcgi_mux::HandlerResult {
    let mut body = Vec::new();
    ctx.stdin().read_to_end(&mut body)?;

    let mut page = String::new();
    let _ = write!(
        page,
        "<html><body><h1>Hello World</h1><p>request {} read {} bytes of input</p><table>",
        ctx.request_id(),
        body.len()
    );
    for (name, value) in ctx.params() {
        let _ = write!(
            page,
            "<tr><td>{}</td><td>{}</td></tr>",
            escape(&String::from_utf8_lossy(name)),
            escape(&String::from_utf8_lossy(value))
        );
    }
    page.push_str("</table></body></html>\n");

    let out = ctx.stdout();
    write!(out, "Content-Type: text/html\r\nContent-Length: {}\r\n\r\n", page.len())?;
    out.write_all(page.as_bytes())?;
    Ok(0)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let service = Service::builder().responder(hello).build()?;

    let listener = TcpListener::bind(LISTEN_ADDR)?;
    tracing::info!("listening on {}", LISTEN_ADDR);
    service.run(listener.incoming().map(|s| s.and_then(SocketConnection::new)))?;
    Ok(())
}
