//! Monitoring listener: a small `tiny_http` server exposing cache
//! introspection and the Prometheus metrics text format. Separate from the
//! two DNS front-ends so it can be bound to a private address, or left
//! disabled entirely.

use std::sync::Arc;

use tiny_http::{Method, Request, Response, Server};

use crate::dns::context::ServerContext;

#[derive(Debug, derive_more::Display, derive_more::Error, derive_more::From)]
pub enum MonitorError {
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, MonitorError>;

pub struct MonitorServer {
    context: Arc<ServerContext>,
    listen: String,
}

impl MonitorServer {
    pub fn new(context: Arc<ServerContext>, listen: String) -> MonitorServer {
        MonitorServer { context, listen }
    }

    pub fn run_server(self) -> Result<()> {
        let server = Server::http(&self.listen).map_err(|e| {
            MonitorError::Io(std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, e))
        })?;

        for request in server.incoming_requests() {
            handle_request(&self.context, request);
        }

        Ok(())
    }
}

fn handle_request(context: &Arc<ServerContext>, request: Request) {
    let method = request.method().clone();
    let url = request.url().to_string();

    let response = match (method, url.as_str()) {
        (Method::Get, "/metrics") => metrics_response(),
        (Method::Get, "/debug/dnsserver/cache/dump") => cache_dump_response(context),
        (Method::Post, "/debug/dnsserver/cache/flush") => cache_flush_response(context),
        _ => Response::from_string("Not Found").with_status_code(404),
    };

    if let Err(e) = request.respond(response) {
        log::debug!("failed to write monitor response: {:?}", e);
    }
}

fn metrics_response() -> Response<std::io::Cursor<Vec<u8>>> {
    let header: tiny_http::Header = "Content-Type: text/plain; version=0.0.4".parse().unwrap();
    Response::from_data(crate::dns::metrics::encode_text()).with_header(header)
}

fn cache_dump_response(context: &Arc<ServerContext>) -> Response<std::io::Cursor<Vec<u8>>> {
    let entries = match &context.cache {
        Some(cache) => cache.dump(),
        None => Vec::new(),
    };
    Response::from_string(entries.join("\n"))
}

fn cache_flush_response(context: &Arc<ServerContext>) -> Response<std::io::Cursor<Vec<u8>>> {
    if let Some(cache) = &context.cache {
        cache.flush();
    }
    Response::from_string("flushed")
}
