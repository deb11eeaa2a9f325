//! The HTTPS front-end: the HTTPS→DNS direction. Accepts DoH requests in
//! either the RFC 8484 wire dialect or the Google JSON dialect, resolves
//! them against the classic DNS client (through the override table, then
//! the cache), and replies in the matching dialect.

use std::io::Read as _;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::thread::Builder;

use base64::{decode_config, URL_SAFE_NO_PAD};
use tiny_http::{Header, Method, Request, Response, Server};

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};
use crate::dns::client::ClientError;
use crate::dns::context::ServerContext;
use crate::dns::errors::{ErrorKind, HttpStatusMapped};
use crate::dns::fingerprint::Fingerprint;
use crate::dns::json::{self, JsonRequest};
use crate::dns::metrics::{DNS_QUERIES_TOTAL, DNS_RESPONSES_TOTAL, ERRORS_TOTAL};
use crate::dns::protocol::{DnsPacket, ResultCode};

const WIRE_CONTENT_TYPE: &str = "application/dns-message";

#[derive(Debug, derive_more::Display, derive_more::Error, derive_more::From)]
pub enum DohServerError {
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, DohServerError>;

/// The HTTPS server: a fixed pool of worker threads pulls requests off the
/// `tiny_http::Server`'s shared queue, same shape as the DNS front-end's
/// thread pool.
pub struct DohHttpServer {
    context: Arc<ServerContext>,
    thread_count: usize,
    listen: String,
    wire_path: String,
    json_path: String,
}

impl DohHttpServer {
    pub fn new(context: Arc<ServerContext>, thread_count: usize) -> DohHttpServer {
        let listen = context.frontend.doh_listen.clone();
        let wire_path = context.frontend.wire_path.clone();
        let json_path = context.frontend.json_path.clone();
        DohHttpServer {
            context,
            thread_count,
            listen,
            wire_path,
            json_path,
        }
    }

    pub fn run_server(self) -> Result<()> {
        let server = Server::http(&self.listen).map_err(|e| {
            DohServerError::Io(std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, e))
        })?;
        let server = Arc::new(server);

        for thread_id in 0..self.thread_count {
            let server = server.clone();
            let context = self.context.clone();
            let wire_path = self.wire_path.clone();
            let json_path = self.json_path.clone();

            Builder::new()
                .name(format!("doh-http-worker-{}", thread_id))
                .spawn(move || loop {
                    let request = match server.recv() {
                        Ok(request) => request,
                        Err(e) => {
                            log::debug!("failed to receive HTTP request: {:?}", e);
                            continue;
                        }
                    };

                    handle_request(&context, request, &wire_path, &json_path);
                })?;
        }

        Ok(())
    }
}

fn content_type(request: &Request) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.as_str() == "Content-Type")
        .map(|h| h.value.clone().into())
}

fn query_string(url: &str) -> &str {
    url.splitn(2, '?').nth(1).unwrap_or("")
}

fn path_only(url: &str) -> &str {
    url.splitn(2, '?').next().unwrap_or(url)
}

fn handle_request(context: &Arc<ServerContext>, mut request: Request, wire_path: &str, json_path: &str) {
    if context.shutdown.is_shutting_down() {
        let _ = request.respond(plain_response(503, "shutting down"));
        return;
    }
    let _guard = context.shutdown.track_request();

    let method = request.method().clone();
    let url = request.url().to_string();
    let path = path_only(&url);
    let query = query_string(&url);

    let response = match method {
        Method::Get if path == wire_path => handle_wire_get(context, query),
        Method::Get if path == json_path => handle_json_get(context, query),
        Method::Post if path == wire_path => handle_wire_post(context, &mut request),
        Method::Post if path == json_path => handle_json_post(context, &mut request),
        _ => plain_response(404, "Not Found"),
    };

    if let Err(e) = request.respond(response) {
        log::debug!("failed to write HTTP response: {:?}", e);
    }
}

fn plain_response(status: u16, body: &str) -> Response<std::io::Cursor<Vec<u8>>> {
    Response::from_string(body.to_string()).with_status_code(status)
}

fn wire_response(status: u16, bytes: Vec<u8>) -> Response<std::io::Cursor<Vec<u8>>> {
    let header: Header = format!("Content-Type: {}", WIRE_CONTENT_TYPE).parse().unwrap();
    Response::from_data(bytes).with_status_code(status).with_header(header)
}

fn json_response(status: u16, body: &json::JsonResponse) -> Response<std::io::Cursor<Vec<u8>>> {
    let payload = serde_json::to_string(body).unwrap_or_else(|_| "{}".to_string());
    let header: Header = "Content-Type: application/json".parse().unwrap();
    Response::from_string(payload).with_status_code(status).with_header(header)
}

fn handle_wire_get(context: &Arc<ServerContext>, query: &str) -> Response<std::io::Cursor<Vec<u8>>> {
    let dns_param = query
        .split('&')
        .find_map(|pair| pair.strip_prefix("dns="));

    let dns_param = match dns_param {
        Some(p) => p,
        None => {
            ERRORS_TOTAL.with_label_values(&["doh_server", "malformed"]).inc();
            return plain_response(400, "missing dns parameter");
        }
    };

    let bytes = match decode_config(dns_param, URL_SAFE_NO_PAD) {
        Ok(b) => b,
        Err(_) => {
            ERRORS_TOTAL.with_label_values(&["doh_server", "malformed"]).inc();
            return plain_response(400, "invalid base64url");
        }
    };

    resolve_wire(context, bytes)
}

fn handle_wire_post(context: &Arc<ServerContext>, request: &mut Request) -> Response<std::io::Cursor<Vec<u8>>> {
    match content_type(request) {
        Some(ct) if ct.starts_with(WIRE_CONTENT_TYPE) => {}
        Some(_) => return plain_response(415, "unsupported media type"),
        None => return plain_response(415, "missing content type"),
    }

    let mut body = Vec::new();
    if request.as_reader().read_to_end(&mut body).is_err() {
        return plain_response(400, "failed to read request body");
    }

    resolve_wire(context, body)
}

fn resolve_wire(context: &Arc<ServerContext>, bytes: Vec<u8>) -> Response<std::io::Cursor<Vec<u8>>> {
    let mut buffer = VectorPacketBuffer::new();
    buffer.buffer = bytes;

    let request_packet = match DnsPacket::from_buffer(&mut buffer) {
        Ok(p) => p,
        Err(_) => {
            ERRORS_TOTAL.with_label_values(&["doh_server", "malformed"]).inc();
            return plain_response(400, "malformed DNS message");
        }
    };

    if request_packet.questions.len() != 1 {
        ERRORS_TOTAL.with_label_values(&["doh_server", "malformed"]).inc();
        return plain_response(400, "exactly one question required");
    }

    let (mut reply, upstream_status) = context.rt_handle.block_on(resolve(context, &request_packet, "doh-wire"));

    let mut out = VectorPacketBuffer::new();
    if reply.write(&mut out, 0xFFFF).is_err() {
        ERRORS_TOTAL.with_label_values(&["doh_server", "internal"]).inc();
        return plain_response(500, "failed to encode reply");
    }

    wire_response(upstream_status.unwrap_or(200), out.buffer)
}

fn handle_json_get(context: &Arc<ServerContext>, query: &str) -> Response<std::io::Cursor<Vec<u8>>> {
    let parsed = match JsonRequest::parse(query) {
        Ok(p) => p,
        Err(_) => {
            ERRORS_TOTAL.with_label_values(&["doh_server", "malformed"]).inc();
            return plain_response(400, "malformed JSON query");
        }
    };

    let edns_client_subnet = parsed.edns_client_subnet.clone();
    let request_packet = parsed.into_query_packet();
    let (reply, upstream_status) = context.rt_handle.block_on(resolve(context, &request_packet, "doh-json"));

    json_response(upstream_status.unwrap_or(200), &json::packet_to_json(&reply, edns_client_subnet))
}

fn handle_json_post(context: &Arc<ServerContext>, request: &mut Request) -> Response<std::io::Cursor<Vec<u8>>> {
    match content_type(request) {
        Some(ct) if ct.starts_with("application/json") || ct.starts_with("application/dns-json") => {}
        Some(_) => return plain_response(415, "unsupported media type"),
        None => return plain_response(415, "missing content type"),
    }

    let mut body = String::new();
    if request.as_reader().read_to_string(&mut body).is_err() {
        return plain_response(400, "failed to read request body");
    }

    handle_json_get(context, body.trim_start_matches('?'))
}

/// Resolves a decoded request: override table → classic DNS client, subject
/// to the shared cache. The second element of the return value is the HTTP
/// status override to use instead of 200 when the classic upstream itself
/// could not be reached (502) or timed out (504); `None` means the reply is
/// a real DNS-level answer (including NXDOMAIN/SERVFAIL *from* the
/// upstream), which stays 200 per RFC 8484.
async fn resolve(context: &Arc<ServerContext>, request: &DnsPacket, frontend: &str) -> (DnsPacket, Option<u16>) {
    let question = match request.questions.first() {
        Some(q) => q.clone(),
        None => return (error_reply(request, ResultCode::FORMERR), None),
    };

    DNS_QUERIES_TOTAL
        .with_label_values(&[frontend, &question.qtype.to_presentation()])
        .inc();

    let upstream = context
        .overrides
        .resolve(&question.name)
        .unwrap_or_else(|| context.classic_upstream.clone());

    // 0 means "no override"; query_classic stores the real HTTP status here
    // if the classic upstream call itself failed.
    let status_override = Arc::new(AtomicU16::new(0));

    let reply = if let Some(fp) = Fingerprint::from_request(request) {
        if let Some(cache) = &context.cache {
            let dns_client = context.dns_client.clone();
            let qname = question.name.clone();
            let qtype = question.qtype;
            let recursive = request.header.recursion_desired;
            let status_override = status_override.clone();
            cache
                .get_or_resolve(&fp, request.header.id, recursive, frontend, || async move {
                    query_classic(&dns_client, qname, qtype, upstream, recursive, status_override).await
                })
                .await
        } else {
            query_classic(
                &context.dns_client,
                question.name.clone(),
                question.qtype,
                upstream,
                request.header.recursion_desired,
                status_override.clone(),
            )
            .await
        }
    } else {
        error_reply(request, ResultCode::FORMERR)
    };

    DNS_RESPONSES_TOTAL
        .with_label_values(&[frontend, rcode_label(reply.header.rescode)])
        .inc();

    let status = match status_override.load(Ordering::Relaxed) {
        0 => None,
        s => Some(s),
    };
    (reply, status)
}

async fn query_classic(
    dns_client: &Arc<crate::dns::client::DnsNetworkClient>,
    qname: String,
    qtype: crate::dns::protocol::QueryType,
    upstream: (String, u16),
    recursive: bool,
    status_override: Arc<AtomicU16>,
) -> DnsPacket {
    match dns_client.send_query_async(qname, qtype, upstream, recursive).await {
        Ok(reply) => reply,
        Err(e) => {
            log::warn!("classic DNS upstream query failed: {}", e);
            ERRORS_TOTAL.with_label_values(&["doh_server", "upstream_unreachable"]).inc();
            let kind = match e {
                ClientError::TimeOut => ErrorKind::UpstreamTimeout,
                _ => ErrorKind::UpstreamUnreachable,
            };
            status_override.store(kind.to_http_status(), Ordering::Relaxed);
            let mut reply = DnsPacket::new();
            reply.header.response = true;
            reply.header.recursion_available = true;
            reply.header.rescode = ResultCode::SERVFAIL;
            reply
        }
    }
}

fn error_reply(request: &DnsPacket, rcode: ResultCode) -> DnsPacket {
    let mut reply = DnsPacket::new();
    reply.header.id = request.header.id;
    reply.header.response = true;
    reply.header.rescode = rcode;
    reply.questions = request.questions.clone();
    reply
}

fn rcode_label(code: ResultCode) -> &'static str {
    match code {
        ResultCode::NOERROR => "noerror",
        ResultCode::FORMERR => "formerr",
        ResultCode::SERVFAIL => "servfail",
        ResultCode::NXDOMAIN => "nxdomain",
        ResultCode::NOTIMP => "notimp",
        ResultCode::REFUSED => "refused",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_string_and_path_split_on_question_mark() {
        assert_eq!(path_only("/dns-query?dns=abc"), "/dns-query");
        assert_eq!(query_string("/dns-query?dns=abc"), "dns=abc");
        assert_eq!(query_string("/dns-query"), "");
    }
}
