//! End-to-end coverage for both bridge directions, driven over real sockets:
//! a fake DoH upstream (plain `tiny_http`) stands in for the DNS→HTTPS
//! direction's HTTPS upstream, and a fake classic DNS upstream (a bare UDP
//! socket) stands in for the HTTPS→DNS direction's classic upstream.
//!
//! Grounded on the teacher's `tests/integration_test.rs` shape (build a real
//! `ServerContext`, drive it directly) combined with `web/server.rs`'s
//! server-construction pattern for standing up the fake HTTP upstream.

use std::net::{Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dohbridge::dns::buffer::{BytePacketBuffer, PacketBuffer, VectorPacketBuffer};
use dohbridge::dns::cache::Cache;
use dohbridge::dns::context::{FrontendConfig, ServerContext};
use dohbridge::dns::doh_client::Dialect;
use dohbridge::dns::doh_server::DohHttpServer;
use dohbridge::dns::override_table::OverrideTable;
use dohbridge::dns::protocol::{DnsPacket, DnsQuestion, DnsRecord, QueryType, ResultCode, TransientTtl};
use dohbridge::dns::server::execute_query;

fn frontend(dns_listen: &str, doh_listen: &str) -> FrontendConfig {
    FrontendConfig {
        dns_enabled: true,
        dns_listen: dns_listen.to_string(),
        doh_enabled: true,
        doh_listen: doh_listen.to_string(),
        wire_path: "/dns-query".to_string(),
        json_path: "/resolve".to_string(),
        monitor_listen: None,
    }
}

/// Stands in for the HTTPS upstream: decodes the wire-dialect GET request,
/// hands the parsed question to `build_reply`, and writes the wire-encoded
/// reply back. Counts how many times it was actually invoked, for the
/// single-flight assertion in `concurrent_identical_queries_coalesce`.
fn spawn_fake_doh_wire_upstream(
    port: u16,
    build_reply: impl Fn(&DnsPacket) -> DnsPacket + Send + 'static,
) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_handle = calls.clone();
    let server = tiny_http::Server::http(("127.0.0.1", port)).expect("bind fake DoH upstream");

    std::thread::spawn(move || {
        for request in server.incoming_requests() {
            calls_handle.fetch_add(1, Ordering::SeqCst);

            let url = request.url().to_string();
            let query = url.splitn(2, '?').nth(1).unwrap_or("").to_string();
            let dns_param = query
                .split('&')
                .find_map(|pair| pair.strip_prefix("dns="))
                .unwrap_or("")
                .to_string();

            let bytes = base64::decode_config(&dns_param, base64::URL_SAFE_NO_PAD).unwrap_or_default();
            let mut in_buf = VectorPacketBuffer::new();
            in_buf.buffer = bytes;
            let query_packet = DnsPacket::from_buffer(&mut in_buf).unwrap_or_else(|_| DnsPacket::new());

            let mut reply = build_reply(&query_packet);
            reply.header.id = query_packet.header.id;

            let mut out_buf = VectorPacketBuffer::new();
            reply.write(&mut out_buf, 0xFFFF).expect("encode fake upstream reply");

            let header: tiny_http::Header = "Content-Type: application/dns-message".parse().unwrap();
            let response = tiny_http::Response::from_data(out_buf.buffer).with_header(header);
            let _ = request.respond(response);
        }
    });

    calls
}

/// Stands in for the classic DNS upstream used by the HTTPS→DNS direction.
fn spawn_fake_classic_upstream(port: u16, build_reply: impl Fn(&DnsPacket) -> DnsPacket + Send + 'static) {
    let socket = UdpSocket::bind(("127.0.0.1", port)).expect("bind fake classic upstream");

    std::thread::spawn(move || loop {
        let mut buf = BytePacketBuffer::new();
        let (_len, src) = match socket.recv_from(&mut buf.buf) {
            Ok(x) => x,
            Err(_) => continue,
        };

        let request = match DnsPacket::from_buffer(&mut buf) {
            Ok(p) => p,
            Err(_) => continue,
        };

        let mut reply = build_reply(&request);
        reply.header.id = request.header.id;

        let mut out = VectorPacketBuffer::new();
        if reply.write(&mut out, 512).is_err() {
            continue;
        }
        let _ = socket.send_to(&out.buffer[..out.pos], src);
    });
}

fn a_reply(request: &DnsPacket, addr: Ipv4Addr, ttl: u32) -> DnsPacket {
    let mut reply = DnsPacket::new();
    reply.header.response = true;
    reply.header.recursion_available = true;
    reply.questions = request.questions.clone();
    if let Some(q) = request.questions.first() {
        reply.answers.push(DnsRecord::A {
            domain: q.name.clone(),
            addr,
            ttl: TransientTtl(ttl),
        });
    }
    reply
}

fn context_for_doh_upstream(port: u16, cache_enabled: bool) -> Arc<ServerContext> {
    let cache = cache_enabled.then(|| Cache::new(100, Duration::from_secs(60)));
    let rt = tokio::runtime::Runtime::new().unwrap();
    let ctx = ServerContext::new(
        cache,
        OverrideTable::new(Vec::new()),
        format!("http://127.0.0.1:{}/dns-query", port),
        Dialect::Wire,
        ("127.0.0.1".to_string(), 1),
        frontend("127.0.0.1:0", "127.0.0.1:0"),
        Duration::from_secs(2),
        rt.handle().clone(),
    )
    .expect("build context");
    // Leak the runtime so its handle (stashed in `ctx.rt_handle`) stays valid
    // for the rest of the test instead of shutting down when `rt` would
    // otherwise drop at the end of this function.
    std::mem::forget(rt);
    Arc::new(ctx)
}

/// S1: an A query against the DNS front-end resolves through the DoH
/// upstream and returns the expected address.
#[test]
fn a_record_resolves_through_doh_upstream() {
    spawn_fake_doh_wire_upstream(18571, |req| a_reply(req, Ipv4Addr::new(93, 184, 216, 34), 300));
    let ctx = context_for_doh_upstream(18571, true);

    let mut request = DnsPacket::new();
    request.header.id = 0x1111;
    request.header.recursion_desired = true;
    request.questions.push(DnsQuestion::new("example.com".into(), QueryType::A));

    let reply = ctx.rt_handle.block_on(execute_query(&ctx, &request, "dns"));

    assert_eq!(reply.header.id, 0x1111);
    assert_eq!(reply.header.rescode, ResultCode::NOERROR);
    assert_eq!(reply.answers.len(), 1);
    match &reply.answers[0] {
        DnsRecord::A { addr, .. } => assert_eq!(*addr, Ipv4Addr::new(93, 184, 216, 34)),
        other => panic!("expected A record, got {:?}", other),
    }
}

/// S2: an MX query resolves through the DoH upstream.
#[test]
fn mx_record_resolves_through_doh_upstream() {
    spawn_fake_doh_wire_upstream(18572, |req| {
        let mut reply = DnsPacket::new();
        reply.header.response = true;
        reply.header.recursion_available = true;
        reply.questions = req.questions.clone();
        if let Some(q) = req.questions.first() {
            reply.answers.push(DnsRecord::Mx {
                domain: q.name.clone(),
                priority: 10,
                host: "mail.example.com".to_string(),
                ttl: TransientTtl(300),
            });
        }
        reply
    });
    let ctx = context_for_doh_upstream(18572, true);

    let mut request = DnsPacket::new();
    request.header.id = 0x2222;
    request.header.recursion_desired = true;
    request.questions.push(DnsQuestion::new("example.com".into(), QueryType::Mx));

    let reply = ctx.rt_handle.block_on(execute_query(&ctx, &request, "dns"));

    assert_eq!(reply.answers.len(), 1);
    match &reply.answers[0] {
        DnsRecord::Mx { host, priority, .. } => {
            assert_eq!(host, "mail.example.com");
            assert_eq!(*priority, 10);
        }
        other => panic!("expected MX record, got {:?}", other),
    }
}

/// S3: a query for a name the upstream doesn't know about comes back NXDOMAIN.
#[test]
fn unknown_name_yields_nxdomain() {
    spawn_fake_doh_wire_upstream(18573, |req| {
        let mut reply = DnsPacket::new();
        reply.header.response = true;
        reply.header.recursion_available = true;
        reply.header.rescode = ResultCode::NXDOMAIN;
        reply.questions = req.questions.clone();
        reply
    });
    let ctx = context_for_doh_upstream(18573, true);

    let mut request = DnsPacket::new();
    request.header.id = 0x3333;
    request.header.recursion_desired = true;
    request
        .questions
        .push(DnsQuestion::new("does-not-exist.example.".into(), QueryType::A));

    let reply = ctx.rt_handle.block_on(execute_query(&ctx, &request, "dns"));

    assert_eq!(reply.header.rescode, ResultCode::NXDOMAIN);
    assert!(reply.answers.is_empty());
}

/// S7: several concurrent identical queries coalesce into exactly one
/// upstream invocation when caching is enabled.
#[test]
fn concurrent_identical_queries_coalesce() {
    let calls = spawn_fake_doh_wire_upstream(18574, |req| a_reply(req, Ipv4Addr::new(10, 0, 0, 1), 300));
    let ctx = context_for_doh_upstream(18574, true);

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async {
        let mut handles = Vec::new();
        for _ in 0..8 {
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                let mut request = DnsPacket::new();
                request.header.id = 0x4444;
                request.header.recursion_desired = true;
                request.questions.push(DnsQuestion::new("coalesce.example.com".into(), QueryType::A));
                execute_query(&ctx, &request, "dns").await
            }));
        }
        for handle in handles {
            let reply = handle.await.unwrap();
            assert_eq!(reply.header.rescode, ResultCode::NOERROR);
        }
    });

    // Give the single in-flight upstream call a moment to land before reading
    // the counter; `get_or_resolve` only returns once it has.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// S4/S5/S6: the HTTPS front-end's wire-dialect GET endpoint, exercised over
/// real HTTP against a `DohHttpServer` bound to a fixed loopback port, with a
/// fake classic-DNS upstream standing in for the resolver.
fn start_doh_server(doh_port: u16, classic_port: u16) -> Arc<ServerContext> {
    spawn_fake_classic_upstream(classic_port, |req| a_reply(req, Ipv4Addr::new(203, 0, 113, 7), 60));

    let rt = tokio::runtime::Runtime::new().unwrap();
    let ctx = ServerContext::new(
        Some(Cache::new(100, Duration::from_secs(60))),
        OverrideTable::new(Vec::new()),
        "http://127.0.0.1:1/dns-query".to_string(),
        Dialect::Wire,
        ("127.0.0.1".to_string(), classic_port),
        frontend("127.0.0.1:0", &format!("127.0.0.1:{}", doh_port)),
        Duration::from_secs(2),
        rt.handle().clone(),
    )
    .expect("build context");
    ctx.run().expect("start classic DNS client");
    // See the comment in `context_for_doh_upstream`: leaked deliberately so
    // the handle `ctx.rt_handle` holds keeps working for the test's duration.
    std::mem::forget(rt);

    let ctx = Arc::new(ctx);
    let doh_server = DohHttpServer::new(ctx.clone(), 4);
    doh_server.run_server().expect("start DoH HTTP server");
    // run_server spawns its worker threads and returns immediately; give the
    // listener a moment to bind before the first request lands.
    std::thread::sleep(Duration::from_millis(50));
    ctx
}

/// S4: a malformed base64url `dns` parameter is rejected with 400.
#[test]
fn doh_get_malformed_base64_is_rejected() {
    start_doh_server(18581, 18591);
    let client = reqwest::blocking::Client::new();
    let resp = client
        .get("http://127.0.0.1:18581/dns-query?dns=not-valid-base64url!!!")
        .send()
        .expect("request failed");
    assert_eq!(resp.status().as_u16(), 400);
}

/// S5: a missing `dns` parameter is rejected with 400.
#[test]
fn doh_get_missing_param_is_rejected() {
    start_doh_server(18582, 18592);
    let client = reqwest::blocking::Client::new();
    let resp = client
        .get("http://127.0.0.1:18582/dns-query")
        .send()
        .expect("request failed");
    assert_eq!(resp.status().as_u16(), 400);
}

/// S6: a valid wire-dialect query resolves and returns 200 with the
/// `application/dns-message` content type.
#[test]
fn doh_get_valid_wire_query_resolves() {
    start_doh_server(18583, 18593);

    let mut query = DnsPacket::new();
    query.header.id = 0x5555;
    query.header.recursion_desired = true;
    query.questions.push(DnsQuestion::new("wire.example.com".into(), QueryType::A));
    let mut out = VectorPacketBuffer::new();
    query.write(&mut out, 0xFFFF).expect("encode query");
    let encoded = base64::encode_config(&out.buffer, base64::URL_SAFE_NO_PAD);

    let client = reqwest::blocking::Client::new();
    let resp = client
        .get(format!("http://127.0.0.1:18583/dns-query?dns={}", encoded))
        .send()
        .expect("request failed");

    assert_eq!(resp.status().as_u16(), 200);
    assert_eq!(
        resp.headers().get("content-type").and_then(|v| v.to_str().ok()),
        Some("application/dns-message")
    );

    let body = resp.bytes().expect("read body").to_vec();
    let mut in_buf = VectorPacketBuffer::new();
    in_buf.buffer = body;
    let reply = DnsPacket::from_buffer(&mut in_buf).expect("decode reply");

    assert_eq!(reply.header.id, 0x5555);
    assert_eq!(reply.header.rescode, ResultCode::NOERROR);
    assert_eq!(reply.answers.len(), 1);
    match &reply.answers[0] {
        DnsRecord::A { addr, .. } => assert_eq!(*addr, Ipv4Addr::new(203, 0, 113, 7)),
        other => panic!("expected A record, got {:?}", other),
    }
}
