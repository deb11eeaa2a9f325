//! The DNS front-end: UDP and TCP listeners for the DNS→HTTPS direction.
//!
//! Mirrors the teacher's worker-pool shape (a fixed number of OS threads
//! pulling off a shared queue/channel) but the resolution path is now
//! cache → override table → DoH client instead of a recursive/forwarding
//! resolver.

use std::collections::VecDeque;
use std::io::Write;
use std::net::SocketAddr;
use std::net::{Shutdown, TcpListener, TcpStream, UdpSocket};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::Builder;

use derive_more::{Display, Error, From};
use rand::random;

use crate::dns::buffer::{BytePacketBuffer, PacketBuffer, StreamPacketBuffer, VectorPacketBuffer};
use crate::dns::context::ServerContext;
use crate::dns::fingerprint::Fingerprint;
use crate::dns::metrics::{DNS_QUERIES_TOTAL, DNS_RESPONSES_TOTAL};
use crate::dns::netutil::{read_packet_length, write_packet_length};
use crate::dns::protocol::{DnsPacket, ResultCode};

#[derive(Debug, Display, From, Error)]
pub enum ServerError {
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ServerError>;

macro_rules! return_or_report {
    ( $x:expr, $message:expr ) => {
        match $x {
            Ok(res) => res,
            Err(_) => {
                log::info!($message);
                return;
            }
        }
    };
}

macro_rules! ignore_or_report {
    ( $x:expr, $message:expr ) => {
        match $x {
            Ok(_) => {}
            Err(_) => {
                log::info!($message);
                return;
            }
        };
    };
}

/// Common trait for DNS servers.
pub trait DnsServer {
    /// Initializes the server and starts listening. Must not block: servers
    /// spawn their own threads and return immediately.
    fn run_server(self) -> Result<()>;
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

/// Validates a request per §4.7: exactly one question, opcode QUERY (0).
/// Returns the RCODE to reply with on failure.
fn validate_request(request: &DnsPacket) -> Option<ResultCode> {
    if request.questions.len() != 1 {
        Some(ResultCode::FORMERR)
    } else if request.header.opcode != 0 {
        Some(ResultCode::NOTIMP)
    } else {
        None
    }
}

/// Resolves a validated request: cache → override table → DoH client. This
/// function always returns a complete reply, synthesizing SERVFAIL if
/// nothing upstream could be reached.
async fn resolve(context: &ServerContext, request: &DnsPacket, frontend: &str) -> DnsPacket {
    let question = &request.questions[0];
    DNS_QUERIES_TOTAL
        .with_label_values(&[frontend, &question.qtype.to_presentation()])
        .inc();

    let fp = match Fingerprint::from_request(request) {
        Some(fp) => fp,
        None => return servfail(request),
    };

    let reply = if let Some(upstream) = context.overrides.resolve(&question.name) {
        let dns_client = context.dns_client.clone();
        let qname = question.name.clone();
        let qtype = question.qtype;
        let recursive = request.header.recursion_desired;
        match dns_client
            .send_query_async(qname, qtype, upstream, recursive)
            .await
        {
            Ok(mut reply) => {
                reply.header.id = request.header.id;
                reply
            }
            Err(_) => servfail(request),
        }
    } else if let Some(cache) = &context.cache {
        let doh_client = &context.doh_client;
        let upstream_request = request.clone();
        cache
            .get_or_resolve(&fp, request.header.id, request.header.recursion_desired, frontend, || async move {
                doh_client.resolve(&upstream_request).await
            })
            .await
    } else {
        context.doh_client.resolve(request).await
    };

    DNS_RESPONSES_TOTAL
        .with_label_values(&[frontend, rcode_label(reply.header.rescode)])
        .inc();
    reply
}

fn servfail(request: &DnsPacket) -> DnsPacket {
    let mut reply = DnsPacket::new();
    reply.header.id = request.header.id;
    reply.header.response = true;
    reply.header.recursion_desired = request.header.recursion_desired;
    reply.header.recursion_available = true;
    reply.header.rescode = ResultCode::SERVFAIL;
    if let Some(q) = request.questions.first() {
        reply.questions.push(q.clone());
    }
    reply
}

/// Builds the reply for an inbound request, handling validation failures
/// before handing a well-formed request off to `resolve`.
pub async fn execute_query(context: &ServerContext, request: &DnsPacket, frontend: &str) -> DnsPacket {
    if let Some(rcode) = validate_request(request) {
        let mut reply = DnsPacket::new();
        reply.header.id = request.header.id;
        reply.header.response = true;
        reply.header.rescode = rcode;
        reply.questions = request.questions.clone();
        DNS_RESPONSES_TOTAL
            .with_label_values(&[frontend, rcode_label(rcode)])
            .inc();
        return reply;
    }

    resolve(context, request, frontend).await
}

/// The UDP server: packets are read on a single thread, then handed to a
/// fixed pool of worker threads that block on the shared runtime to resolve
/// and reply.
pub struct DnsUdpServer {
    context: Arc<ServerContext>,
    request_queue: Arc<Mutex<VecDeque<(SocketAddr, DnsPacket)>>>,
    request_cond: Arc<Condvar>,
    thread_count: usize,
    listen: String,
}

impl DnsUdpServer {
    pub fn new(context: Arc<ServerContext>, thread_count: usize, listen: String) -> DnsUdpServer {
        DnsUdpServer {
            context,
            request_queue: Arc::new(Mutex::new(VecDeque::new())),
            request_cond: Arc::new(Condvar::new()),
            thread_count,
            listen,
        }
    }

    fn process_request(socket: &UdpSocket, context: &ServerContext, src: SocketAddr, request: &DnsPacket) {
        if context.shutdown.is_shutting_down() {
            return;
        }
        let _guard = context.shutdown.track_request();

        let size_limit = request.edns.map(|e| e.udp_payload_size as usize).unwrap_or(512);

        let mut res_buffer = VectorPacketBuffer::new();
        let mut packet = context.rt_handle.block_on(execute_query(context, request, "dns"));
        let _ = packet.write(&mut res_buffer, size_limit);

        let len = res_buffer.pos();
        let data = return_or_report!(res_buffer.get_range(0, len), "Failed to get buffer data");
        ignore_or_report!(socket.send_to(data, src), "Failed to send response packet");
    }

    fn spawn_request_handler(&self, thread_id: usize, socket: UdpSocket) -> std::io::Result<()> {
        let context = self.context.clone();
        let request_cond = self.request_cond.clone();
        let request_queue = self.request_queue.clone();

        let name = format!("dns-udp-worker-{}", thread_id);
        Builder::new().name(name).spawn(move || loop {
            let (src, request) = match request_queue
                .lock()
                .ok()
                .and_then(|x| request_cond.wait(x).ok())
                .and_then(|mut x| x.pop_front())
            {
                Some(x) => x,
                None => continue,
            };

            Self::process_request(&socket, &context, src, &request);
        })?;

        Ok(())
    }

    fn spawn_incoming_handler(self, socket: UdpSocket) -> std::io::Result<()> {
        Builder::new()
            .name("dns-udp-incoming".into())
            .spawn(move || loop {
                let mut req_buffer = BytePacketBuffer::new();
                let (_, src) = match socket.recv_from(&mut req_buffer.buf) {
                    Ok(x) => x,
                    Err(e) => {
                        log::debug!("failed to read from UDP socket: {:?}", e);
                        continue;
                    }
                };

                let request = match DnsPacket::from_buffer(&mut req_buffer) {
                    Ok(x) => x,
                    Err(e) => {
                        log::debug!("failed to parse UDP query packet: {:?}", e);
                        continue;
                    }
                };

                self.enqueue_request(src, request);
            })?;

        Ok(())
    }

    fn enqueue_request(&self, src: SocketAddr, request: DnsPacket) {
        match self.request_queue.lock() {
            Ok(mut queue) => {
                queue.push_back((src, request));
                self.request_cond.notify_one();
            }
            Err(e) => log::warn!("failed to enqueue UDP request: {}", e),
        }
    }
}

impl DnsServer for DnsUdpServer {
    fn run_server(self) -> Result<()> {
        let socket = UdpSocket::bind(&self.listen)?;

        for thread_id in 0..self.thread_count {
            let socket_clone = match socket.try_clone() {
                Ok(x) => x,
                Err(e) => {
                    log::warn!("failed to clone UDP socket: {:?}", e);
                    continue;
                }
            };
            self.spawn_request_handler(thread_id, socket_clone)?;
        }

        self.spawn_incoming_handler(socket)?;
        Ok(())
    }
}

/// The TCP server: a listener thread hands accepted connections off round-robin
/// to a pool of worker threads, each of which owns the whole request/response
/// exchange for that connection.
pub struct DnsTcpServer {
    context: Arc<ServerContext>,
    senders: Vec<Sender<TcpStream>>,
    thread_count: usize,
    listen: String,
}

impl DnsTcpServer {
    pub fn new(context: Arc<ServerContext>, thread_count: usize, listen: String) -> DnsTcpServer {
        DnsTcpServer {
            context,
            senders: Vec::new(),
            thread_count,
            listen,
        }
    }
}

impl DnsServer for DnsTcpServer {
    fn run_server(mut self) -> Result<()> {
        let socket = TcpListener::bind(&self.listen)?;

        for thread_id in 0..self.thread_count {
            let (tx, rx) = channel();
            self.senders.push(tx);
            let context = self.context.clone();

            let name = format!("dns-tcp-worker-{}", thread_id);
            Builder::new().name(name).spawn(move || loop {
                let mut stream: TcpStream = match rx.recv() {
                    Ok(x) => x,
                    Err(_) => continue,
                };

                if context.shutdown.is_shutting_down() {
                    continue;
                }
                let _guard = context.shutdown.track_request();

                ignore_or_report!(read_packet_length(&mut stream), "failed to read query length");

                let request = {
                    let mut stream_buffer = StreamPacketBuffer::new(&mut stream);
                    return_or_report!(DnsPacket::from_buffer(&mut stream_buffer), "failed to read query packet")
                };

                let mut res_buffer = VectorPacketBuffer::new();
                let mut packet = context.rt_handle.block_on(execute_query(&context, &request, "dns"));
                ignore_or_report!(packet.write(&mut res_buffer, 0xFFFF), "failed to write response packet");

                let len = res_buffer.pos();
                ignore_or_report!(write_packet_length(&mut stream, len), "failed to write packet size");

                let data = return_or_report!(res_buffer.get_range(0, len), "failed to get packet data");
                ignore_or_report!(stream.write_all(data), "failed to write response packet");
                ignore_or_report!(stream.shutdown(Shutdown::Both), "failed to shut down socket");
            })?;
        }

        let thread_count = self.thread_count;
        Builder::new()
            .name("dns-tcp-incoming".into())
            .spawn(move || {
                for wrap_stream in socket.incoming() {
                    let stream = match wrap_stream {
                        Ok(stream) => stream,
                        Err(err) => {
                            log::debug!("failed to accept TCP connection: {:?}", err);
                            continue;
                        }
                    };

                    let thread_no = random::<usize>() % thread_count;
                    if let Err(e) = self.senders[thread_no].send(stream) {
                        log::warn!("failed to dispatch TCP connection to worker {}: {}", thread_no, e);
                    }
                }
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::cache::Cache;
    use crate::dns::context::FrontendConfig;
    use crate::dns::doh_client::{Dialect, DohClient, DohClientConfig};
    use crate::dns::override_table::OverrideTable;
    use crate::dns::protocol::{DnsQuestion, QueryType};
    use std::time::Duration;

    fn context(rt: &tokio::runtime::Runtime) -> ServerContext {
        ServerContext {
            cache: Some(Cache::new(10, Duration::from_secs(60))),
            overrides: OverrideTable::new(Vec::new()),
            dns_client: Arc::new(crate::dns::client::DnsNetworkClient::new(0).unwrap()),
            doh_client: DohClient::new(DohClientConfig {
                endpoint: "http://127.0.0.1:1".to_string(),
                dialect: Dialect::Wire,
                timeout: Duration::from_millis(50),
            }),
            classic_upstream: ("127.0.0.1".to_string(), 53),
            frontend: FrontendConfig {
                dns_enabled: true,
                dns_listen: "127.0.0.1:0".into(),
                doh_enabled: false,
                doh_listen: "127.0.0.1:0".into(),
                wire_path: "/dns-query".into(),
                json_path: "/resolve".into(),
                monitor_listen: None,
            },
            request_timeout: Duration::from_millis(50),
            rt_handle: rt.handle().clone(),
            shutdown: crate::dns::shutdown::ShutdownHandle::new(),
        }
    }

    #[test]
    fn malformed_request_without_question_is_formerr() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let ctx = context(&rt);
        let request = DnsPacket::new();
        let reply = rt.block_on(execute_query(&ctx, &request, "dns"));
        assert_eq!(reply.header.rescode, ResultCode::FORMERR);
    }

    #[test]
    fn unreachable_upstream_yields_servfail_with_preserved_id() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let ctx = context(&rt);
        let mut request = DnsPacket::new();
        request.header.id = 0xABCD;
        request.header.recursion_desired = true;
        request.questions.push(DnsQuestion::new("example.com".into(), QueryType::A));

        let reply = rt.block_on(execute_query(&ctx, &request, "dns"));
        assert_eq!(reply.header.id, 0xABCD);
        assert_eq!(reply.header.rescode, ResultCode::SERVFAIL);
    }
}
