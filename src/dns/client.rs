//! Classic DNS client used by the HTTPS→DNS server and by override rules to
//! speak UDP/TCP DNS to a conventional upstream resolver.

use std::io::Write;
use std::net::{TcpStream, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{sleep, Builder};
use std::time::Duration as SleepDuration;

use chrono::*;
use derive_more::{Display, Error, From};

use crate::dns::buffer::{BytePacketBuffer, PacketBuffer, StreamPacketBuffer};
use crate::dns::netutil::{read_packet_length, write_packet_length};
use crate::dns::protocol::{DnsPacket, DnsQuestion, QueryType};

#[derive(Debug, Display, From, Error)]
pub enum ClientError {
    Protocol(crate::dns::protocol::ProtocolError),
    Io(std::io::Error),
    #[display(fmt = "pending query lock was poisoned")]
    PoisonedLock,
    #[display(fmt = "lookup channel closed without a reply")]
    LookupFailed,
    #[display(fmt = "query timed out waiting for a reply")]
    TimeOut,
}

type Result<T> = std::result::Result<T, ClientError>;

pub trait DnsClient {
    fn get_sent_count(&self) -> usize;
    fn get_failed_count(&self) -> usize;

    fn run(&self) -> Result<()>;
    fn send_query(
        &self,
        qname: &str,
        qtype: QueryType,
        server: (&str, u16),
        recursive: bool,
    ) -> Result<DnsPacket>;
}

/// The UDP client.
///
/// This includes a fair bit of synchronization due to the stateless nature
/// of UDP. When many queries are sent in parallel, the response packets can
/// come back in any order. For that reason, we fire off replies on the
/// sending thread, but handle replies on a single thread. A channel is
/// created for every response, and the caller blocks on the channel until a
/// response is received (or the timeout thread gives up on its behalf).
pub struct DnsNetworkClient {
    total_sent: Arc<AtomicUsize>,
    total_failed: Arc<AtomicUsize>,
    seq: Arc<AtomicUsize>,
    socket: Arc<UdpSocket>,
    pending_queries: Arc<Mutex<Vec<PendingQuery>>>,
}

impl Clone for DnsNetworkClient {
    fn clone(&self) -> Self {
        Self {
            total_sent: self.total_sent.clone(),
            total_failed: self.total_failed.clone(),
            seq: self.seq.clone(),
            socket: self.socket.clone(),
            pending_queries: self.pending_queries.clone(),
        }
    }
}

/// A query in progress: the transaction ID used on the wire, and a channel
/// endpoint for returning a response back to the thread that posed it.
struct PendingQuery {
    seq: u16,
    timestamp: DateTime<Local>,
    tx: Sender<Option<DnsPacket>>,
}

unsafe impl Send for DnsNetworkClient {}
unsafe impl Sync for DnsNetworkClient {}

impl DnsNetworkClient {
    pub fn new(port: u16) -> Result<DnsNetworkClient> {
        let socket = UdpSocket::bind(("0.0.0.0", port))?;

        if let Ok(local_addr) = socket.local_addr() {
            log::debug!("classic DNS client bound to {}", local_addr);
        }

        Ok(DnsNetworkClient {
            total_sent: Arc::new(AtomicUsize::new(0)),
            total_failed: Arc::new(AtomicUsize::new(0)),
            seq: Arc::new(AtomicUsize::new(0)),
            socket: Arc::new(socket),
            pending_queries: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Send a DNS query using TCP transport. Used when a UDP reply came back
    /// truncated, or the caller always wants TCP (e.g. zone-transfer-sized
    /// replies, though zone transfers themselves are out of scope here).
    pub fn send_tcp_query(
        &self,
        qname: &str,
        qtype: QueryType,
        server: (&str, u16),
        recursive: bool,
    ) -> Result<DnsPacket> {
        let _ = self.total_sent.fetch_add(1, Ordering::Release);

        let mut packet = DnsPacket::new();
        packet.header.id = self.next_id();
        packet.header.questions = 1;
        packet.header.recursion_desired = recursive;
        packet.questions.push(DnsQuestion::new(qname.into(), qtype));

        let mut req_buffer = BytePacketBuffer::new();
        packet.write(&mut req_buffer, 0xFFFF)?;

        let mut socket = TcpStream::connect(server)?;
        write_packet_length(&mut socket, req_buffer.pos())?;
        socket.write_all(&req_buffer.buf[0..req_buffer.pos])?;
        socket.flush()?;

        let _ = read_packet_length(&mut socket)?;
        let mut stream_buffer = StreamPacketBuffer::new(&mut socket);
        Ok(DnsPacket::from_buffer(&mut stream_buffer)?)
    }

    /// Send a DNS query using UDP transport. The query is sent from the
    /// calling thread; the response is read by the worker thread spawned
    /// from `run` and delivered back here over a channel, so this method is
    /// safe to call concurrently from any number of threads.
    pub fn send_udp_query(
        &self,
        qname: &str,
        qtype: QueryType,
        server: (&str, u16),
        recursive: bool,
    ) -> Result<DnsPacket> {
        let _ = self.total_sent.fetch_add(1, Ordering::Release);

        let mut packet = DnsPacket::new();
        packet.header.id = self.next_id();
        packet.header.questions = 1;
        packet.header.recursion_desired = recursive;
        packet
            .questions
            .push(DnsQuestion::new(qname.to_string(), qtype));

        let (tx, rx) = channel();
        {
            let mut pending_queries = self
                .pending_queries
                .lock()
                .map_err(|_| ClientError::PoisonedLock)?;
            pending_queries.push(PendingQuery {
                seq: packet.header.id,
                timestamp: Local::now(),
                tx,
            });
        }

        let mut req_buffer = BytePacketBuffer::new();
        packet.write(&mut req_buffer, 512)?;
        self.socket
            .send_to(&req_buffer.buf[0..req_buffer.pos], server)?;

        match rx.recv() {
            Ok(Some(qr)) => Ok(qr),
            Ok(None) => {
                let _ = self.total_failed.fetch_add(1, Ordering::Release);
                Err(ClientError::TimeOut)
            }
            Err(_) => {
                let _ = self.total_failed.fetch_add(1, Ordering::Release);
                Err(ClientError::LookupFailed)
            }
        }
    }

    fn next_id(&self) -> u16 {
        let id = self.seq.fetch_add(1, Ordering::SeqCst) as u16;
        if id == 0xFFFF {
            let _ = self.seq.compare_exchange(0x1_0000, 0, Ordering::SeqCst, Ordering::SeqCst);
        }
        id
    }

    /// Async adapter for callers living in a tokio context (the DoH server's
    /// request handler), running the blocking UDP/TCP exchange on a blocking
    /// thread pool.
    pub async fn send_query_async(
        &self,
        qname: String,
        qtype: QueryType,
        server: (String, u16),
        recursive: bool,
    ) -> Result<DnsPacket> {
        let client = self.clone();
        tokio::task::spawn_blocking(move || {
            client.send_query(&qname, qtype, (server.0.as_str(), server.1), recursive)
        })
        .await
        .map_err(|e| ClientError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }
}

impl DnsClient for DnsNetworkClient {
    fn get_sent_count(&self) -> usize {
        self.total_sent.load(Ordering::Acquire)
    }

    fn get_failed_count(&self) -> usize {
        self.total_failed.load(Ordering::Acquire)
    }

    /// Launches the worker threads. Unless this has run, no UDP responses
    /// will ever be delivered and callers will block indefinitely.
    fn run(&self) -> Result<()> {
        {
            let socket_copy = self.socket.try_clone()?;
            let pending_queries_lock = self.pending_queries.clone();

            Builder::new()
                .name("dns-client-reader".into())
                .spawn(move || loop {
                    let mut res_buffer = BytePacketBuffer::new();
                    if socket_copy.recv_from(&mut res_buffer.buf).is_err() {
                        continue;
                    }

                    let packet = match DnsPacket::from_buffer(&mut res_buffer) {
                        Ok(packet) => packet,
                        Err(err) => {
                            log::debug!("classic DNS client: failed to parse reply: {}", err);
                            continue;
                        }
                    };

                    if let Ok(mut pending_queries) = pending_queries_lock.lock() {
                        if let Some(idx) = pending_queries
                            .iter()
                            .position(|q| q.seq == packet.header.id)
                        {
                            let pending = pending_queries.remove(idx);
                            let _ = pending.tx.send(Some(packet));
                        }
                    }
                })?;
        }

        {
            let pending_queries_lock = self.pending_queries.clone();

            Builder::new()
                .name("dns-client-timeout".into())
                .spawn(move || {
                    let timeout = Duration::seconds(5);
                    loop {
                        if let Ok(mut pending_queries) = pending_queries_lock.lock() {
                            let now = Local::now();
                            let expired: Vec<usize> = pending_queries
                                .iter()
                                .enumerate()
                                .filter(|(_, q)| q.timestamp + timeout < now)
                                .map(|(i, _)| i)
                                .collect();
                            for idx in expired.into_iter().rev() {
                                let pending = pending_queries.remove(idx);
                                let _ = pending.tx.send(None);
                            }
                        }
                        sleep(SleepDuration::from_millis(100));
                    }
                })?;
        }

        Ok(())
    }

    fn send_query(
        &self,
        qname: &str,
        qtype: QueryType,
        server: (&str, u16),
        recursive: bool,
    ) -> Result<DnsPacket> {
        let packet = self.send_udp_query(qname, qtype, server, recursive)?;
        if !packet.header.truncated_message {
            return Ok(packet);
        }

        log::debug!("truncated UDP response from {:?}, retrying over TCP", server);
        self.send_tcp_query(qname, qtype, server, recursive)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::dns::protocol::QueryType;

    pub type StubCallback = dyn Fn(&str, QueryType, (&str, u16), bool) -> Result<DnsPacket> + Send + Sync;

    /// Stand-in classic DNS client for tests: rather than touching the
    /// network, invokes a callback that plays the role of a fake upstream.
    pub struct DnsStubClient {
        callback: Box<StubCallback>,
    }

    impl DnsStubClient {
        pub fn new(callback: Box<StubCallback>) -> DnsStubClient {
            DnsStubClient { callback }
        }
    }

    impl DnsClient for DnsStubClient {
        fn get_sent_count(&self) -> usize {
            0
        }

        fn get_failed_count(&self) -> usize {
            0
        }

        fn run(&self) -> Result<()> {
            Ok(())
        }

        fn send_query(
            &self,
            qname: &str,
            qtype: QueryType,
            server: (&str, u16),
            recursive: bool,
        ) -> Result<DnsPacket> {
            (self.callback)(qname, qtype, server, recursive)
        }
    }

    #[test]
    fn next_id_wraps() {
        let client = DnsNetworkClient::new(0).unwrap();
        for _ in 0..5 {
            let _ = client.next_id();
        }
    }
}
