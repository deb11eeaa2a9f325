//! Bounded, TTL-aware cache keyed by question fingerprint, with single-flight
//! coalescing of concurrent misses.
//!
//! Mirrors the shape of the teacher's own `SynchronizedCache` (a
//! lock-guarded map consulted by every front-end) but keyed on the full
//! `Fingerprint` rather than name+qtype alone, and restructured around the
//! bound/TTL-cap/negative-caching/single-flight/rewrite-on-return policy this
//! daemon needs.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::dns::fingerprint::Fingerprint;
use crate::dns::metrics::{
    DNS_CACHE_OPERATIONS, DNS_CACHE_SIZE, SINGLE_FLIGHT_COALESCED_TOTAL,
};
use crate::dns::protocol::{DnsPacket, ResultCode};

const DEFAULT_CAPACITY: usize = 10_000;
const DEFAULT_TTL_CAP_SECS: u64 = 3600;
const SINGLE_FLIGHT_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct CacheEntry {
    packet: DnsPacket,
    inserted_at: Instant,
    deadline: Instant,
}

struct Inner {
    entries: HashMap<Fingerprint, CacheEntry>,
    /// Recency queue, front = least recently used. Rebuilt with a linear
    /// scan on touch/evict; simple and adequate at the capacities this
    /// daemon is configured for.
    order: VecDeque<Fingerprint>,
    inflight: HashMap<Fingerprint, Arc<Notify>>,
}

/// Bounded LRU, TTL-capped cache of DNS replies, coordinating single-flight
/// resolution of concurrent misses for the same fingerprint.
pub struct Cache {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl_cap: Duration,
}

fn touch(order: &mut VecDeque<Fingerprint>, fp: &Fingerprint) {
    if let Some(pos) = order.iter().position(|f| f == fp) {
        order.remove(pos);
    }
    order.push_back(fp.clone());
}

fn remove_from_order(order: &mut VecDeque<Fingerprint>, fp: &Fingerprint) {
    if let Some(pos) = order.iter().position(|f| f == fp) {
        order.remove(pos);
    }
}

/// Effective TTL per the cache policy: positive answers use the minimum TTL
/// across Answer+Authority; NXDOMAIN/NODATA use the SOA minimum from
/// Authority if present. Returns `None` when nothing is cacheable (no TTL
/// information available at all).
fn effective_ttl(packet: &DnsPacket) -> Option<u32> {
    let is_negative =
        packet.header.rescode == ResultCode::NXDOMAIN || packet.answers.is_empty();

    if is_negative {
        packet.get_ttl_from_soa()
    } else {
        packet
            .answers
            .iter()
            .chain(packet.authorities.iter())
            .map(|r| r.get_ttl())
            .min()
    }
}

/// Builds the reply handed back to a specific request: transaction ID and
/// RD flag rewritten, per-RR TTL decremented by elapsed time and clamped at
/// zero.
fn rewrite_for_response(
    stored: &DnsPacket,
    inserted_at: Instant,
    now: Instant,
    request_id: u16,
    recursion_desired: bool,
) -> DnsPacket {
    let mut reply = stored.clone();
    reply.header.id = request_id;
    reply.header.recursion_desired = recursion_desired;
    reply.header.recursion_available = true;

    let elapsed = now.saturating_duration_since(inserted_at).as_secs() as u32;
    for rec in reply
        .answers
        .iter_mut()
        .chain(reply.authorities.iter_mut())
        .chain(reply.resources.iter_mut())
    {
        rec.set_ttl(rec.get_ttl().saturating_sub(elapsed));
    }

    reply
}

impl Cache {
    pub fn new(capacity: usize, ttl_cap: Duration) -> Cache {
        Cache {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                inflight: HashMap::new(),
            }),
            capacity,
            ttl_cap,
        }
    }

    /// Non-blocking point lookup, used by the monitoring listener's dump and
    /// by tests; does not participate in single-flight.
    pub fn lookup(&self, fp: &Fingerprint, request_id: u16, recursion_desired: bool) -> Option<DnsPacket> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        let expired = match inner.entries.get(fp) {
            Some(entry) => now >= entry.deadline,
            None => {
                DNS_CACHE_OPERATIONS.with_label_values(&["miss"]).inc();
                return None;
            }
        };

        if expired {
            inner.entries.remove(fp);
            remove_from_order(&mut inner.order, fp);
            DNS_CACHE_OPERATIONS.with_label_values(&["miss"]).inc();
            return None;
        }

        touch(&mut inner.order, fp);
        let entry = inner.entries.get(fp).expect("checked above");
        let label = if entry.packet.header.rescode == ResultCode::NXDOMAIN {
            "negative_hit"
        } else {
            "hit"
        };
        DNS_CACHE_OPERATIONS.with_label_values(&[label]).inc();
        Some(rewrite_for_response(
            &entry.packet,
            entry.inserted_at,
            now,
            request_id,
            recursion_desired,
        ))
    }

    /// Stores `packet` under `fp`, subject to the TTL/negative-caching
    /// policy. Returns `false` when the reply was not cacheable (no TTL
    /// information, or an effective TTL of zero).
    pub fn insert(&self, fp: Fingerprint, packet: DnsPacket) -> bool {
        let ttl = match effective_ttl(&packet) {
            Some(0) | None => {
                DNS_CACHE_OPERATIONS.with_label_values(&["bypass"]).inc();
                return false;
            }
            Some(ttl) => ttl,
        };
        let capped = Duration::from_secs(ttl as u64).min(self.ttl_cap);

        let mut inner = self.inner.lock();
        let now = Instant::now();

        if !inner.entries.contains_key(&fp) && inner.entries.len() >= self.capacity {
            if let Some(lru) = inner.order.pop_front() {
                inner.entries.remove(&lru);
                DNS_CACHE_OPERATIONS.with_label_values(&["evict"]).inc();
            }
        }

        inner.entries.insert(
            fp.clone(),
            CacheEntry {
                packet,
                inserted_at: now,
                deadline: now + capped,
            },
        );
        touch(&mut inner.order, &fp);
        DNS_CACHE_OPERATIONS.with_label_values(&["store"]).inc();
        DNS_CACHE_SIZE.set(inner.entries.len() as i64);
        true
    }

    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
        DNS_CACHE_SIZE.set(0);
    }

    pub fn dump(&self) -> Vec<String> {
        let inner = self.inner.lock();
        inner.entries.keys().map(|fp| fp.to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Looks up `fp`; on miss, coalesces with any in-flight resolution for
    /// the same fingerprint, or becomes the leader and calls `resolve` to
    /// produce a fresh reply, which is then stored and broadcast to any
    /// waiters. `frontend` is only used for the single-flight metric label.
    pub async fn get_or_resolve<F, Fut>(
        &self,
        fp: &Fingerprint,
        request_id: u16,
        recursion_desired: bool,
        frontend: &str,
        resolve: F,
    ) -> DnsPacket
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = DnsPacket>,
    {
        loop {
            let wait_on = {
                let mut inner = self.inner.lock();
                let now = Instant::now();

                if let Some(entry) = inner.entries.get(fp) {
                    if now < entry.deadline {
                        touch(&mut inner.order, fp);
                        let entry = inner.entries.get(fp).expect("checked above");
                        DNS_CACHE_OPERATIONS.with_label_values(&["hit"]).inc();
                        return rewrite_for_response(
                            &entry.packet,
                            entry.inserted_at,
                            now,
                            request_id,
                            recursion_desired,
                        );
                    }
                    inner.entries.remove(fp);
                    remove_from_order(&mut inner.order, fp);
                }

                if let Some(notify) = inner.inflight.get(fp) {
                    SINGLE_FLIGHT_COALESCED_TOTAL
                        .with_label_values(&[frontend])
                        .inc();
                    Some(notify.clone())
                } else {
                    inner
                        .inflight
                        .insert(fp.clone(), Arc::new(Notify::new()));
                    None
                }
            };

            match wait_on {
                Some(notify) => {
                    // `Notify::notify_waiters` wakes only futures already
                    // registered at the moment it fires; a waiter that
                    // cloned the handle but hasn't called `notified()` yet
                    // can miss the leader's wakeup entirely. Bound the wait
                    // so a missed notification still falls back to
                    // re-consulting the cache/inflight map on the next loop
                    // iteration instead of hanging forever.
                    let _ = tokio::time::timeout(SINGLE_FLIGHT_POLL_INTERVAL, notify.notified()).await;
                    continue;
                }
                None => {
                    let packet = resolve().await;
                    self.insert(fp.clone(), packet.clone());

                    let notify = self.inner.lock().inflight.remove(fp);
                    if let Some(notify) = notify {
                        notify.notify_waiters();
                    }

                    let now = Instant::now();
                    return rewrite_for_response(&packet, now, now, request_id, recursion_desired);
                }
            }
        }
    }
}

impl Default for Cache {
    fn default() -> Cache {
        Cache::new(DEFAULT_CAPACITY, Duration::from_secs(DEFAULT_TTL_CAP_SECS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::protocol::{DnsQuestion, DnsRecord, QueryType, TransientTtl};
    use std::net::Ipv4Addr;

    fn answer_packet(ttl: u32) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.rescode = ResultCode::NOERROR;
        packet
            .questions
            .push(DnsQuestion::new("example.com".into(), QueryType::A));
        packet.answers.push(DnsRecord::A {
            domain: "example.com".into(),
            addr: Ipv4Addr::new(1, 2, 3, 4),
            ttl: TransientTtl(ttl),
        });
        packet
    }

    #[test]
    fn miss_then_hit() {
        let cache = Cache::new(10, Duration::from_secs(60));
        let fp = Fingerprint::new("example.com", QueryType::A, false);

        assert!(cache.lookup(&fp, 1, true).is_none());
        cache.insert(fp.clone(), answer_packet(300));
        let hit = cache.lookup(&fp, 42, true).unwrap();
        assert_eq!(hit.header.id, 42);
        assert_eq!(hit.answers[0].get_ttl(), 300);
    }

    #[test]
    fn zero_ttl_bypasses_cache() {
        let cache = Cache::new(10, Duration::from_secs(60));
        let fp = Fingerprint::new("example.com", QueryType::A, false);
        assert!(!cache.insert(fp.clone(), answer_packet(0)));
        assert!(cache.lookup(&fp, 1, true).is_none());
    }

    #[test]
    fn bounded_lru_evicts_oldest() {
        let cache = Cache::new(2, Duration::from_secs(60));
        for i in 0..3 {
            let fp = Fingerprint::new(&format!("host{}.example.com", i), QueryType::A, false);
            let mut p = answer_packet(300);
            p.questions[0].name = format!("host{}.example.com", i);
            cache.insert(fp, p);
        }
        assert_eq!(cache.len(), 2);

        let evicted = Fingerprint::new("host0.example.com", QueryType::A, false);
        assert!(cache.lookup(&evicted, 1, true).is_none());
        let kept = Fingerprint::new("host2.example.com", QueryType::A, false);
        assert!(cache.lookup(&kept, 1, true).is_some());
    }

    #[tokio::test]
    async fn single_flight_coalesces_concurrent_misses() {
        let cache = Arc::new(Cache::new(10, Duration::from_secs(60)));
        let fp = Fingerprint::new("example.com", QueryType::A, false);
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..8u16 {
            let cache = cache.clone();
            let fp = fp.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_resolve(&fp, i, true, "test", || {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            answer_packet(300)
                        }
                    })
                    .await
            }));
        }

        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
