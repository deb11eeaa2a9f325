//! DoH client: the DNS→HTTPS direction. Takes a parsed DNS request and a
//! configured upstream, serializes it in the configured dialect, and speaks
//! HTTPS to resolve it.

use std::time::Duration;

use base64::{encode_config, URL_SAFE_NO_PAD};
use derive_more::{Display, Error, From};

use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};
use crate::dns::errors::{ErrorKind, HttpStatusMapped, RcodeMapped};
use crate::dns::json::{self, JsonResponse};
use crate::dns::metrics::{UPSTREAM_QUERIES_TOTAL, UPSTREAM_QUERY_DURATION};
use crate::dns::protocol::{DnsPacket, DnsQuestion, DnsRecord, QueryType, ResultCode, TransientTtl};

#[derive(Debug, Display, From, Error)]
pub enum DohClientError {
    Transport(reqwest::Error),
    Protocol(crate::dns::protocol::ProtocolError),
    Json(serde_json::Error),
    #[display(fmt = "upstream returned status {}", _0)]
    BadStatus(u16),
    #[display(fmt = "reply question did not match request")]
    QuestionMismatch,
    #[display(fmt = "upstream request timed out")]
    Timeout,
}

impl RcodeMapped for DohClientError {
    fn to_rcode(&self) -> ResultCode {
        ErrorKind::UpstreamUnreachable.to_rcode()
    }
}

impl HttpStatusMapped for DohClientError {
    fn to_http_status(&self) -> u16 {
        ErrorKind::UpstreamUnreachable.to_http_status()
    }
}

/// Which wire dialect to use when talking to the upstream DoH endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dialect {
    Wire,
    Json,
}

#[derive(Clone, Debug)]
pub struct DohClientConfig {
    pub endpoint: String,
    pub dialect: Dialect,
    pub timeout: Duration,
}

pub struct DohClient {
    config: DohClientConfig,
    http: reqwest::Client,
}

impl DohClient {
    pub fn new(config: DohClientConfig) -> DohClient {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("reqwest client builder");
        DohClient { config, http }
    }

    /// Resolves `request` against the configured upstream. On any transport,
    /// HTTP status, codec, or question-mismatch failure this returns a
    /// SERVFAIL reply with the request's ID preserved rather than an `Err` —
    /// per the failure policy, the caller never needs to synthesize that
    /// reply itself.
    pub async fn resolve(&self, request: &DnsPacket) -> DnsPacket {
        let timer = UPSTREAM_QUERY_DURATION.with_label_values(&["doh"]).start_timer();
        let result = match self.config.dialect {
            Dialect::Wire => self.resolve_wire(request).await,
            Dialect::Json => self.resolve_json(request).await,
        };
        timer.observe_duration();

        match result {
            Ok(reply) => {
                UPSTREAM_QUERIES_TOTAL.with_label_values(&["doh", "ok"]).inc();
                reply
            }
            Err(err) => {
                let outcome = if matches!(err, DohClientError::Timeout) {
                    "timeout"
                } else {
                    "servfail"
                };
                UPSTREAM_QUERIES_TOTAL.with_label_values(&["doh", outcome]).inc();
                log::warn!("DoH upstream query failed: {}", err);
                servfail_reply(request)
            }
        }
    }

    async fn resolve_wire(&self, request: &DnsPacket) -> Result<DnsPacket, DohClientError> {
        let mut req = request.clone();
        let mut buffer = VectorPacketBuffer::new();
        req.write(&mut buffer, 4096)?;
        let wire = buffer.buffer;

        let encoded = encode_config(&wire, URL_SAFE_NO_PAD);
        let url = format!(
            "{}{}dns={}",
            self.config.endpoint,
            if self.config.endpoint.contains('?') { "&" } else { "?" },
            encoded
        );

        let response = self
            .http
            .get(&url)
            .header("Accept", "application/dns-message")
            .send()
            .await
            .map_err(map_timeout)?;

        if !response.status().is_success() {
            return Err(DohClientError::BadStatus(response.status().as_u16()));
        }

        let body = response.bytes().await.map_err(map_timeout)?;
        let mut resp_buffer = VectorPacketBuffer::new();
        resp_buffer.buffer = body.to_vec();
        let reply = DnsPacket::from_buffer(&mut resp_buffer)?;

        check_question_match(request, &reply)?;
        Ok(reply)
    }

    async fn resolve_json(&self, request: &DnsPacket) -> Result<DnsPacket, DohClientError> {
        let question = request
            .questions
            .first()
            .ok_or(DohClientError::QuestionMismatch)?;

        let mut full_url = format!(
            "{}{}name={}&type={}",
            self.config.endpoint,
            if self.config.endpoint.contains('?') { "&" } else { "?" },
            urlencode(&question.name),
            question.qtype.to_num(),
        );
        if request.header.checking_disabled {
            full_url.push_str("&cd=true");
        }
        if request.dnssec_ok() {
            full_url.push_str("&do=true");
        }

        let response = self
            .http
            .get(&full_url)
            .header("Accept", "application/dns-json")
            .send()
            .await
            .map_err(map_timeout)?;

        if !response.status().is_success() {
            return Err(DohClientError::BadStatus(response.status().as_u16()));
        }

        let json: JsonResponse = response.json().await.map_err(map_timeout)?;
        let reply = json_to_packet(request, json);
        check_question_match(request, &reply)?;
        Ok(reply)
    }
}

fn map_timeout(err: reqwest::Error) -> DohClientError {
    if err.is_timeout() {
        DohClientError::Timeout
    } else {
        DohClientError::Transport(err)
    }
}

fn urlencode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => out.push(b as char),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

fn check_question_match(request: &DnsPacket, reply: &DnsPacket) -> Result<(), DohClientError> {
    let (Some(q), Some(a)) = (request.questions.first(), reply.questions.first()) else {
        return Ok(());
    };
    let same_name = q.name.trim_end_matches('.').to_lowercase() == a.name.trim_end_matches('.').to_lowercase();
    if !same_name || q.qtype != a.qtype {
        return Err(DohClientError::QuestionMismatch);
    }
    Ok(())
}

fn servfail_reply(request: &DnsPacket) -> DnsPacket {
    let mut reply = DnsPacket::new();
    reply.header.id = request.header.id;
    reply.header.response = true;
    reply.header.recursion_desired = request.header.recursion_desired;
    reply.header.recursion_available = true;
    reply.header.rescode = ResultCode::SERVFAIL;
    reply.questions = request.questions.clone();
    reply
}

fn num_to_rescode(status: u16) -> ResultCode {
    match status {
        1 => ResultCode::FORMERR,
        2 => ResultCode::SERVFAIL,
        3 => ResultCode::NXDOMAIN,
        4 => ResultCode::NOTIMP,
        5 => ResultCode::REFUSED,
        _ => ResultCode::NOERROR,
    }
}

/// Reconstructs a `DnsPacket` from a JSON dialect response, for the wire
/// side of a request that used the JSON dialect upstream.
fn json_to_packet(request: &DnsPacket, json: JsonResponse) -> DnsPacket {
    let mut packet = DnsPacket::new();
    packet.header.id = request.header.id;
    packet.header.response = true;
    packet.header.recursion_desired = json.rd;
    packet.header.recursion_available = json.ra;
    packet.header.truncated_message = json.tc;
    packet.header.authed_data = json.ad;
    packet.header.checking_disabled = json.cd;
    packet.header.rescode = num_to_rescode(json.status);

    packet.questions = json
        .question
        .iter()
        .map(|q| DnsQuestion::new(q.name.trim_end_matches('.').to_string(), QueryType::from_num(q.qtype)))
        .collect();
    if packet.questions.is_empty() {
        packet.questions = request.questions.clone();
    }

    packet.answers = json.answer.iter().filter_map(json_record_to_dns).collect();
    packet.authorities = json.authority.iter().filter_map(json_record_to_dns).collect();
    packet.resources = json.additional.iter().filter_map(json_record_to_dns).collect();

    packet
}

fn json_record_to_dns(record: &json::JsonRecord) -> Option<DnsRecord> {
    let domain = record.name.trim_end_matches('.').to_string();
    let ttl = TransientTtl(record.ttl);

    Some(match QueryType::from_num(record.rtype) {
        QueryType::A => DnsRecord::A {
            domain,
            addr: record.data.parse().ok()?,
            ttl,
        },
        QueryType::Aaaa => DnsRecord::Aaaa {
            domain,
            addr: record.data.parse().ok()?,
            ttl,
        },
        QueryType::Ns => DnsRecord::Ns {
            domain,
            host: record.data.trim_end_matches('.').to_string(),
            ttl,
        },
        QueryType::Cname => DnsRecord::Cname {
            domain,
            host: record.data.trim_end_matches('.').to_string(),
            ttl,
        },
        QueryType::Ptr => DnsRecord::Ptr {
            domain,
            host: record.data.trim_end_matches('.').to_string(),
            ttl,
        },
        QueryType::Mx => {
            let mut parts = record.data.splitn(2, ' ');
            let priority = parts.next()?.parse().ok()?;
            let host = parts.next()?.trim_end_matches('.').to_string();
            DnsRecord::Mx {
                domain,
                priority,
                host,
                ttl,
            }
        }
        QueryType::Txt => DnsRecord::Txt {
            domain,
            data: record.data.trim_matches('"').to_string(),
            ttl,
        },
        QueryType::Srv => {
            let mut parts = record.data.splitn(4, ' ');
            let priority = parts.next()?.parse().ok()?;
            let weight = parts.next()?.parse().ok()?;
            let port = parts.next()?.parse().ok()?;
            let host = parts.next()?.trim_end_matches('.').to_string();
            DnsRecord::Srv {
                domain,
                priority,
                weight,
                port,
                host,
                ttl,
            }
        }
        other => DnsRecord::Unknown {
            domain,
            qtype: other.to_num(),
            data_len: 0,
            ttl,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn servfail_reply_preserves_id_and_question() {
        let mut request = DnsPacket::new();
        request.header.id = 0xBEEF;
        request.questions.push(DnsQuestion::new("example.com".into(), QueryType::A));

        let reply = servfail_reply(&request);
        assert_eq!(reply.header.id, 0xBEEF);
        assert_eq!(reply.header.rescode, ResultCode::SERVFAIL);
        assert_eq!(reply.questions.len(), 1);
    }

    #[test]
    fn json_record_to_dns_parses_mx() {
        let rec = json::JsonRecord {
            name: "example.com.".into(),
            rtype: QueryType::Mx.to_num(),
            ttl: 300,
            data: "10 mail.example.com.".into(),
        };
        let parsed = json_record_to_dns(&rec).unwrap();
        match parsed {
            DnsRecord::Mx { priority, host, .. } => {
                assert_eq!(priority, 10);
                assert_eq!(host, "mail.example.com");
            }
            _ => panic!("expected MX"),
        }
    }

    #[test]
    fn question_mismatch_detected() {
        let mut request = DnsPacket::new();
        request.questions.push(DnsQuestion::new("example.com".into(), QueryType::A));
        let mut reply = DnsPacket::new();
        reply.questions.push(DnsQuestion::new("other.com".into(), QueryType::A));
        assert!(check_question_match(&request, &reply).is_err());
    }
}
