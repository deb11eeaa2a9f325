//! The Google-style DoH JSON dialect: request query parameters and the
//! `Status/Question/Answer/...` response schema, with bidirectional
//! conversion to and from `DnsPacket`.

use ipnetwork::IpNetwork;
use serde_derive::{Deserialize, Serialize};

use crate::dns::protocol::{DnsPacket, DnsQuestion, DnsRecord, QueryType, ResultCode, TransientTtl};

/// A parsed `GET /resolve` query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonRequest {
    pub name: String,
    pub qtype: QueryType,
    pub checking_disabled: bool,
    pub dnssec_ok: bool,
    pub edns_client_subnet: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonRequestError {
    MissingName,
    BadType,
    BadEdnsClientSubnet,
}

impl JsonRequest {
    /// Parses the query string of a `GET /resolve?name=...&type=...` request.
    /// `query` is everything after the `?`, not including it.
    pub fn parse(query: &str) -> Result<JsonRequest, JsonRequestError> {
        let mut name = None;
        let mut qtype = QueryType::A;
        let mut cd = false;
        let mut want_do = false;
        let mut ecs = None;

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = match pair.split_once('=') {
                Some((k, v)) => (k, v),
                None => (pair, ""),
            };
            let value = percent_decode(value);

            match key {
                "name" => name = Some(value),
                "type" => qtype = parse_type(&value).ok_or(JsonRequestError::BadType)?,
                "cd" => cd = parse_bool(&value),
                "do" => want_do = parse_bool(&value),
                "edns_client_subnet" => {
                    value
                        .parse::<IpNetwork>()
                        .map_err(|_| JsonRequestError::BadEdnsClientSubnet)?;
                    ecs = Some(value);
                }
                _ => {}
            }
        }
        Ok(JsonRequest {
            name: name.ok_or(JsonRequestError::MissingName)?,
            qtype,
            checking_disabled: cd,
            dnssec_ok: want_do,
            edns_client_subnet: ecs,
        })
    }

    pub fn into_query_packet(self) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.id = rand::random::<u16>();
        packet.header.recursion_desired = true;
        packet.header.checking_disabled = self.checking_disabled;
        packet.questions.push(DnsQuestion::new(self.name, self.qtype));
        if self.dnssec_ok {
            packet.edns = Some(crate::dns::protocol::EdnsOpt {
                udp_payload_size: 4096,
                extended_rcode: 0,
                version: 0,
                dnssec_ok: true,
            });
        }
        packet
    }
}

fn parse_type(value: &str) -> Option<QueryType> {
    if let Ok(num) = value.parse::<u16>() {
        return Some(QueryType::from_num(num));
    }
    Some(match value.to_uppercase().as_str() {
        "A" => QueryType::A,
        "NS" => QueryType::Ns,
        "CNAME" => QueryType::Cname,
        "SOA" => QueryType::Soa,
        "PTR" => QueryType::Ptr,
        "MX" => QueryType::Mx,
        "TXT" => QueryType::Txt,
        "AAAA" => QueryType::Aaaa,
        "SRV" => QueryType::Srv,
        "OPT" => QueryType::Opt,
        "IXFR" => QueryType::Ixfr,
        "AXFR" => QueryType::Axfr,
        other if other.starts_with("TYPE") => {
            return other[4..].parse::<u16>().ok().map(QueryType::from_num)
        }
        _ => return None,
    })
}

fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "True" | "TRUE")
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                    if let Ok(byte) = u8::from_str_radix(hex, 16) {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                }
                out.push(bytes[i]);
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// The Google DoH JSON response schema.
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonResponse {
    #[serde(rename = "Status")]
    pub status: u16,
    #[serde(rename = "TC")]
    pub tc: bool,
    #[serde(rename = "RD")]
    pub rd: bool,
    #[serde(rename = "RA")]
    pub ra: bool,
    #[serde(rename = "AD")]
    pub ad: bool,
    #[serde(rename = "CD")]
    pub cd: bool,
    #[serde(rename = "Question")]
    pub question: Vec<JsonQuestion>,
    #[serde(rename = "Answer", skip_serializing_if = "Vec::is_empty", default)]
    pub answer: Vec<JsonRecord>,
    #[serde(rename = "Authority", skip_serializing_if = "Vec::is_empty", default)]
    pub authority: Vec<JsonRecord>,
    #[serde(rename = "Additional", skip_serializing_if = "Vec::is_empty", default)]
    pub additional: Vec<JsonRecord>,
    #[serde(
        rename = "edns_client_subnet",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub edns_client_subnet: Option<String>,
    #[serde(rename = "Comment", skip_serializing_if = "Option::is_none", default)]
    pub comment: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonQuestion {
    pub name: String,
    #[serde(rename = "type")]
    pub qtype: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRecord {
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: u16,
    #[serde(rename = "TTL")]
    pub ttl: u32,
    pub data: String,
}

fn fqdn(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{}.", name)
    }
}

/// Presentation-form RDATA, matching the textual forms the JSON dialect uses
/// (`"1.2.3.4"`, `"10 mail.example."`); unknown types fall back to the
/// generic `\# length hex` form.
fn rdata_presentation(record: &DnsRecord) -> String {
    match record {
        DnsRecord::A { addr, .. } => addr.to_string(),
        DnsRecord::Aaaa { addr, .. } => addr.to_string(),
        DnsRecord::Ns { host, .. } => fqdn(host),
        DnsRecord::Cname { host, .. } => fqdn(host),
        DnsRecord::Ptr { host, .. } => fqdn(host),
        DnsRecord::Mx { priority, host, .. } => format!("{} {}", priority, fqdn(host)),
        DnsRecord::Txt { data, .. } => format!("\"{}\"", data),
        DnsRecord::Srv {
            priority,
            weight,
            port,
            host,
            ..
        } => format!("{} {} {} {}", priority, weight, port, fqdn(host)),
        DnsRecord::Soa {
            m_name,
            r_name,
            serial,
            refresh,
            retry,
            expire,
            minimum,
            ..
        } => format!(
            "{} {} {} {} {} {} {}",
            fqdn(m_name),
            fqdn(r_name),
            serial,
            refresh,
            retry,
            expire,
            minimum
        ),
        DnsRecord::Unknown { data_len, .. } => {
            format!("\\# {} {}", data_len, "00".repeat(*data_len as usize))
        }
    }
}

fn record_to_json(record: &DnsRecord) -> JsonRecord {
    JsonRecord {
        name: record.get_domain().map(|n| fqdn(&n)).unwrap_or_default(),
        rtype: record.get_querytype().to_num(),
        ttl: record.get_ttl(),
        data: rdata_presentation(record),
    }
}

/// Renders a resolved reply in the JSON dialect.
pub fn packet_to_json(packet: &DnsPacket, edns_client_subnet: Option<String>) -> JsonResponse {
    JsonResponse {
        status: rescode_to_num(packet.header.rescode),
        tc: packet.header.truncated_message,
        rd: packet.header.recursion_desired,
        ra: packet.header.recursion_available,
        ad: packet.header.authed_data,
        cd: packet.header.checking_disabled,
        question: packet
            .questions
            .iter()
            .map(|q| JsonQuestion {
                name: fqdn(&q.name),
                qtype: q.qtype.to_num(),
            })
            .collect(),
        answer: packet.answers.iter().map(record_to_json).collect(),
        authority: packet.authorities.iter().map(record_to_json).collect(),
        additional: packet.resources.iter().map(record_to_json).collect(),
        edns_client_subnet,
        comment: None,
    }
}

fn rescode_to_num(code: ResultCode) -> u16 {
    match code {
        ResultCode::NOERROR => 0,
        ResultCode::FORMERR => 1,
        ResultCode::SERVFAIL => 2,
        ResultCode::NXDOMAIN => 3,
        ResultCode::NOTIMP => 4,
        ResultCode::REFUSED => 5,
    }
}

/// Builds a synthetic NXDOMAIN/SERVFAIL-style reply for presenting errors in
/// the JSON dialect when there is no resolved `DnsPacket` to render.
pub fn error_json(question_name: &str, qtype: QueryType, status: ResultCode) -> JsonResponse {
    JsonResponse {
        status: rescode_to_num(status),
        tc: false,
        rd: true,
        ra: true,
        ad: false,
        cd: false,
        question: vec![JsonQuestion {
            name: fqdn(question_name),
            qtype: qtype.to_num(),
        }],
        answer: Vec::new(),
        authority: Vec::new(),
        additional: Vec::new(),
        edns_client_subnet: None,
        comment: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn parses_name_and_type() {
        let req = JsonRequest::parse("name=example.com&type=MX").unwrap();
        assert_eq!(req.name, "example.com");
        assert_eq!(req.qtype, QueryType::Mx);
    }

    #[test]
    fn missing_name_is_an_error() {
        assert_eq!(JsonRequest::parse("type=A"), Err(JsonRequestError::MissingName));
    }

    #[test]
    fn numeric_type_accepted() {
        let req = JsonRequest::parse("name=example.com&type=28").unwrap();
        assert_eq!(req.qtype, QueryType::Aaaa);
    }

    #[test]
    fn do_and_cd_flags() {
        let req = JsonRequest::parse("name=example.com&do=true&cd=1").unwrap();
        assert!(req.dnssec_ok);
        assert!(req.checking_disabled);
    }

    #[test]
    fn bad_edns_client_subnet_rejected() {
        assert_eq!(
            JsonRequest::parse("name=example.com&edns_client_subnet=not-a-cidr"),
            Err(JsonRequestError::BadEdnsClientSubnet)
        );
    }

    #[test]
    fn renders_a_record_as_dotted_quad() {
        let mut packet = DnsPacket::new();
        packet.header.rescode = ResultCode::NOERROR;
        packet
            .questions
            .push(DnsQuestion::new("example.com".into(), QueryType::A));
        packet.answers.push(DnsRecord::A {
            domain: "example.com".into(),
            addr: Ipv4Addr::new(93, 184, 216, 34),
            ttl: TransientTtl(300),
        });

        let json = packet_to_json(&packet, None);
        assert_eq!(json.status, 0);
        assert_eq!(json.answer[0].data, "93.184.216.34");
        assert_eq!(json.question[0].name, "example.com.");
    }

    #[test]
    fn renders_mx_preference_and_exchange() {
        let mut packet = DnsPacket::new();
        packet.answers.push(DnsRecord::Mx {
            domain: "example.com".into(),
            priority: 10,
            host: "mail.example.com".into(),
            ttl: TransientTtl(300),
        });
        let json = packet_to_json(&packet, None);
        assert_eq!(json.answer[0].data, "10 mail.example.com.");
    }
}
