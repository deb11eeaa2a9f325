//! Question fingerprint: the normalized cache key for a DNS question.
//!
//! Two requests fingerprint identically iff they would receive the same
//! answer from upstream: same (lowercased) name, same type, same class, and
//! the same DO bit, since DNSSEC-OK queries can get a different RRset back.

use std::fmt;

use crate::dns::protocol::{DnsPacket, QueryType};

/// IN is the only class the wire codec and JSON codec deal in; kept as an
/// explicit field anyway since it's part of the fingerprint definition.
pub const CLASS_IN: u16 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub name: String,
    pub qtype: QueryType,
    pub qclass: u16,
    pub do_bit: bool,
}

impl Fingerprint {
    pub fn new(name: &str, qtype: QueryType, do_bit: bool) -> Fingerprint {
        Fingerprint {
            name: name.to_lowercase(),
            qtype,
            qclass: CLASS_IN,
            do_bit,
        }
    }

    /// Builds the fingerprint for a request's first (and only, by the time
    /// validation has run) question.
    pub fn from_request(packet: &DnsPacket) -> Option<Fingerprint> {
        let question = packet.questions.first()?;
        Some(Fingerprint::new(
            &question.name,
            question.qtype,
            packet.dnssec_ok(),
        ))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} IN{}",
            self.name,
            self.qtype,
            if self.do_bit { " DO" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive() {
        let a = Fingerprint::new("Example.COM", QueryType::A, false);
        let b = Fingerprint::new("example.com", QueryType::A, false);
        assert_eq!(a, b);
    }

    #[test]
    fn do_bit_distinguishes() {
        let a = Fingerprint::new("example.com", QueryType::A, false);
        let b = Fingerprint::new("example.com", QueryType::A, true);
        assert_ne!(a, b);
    }
}
