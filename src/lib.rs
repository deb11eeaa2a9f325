//! dohbridge
//!
//! A daemon bridging the classic DNS wire protocol and DNS-over-HTTPS (DoH),
//! in two independently-enablable directions:
//!
//! * DNS→HTTPS: accepts UDP/TCP DNS queries and forwards them to a DoH
//!   upstream.
//! * HTTPS→DNS: accepts DoH requests (JSON or wire dialect) and resolves
//!   them against a classic DNS upstream.
//!
//! # Architecture
//!
//! * `dns` — wire/JSON codecs, cache, override table, both clients, both
//!   front-ends, shared context, metrics, and the monitoring listener.
//! * `config` — CLI flags and optional TOML file, merged into `Config`.

/// DNS↔DoH protocol handling, caching, and both front-ends
pub mod dns;

/// CLI flags and TOML config file parsing
pub mod config;
