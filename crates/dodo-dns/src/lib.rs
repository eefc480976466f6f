//! DNS zone manager
//!
//! Keeps one authoritative zone file for CoreDNS and lets the ACME DNS-01
//! solver and the VPN controller edit it over HTTP:
//!
//! - `POST /create-txt-record`, `/delete-txt-record`
//! - `POST /create-a-record`, `/delete-a-record`
//! - `GET /records-to-publish` - DS and glue records for the parent zone

#![deny(missing_docs)]

pub mod client;
pub mod dnssec;
pub mod error;
pub mod manager;
pub mod server;
pub mod zone;

pub use client::{split_fqdn, SolverConfig, ZoneClient};
pub use dnssec::DnsSecKey;
pub use error::{Error, Result};
pub use manager::{ZoneConfig, ZoneManager};
pub use server::{router, serve, RecordRequest};
pub use zone::{RData, Record, Zone};
