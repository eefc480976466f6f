//! Authoritative zone file manager
//!
//! Every mutation reads the zone file, edits it in memory, bumps the SOA
//! serial and rewrites the whole file under one lock. CoreDNS reloads the
//! file by itself.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::dnssec::DnsSecKey;
use crate::error::{Error, Result};
use crate::zone::{fqdn, initial_zone, RData, Record, Zone, GLUE_TTL};

/// Where and what the manager serves
#[derive(Clone, Debug)]
pub struct ZoneConfig {
    /// Directory holding the key, the snippet and the zone file
    pub root_dir: PathBuf,
    /// CoreDNS snippet file name
    pub config_file: String,
    /// Zone file name
    pub db_file: String,
    /// Zone domain, e.g. `lekva.me`
    pub zone: String,
    /// Public ingress addresses
    pub public_ips: Vec<Ipv4Addr>,
    /// Private ingress address
    pub private_ip: Option<Ipv4Addr>,
    /// Nameserver addresses, published as `ns1`, `ns2`, ...
    pub nameserver_ips: Vec<Ipv4Addr>,
}

/// Owns one zone file
pub struct ZoneManager {
    zone: String,
    db_path: PathBuf,
    ds: String,
    nameservers: Vec<Ipv4Addr>,
    lock: Mutex<()>,
}

impl ZoneManager {
    /// Prepare `config.root_dir`: DNSSEC key files, CoreDNS snippet, and
    /// the initial zone file when there is none yet.
    pub fn open(config: ZoneConfig) -> Result<Self> {
        if config.zone.trim_end_matches('.').is_empty() {
            return Err(Error::invalid("zone must not be empty"));
        }
        std::fs::create_dir_all(&config.root_dir)?;
        let key = DnsSecKey::load_or_generate(&config.root_dir, &config.zone)?;
        key.write_key_files(&config.root_dir)?;

        let db_path = config.root_dir.join(&config.db_file);
        std::fs::write(
            config.root_dir.join(&config.config_file),
            corefile_snippet(&config.zone, &db_path, &config.root_dir.join(&key.basename)),
        )?;
        if !db_path.exists() {
            let zone = initial_zone(
                &config.zone,
                next_serial(0),
                &config.nameserver_ips,
                &config.public_ips,
                config.private_ip,
            );
            std::fs::write(&db_path, zone.to_string())?;
            info!(zone = %config.zone, path = %db_path.display(), "Created zone file");
        }
        Ok(Self {
            zone: config.zone.trim_end_matches('.').to_string(),
            db_path,
            ds: key.ds,
            nameservers: config.nameserver_ips,
            lock: Mutex::new(()),
        })
    }

    /// Zone domain without trailing dot
    pub fn zone(&self) -> &str {
        &self.zone
    }

    /// Path of the zone file
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    /// Current zone contents
    pub fn read(&self) -> Result<Zone> {
        let _guard = self.lock.lock();
        self.load()
    }

    /// Add a TXT record; adding an existing one changes nothing but the serial
    #[instrument(skip(self))]
    pub fn add_txt_record(&self, entry: &str, value: &str) -> Result<()> {
        let record = Record::txt(self.name(entry)?, value);
        self.mutate(|zone| {
            if zone.position(&record).is_none() {
                zone.records.push(record);
            }
            Ok(())
        })
    }

    /// Delete the TXT record with exactly `value`; other values of the same
    /// name stay
    #[instrument(skip(self))]
    pub fn delete_txt_record(&self, entry: &str, value: &str) -> Result<()> {
        let record = Record::txt(self.name(entry)?, value);
        self.mutate(|zone| {
            match zone.position(&record) {
                Some(i) => {
                    zone.records.remove(i);
                }
                None => debug!(name = %record.name, "TXT record already absent"),
            }
            Ok(())
        })
    }

    /// Add an A record
    #[instrument(skip(self))]
    pub fn add_a_record(&self, entry: &str, ip: &str) -> Result<()> {
        let record = Record::a(self.name(entry)?, parse_ip(ip)?);
        self.mutate(|zone| {
            if zone.position(&record).is_none() {
                zone.records.push(record);
            }
            Ok(())
        })
    }

    /// Delete an A record; `NotFound` when there is none
    #[instrument(skip(self))]
    pub fn delete_a_record(&self, entry: &str, ip: &str) -> Result<()> {
        let record = Record::a(self.name(entry)?, parse_ip(ip)?);
        self.mutate(|zone| {
            let i = zone
                .position(&record)
                .ok_or_else(|| Error::NotFound(format!("{} A {}", record.name, ip)))?;
            zone.records.remove(i);
            Ok(())
        })
    }

    /// Records the parent zone administrator has to publish
    pub fn records_to_publish(&self) -> Vec<String> {
        let mut out = vec![self.ds.clone()];
        let origin = fqdn(&self.zone);
        let label = self.zone.split('.').next().unwrap_or(&self.zone);
        for (i, ip) in self.nameservers.iter().enumerate() {
            let ns = format!("ns{}.{}", i + 1, origin);
            out.push(format!("{} {} IN A {}", ns, GLUE_TTL, ip));
            out.push(format!("{} {} IN NS {}", label, GLUE_TTL, ns));
        }
        out
    }

    fn name(&self, entry: &str) -> Result<String> {
        let entry = entry.trim_end_matches('.');
        if entry.is_empty() || entry.chars().any(char::is_whitespace) {
            return Err(Error::invalid(format!("invalid entry {:?}", entry)));
        }
        Ok(format!("{}.{}.", entry, self.zone))
    }

    fn load(&self) -> Result<Zone> {
        Zone::parse(&std::fs::read_to_string(&self.db_path)?, &self.zone)
    }

    fn mutate(&self, f: impl FnOnce(&mut Zone) -> Result<()>) -> Result<()> {
        let _guard = self.lock.lock();
        let mut zone = self.load()?;
        f(&mut zone)?;
        let soa = zone
            .soa_mut()
            .ok_or_else(|| Error::Internal(format!("zone {} has no SOA record", self.zone)))?;
        soa.serial = next_serial(soa.serial);
        let serial = soa.serial;

        let tmp = self.db_path.with_extension("tmp");
        std::fs::write(&tmp, zone.to_string())?;
        std::fs::rename(&tmp, &self.db_path)?;
        debug!(zone = %self.zone, serial, records = zone.records.len(), "Zone written");
        Ok(())
    }
}

/// Ten times the Unix time, wrapped to 32 bits, but always past `previous`
pub fn next_serial(previous: u32) -> u32 {
    let now = (Utc::now().timestamp() as u64).wrapping_mul(10) as u32;
    now.max(previous.saturating_add(1))
}

fn parse_ip(ip: &str) -> Result<Ipv4Addr> {
    ip.parse()
        .map_err(|_| Error::invalid(format!("invalid IPv4 address {:?}", ip)))
}

fn corefile_snippet(zone: &str, db: &Path, key_basename: &Path) -> String {
    format!(
        "{zone}:53 {{
\tfile {db} {{
\t\treload 1s
\t}}
\terrors
\tdnssec {{
\t\tkey file {key}
\t}}
\tlog
\thealth {{
\t\tlameduck 5s
\t}}
\tready
\tcache 30
\tloop
\treload
\tloadbalance
}}
",
        zone = zone.trim_end_matches('.'),
        db = db.display(),
        key = key_basename.display(),
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::zone::Soa;

    pub(crate) fn manager() -> (tempfile::TempDir, ZoneManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let manager = ZoneManager::open(ZoneConfig {
            root_dir: dir.path().to_path_buf(),
            config_file: "coredns.conf".into(),
            db_file: "zone.db".into(),
            zone: "lekva.me".into(),
            public_ips: vec!["135.181.48.180".parse().expect("ip")],
            private_ip: Some("10.1.0.1".parse().expect("ip")),
            nameserver_ips: vec!["10.0.0.1".parse().expect("ip"), "10.0.0.2".parse().expect("ip")],
        })
        .expect("open");
        (dir, manager)
    }

    fn serial(m: &ZoneManager) -> u32 {
        m.read().expect("read").soa().expect("soa").serial
    }

    fn txt_values(zone: &Zone, name: &str) -> Vec<String> {
        zone.txt_records(name).filter_map(Record::txt_value).collect()
    }

    #[test]
    fn open_writes_snippet_keys_and_zone() {
        let (dir, m) = manager();
        let snippet = std::fs::read_to_string(dir.path().join("coredns.conf")).expect("snippet");
        assert!(snippet.starts_with("lekva.me:53 {"));
        assert!(snippet.contains(&format!("file {} {{", m.db_path().display())));
        assert!(snippet.contains("key file "));
        assert!(dir.path().join("dns-sec-key.json").exists());
        assert_eq!(m.read().expect("zone").records.len(), 7);
    }

    #[test]
    fn reopening_keeps_the_zone() {
        let (dir, m) = manager();
        m.add_txt_record("keep", "me").expect("add");
        let before = std::fs::read_to_string(m.db_path()).expect("db");
        let reopened = ZoneManager::open(ZoneConfig {
            root_dir: dir.path().to_path_buf(),
            config_file: "coredns.conf".into(),
            db_file: "zone.db".into(),
            zone: "lekva.me".into(),
            public_ips: vec![],
            private_ip: None,
            nameserver_ips: vec![],
        })
        .expect("reopen");
        assert_eq!(std::fs::read_to_string(reopened.db_path()).expect("db"), before);
    }

    #[test]
    fn concurrent_challenges_for_one_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let m = ZoneManager::open(ZoneConfig {
            root_dir: dir.path().to_path_buf(),
            config_file: "coredns.conf".into(),
            db_file: "zone.db".into(),
            zone: "lekva.me".into(),
            public_ips: vec![],
            private_ip: None,
            nameserver_ips: vec!["10.0.0.1".parse().expect("ip")],
        })
        .expect("open");
        let name = "_acme.foo.lekva.me.";

        let mut serials = vec![serial(&m)];
        m.add_txt_record("_acme.foo", "abc").expect("add abc");
        serials.push(serial(&m));
        m.add_txt_record("_acme.foo", "def").expect("add def");
        serials.push(serial(&m));
        m.delete_txt_record("_acme.foo", "abc").expect("delete abc");
        serials.push(serial(&m));

        assert!(serials.windows(2).all(|w| w[1] > w[0]), "{:?}", serials);
        let zone = m.read().expect("read");
        assert_eq!(txt_values(&zone, name), vec!["def".to_string()]);
        assert_eq!(zone.records.iter().filter(|r| r.data.rtype() == "TXT").count(), 1);
    }

    #[test]
    fn add_then_delete_restores_everything_but_the_serial() {
        let (_dir, m) = manager();
        let mut before = m.read().expect("read");
        m.add_txt_record("_acme-challenge.app", "token").expect("add");
        m.delete_txt_record("_acme-challenge.app", "token").expect("delete");
        let mut after = m.read().expect("read");

        assert!(after.soa().expect("soa").serial > before.soa().expect("soa").serial);
        let reset = |z: &mut Zone| {
            if let Some(Soa { serial, .. }) = z.soa_mut() {
                *serial = 0;
            }
        };
        reset(&mut before);
        reset(&mut after);
        assert_eq!(before.to_string(), after.to_string());
    }

    #[test]
    fn duplicate_txt_is_idempotent_and_missing_delete_is_noop() {
        let (_dir, m) = manager();
        m.add_txt_record("x", "v").expect("add");
        m.add_txt_record("x", "v").expect("add again");
        assert_eq!(txt_values(&m.read().expect("read"), "x.lekva.me."), vec!["v".to_string()]);
        m.delete_txt_record("x", "other").expect("noop delete");
        assert_eq!(txt_values(&m.read().expect("read"), "x.lekva.me."), vec!["v".to_string()]);
    }

    #[test]
    fn a_records_add_and_delete() {
        let (_dir, m) = manager();
        m.add_a_record("vpn", "10.2.0.1").expect("add");
        let record = Record::a("vpn.lekva.me.", "10.2.0.1".parse().expect("ip"));
        assert!(m.read().expect("read").position(&record).is_some());
        m.delete_a_record("vpn", "10.2.0.1").expect("delete");
        assert!(m.read().expect("read").position(&record).is_none());

        let missing = m.delete_a_record("vpn", "10.2.0.1").expect_err("gone");
        assert!(matches!(missing, Error::NotFound(_)));
        let bad = m.add_a_record("vpn", "not-an-ip").expect_err("bad ip");
        assert!(matches!(bad, Error::InvalidRequest(_)));
    }

    #[test]
    fn records_to_publish_start_with_ds() {
        let (_dir, m) = manager();
        let records = m.records_to_publish();
        assert!(records[0].contains("\tDS\t"));
        assert_eq!(
            &records[1..],
            [
                "ns1.lekva.me. 10800 IN A 10.0.0.1",
                "lekva 10800 IN NS ns1.lekva.me.",
                "ns2.lekva.me. 10800 IN A 10.0.0.2",
                "lekva 10800 IN NS ns2.lekva.me.",
            ]
        );
    }

    #[test]
    fn serial_never_goes_backwards() {
        assert_eq!(next_serial(u32::MAX), u32::MAX);
        let now = next_serial(0);
        assert!(next_serial(now) > now);
    }
}
