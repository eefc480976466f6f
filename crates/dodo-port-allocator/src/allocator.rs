//! Port bookkeeping on top of the ingress Helm release
//!
//! The ingress controller exposes TCP/UDP ports through
//! `spec.values.{tcp,udp}` of its HelmRelease, a map from ingress port to
//! `service:port`. Every mapping change is one commit to the configuration
//! repository; the reconciler rolls it out.
//!
//! Allocator state that must survive restarts (pre-opened ports, blocklist
//! and per-mapping secrets) lives next to the release in
//! `<release>-state.json`. Reservations are short-lived and kept in memory.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use dodo_common::yaml;
use dodo_gitops::{DoOptions, RepoFs, RepoStore};
use parking_lot::Mutex;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::{debug, info, instrument, warn};

use crate::api::{AllocateRequest, PortResponse, Protocol, RemoveRequest, ReserveRequest};
use crate::error::{Error, Result};

/// First port handed out at random
pub const PORT_RANGE_START: u16 = 49152;
/// Last port handed out at random
pub const PORT_RANGE_END: u16 = 65535;

const SECRET_LENGTH: usize = 20;
const FORBIDDEN_PORTS: [u16; 3] = [22, 80, 443];
const TRIES_PER_PORT: usize = 3;
const NODE_PORT: &str = "NodePort";
const SERVICE_TYPE_PATH: &str = "spec.values.controller.service.type";

/// Allocator tunables
#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    /// Path of the ingress HelmRelease inside the repository
    pub ingress_path: String,
    /// Refill the pre-open pool when it drops below this size
    pub min_pre_open_ports: usize,
    /// Number of ports opened per refill
    pub pre_open_batch_size: usize,
    /// How long a reservation stays valid
    pub reservation_ttl: Duration,
}

impl AllocatorConfig {
    /// Defaults for the release at `ingress_path`
    pub fn new(ingress_path: impl Into<String>) -> Self {
        Self {
            ingress_path: ingress_path.into(),
            min_pre_open_ports: 5,
            pre_open_batch_size: 10,
            reservation_ttl: Duration::from_secs(30 * 60),
        }
    }

    /// Path of the JSON state file kept next to the release
    pub fn state_path(&self) -> String {
        let base = self
            .ingress_path
            .strip_suffix(".yaml")
            .unwrap_or(&self.ingress_path);
        format!("{}-state.json", base)
    }
}

/// Marker value of blocklist entries, serialized as `{}`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blocked {}

/// Persisted allocator state
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatorState {
    /// Ports already opened on the NodePort service but not mapped yet
    #[serde(default)]
    pub pre_open_ports: Vec<u16>,
    /// Ports never to be picked at random
    #[serde(default)]
    pub blocklist: BTreeMap<u16, Blocked>,
    /// Secret per `<protocol>/<port>` mapping
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

fn secret_key(protocol: Protocol, port: u16) -> String {
    format!("{}/{}", protocol, port)
}

#[derive(Clone, Debug)]
struct Reservation {
    secret: String,
    expires_at: Instant,
}

/// Hands out ingress ports and records them in the configuration repository
pub struct PortAllocator {
    repo: Arc<RepoStore>,
    config: AllocatorConfig,
    reservations: Mutex<HashMap<u16, Reservation>>,
}

/// Release document and state file loaded for one operation
struct Snapshot {
    release: Value,
    state: AllocatorState,
}

impl Snapshot {
    fn load(fs: &RepoFs, config: &AllocatorConfig) -> Result<Self> {
        let release: Value = fs.read_yaml(&config.ingress_path)?;
        let state_path = config.state_path();
        let state = if fs.exists(&state_path)? {
            fs.read_json(&state_path)?
        } else {
            AllocatorState::default()
        };
        Ok(Self { release, state })
    }

    fn save(&self, fs: &RepoFs, config: &AllocatorConfig) -> Result<()> {
        fs.write_json(&config.state_path(), &self.state)?;
        fs.write_yaml(&config.ingress_path, &self.release)?;
        Ok(())
    }

    fn node_port_service(&self) -> bool {
        yaml::get_str(&self.release, SERVICE_TYPE_PATH) == Some(NODE_PORT)
    }

    fn is_mapped(&self, protocol: Protocol, port: u16) -> bool {
        yaml::get(&self.release, &format!("spec.values.{}", protocol))
            .and_then(Value::as_mapping)
            .is_some_and(|m| m.keys().any(|k| is_port_key(k, port)))
    }

    fn is_mapped_any(&self, port: u16) -> bool {
        Protocol::ALL.iter().any(|p| self.is_mapped(*p, port))
    }

    fn map(&mut self, protocol: Protocol, port: u16, destination: &str) -> Result<()> {
        let ports = yaml::mapping_mut(&mut self.release, &format!("spec.values.{}", protocol))?;
        remove_port(ports, port);
        ports.insert(
            Value::String(port.to_string()),
            Value::String(destination.to_string()),
        );
        if self.node_port_service() {
            self.open_node_port(protocol, port)?;
        }
        Ok(())
    }

    fn unmap(&mut self, protocol: Protocol, port: u16) -> Result<()> {
        remove_port(
            yaml::mapping_mut(&mut self.release, &format!("spec.values.{}", protocol))?,
            port,
        );
        if self.node_port_service() {
            remove_port(
                yaml::mapping_mut(
                    &mut self.release,
                    &format!("spec.values.controller.service.nodePorts.{}", protocol),
                )?,
                port,
            );
        }
        Ok(())
    }

    fn open_node_port(&mut self, protocol: Protocol, port: u16) -> Result<()> {
        let ports = yaml::mapping_mut(
            &mut self.release,
            &format!("spec.values.controller.service.nodePorts.{}", protocol),
        )?;
        remove_port(ports, port);
        ports.insert(Value::String(port.to_string()), Value::Number(port.into()));
        Ok(())
    }
}

/// Hand-written releases carry ports as plain integers (`2222:`), generated
/// ones as strings (`"2222":`); both name the same port.
fn is_port_key(key: &Value, port: u16) -> bool {
    yaml::key_string(key).is_some_and(|k| k.parse::<u16>() == Ok(port))
}

fn remove_port(ports: &mut serde_yaml::Mapping, port: u16) {
    ports.retain(|k, _| !is_port_key(k, port));
}

impl PortAllocator {
    /// Allocator over the ingress release described by `config`
    pub fn new(repo: Arc<RepoStore>, config: AllocatorConfig) -> Self {
        Self {
            repo,
            config,
            reservations: Mutex::new(HashMap::new()),
        }
    }

    /// Tunables in effect
    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// Map a port to `target_service:target_port`.
    ///
    /// The port is the explicitly requested one, the reserved port matching
    /// `secret`, or a random free port. Nothing is written on failure.
    #[instrument(skip(self, req), fields(protocol = %req.protocol, dest = %req.destination()))]
    pub fn allocate(&self, req: AllocateRequest) -> Result<PortResponse> {
        let protocol: Protocol = req.protocol.parse()?;
        let destination = req.destination();
        let (_, response) = self.repo.run_with(DoOptions::default(), |fs| {
            let mut snap = Snapshot::load(fs, &self.config)?;
            let mut reservations = self.reservations.lock();
            prune(&mut reservations);

            let (port, reserved_secret) = match (req.source_port, req.secret.as_deref()) {
                (Some(port), secret) => {
                    check_allowed(port)?;
                    let reserved = match reservations.get(&port) {
                        Some(r) if Some(r.secret.as_str()) != secret => {
                            return Err(Error::Forbidden(format!(
                                "port {} is reserved with a different secret",
                                port
                            )));
                        }
                        Some(r) => Some(r.secret.clone()),
                        None => None,
                    };
                    (port, reserved)
                }
                (None, Some(secret)) => {
                    let port = reservations
                        .iter()
                        .find(|(_, r)| r.secret == secret)
                        .map(|(port, _)| *port)
                        .ok_or_else(|| {
                            Error::Forbidden("no reservation matches the secret".to_string())
                        })?;
                    (port, Some(secret.to_string()))
                }
                (None, None) => {
                    let port = random_port(|p| {
                        !snap.state.blocklist.contains_key(&p)
                            && !snap.state.pre_open_ports.contains(&p)
                            && !snap.is_mapped_any(p)
                            && !reservations.contains_key(&p)
                    })?;
                    (port, None)
                }
            };

            if snap.is_mapped(protocol, port) {
                return Err(Error::Conflict(format!(
                    "{} port {} is already taken",
                    protocol, port
                )));
            }

            let secret = match reserved_secret.or(req.secret.clone()) {
                Some(secret) => secret,
                None => generate_secret(),
            };
            snap.map(protocol, port, &destination)?;
            snap.state.pre_open_ports.retain(|p| *p != port);
            snap.state
                .secrets
                .insert(secret_key(protocol, port), secret.clone());
            snap.save(fs, &self.config)?;
            reservations.remove(&port);

            Ok((
                format!("ingress: port {} map {} {}", protocol, port, destination),
                PortResponse { port, secret },
            ))
        })?;
        info!(port = response.port, "Allocated ingress port");

        if let Err(e) = self.ensure_pre_open_ports() {
            warn!(error = %e, "Failed to refill pre-open ports");
        }
        Ok(response)
    }

    /// Hold a port for [`AllocatorConfig::reservation_ttl`].
    ///
    /// Pre-opened ports are handed out first; without a pre-open pool a
    /// random free port is picked.
    #[instrument(skip(self))]
    pub fn reserve(&self, req: ReserveRequest) -> Result<PortResponse> {
        let protocol = req
            .protocol
            .as_deref()
            .map(str::parse::<Protocol>)
            .transpose()?;
        let response = self.repo.read(true, |fs| {
            let snap = Snapshot::load(fs, &self.config)?;
            let mut reservations = self.reservations.lock();
            prune(&mut reservations);

            let taken = |p: u16| match protocol {
                Some(protocol) => snap.is_mapped(protocol, p),
                None => snap.is_mapped_any(p),
            };
            let port = match req.source_port {
                Some(port) => {
                    check_allowed(port)?;
                    if taken(port) || reservations.contains_key(&port) {
                        return Err(Error::Conflict(format!("port {} is already taken", port)));
                    }
                    port
                }
                None => match snap
                    .state
                    .pre_open_ports
                    .iter()
                    .copied()
                    .find(|p| !taken(*p) && !reservations.contains_key(p))
                {
                    Some(port) => port,
                    None => random_port(|p| {
                        !snap.state.blocklist.contains_key(&p)
                            && !snap.is_mapped_any(p)
                            && !reservations.contains_key(&p)
                    })?,
                },
            };

            let secret = generate_secret();
            reservations.insert(
                port,
                Reservation {
                    secret: secret.clone(),
                    expires_at: Instant::now() + self.config.reservation_ttl,
                },
            );
            Ok::<_, Error>(PortResponse { port, secret })
        })?;
        debug!(port = response.port, "Reserved port");
        Ok(response)
    }

    /// Drop a mapping created by [`PortAllocator::allocate`]
    #[instrument(skip(self, req), fields(protocol = %req.protocol, port = req.source_port))]
    pub fn deallocate(&self, req: RemoveRequest) -> Result<()> {
        let protocol: Protocol = req.protocol.parse()?;
        let port = req.source_port;
        self.repo.run(DoOptions::default(), |fs| {
            let mut snap = Snapshot::load(fs, &self.config)?;
            if !snap.is_mapped(protocol, port) {
                return Err(Error::NotFound(format!(
                    "{} port {} is not mapped",
                    protocol, port
                )));
            }
            let key = secret_key(protocol, port);
            if snap.state.secrets.get(&key) != Some(&req.secret) {
                return Err(Error::Forbidden(format!(
                    "wrong secret for {} port {}",
                    protocol, port
                )));
            }
            snap.unmap(protocol, port)?;
            snap.state.secrets.remove(&key);
            snap.save(fs, &self.config)?;
            Ok(format!("ingress: remove {} port map {}", protocol, port))
        })?;
        info!("Removed ingress port mapping");
        Ok(())
    }

    /// Top up the pool of ports opened ahead of time on a NodePort ingress
    /// service. Does nothing for other service types or when the pool is
    /// large enough.
    pub fn ensure_pre_open_ports(&self) -> Result<()> {
        let min = self.config.min_pre_open_ports;
        let batch = self.config.pre_open_batch_size;
        self.repo.run(DoOptions::default(), |fs| {
            let mut snap = Snapshot::load(fs, &self.config)?;
            if !snap.node_port_service() || snap.state.pre_open_ports.len() >= min {
                return Ok("preopen new ports".to_string());
            }
            let mut opened = Vec::with_capacity(batch);
            for _ in 0..batch {
                let port = random_port(|p| {
                    !snap.state.blocklist.contains_key(&p)
                        && !snap.state.pre_open_ports.contains(&p)
                        && !snap.is_mapped_any(p)
                })
                .map_err(|_| Error::Internal("could not open new port".to_string()))?;
                snap.state.pre_open_ports.push(port);
                snap.state.blocklist.insert(port, Blocked {});
                for protocol in Protocol::ALL {
                    snap.open_node_port(protocol, port)?;
                }
                opened.push(port);
            }
            snap.save(fs, &self.config)?;
            info!(ports = ?opened, "Pre-opened new ports");
            Ok::<_, Error>("preopen new ports".to_string())
        })?;
        Ok(())
    }
}

fn check_allowed(port: u16) -> Result<()> {
    if port == 0 || FORBIDDEN_PORTS.contains(&port) {
        return Err(Error::invalid(format!("port {} can not be forwarded", port)));
    }
    Ok(())
}

fn prune(reservations: &mut HashMap<u16, Reservation>) {
    let now = Instant::now();
    reservations.retain(|_, r| r.expires_at > now);
}

fn random_port(mut free: impl FnMut(u16) -> bool) -> Result<u16> {
    let mut rng = rand::thread_rng();
    (0..TRIES_PER_PORT)
        .map(|_| rng.gen_range(PORT_RANGE_START..=PORT_RANGE_END))
        .find(|p| free(*p))
        .ok_or_else(|| Error::Conflict("no free port found".to_string()))
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_LENGTH];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use dodo_gitops::LocalBackend;

    pub(crate) const INGRESS_PATH: &str = "/infrastructure/ingress-public/resources/main.yaml";

    pub(crate) fn ingress_release(service_type: &str) -> String {
        format!(
            "apiVersion: helm.toolkit.fluxcd.io/v2\n\
             kind: HelmRelease\n\
             metadata:\n  name: ingress-public\n  namespace: dodo-ingress-public\n\
             spec:\n  values:\n    controller:\n      service:\n        type: {}\n    tcp: {{}}\n    udp: {{}}\n",
            service_type
        )
    }

    pub(crate) fn allocator(service_type: &str) -> (tempfile::TempDir, PortAllocator) {
        let dir = tempfile::tempdir().expect("tempdir");
        let fs = RepoFs::new(dir.path());
        fs.write_string(INGRESS_PATH, &ingress_release(service_type))
            .expect("release");
        let repo = RepoStore::new(LocalBackend::new(dir.path()).expect("backend"));
        (dir, PortAllocator::new(repo, AllocatorConfig::new(INGRESS_PATH)))
    }

    fn release(alloc: &PortAllocator) -> Value {
        RepoFs::new(alloc.repo.workdir())
            .read_yaml(INGRESS_PATH)
            .expect("read release")
    }

    fn state(alloc: &PortAllocator) -> AllocatorState {
        RepoFs::new(alloc.repo.workdir())
            .read_json(&alloc.config.state_path())
            .expect("read state")
    }

    fn request(port: Option<u16>) -> AllocateRequest {
        AllocateRequest {
            protocol: "TCP".to_string(),
            source_port: port,
            target_service: "gerrit".to_string(),
            target_port: 29418,
            secret: None,
        }
    }

    #[test]
    fn state_file_sits_next_to_release() {
        let config = AllocatorConfig::new("/ingress/main.yaml");
        assert_eq!(config.state_path(), "/ingress/main-state.json");
    }

    #[test]
    fn explicit_port_is_mapped_and_secret_recorded() {
        let (_dir, alloc) = allocator("LoadBalancer");
        let resp = alloc.allocate(request(Some(2222))).expect("allocate");
        assert_eq!(resp.port, 2222);
        assert!(!resp.secret.is_empty());

        assert_eq!(
            yaml::get_str(&release(&alloc), "spec.values.tcp.2222"),
            Some("gerrit:29418")
        );
        assert_eq!(
            state(&alloc).secrets.get("tcp/2222"),
            Some(&resp.secret)
        );
    }

    #[test]
    fn conflicting_port_leaves_repository_untouched() {
        let (_dir, alloc) = allocator("LoadBalancer");
        alloc.allocate(request(Some(2222))).expect("first");
        let before = state(&alloc);

        let mut other = request(Some(2222));
        other.target_service = "other".to_string();
        assert!(matches!(alloc.allocate(other), Err(Error::Conflict(_))));

        assert_eq!(state(&alloc), before);
        assert_eq!(
            yaml::get_str(&release(&alloc), "spec.values.tcp.2222"),
            Some("gerrit:29418")
        );
    }

    #[test]
    fn well_known_ports_are_rejected() {
        let (_dir, alloc) = allocator("LoadBalancer");
        for port in [22, 80, 443] {
            assert!(matches!(
                alloc.allocate(request(Some(port))),
                Err(Error::InvalidRequest(_))
            ));
        }
    }

    #[test]
    fn same_port_on_other_protocol_is_free() {
        let (_dir, alloc) = allocator("LoadBalancer");
        alloc.allocate(request(Some(5000))).expect("tcp");
        let mut udp = request(Some(5000));
        udp.protocol = "udp".to_string();
        alloc.allocate(udp).expect("udp");
        assert!(yaml::get(&release(&alloc), "spec.values.udp.5000").is_some());
    }

    #[test]
    fn random_port_falls_in_dynamic_range() {
        let (_dir, alloc) = allocator("LoadBalancer");
        let resp = alloc.allocate(request(None)).expect("allocate");
        assert!((PORT_RANGE_START..=PORT_RANGE_END).contains(&resp.port));
    }

    #[test]
    fn reservation_is_claimed_with_its_secret() {
        let (_dir, alloc) = allocator("LoadBalancer");
        let reserved = alloc
            .reserve(ReserveRequest {
                protocol: Some("tcp".to_string()),
                source_port: None,
            })
            .expect("reserve");

        let mut req = request(None);
        req.secret = Some(reserved.secret.clone());
        let resp = alloc.allocate(req).expect("allocate");
        assert_eq!(resp, reserved);
    }

    #[test]
    fn reserved_port_needs_matching_secret() {
        let (_dir, alloc) = allocator("LoadBalancer");
        alloc
            .reserve(ReserveRequest {
                protocol: None,
                source_port: Some(3000),
            })
            .expect("reserve");

        assert!(matches!(
            alloc.allocate(request(Some(3000))),
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            alloc.reserve(ReserveRequest {
                protocol: None,
                source_port: Some(3000),
            }),
            Err(Error::Conflict(_))
        ));
    }

    #[test]
    fn expired_reservation_releases_the_port() {
        let (_dir, mut alloc) = allocator("LoadBalancer");
        alloc.config.reservation_ttl = Duration::ZERO;
        alloc
            .reserve(ReserveRequest {
                protocol: None,
                source_port: Some(3000),
            })
            .expect("reserve");
        alloc.allocate(request(Some(3000))).expect("allocate after expiry");
    }

    #[test]
    fn deallocate_checks_mapping_then_secret() {
        let (_dir, alloc) = allocator("LoadBalancer");
        let resp = alloc.allocate(request(Some(2222))).expect("allocate");

        let remove = |port: u16, secret: &str| RemoveRequest {
            protocol: "tcp".to_string(),
            source_port: port,
            secret: secret.to_string(),
        };
        assert!(matches!(
            alloc.deallocate(remove(2223, &resp.secret)),
            Err(Error::NotFound(_))
        ));
        assert!(matches!(
            alloc.deallocate(remove(2222, "wrong")),
            Err(Error::Forbidden(_))
        ));
        alloc.deallocate(remove(2222, &resp.secret)).expect("remove");

        let rel = release(&alloc);
        assert!(yaml::get(&rel, "spec.values.tcp.2222").is_none());
        assert!(state(&alloc).secrets.is_empty());
    }

    #[test]
    fn integer_keys_in_release_count_as_mapped() {
        let (dir, alloc) = allocator("LoadBalancer");
        let fs = RepoFs::new(dir.path());
        let seeded = ingress_release("LoadBalancer")
            .replace("    tcp: {}\n", "    tcp:\n      2222: gerrit:29418\n");
        fs.write_string(INGRESS_PATH, &seeded).expect("seed");

        assert!(matches!(
            alloc.allocate(request(Some(2222))),
            Err(Error::Conflict(_))
        ));
        assert!(matches!(
            alloc.reserve(ReserveRequest {
                protocol: Some("tcp".to_string()),
                source_port: Some(2222),
            }),
            Err(Error::Conflict(_))
        ));

        let mut seeded_state = AllocatorState::default();
        seeded_state
            .secrets
            .insert(secret_key(Protocol::Tcp, 2222), "s3cret".to_string());
        fs.write_json(&alloc.config.state_path(), &seeded_state)
            .expect("seed state");
        alloc
            .deallocate(RemoveRequest {
                protocol: "tcp".to_string(),
                source_port: 2222,
                secret: "s3cret".to_string(),
            })
            .expect("remove");

        let tcp = release(&alloc);
        let tcp = yaml::get(&tcp, "spec.values.tcp").and_then(Value::as_mapping);
        assert!(tcp.map_or(true, |m| m.is_empty()));
        alloc.allocate(request(Some(2222))).expect("port is free again");
    }

    #[test]
    fn node_port_service_keeps_a_pre_open_pool() {
        let (_dir, alloc) = allocator("NodePort");
        alloc.ensure_pre_open_ports().expect("pre-open");

        let st = state(&alloc);
        assert_eq!(st.pre_open_ports.len(), 10);
        let rel = release(&alloc);
        for port in &st.pre_open_ports {
            assert!(st.blocklist.contains_key(port));
            let path = format!("spec.values.controller.service.nodePorts.udp.{}", port);
            assert_eq!(
                yaml::get(&rel, &path).and_then(Value::as_u64),
                Some(u64::from(*port))
            );
        }

        let reserved = alloc.reserve(ReserveRequest::default()).expect("reserve");
        assert!(st.pre_open_ports.contains(&reserved.port));
        let mut req = request(None);
        req.secret = Some(reserved.secret);
        alloc.allocate(req).expect("allocate");
        assert!(!state(&alloc).pre_open_ports.contains(&reserved.port));
    }

    #[test]
    fn load_balancer_service_does_not_pre_open() {
        let (_dir, alloc) = allocator("LoadBalancer");
        alloc.ensure_pre_open_ports().expect("noop");
        let fs = RepoFs::new(alloc.repo.workdir());
        assert!(!fs.exists(&alloc.config.state_path()).expect("exists"));
    }
}
