//! Services configuration model: loading, validation and normalization.
//!
//! Configurations arrive in keepalived syntax or as the normalized JSON
//! this module itself dumps. Either loader produces the same typed tree,
//! which [`ServicesConfig::prepare`] then canonicalizes: addresses are
//! unmapped, defaults applied, scheduler settings and virtual hosts
//! propagated down the service → real → checker chain, and announce groups
//! resolved and validated.

pub mod keepalived;

use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use vigil_common::{Port, Protocol, RealKey, ServiceKey, Weight};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse services config: {0}")]
    Parse(#[from] vigil_keepalived::ParseError),

    #[error("failed to parse services config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid quorum script: {0}")]
    InvalidQuorumScript(String),

    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: String, value: String },

    #[error("missing value for {0}")]
    MissingValue(String),
}

/// Format of the services configuration file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigFormat {
    #[default]
    Keepalived,
    Json,
}

/// How probe packets are encapsulated on their way to a real.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ForwardingMethod {
    #[default]
    Tun,
    Gre,
}

impl ForwardingMethod {
    /// The LVS method byte carried in the experimental packet option.
    pub fn lvs_method_byte(self) -> u8 {
        match self {
            ForwardingMethod::Tun => 0x02,
            ForwardingMethod::Gre => 0x05,
        }
    }
}

impl fmt::Display for ForwardingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardingMethod::Tun => f.write_str("TUN"),
            ForwardingMethod::Gre => f.write_str("GRE"),
        }
    }
}

impl FromStr for ForwardingMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "TUN" | "IPIP" => Ok(ForwardingMethod::Tun),
            "GRE" => Ok(ForwardingMethod::Gre),
            _ => Err(()),
        }
    }
}

/// Experimental features, captured once at startup.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExperimentsConfig {
    pub enabled: bool,
    /// Use the virtualhost as TLS SNI in HTTPS and gRPC probes.
    pub enable_tls_sni: bool,
    /// Replacement for the `mh` scheduler in dumped configs.
    pub replace_mh_with: Option<String>,
}

impl ExperimentsConfig {
    pub fn tls_sni_enabled(&self) -> bool {
        self.enabled && self.enable_tls_sni
    }

    fn mh_replacement(&self) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.replace_mh_with.as_deref()
    }
}

const DEFAULT_DELAY_LOOP: f64 = 60.0;
const DEFAULT_RETRIES: u32 = 1;
const DEFAULT_RETRY_DELAY: f64 = 3.0;

/// Probe pacing settings, in seconds. Unset fields inherit from the
/// enclosing scope and finally fall back to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_loop: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<f64>,
}

/// Seconds to a duration, clamping malformed negatives to zero.
pub(crate) fn seconds(value: f64) -> Duration {
    Duration::from_secs_f64(value.max(0.0))
}

impl SchedulerConfig {
    pub fn delay_loop(&self) -> Duration {
        seconds(self.delay_loop.unwrap_or(DEFAULT_DELAY_LOOP))
    }

    pub fn retries(&self) -> u32 {
        self.retries.unwrap_or(DEFAULT_RETRIES)
    }

    pub fn retry_delay(&self) -> Duration {
        seconds(self.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY))
    }

    /// Fills unset fields from the enclosing scope; the first set value
    /// along the service → real → checker chain wins.
    pub fn inherit(&mut self, parent: &SchedulerConfig) {
        self.delay_loop = self.delay_loop.or(parent.delay_loop);
        self.retries = self.retries.or(parent.retries);
        self.retry_delay = self.retry_delay.or(parent.retry_delay);
    }
}

/// Probe type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckerKind {
    #[default]
    Tcp,
    Http,
    Https,
    Grpc,
}

impl fmt::Display for CheckerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckerKind::Tcp => f.write_str("TCP"),
            CheckerKind::Http => f.write_str("HTTP"),
            CheckerKind::Https => f.write_str("HTTPS"),
            CheckerKind::Grpc => f.write_str("GRPC"),
        }
    }
}

/// URL-level probe settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UrlConfig {
    /// Request path for HTTP(S) probes.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// Expected status code; any 2xx-agnostic match is skipped when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    /// Expected hex MD5 digest of the response body.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Host header for HTTP(S) probes; service name for gRPC probes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtualhost: Option<String>,
}

/// Network-level probe settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Address to probe; defaults to the real's address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_ip: Option<IpAddr>,
    pub connect_port: Port,
    /// Local address the probe socket binds to.
    #[serde(rename = "bindto", skip_serializing_if = "Option::is_none")]
    pub bind_ip: Option<IpAddr>,
    /// Connection establishment timeout, seconds.
    pub connect_timeout: f64,
    /// Whole-probe timeout, seconds; falls back to `connect_timeout`.
    pub check_timeout: f64,
    /// Firewall mark carried by probe packets.
    pub fwmark: u32,
}

impl NetConfig {
    pub fn connect_timeout(&self) -> Duration {
        seconds(self.connect_timeout)
    }

    /// Older configs set only `connect_timeout`; it then bounds the whole
    /// check as well.
    pub fn check_timeout(&self) -> Duration {
        if self.check_timeout == 0.0 {
            return self.connect_timeout();
        }
        seconds(self.check_timeout)
    }
}

/// Dynamic weight settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightControlConfig {
    #[serde(rename = "dynamic_weight_enable")]
    pub dynamic_weight: bool,
    /// Read the weight from a response header instead of the body.
    #[serde(rename = "dynamic_weight_in_header")]
    pub dynamic_weight_header: bool,
    /// Percentage coefficient bounding each weight adjustment step.
    #[serde(rename = "dynamic_weight_coefficient")]
    pub dynamic_weight_coeff: u32,
}

/// Configuration of a single checker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckerConfig {
    /// Set from the config section the checker was declared in.
    #[serde(skip)]
    pub kind: CheckerKind,

    #[serde(flatten)]
    pub url: UrlConfig,
    #[serde(flatten)]
    pub net: NetConfig,
    #[serde(flatten)]
    pub weight: WeightControlConfig,
    #[serde(flatten)]
    pub scheduler: SchedulerConfig,
}

impl CheckerConfig {
    /// The full semantic identity of this checker. Two configurations with
    /// equal fingerprints drive the same probe the same way, so the
    /// running checker is reused across reloads. Connect and check
    /// timeouts are fingerprinted separately.
    pub fn fingerprint(&self) -> CheckerFingerprint {
        CheckerFingerprint {
            kind: self.kind,
            connect_ip: self.net.connect_ip,
            connect_port: self.net.connect_port,
            bind_ip: self.net.bind_ip,
            connect_timeout: self.net.connect_timeout(),
            check_timeout: self.net.check_timeout(),
            fwmark: self.net.fwmark,
            path: self.url.path.clone(),
            status_code: self.url.status_code,
            digest: self.url.digest.clone(),
            virtualhost: self.url.virtualhost.clone(),
            dynamic_weight: self.weight.dynamic_weight,
            dynamic_weight_header: self.weight.dynamic_weight_header,
            dynamic_weight_coeff: self.weight.dynamic_weight_coeff,
            delay_loop: self.scheduler.delay_loop(),
            retries: self.scheduler.retries(),
            retry_delay: self.scheduler.retry_delay(),
        }
    }
}

/// Value form of a checker configuration, usable as a map key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckerFingerprint {
    kind: CheckerKind,
    connect_ip: Option<IpAddr>,
    connect_port: Port,
    bind_ip: Option<IpAddr>,
    connect_timeout: Duration,
    check_timeout: Duration,
    fwmark: u32,
    path: String,
    status_code: Option<u16>,
    digest: Option<String>,
    virtualhost: Option<String>,
    dynamic_weight: bool,
    dynamic_weight_header: bool,
    dynamic_weight_coeff: u32,
    delay_loop: Duration,
    retries: u32,
    retry_delay: Duration,
}

fn default_real_weight() -> Weight {
    Weight::new(1)
}

/// Configuration of a real server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealConfig {
    pub ip: IpAddr,
    pub port: Port,
    /// Static weight used when no checker supplies a dynamic one.
    pub weight: Weight,
    /// Keep a failed real in the balancer at weight zero instead of
    /// removing it.
    pub inhibit_on_failure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtualhost: Option<String>,
    #[serde(rename = "lvs_method", skip_serializing_if = "Option::is_none")]
    pub forwarding_method: Option<ForwardingMethod>,

    #[serde(flatten)]
    pub scheduler: SchedulerConfig,

    #[serde(rename = "tcp_check", skip_serializing_if = "Vec::is_empty")]
    pub tcp_checkers: Vec<CheckerConfig>,
    #[serde(rename = "http_get", skip_serializing_if = "Vec::is_empty")]
    pub http_checkers: Vec<CheckerConfig>,
    #[serde(rename = "ssl_get", skip_serializing_if = "Vec::is_empty")]
    pub https_checkers: Vec<CheckerConfig>,
    #[serde(rename = "grpc_check", skip_serializing_if = "Vec::is_empty")]
    pub grpc_checkers: Vec<CheckerConfig>,
}

impl Default for RealConfig {
    fn default() -> Self {
        RealConfig {
            ip: IpAddr::from([0, 0, 0, 0]),
            port: Port::OMITTED,
            weight: default_real_weight(),
            inhibit_on_failure: false,
            virtualhost: None,
            forwarding_method: None,
            scheduler: SchedulerConfig::default(),
            tcp_checkers: Vec::new(),
            http_checkers: Vec::new(),
            https_checkers: Vec::new(),
            grpc_checkers: Vec::new(),
        }
    }
}

impl RealConfig {
    pub fn key(&self) -> RealKey {
        RealKey {
            addr: self.ip,
            port: self.port,
        }
    }

    /// All checker configurations, in declaration order by type.
    pub fn checkers(&self) -> impl Iterator<Item = &CheckerConfig> {
        self.tcp_checkers
            .iter()
            .chain(&self.http_checkers)
            .chain(&self.https_checkers)
            .chain(&self.grpc_checkers)
    }

    fn checkers_mut(&mut self) -> impl Iterator<Item = &mut CheckerConfig> {
        self.tcp_checkers
            .iter_mut()
            .chain(&mut self.http_checkers)
            .chain(&mut self.https_checkers)
            .chain(&mut self.grpc_checkers)
    }

    /// Whether any checker supplies a dynamic weight.
    pub fn dynamic_weight(&self) -> bool {
        self.checkers().any(|checker| checker.weight.dynamic_weight)
    }

    fn prepare(&mut self) {
        self.ip = self.ip.to_canonical();

        for (kind, checkers) in [
            (CheckerKind::Tcp, &mut self.tcp_checkers),
            (CheckerKind::Http, &mut self.http_checkers),
            (CheckerKind::Https, &mut self.https_checkers),
            (CheckerKind::Grpc, &mut self.grpc_checkers),
        ] {
            for checker in checkers {
                checker.kind = kind;
            }
        }

        let scheduler = self.scheduler.clone();
        let virtualhost = self.virtualhost.clone();
        let real_ip = self.ip;
        for checker in self.checkers_mut() {
            checker.scheduler.inherit(&scheduler);
            if checker.url.virtualhost.is_none() {
                checker.url.virtualhost = virtualhost.clone();
            }
            // A checker without an explicit target probes the real itself.
            let connect_ip = checker.net.connect_ip.get_or_insert(real_ip);
            *connect_ip = connect_ip.to_canonical();
            if let Some(bind_ip) = &mut checker.net.bind_ip {
                *bind_ip = bind_ip.to_canonical();
            }
        }
    }
}

fn default_quorum() -> i32 {
    1
}

/// Configuration of a virtual service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub vip: IpAddr,
    pub vport: Port,
    #[serde(rename = "proto")]
    pub protocol: Protocol,
    /// Balancing scheduler announced in the dumped config.
    #[serde(rename = "scheduler", skip_serializing_if = "String::is_empty")]
    pub lvs_scheduler: String,
    #[serde(rename = "lvs_method")]
    pub forwarding_method: ForwardingMethod,
    /// Aggregate weight required for the service to be announced.
    pub quorum: i32,
    pub hysteresis: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub quorum_up: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub quorum_down: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub announce_group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub virtualhost: Option<String>,
    pub fwmark: u32,
    #[serde(rename = "ops")]
    pub one_packet_scheduler: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv4_outer_source_network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipv6_outer_source_network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(flatten)]
    pub scheduler: SchedulerConfig,

    pub reals: Vec<RealConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            vip: IpAddr::from([0, 0, 0, 0]),
            vport: Port::OMITTED,
            protocol: Protocol::Undefined,
            lvs_scheduler: String::new(),
            forwarding_method: ForwardingMethod::Tun,
            quorum: default_quorum(),
            hysteresis: 0,
            quorum_up: String::new(),
            quorum_down: String::new(),
            announce_group: String::new(),
            virtualhost: None,
            fwmark: 0,
            one_packet_scheduler: false,
            ipv4_outer_source_network: None,
            ipv6_outer_source_network: None,
            version: None,
            scheduler: SchedulerConfig::default(),
            reals: Vec::new(),
        }
    }
}

impl ServiceConfig {
    pub fn key(&self) -> ServiceKey {
        ServiceKey {
            addr: self.vip,
            port: self.vport,
            proto: self.protocol,
        }
    }

    fn prepare(&mut self, experiments: &ExperimentsConfig) -> Result<(), ConfigError> {
        self.vip = self.vip.to_canonical();
        self.normalize_scheduler(experiments);

        if self.announce_group.is_empty() {
            self.announce_group = announce_group_from_quorum_script(&self.quorum_up)?;
        }

        for real in &mut self.reals {
            if real.forwarding_method.is_none() {
                real.forwarding_method = Some(self.forwarding_method);
            }
            real.scheduler.inherit(&self.scheduler);
            if real.virtualhost.is_none() {
                real.virtualhost = self.virtualhost.clone();
            }
            real.prepare();
        }

        Ok(())
    }

    /// Rewrites scheduler aliases the balancer cannot serve: `mh` maps to
    /// its configured replacement, and one-packet scheduling cannot run on
    /// top of `wlc` since there are no connections to count.
    fn normalize_scheduler(&mut self, experiments: &ExperimentsConfig) {
        if self.lvs_scheduler == "mh" {
            self.lvs_scheduler = experiments.mh_replacement().unwrap_or("wrr").to_string();
        }
        if self.one_packet_scheduler && self.lvs_scheduler == "wlc" {
            self.lvs_scheduler = "wrr".to_string();
        }
    }
}

/// Derives the announce group from a `quorum_up` handler script of the
/// form `<...>/quorum-handler<...> <up|down> <vip>,<group>,<...>`.
///
/// An empty script means the service does not take part in announcing its
/// prefix. Any other malformed script is a configuration error.
fn announce_group_from_quorum_script(script: &str) -> Result<String, ConfigError> {
    if script.is_empty() {
        return Ok(String::new());
    }

    let fields: Vec<&str> = script.split_whitespace().collect();
    if fields.len() != 3 {
        return Err(ConfigError::InvalidQuorumScript(script.to_string()));
    }

    let handler = Path::new(fields[0])
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    if !handler.starts_with("quorum-handler") {
        return Err(ConfigError::InvalidQuorumScript(format!(
            "incorrect script: {script}"
        )));
    }

    let args: Vec<&str> = fields[2].split(',').collect();
    if args.len() < 2 {
        return Err(ConfigError::InvalidQuorumScript(format!(
            "not enough args: {script}"
        )));
    }

    Ok(args[args.len() - 2].to_string())
}

/// The full set of configured virtual services.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServicesConfig {
    pub services: Vec<ServiceConfig>,
}

impl ServicesConfig {
    /// Loads a services configuration in the given format.
    pub fn load(path: &Path, format: ConfigFormat) -> Result<Self, ConfigError> {
        match format {
            ConfigFormat::Keepalived => keepalived::load(path),
            ConfigFormat::Json => Self::load_json(path),
        }
    }

    /// Loads the normalized JSON form, as written by [`dump`].
    ///
    /// [`dump`]: ServicesConfig::dump
    pub fn load_json(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Validates and normalizes the whole tree. Must run before the config
    /// is applied to the core.
    pub fn prepare(&mut self, experiments: &ExperimentsConfig) -> Result<(), ConfigError> {
        for service in &mut self.services {
            service.prepare(experiments)?;
        }
        self.pin_shared_prefix_groups();
        Ok(())
    }

    /// Writes the normalized configuration as pretty JSON, atomically:
    /// the content goes to a temporary file in the target directory which
    /// is then renamed over the destination.
    pub fn dump(&self, path: &Path) -> Result<(), std::io::Error> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;

        let data = serde_json::to_vec_pretty(self)?;
        tmp.write_all(&data)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;

        tmp.persist(path).map_err(|err| err.error)?;
        Ok(())
    }

    /// Services sharing a prefix must share an announce group, otherwise
    /// the prefix → group mapping would be ambiguous. The first-seen group
    /// of each prefix wins.
    fn pin_shared_prefix_groups(&mut self) {
        let mut groups: HashMap<IpNet, String> = HashMap::new();
        for service in &mut self.services {
            if service.announce_group.is_empty() {
                continue;
            }

            let prefix = service.key().prefix();
            match groups.get(&prefix) {
                Some(group) => service.announce_group = group.clone(),
                None => {
                    groups.insert(prefix, service.announce_group.clone());
                }
            }
        }
    }

    /// The service → announce group mapping for the announcer, restricted
    /// to services that take part in announcing.
    pub fn announce_groups(&self) -> HashMap<ServiceKey, String> {
        self.services
            .iter()
            .filter(|service| !service.announce_group.is_empty())
            .map(|service| (service.key(), service.announce_group.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service_with_quorum_script(script: &str) -> ServiceConfig {
        ServiceConfig {
            vip: "192.0.2.1".parse().unwrap(),
            vport: Port::new(80),
            protocol: Protocol::Tcp,
            quorum_up: script.to_string(),
            ..ServiceConfig::default()
        }
    }

    #[test]
    fn test_scheduler_inherit_first_set_wins() {
        let mut checker = SchedulerConfig {
            delay_loop: Some(5.0),
            retries: None,
            retry_delay: None,
        };
        let real = SchedulerConfig {
            delay_loop: Some(30.0),
            retries: Some(2),
            retry_delay: None,
        };

        checker.inherit(&real);
        assert_eq!(checker.delay_loop, Some(5.0));
        assert_eq!(checker.retries, Some(2));
        assert_eq!(checker.retry_delay, None);
        assert_eq!(checker.retry_delay(), Duration::from_secs_f64(3.0));
    }

    #[test]
    fn test_check_timeout_falls_back_to_connect_timeout() {
        let net = NetConfig {
            connect_timeout: 2.0,
            check_timeout: 0.0,
            ..NetConfig::default()
        };
        assert_eq!(net.check_timeout(), Duration::from_secs_f64(2.0));

        let net = NetConfig {
            connect_timeout: 2.0,
            check_timeout: 7.5,
            ..NetConfig::default()
        };
        assert_eq!(net.check_timeout(), Duration::from_secs_f64(7.5));
    }

    #[test]
    fn test_fingerprint_distinguishes_timeouts() {
        let mut a = CheckerConfig::default();
        a.net.connect_timeout = 1.0;
        let mut b = a.clone();
        b.net.check_timeout = 2.0;

        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_announce_group_from_quorum_script() {
        let group = announce_group_from_quorum_script(
            "/etc/keepalived/quorum-handler2.sh up 192.0.2.1,g-1,extra",
        )
        .unwrap();
        assert_eq!(group, "g-1");

        assert_eq!(announce_group_from_quorum_script("").unwrap(), "");

        assert!(announce_group_from_quorum_script("not a quorum script at all").is_err());
        assert!(announce_group_from_quorum_script("/bin/other.sh up a,b").is_err());
        assert!(
            announce_group_from_quorum_script("/etc/keepalived/quorum-handler2.sh up plain")
                .is_err()
        );
    }

    #[test]
    fn test_prepare_propagates_down_the_chain() {
        let mut config = ServicesConfig {
            services: vec![ServiceConfig {
                virtualhost: Some("example.com".to_string()),
                scheduler: SchedulerConfig {
                    delay_loop: Some(10.0),
                    retries: Some(4),
                    retry_delay: Some(1.0),
                },
                reals: vec![RealConfig {
                    ip: "10.0.0.1".parse().unwrap(),
                    port: Port::new(8080),
                    scheduler: SchedulerConfig {
                        retries: Some(1),
                        ..SchedulerConfig::default()
                    },
                    http_checkers: vec![CheckerConfig::default()],
                    ..RealConfig::default()
                }],
                ..service_with_quorum_script("")
            }],
        };

        config.prepare(&ExperimentsConfig::default()).unwrap();

        let real = &config.services[0].reals[0];
        assert_eq!(real.forwarding_method, Some(ForwardingMethod::Tun));

        let checker = &real.http_checkers[0];
        assert_eq!(checker.kind, CheckerKind::Http);
        assert_eq!(checker.url.virtualhost.as_deref(), Some("example.com"));
        // The checker probes the real itself when no connect_ip is given.
        assert_eq!(checker.net.connect_ip, Some(real.ip));
        // Real overrides service, service fills the rest.
        assert_eq!(checker.scheduler.retries, Some(1));
        assert_eq!(checker.scheduler.delay_loop, Some(10.0));
        assert_eq!(checker.scheduler.retry_delay, Some(1.0));
    }

    #[test]
    fn test_prepare_unmaps_mapped_addresses() {
        let mut config = ServicesConfig {
            services: vec![ServiceConfig {
                vip: "::ffff:192.0.2.1".parse().unwrap(),
                reals: vec![RealConfig {
                    ip: "::ffff:10.0.0.1".parse().unwrap(),
                    ..RealConfig::default()
                }],
                ..ServiceConfig::default()
            }],
        };

        config.prepare(&ExperimentsConfig::default()).unwrap();
        assert_eq!(config.services[0].vip, "192.0.2.1".parse::<IpAddr>().unwrap());
        assert_eq!(
            config.services[0].reals[0].ip,
            "10.0.0.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_shared_prefix_groups_are_pinned() {
        let mut first = service_with_quorum_script("");
        first.announce_group = "g-1".to_string();
        let mut second = first.clone();
        second.vport = Port::new(443);
        second.announce_group = "g-2".to_string();

        let mut config = ServicesConfig {
            services: vec![first, second],
        };
        config.prepare(&ExperimentsConfig::default()).unwrap();

        assert_eq!(config.services[0].announce_group, "g-1");
        assert_eq!(config.services[1].announce_group, "g-1");
    }

    #[test]
    fn test_scheduler_alias_rewrites() {
        let mut service = service_with_quorum_script("");
        service.lvs_scheduler = "mh".to_string();
        service.prepare(&ExperimentsConfig::default()).unwrap();
        assert_eq!(service.lvs_scheduler, "wrr");

        let mut service = service_with_quorum_script("");
        service.lvs_scheduler = "mh".to_string();
        let experiments = ExperimentsConfig {
            enabled: true,
            replace_mh_with: Some("sh".to_string()),
            ..ExperimentsConfig::default()
        };
        service.prepare(&experiments).unwrap();
        assert_eq!(service.lvs_scheduler, "sh");

        let mut service = service_with_quorum_script("");
        service.lvs_scheduler = "wlc".to_string();
        service.one_packet_scheduler = true;
        service.prepare(&ExperimentsConfig::default()).unwrap();
        assert_eq!(service.lvs_scheduler, "wrr");
    }

    #[test]
    fn test_dump_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.json");

        let mut config = ServicesConfig {
            services: vec![ServiceConfig {
                reals: vec![RealConfig {
                    ip: "10.0.0.1".parse().unwrap(),
                    port: Port::new(8080),
                    weight: Weight::new(5),
                    http_checkers: vec![CheckerConfig {
                        url: UrlConfig {
                            path: "/healthz".to_string(),
                            status_code: Some(200),
                            ..UrlConfig::default()
                        },
                        ..CheckerConfig::default()
                    }],
                    ..RealConfig::default()
                }],
                ..service_with_quorum_script("")
            }],
        };
        config.prepare(&ExperimentsConfig::default()).unwrap();

        config.dump(&path).unwrap();
        let mut loaded = ServicesConfig::load_json(&path).unwrap();
        loaded.prepare(&ExperimentsConfig::default()).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_dump_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.json");
        std::fs::write(&path, "old contents").unwrap();

        ServicesConfig::default().dump(&path).unwrap();
        let data = std::fs::read_to_string(&path).unwrap();
        assert_eq!(data.trim(), "[]");
    }

    #[test]
    fn test_real_dynamic_weight_is_or_over_checkers() {
        let mut real = RealConfig {
            ip: "10.0.0.1".parse().unwrap(),
            tcp_checkers: vec![CheckerConfig::default()],
            http_checkers: vec![CheckerConfig {
                weight: WeightControlConfig {
                    dynamic_weight: true,
                    ..WeightControlConfig::default()
                },
                ..CheckerConfig::default()
            }],
            ..RealConfig::default()
        };
        assert!(real.dynamic_weight());

        real.http_checkers.clear();
        assert!(!real.dynamic_weight());
    }
}
