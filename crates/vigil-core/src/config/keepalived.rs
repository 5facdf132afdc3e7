//! Binder from the keepalived configuration tree to the typed services
//! model.

use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;

use vigil_keepalived::Item;

use vigil_common::{Port, Weight};

use super::{CheckerConfig, ConfigError, RealConfig, ServiceConfig, ServicesConfig};

/// Loads a services configuration from a keepalived-syntax file.
pub fn load(path: &Path) -> Result<ServicesConfig, ConfigError> {
    let root = vigil_keepalived::parse_file(path)?;

    let mut services = Vec::new();
    for item in root.children_named("virtual_server") {
        services.push(bind_service(item)?);
    }

    Ok(ServicesConfig { services })
}

fn bind_service(item: &Item) -> Result<ServiceConfig, ConfigError> {
    let mut service = ServiceConfig {
        vip: positional(item, 0, "virtual_server address")?,
        vport: positional_or(item, 1, Port::OMITTED)?,
        ..ServiceConfig::default()
    };

    for child in &item.children {
        match child.name.as_str() {
            "protocol" => service.protocol = parse(child)?,
            "lvs_sched" => service.lvs_scheduler = string(child)?,
            "lvs_method" => service.forwarding_method = parse(child)?,
            "quorum" => service.quorum = parse(child)?,
            "hysteresis" => service.hysteresis = parse(child)?,
            "quorum_up" => service.quorum_up = joined(child),
            "quorum_down" => service.quorum_down = joined(child),
            "announce_group" => service.announce_group = string(child)?,
            "virtualhost" => service.virtualhost = Some(string(child)?),
            "fwmark" => service.fwmark = parse(child)?,
            "ops" => service.one_packet_scheduler = true,
            "ipv4_outer_source_network" => {
                service.ipv4_outer_source_network = Some(string(child)?)
            }
            "ipv6_outer_source_network" => {
                service.ipv6_outer_source_network = Some(string(child)?)
            }
            "version" => service.version = Some(string(child)?),
            "delay_loop" => service.scheduler.delay_loop = Some(parse(child)?),
            "retry" | "nb_get_retry" => service.scheduler.retries = Some(parse(child)?),
            "delay_before_retry" => service.scheduler.retry_delay = Some(parse(child)?),
            "real_server" => service.reals.push(bind_real(child)?),
            // Unknown parameters are tolerated, as keepalived carries many
            // settings this system does not consume.
            _ => {}
        }
    }

    Ok(service)
}

fn bind_real(item: &Item) -> Result<RealConfig, ConfigError> {
    let mut real = RealConfig {
        ip: positional::<IpAddr>(item, 0, "real_server address")?,
        port: positional_or(item, 1, Port::OMITTED)?,
        ..RealConfig::default()
    };

    for child in &item.children {
        match child.name.as_str() {
            "weight" => real.weight = Weight::from_str(string(child)?.as_str()).expect("infallible"),
            "inhibit_on_failure" => real.inhibit_on_failure = true,
            "virtualhost" => real.virtualhost = Some(string(child)?),
            "lvs_method" => real.forwarding_method = Some(parse(child)?),
            "delay_loop" => real.scheduler.delay_loop = Some(parse(child)?),
            "retry" | "nb_get_retry" => real.scheduler.retries = Some(parse(child)?),
            "delay_before_retry" => real.scheduler.retry_delay = Some(parse(child)?),
            "TCP_CHECK" => real.tcp_checkers.push(bind_checker(child)?),
            "HTTP_GET" => real.http_checkers.push(bind_checker(child)?),
            "SSL_GET" => real.https_checkers.push(bind_checker(child)?),
            "GRPC_CHECK" => real.grpc_checkers.push(bind_checker(child)?),
            _ => {}
        }
    }

    Ok(real)
}

fn bind_checker(item: &Item) -> Result<CheckerConfig, ConfigError> {
    let mut checker = CheckerConfig::default();

    for child in &item.children {
        match child.name.as_str() {
            "url" => {
                for url_child in &child.children {
                    match url_child.name.as_str() {
                        "path" => checker.url.path = string(url_child)?,
                        "status_code" => checker.url.status_code = Some(parse(url_child)?),
                        "digest" => checker.url.digest = Some(string(url_child)?),
                        "virtualhost" => checker.url.virtualhost = Some(string(url_child)?),
                        _ => {}
                    }
                }
            }
            "virtualhost" => checker.url.virtualhost = Some(string(child)?),
            "connect_ip" => checker.net.connect_ip = Some(parse(child)?),
            "connect_port" => checker.net.connect_port = parse(child)?,
            "bindto" => checker.net.bind_ip = Some(parse(child)?),
            "connect_timeout" => checker.net.connect_timeout = parse(child)?,
            "check_timeout" => checker.net.check_timeout = parse(child)?,
            "fwmark" => checker.net.fwmark = parse(child)?,
            "dynamic_weight_enable" => checker.weight.dynamic_weight = true,
            "dynamic_weight_in_header" => checker.weight.dynamic_weight_header = true,
            "dynamic_weight_coefficient" => checker.weight.dynamic_weight_coeff = parse(child)?,
            "delay_loop" => checker.scheduler.delay_loop = Some(parse(child)?),
            "retry" | "nb_get_retry" => checker.scheduler.retries = Some(parse(child)?),
            "delay_before_retry" => checker.scheduler.retry_delay = Some(parse(child)?),
            _ => {}
        }
    }

    Ok(checker)
}

fn string(item: &Item) -> Result<String, ConfigError> {
    item.single()
        .map(str::to_string)
        .ok_or_else(|| ConfigError::MissingValue(item.name.clone()))
}

/// All inline values joined back together; quorum scripts arrive either as
/// one quoted token or as bare words.
fn joined(item: &Item) -> String {
    item.values.join(" ")
}

fn parse<T>(item: &Item) -> Result<T, ConfigError>
where
    T: FromStr,
{
    let value = item
        .single()
        .ok_or_else(|| ConfigError::MissingValue(item.name.clone()))?;
    value.parse().map_err(|_| ConfigError::InvalidValue {
        name: item.name.clone(),
        value: value.to_string(),
    })
}

fn positional<T>(item: &Item, index: usize, what: &str) -> Result<T, ConfigError>
where
    T: FromStr,
{
    let value = item
        .values
        .get(index)
        .ok_or_else(|| ConfigError::MissingValue(what.to_string()))?;
    value.parse().map_err(|_| ConfigError::InvalidValue {
        name: what.to_string(),
        value: value.clone(),
    })
}

fn positional_or<T>(item: &Item, index: usize, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
{
    let Some(value) = item.values.get(index) else {
        return Ok(default);
    };
    value.parse().map_err(|_| ConfigError::InvalidValue {
        name: item.name.clone(),
        value: value.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckerKind;
    use vigil_common::Protocol;

    fn load_str(text: &str) -> ServicesConfig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.conf");
        std::fs::write(&path, text).unwrap();
        load(&path).unwrap()
    }

    #[test]
    fn test_bind_full_service() {
        let config = load_str(
            r#"
virtual_server 2001:db8::1 80 {
    protocol TCP
    lvs_sched wrr
    lvs_method TUN
    quorum 5
    hysteresis 1
    quorum_up "/etc/keepalived/quorum-handler2.sh up 2001:db8::1,g-1"
    delay_loop 10
    real_server 2001:db8::10 8080 {
        weight 7
        inhibit_on_failure
        HTTP_GET {
            url {
                path /healthz
                status_code 200
                digest 0123456789abcdef0123456789abcdef
            }
            connect_ip 2001:db8::10
            connect_port 8080
            connect_timeout 1.5
            check_timeout 3
            dynamic_weight_enable
            dynamic_weight_coefficient 30
            nb_get_retry 2
        }
        TCP_CHECK {
            connect_port 22
        }
    }
}
"#,
        );

        assert_eq!(config.services.len(), 1);
        let service = &config.services[0];
        assert_eq!(service.vip, "2001:db8::1".parse::<IpAddr>().unwrap());
        assert_eq!(service.vport, Port::new(80));
        assert_eq!(service.protocol, Protocol::Tcp);
        assert_eq!(service.lvs_scheduler, "wrr");
        assert_eq!(service.quorum, 5);
        assert_eq!(service.hysteresis, 1);
        assert_eq!(
            service.quorum_up,
            "/etc/keepalived/quorum-handler2.sh up 2001:db8::1,g-1"
        );
        assert_eq!(service.scheduler.delay_loop, Some(10.0));

        let real = &service.reals[0];
        assert_eq!(real.ip, "2001:db8::10".parse::<IpAddr>().unwrap());
        assert_eq!(real.port, Port::new(8080));
        assert_eq!(real.weight, Weight::new(7));
        assert!(real.inhibit_on_failure);

        let http = &real.http_checkers[0];
        assert_eq!(http.url.path, "/healthz");
        assert_eq!(http.url.status_code, Some(200));
        assert_eq!(
            http.url.digest.as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
        assert_eq!(http.net.connect_port, Port::new(8080));
        assert_eq!(http.net.connect_timeout, 1.5);
        assert_eq!(http.net.check_timeout, 3.0);
        assert!(http.weight.dynamic_weight);
        assert_eq!(http.weight.dynamic_weight_coeff, 30);
        assert_eq!(http.scheduler.retries, Some(2));

        let tcp = &real.tcp_checkers[0];
        assert_eq!(tcp.net.connect_port, Port::new(22));
    }

    #[test]
    fn test_bind_l3_service_without_ports() {
        let config = load_str(
            "virtual_server 192.0.2.1 {\n\
             \treal_server 10.0.0.1 {\n\
             \t}\n\
             }\n",
        );

        let service = &config.services[0];
        assert!(service.vport.is_omitted());
        assert!(service.reals[0].port.is_omitted());
    }

    #[test]
    fn test_checker_kinds_follow_sections() {
        let mut config = load_str(
            "virtual_server 192.0.2.1 80 {\n\
             \treal_server 10.0.0.1 80 {\n\
             \t\tSSL_GET {\n\
             \t\t}\n\
             \t\tGRPC_CHECK {\n\
             \t\t}\n\
             \t}\n\
             }\n",
        );
        config
            .prepare(&crate::config::ExperimentsConfig::default())
            .unwrap();

        let real = &config.services[0].reals[0];
        assert_eq!(real.https_checkers[0].kind, CheckerKind::Https);
        assert_eq!(real.grpc_checkers[0].kind, CheckerKind::Grpc);
    }

    #[test]
    fn test_unknown_parameters_are_tolerated() {
        let config = load_str(
            "virtual_server 192.0.2.1 80 {\n\
             \talpha beta\n\
             \tsome_block {\n\
             \t\tnested value\n\
             \t}\n\
             }\n",
        );
        assert_eq!(config.services.len(), 1);
    }

    #[test]
    fn test_invalid_address_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("services.conf");
        std::fs::write(&path, "virtual_server not-an-address 80 {\n}\n").unwrap();
        assert!(matches!(
            load(&path),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
