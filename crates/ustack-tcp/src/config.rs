use core::net::IpAddr;
use core::ops::RangeInclusive;
use core::str::FromStr;

use thiserror::Error;

use crate::nat::TcpTimeout;
use crate::pool::PortPool;
use crate::{MAX_BACKLOG_SIZE, MAX_SYN_BACKLOG_SIZE, RCV_MSS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    /// Half-open connections a listener keeps before new SYNs are dropped.
    pub max_syn_backlog: usize,
    /// Completed connections waiting for `accept`.
    pub max_backlog: usize,
    /// MSS advertised in our SYN-ACK.
    pub rcv_mss: u16,
    pub tcp_timeout: TcpTimeout,
    /// Source addresses handed out to SNAT/FNAT connections.
    pub snat_ips: Vec<IpAddr>,
    pub snat_ports: RangeInclusive<u16>,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            max_syn_backlog: MAX_SYN_BACKLOG_SIZE,
            max_backlog: MAX_BACKLOG_SIZE,
            rcv_mss: RCV_MSS,
            tcp_timeout: TcpTimeout::default(),
            snat_ips: Vec::new(),
            snat_ports: 20000..=60000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing required env var {0}")]
    MissingEnv(&'static str),

    #[error("invalid value for env var {0}")]
    InvalidEnv(&'static str),
}

impl StackConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from `lookup`, which maps a variable name to its value.
    ///
    /// Unset variables keep their defaults; set but unparsable ones are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let t = defaults.tcp_timeout;
        let tcp_timeout = TcpTimeout {
            syn_sent: parse_or(&lookup, "USTACK_TCP_TIMEOUT_SYN_SENT", t.syn_sent)?,
            syn_recv: parse_or(&lookup, "USTACK_TCP_TIMEOUT_SYN_RECV", t.syn_recv)?,
            established: parse_or(&lookup, "USTACK_TCP_TIMEOUT_ESTABLISHED", t.established)?,
            fin_wait: parse_or(&lookup, "USTACK_TCP_TIMEOUT_FIN_WAIT", t.fin_wait)?,
            close_wait: parse_or(&lookup, "USTACK_TCP_TIMEOUT_CLOSE_WAIT", t.close_wait)?,
            last_ack: parse_or(&lookup, "USTACK_TCP_TIMEOUT_LAST_ACK", t.last_ack)?,
            time_wait: parse_or(&lookup, "USTACK_TCP_TIMEOUT_TIME_WAIT", t.time_wait)?,
            close: parse_or(&lookup, "USTACK_TCP_TIMEOUT_CLOSE", t.close)?,
        };

        let rcv_mss: u16 = parse_or(&lookup, "USTACK_RCV_MSS", defaults.rcv_mss)?;
        if rcv_mss == 0 {
            return Err(ConfigError::InvalidEnv("USTACK_RCV_MSS"));
        }

        let snat_ips = match lookup("USTACK_SNAT_IPS") {
            Some(raw) => parse_ips(&raw)?,
            None => Vec::new(),
        };
        let snat_ports = match lookup("USTACK_SNAT_PORTS") {
            Some(_) if snat_ips.is_empty() => return Err(ConfigError::MissingEnv("USTACK_SNAT_IPS")),
            Some(raw) => parse_port_range(&raw)?,
            None => defaults.snat_ports,
        };

        Ok(Self {
            max_syn_backlog: parse_or(&lookup, "USTACK_MAX_SYN_BACKLOG", defaults.max_syn_backlog)?,
            max_backlog: parse_or(&lookup, "USTACK_MAX_BACKLOG", defaults.max_backlog)?,
            rcv_mss,
            tcp_timeout,
            snat_ips,
            snat_ports,
        })
    }

    pub fn port_pool(&self) -> PortPool {
        PortPool::new(self.snat_ips.clone(), self.snat_ports.clone())
    }
}

fn parse_or<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidEnv(name)),
        None => Ok(default),
    }
}

fn parse_ips(raw: &str) -> Result<Vec<IpAddr>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(|_| ConfigError::InvalidEnv("USTACK_SNAT_IPS")))
        .collect()
}

/// Accepts `20000-30000` or a single port.
fn parse_port_range(raw: &str) -> Result<RangeInclusive<u16>, ConfigError> {
    let invalid = || ConfigError::InvalidEnv("USTACK_SNAT_PORTS");
    let raw = raw.trim();
    let (start, end) = match raw.split_once('-') {
        Some((start, end)) => (start.trim(), end.trim()),
        None => (raw, raw),
    };
    let start: u16 = start.parse().map_err(|_| invalid())?;
    let end: u16 = end.parse().map_err(|_| invalid())?;
    if start == 0 || start > end {
        return Err(invalid());
    }
    Ok(start..=end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = StackConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, StackConfig::default());
        assert_eq!(cfg.max_syn_backlog, 128);
        assert_eq!(cfg.tcp_timeout.established, 432_000);
    }

    #[test]
    fn overrides() {
        let cfg = StackConfig::from_lookup(lookup(&[
            ("USTACK_MAX_SYN_BACKLOG", "4"),
            ("USTACK_MAX_BACKLOG", " 8 "),
            ("USTACK_RCV_MSS", "1460"),
            ("USTACK_TCP_TIMEOUT_TIME_WAIT", "30"),
            ("USTACK_SNAT_IPS", "192.0.2.1, fd00::1"),
            ("USTACK_SNAT_PORTS", "40000-40010"),
        ]))
        .unwrap();
        assert_eq!(cfg.max_syn_backlog, 4);
        assert_eq!(cfg.max_backlog, 8);
        assert_eq!(cfg.rcv_mss, 1460);
        assert_eq!(cfg.tcp_timeout.time_wait, 30);
        assert_eq!(cfg.tcp_timeout.close, 10);
        assert_eq!(cfg.snat_ips.len(), 2);
        assert_eq!(cfg.snat_ports, 40000..=40010);
    }

    #[test]
    fn invalid_values() {
        assert_eq!(
            StackConfig::from_lookup(lookup(&[("USTACK_MAX_BACKLOG", "many")])),
            Err(ConfigError::InvalidEnv("USTACK_MAX_BACKLOG"))
        );
        assert_eq!(
            StackConfig::from_lookup(lookup(&[("USTACK_RCV_MSS", "0")])),
            Err(ConfigError::InvalidEnv("USTACK_RCV_MSS"))
        );
        assert_eq!(
            StackConfig::from_lookup(lookup(&[
                ("USTACK_SNAT_IPS", "192.0.2.1"),
                ("USTACK_SNAT_PORTS", "5-1"),
            ])),
            Err(ConfigError::InvalidEnv("USTACK_SNAT_PORTS"))
        );
        assert_eq!(
            StackConfig::from_lookup(lookup(&[("USTACK_SNAT_IPS", "nope")])),
            Err(ConfigError::InvalidEnv("USTACK_SNAT_IPS"))
        );
    }

    #[test]
    fn ports_without_ips() {
        assert_eq!(
            StackConfig::from_lookup(lookup(&[("USTACK_SNAT_PORTS", "1000")])),
            Err(ConfigError::MissingEnv("USTACK_SNAT_IPS"))
        );
    }
}
