//! Configuration types for TapNat Core

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::ops::RangeInclusive;
use std::time::Duration;

use crate::error::TapNatError;

/// A route pushed to the OS routing table while the engine runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSpec {
    pub destination: Ipv4Addr,
    pub prefix_len: u8,
}

impl RouteSpec {
    pub fn new(destination: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            destination,
            prefix_len,
        }
    }
}

/// NAT engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Address that stands in for guests on the host side.
    /// Translated guest flows are sourced from `gateway_address:<port>`.
    pub gateway_address: Ipv4Addr,
    /// Host-side listener that accepts translated guest TCP flows
    pub listener: SocketAddrV4,
    /// Route guest TCP through the in-process loopback listener
    pub use_subnet_stack: bool,
    /// Idle time after which an established link is torn down
    pub max_inactivity_time: Duration,
    /// Idle time allowed for a link still in its handshake
    pub max_syn_time: Duration,
    /// Grace period a disconnecting link is kept to absorb trailing ACKs
    pub max_final_time: Duration,
    /// Idle time after which a UDP port entry is evicted
    pub udp_inactivity_time: Duration,
    /// Lifetime of an incomplete fragment group
    pub fragment_timeout: Duration,
    /// Aging sweep period
    pub sweep_interval: Duration,
    /// Local ports handed out to links
    pub port_range: RangeInclusive<u16>,
    /// Reject frames with bad IP/TCP/UDP checksums
    pub validate_checksums: bool,
    /// Routes installed at start, removed at stop
    pub routes: Vec<RouteSpec>,
    /// DNS servers applied at start
    pub dns_servers: Vec<IpAddr>,
}

impl EngineConfig {
    pub fn new(gateway_address: Ipv4Addr, listener: SocketAddrV4) -> Self {
        Self {
            gateway_address,
            listener,
            ..Default::default()
        }
    }

    pub fn with_subnet_stack(mut self, enabled: bool) -> Self {
        self.use_subnet_stack = enabled;
        self
    }

    pub fn with_max_inactivity_time(mut self, timeout: Duration) -> Self {
        self.max_inactivity_time = timeout;
        self
    }

    pub fn with_port_range(mut self, range: RangeInclusive<u16>) -> Self {
        self.port_range = range;
        self
    }

    pub fn with_checksum_validation(mut self, enabled: bool) -> Self {
        self.validate_checksums = enabled;
        self
    }

    pub fn with_route(mut self, route: RouteSpec) -> Self {
        self.routes.push(route);
        self
    }

    pub fn with_dns_server(mut self, server: IpAddr) -> Self {
        self.dns_servers.push(server);
        self
    }

    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<(), TapNatError> {
        if self.port_range.is_empty() {
            return Err(TapNatError::ConfigError("empty port range".into()));
        }
        if *self.port_range.start() == 0 {
            return Err(TapNatError::ConfigError("port range must not include 0".into()));
        }
        if self.sweep_interval.is_zero() {
            return Err(TapNatError::ConfigError("sweep interval must be non-zero".into()));
        }
        if *self.listener.ip() == self.gateway_address {
            return Err(TapNatError::ConfigError(
                "listener address must differ from the gateway address".into(),
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gateway_address: Ipv4Addr::new(10, 0, 0, 2),
            listener: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 7070),
            use_subnet_stack: false,
            max_inactivity_time: Duration::from_secs(300),
            max_syn_time: Duration::from_secs(20),
            max_final_time: Duration::from_secs(5),
            udp_inactivity_time: Duration::from_secs(60),
            fragment_timeout: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(1),
            port_range: 49152..=65535,
            validate_checksums: true,
            routes: Vec::new(),
            dns_servers: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.gateway_address, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(config.max_inactivity_time, Duration::from_secs(300));
        assert_eq!(config.max_syn_time, Duration::from_secs(20));
        assert_eq!(config.max_final_time, Duration::from_secs(5));
        assert!(!config.use_subnet_stack);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_config_builders() {
        let config = EngineConfig::default()
            .with_subnet_stack(true)
            .with_max_inactivity_time(Duration::from_secs(30))
            .with_route(RouteSpec::new(Ipv4Addr::new(0, 0, 0, 0), 1))
            .with_dns_server("1.1.1.1".parse().unwrap());
        assert!(config.use_subnet_stack);
        assert_eq!(config.max_inactivity_time, Duration::from_secs(30));
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.dns_servers.len(), 1);
    }

    #[test]
    fn test_engine_config_rejects_bad_values() {
        #[allow(clippy::reversed_empty_ranges)]
        let empty = EngineConfig::default().with_port_range(60000..=50000);
        assert!(empty.validate().is_err());

        let clash = EngineConfig::new(
            Ipv4Addr::new(10, 0, 0, 1),
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 7070),
        );
        assert!(clash.validate().is_err());

        let mut zero_tick = EngineConfig::default();
        zero_tick.sweep_interval = Duration::ZERO;
        assert!(zero_tick.validate().is_err());
    }
}
