//! Routing Service Seam
//!
//! Installs the routes and DNS servers that steer guest traffic into the
//! virtual interface. Only called on engine start and stop, never on the
//! packet path.

use std::net::IpAddr;

use crate::config::RouteSpec;
use crate::error::Result;

/// Host routing table and resolver configuration
pub trait RoutingService: Send + Sync {
    fn add_route(&self, route: &RouteSpec) -> Result<()>;

    fn delete_route(&self, route: &RouteSpec) -> Result<()>;

    fn set_dns_servers(&self, servers: &[IpAddr]) -> Result<()>;
}

/// Routing service that changes nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRouting;

impl RoutingService for NoopRouting {
    fn add_route(&self, _route: &RouteSpec) -> Result<()> {
        Ok(())
    }

    fn delete_route(&self, _route: &RouteSpec) -> Result<()> {
        Ok(())
    }

    fn set_dns_servers(&self, _servers: &[IpAddr]) -> Result<()> {
        Ok(())
    }
}

/// Add every route and then set the DNS servers.
/// If any step fails, routes added so far are removed again.
pub fn apply(service: &dyn RoutingService, routes: &[RouteSpec], dns: &[IpAddr]) -> Result<()> {
    for (index, route) in routes.iter().enumerate() {
        if let Err(e) = service.add_route(route) {
            withdraw(service, &routes[..index]);
            return Err(e);
        }
        log::debug!("Route {}/{} added", route.destination, route.prefix_len);
    }

    if let Err(e) = service.set_dns_servers(dns) {
        withdraw(service, routes);
        return Err(e);
    }
    Ok(())
}

/// Delete `routes` in reverse order, logging failures
pub fn withdraw(service: &dyn RoutingService, routes: &[RouteSpec]) {
    for route in routes.iter().rev() {
        match service.delete_route(route) {
            Ok(()) => log::debug!("Route {}/{} deleted", route.destination, route.prefix_len),
            Err(e) => log::warn!(
                "Failed to delete route {}/{}: {}",
                route.destination,
                route.prefix_len,
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TapNatError;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<String>>,
        fail_on: Option<Ipv4Addr>,
    }

    impl RoutingService for Recorder {
        fn add_route(&self, route: &RouteSpec) -> Result<()> {
            if Some(route.destination) == self.fail_on {
                return Err(TapNatError::Routing("refused".into()));
            }
            self.calls.lock().unwrap().push(format!("add {}", route.destination));
            Ok(())
        }

        fn delete_route(&self, route: &RouteSpec) -> Result<()> {
            self.calls.lock().unwrap().push(format!("del {}", route.destination));
            Ok(())
        }

        fn set_dns_servers(&self, servers: &[IpAddr]) -> Result<()> {
            self.calls.lock().unwrap().push(format!("dns {}", servers.len()));
            Ok(())
        }
    }

    fn routes() -> Vec<RouteSpec> {
        vec![
            RouteSpec::new(Ipv4Addr::new(0, 0, 0, 0), 1),
            RouteSpec::new(Ipv4Addr::new(128, 0, 0, 0), 1),
        ]
    }

    #[test]
    fn test_apply_then_withdraw() {
        let recorder = Recorder::default();
        let dns = [IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))];
        apply(&recorder, &routes(), &dns).unwrap();
        withdraw(&recorder, &routes());

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec!["add 0.0.0.0", "add 128.0.0.0", "dns 1", "del 128.0.0.0", "del 0.0.0.0"]
        );
    }

    #[test]
    fn test_failed_route_rolls_back() {
        let recorder = Recorder {
            fail_on: Some(Ipv4Addr::new(128, 0, 0, 0)),
            ..Default::default()
        };
        assert!(apply(&recorder, &routes(), &[]).is_err());

        let calls = recorder.calls.lock().unwrap();
        assert_eq!(*calls, vec!["add 0.0.0.0", "del 0.0.0.0"]);
    }
}
