use ipnetwork::IpNetwork;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{masked, Address, Link, NetError, NetOps, Route, Rule, Scope, TABLE_MAIN};
use crate::config::IpVersion;

const HOST: &str = "host";

#[derive(Debug, Clone)]
struct MemLink {
    link: Link,
    addresses: Vec<Address>,
    /// Global index of the other end of a veth pair.
    peer: Option<u32>,
}

#[derive(Debug, Default)]
struct Namespace {
    links: Vec<MemLink>,
    routes: Vec<Route>,
    rules: Vec<Rule>,
    announced: Vec<(String, IpAddr)>,
}

impl Namespace {
    fn with_loopback(index: u32) -> Self {
        Self {
            links: vec![MemLink {
                link: Link {
                    index,
                    name: "lo".to_string(),
                    mac: None,
                    mtu: 65536,
                    up: true,
                    kind: None,
                },
                addresses: Vec::new(),
                peer: None,
            }],
            ..Default::default()
        }
    }

    fn link(&self, name: &str) -> Result<&MemLink, NetError> {
        self.links
            .iter()
            .find(|l| l.link.name == name)
            .ok_or_else(|| NetError::NotFound(format!("link {}", name)))
    }

    fn link_mut(&mut self, name: &str) -> Result<&mut MemLink, NetError> {
        self.links
            .iter_mut()
            .find(|l| l.link.name == name)
            .ok_or_else(|| NetError::NotFound(format!("link {}", name)))
    }

    /// Remove a link and everything routed through it.
    fn take_link(&mut self, name: &str) -> Result<MemLink, NetError> {
        let pos = self
            .links
            .iter()
            .position(|l| l.link.name == name)
            .ok_or_else(|| NetError::NotFound(format!("link {}", name)))?;
        self.routes.retain(|r| r.dev != name);
        Ok(self.links.remove(pos))
    }

    /// The subnet route the kernel installs for an address on an up link.
    fn add_prefix_route(&mut self, dev: &str, addr: &Address) {
        let net = addr.network;
        let full = match net {
            IpNetwork::V4(_) => 32,
            IpNetwork::V6(_) => 128,
        };
        if net.prefix() >= full {
            return;
        }
        let mut route = Route::new(masked(net), dev).table(TABLE_MAIN);
        if net.is_ipv4() {
            route = route.scope(Scope::Link).src(net.ip());
        }
        if !self.routes.iter().any(|r| same_route_key(r, &route)) {
            self.routes.push(route);
        }
    }
}

fn same_route_key(a: &Route, b: &Route) -> bool {
    a.dst == b.dst && a.table_id() == b.table_id()
}

#[derive(Debug)]
struct World {
    namespaces: HashMap<String, Namespace>,
    next_index: u32,
}

impl World {
    fn alloc_index(&mut self) -> u32 {
        self.next_index += 1;
        self.next_index
    }

    fn ns(&self, key: &str) -> Result<&Namespace, NetError> {
        self.namespaces.get(key).ok_or_else(|| NetError::Namespace {
            path: key.to_string(),
            message: "no such namespace".to_string(),
        })
    }

    fn ns_mut(&mut self, key: &str) -> Result<&mut Namespace, NetError> {
        self.namespaces.get_mut(key).ok_or_else(|| NetError::Namespace {
            path: key.to_string(),
            message: "no such namespace".to_string(),
        })
    }

    fn remove_by_index(&mut self, index: u32) {
        for ns in self.namespaces.values_mut() {
            if let Some(pos) = ns.links.iter().position(|l| l.link.index == index) {
                let name = ns.links.remove(pos).link.name;
                ns.routes.retain(|r| r.dev != name);
            }
        }
    }
}

/// In-memory [`NetOps`] spanning any number of namespaces.
///
/// A handle is bound to one namespace; handles for other namespaces share
/// the same world, so a veth moved out of one shows up in the other.
#[derive(Debug, Clone)]
pub struct MemoryNet {
    world: Arc<Mutex<World>>,
    ns: String,
}

impl Default for MemoryNet {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNet {
    /// A fresh world holding only the host namespace.
    pub fn new() -> Self {
        let mut namespaces = HashMap::new();
        namespaces.insert(HOST.to_string(), Namespace::with_loopback(1));
        Self {
            world: Arc::new(Mutex::new(World {
                namespaces,
                next_index: 1,
            })),
            ns: HOST.to_string(),
        }
    }

    /// Handle for the namespace mounted at `path`, creating it if needed.
    pub fn namespace(&self, path: &str) -> MemoryNet {
        let mut world = self.lock();
        if !world.namespaces.contains_key(path) {
            let lo = world.alloc_index();
            world
                .namespaces
                .insert(path.to_string(), Namespace::with_loopback(lo));
        }
        MemoryNet {
            world: Arc::clone(&self.world),
            ns: path.to_string(),
        }
    }

    /// Drop a namespace and every link in it, as when a pod sandbox goes away.
    pub fn remove_namespace(&self, path: &str) {
        let mut world = self.lock();
        if let Some(ns) = world.namespaces.remove(path) {
            for peer in ns.links.iter().filter_map(|l| l.peer) {
                world.remove_by_index(peer);
            }
        }
    }

    /// Add a physical device, down and without addresses.
    pub fn add_device(&self, name: &str, mac: &str, mtu: u32) -> u32 {
        let mut world = self.lock();
        let index = world.alloc_index();
        if let Some(ns) = world.namespaces.get_mut(&self.ns) {
            ns.links.push(MemLink {
                link: Link {
                    index,
                    name: name.to_string(),
                    mac: Some(mac.to_string()),
                    mtu,
                    up: false,
                    kind: None,
                },
                addresses: Vec::new(),
                peer: None,
            });
        }
        index
    }

    /// Every route in this namespace, sorted for comparison.
    pub fn all_routes(&self) -> Vec<Route> {
        let world = self.lock();
        let mut routes = world
            .namespaces
            .get(&self.ns)
            .map(|ns| ns.routes.clone())
            .unwrap_or_default();
        routes.sort_by_key(|r| (r.table_id(), r.dst.to_string(), r.dev.clone()));
        routes
    }

    /// Every rule in this namespace, both families, in priority order.
    pub fn all_rules(&self) -> Vec<Rule> {
        let world = self.lock();
        let mut rules = world
            .namespaces
            .get(&self.ns)
            .map(|ns| ns.rules.clone())
            .unwrap_or_default();
        rules.sort_by_key(|r| (r.priority, r.table, r.src.map(|s| s.to_string())));
        rules
    }

    /// `(dev, ip)` pairs announced so far.
    pub fn announced(&self) -> Vec<(String, IpAddr)> {
        let world = self.lock();
        world
            .namespaces
            .get(&self.ns)
            .map(|ns| ns.announced.clone())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, World> {
        // A panic while holding the lock only happens in a failing test.
        self.world.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_ns<T>(&self, f: impl FnOnce(&mut Namespace) -> Result<T, NetError>) -> Result<T, NetError> {
        let mut world = self.lock();
        f(world.ns_mut(&self.ns)?)
    }
}

impl NetOps for MemoryNet {
    fn enter(&self, netns_path: &str) -> Result<Box<dyn NetOps>, NetError> {
        self.lock().ns(netns_path)?;
        Ok(Box::new(MemoryNet {
            world: Arc::clone(&self.world),
            ns: netns_path.to_string(),
        }))
    }

    fn links(&self) -> Result<Vec<Link>, NetError> {
        self.with_ns(|ns| Ok(ns.links.iter().map(|l| l.link.clone()).collect()))
    }

    fn add_veth(&self, name: &str, peer: &str, mtu: Option<u32>) -> Result<(), NetError> {
        let mut world = self.lock();
        let a = world.alloc_index();
        let b = world.alloc_index();
        let ns = world.ns_mut(&self.ns)?;
        for n in [name, peer] {
            if ns.links.iter().any(|l| l.link.name == n) {
                return Err(NetError::AlreadyExists(format!("link {}", n)));
            }
        }
        let make = |index: u32, name: &str, peer: u32| MemLink {
            link: Link {
                index,
                name: name.to_string(),
                mac: Some(format!("0e:00:00:00:{:02x}:{:02x}", index >> 8, index & 0xff)),
                mtu: mtu.unwrap_or(1500),
                up: false,
                kind: Some("veth".to_string()),
            },
            addresses: Vec::new(),
            peer: Some(peer),
        };
        ns.links.push(make(a, name, b));
        ns.links.push(make(b, peer, a));
        Ok(())
    }

    fn move_link(&self, name: &str, netns_path: &str) -> Result<(), NetError> {
        let mut world = self.lock();
        let target_has_name = world.ns(netns_path)?.links.iter().any(|l| l.link.name == name);
        if target_has_name {
            return Err(NetError::AlreadyExists(format!("link {} in {}", name, netns_path)));
        }
        let mut link = world.ns_mut(&self.ns)?.take_link(name)?;
        link.link.up = false;
        link.addresses.clear();
        world.ns_mut(netns_path)?.links.push(link);
        Ok(())
    }

    fn rename_link(&self, name: &str, new_name: &str) -> Result<(), NetError> {
        self.with_ns(|ns| {
            if ns.links.iter().any(|l| l.link.name == new_name) {
                return Err(NetError::AlreadyExists(format!("link {}", new_name)));
            }
            let link = ns.link_mut(name)?;
            if link.link.up {
                return Err(NetError::Command {
                    command: format!("ip link set dev {} name {}", name, new_name),
                    stderr: "Device or resource busy".to_string(),
                });
            }
            link.link.name = new_name.to_string();
            Ok(())
        })
    }

    fn set_link_up(&self, name: &str) -> Result<(), NetError> {
        self.with_ns(|ns| {
            let link = ns.link_mut(name)?;
            if link.link.up {
                return Ok(());
            }
            link.link.up = true;
            let addresses = link.addresses.clone();
            for addr in &addresses {
                ns.add_prefix_route(name, addr);
            }
            Ok(())
        })
    }

    fn set_link_mtu(&self, name: &str, mtu: u32) -> Result<(), NetError> {
        self.with_ns(|ns| {
            ns.link_mut(name)?.link.mtu = mtu;
            Ok(())
        })
    }

    fn delete_link(&self, name: &str) -> Result<(), NetError> {
        let mut world = self.lock();
        let link = world.ns_mut(&self.ns)?.take_link(name)?;
        if let Some(peer) = link.peer {
            world.remove_by_index(peer);
        }
        Ok(())
    }

    fn addresses(&self, dev: &str) -> Result<Vec<Address>, NetError> {
        self.with_ns(|ns| Ok(ns.link(dev)?.addresses.clone()))
    }

    fn add_address(&self, dev: &str, addr: IpNetwork, scope: Scope) -> Result<(), NetError> {
        self.with_ns(|ns| {
            let link = ns.link_mut(dev)?;
            if link.addresses.iter().any(|a| a.network.ip() == addr.ip()) {
                return Err(NetError::AlreadyExists(format!("address {} on {}", addr, dev)));
            }
            let address = Address {
                network: addr,
                scope,
            };
            link.addresses.push(address);
            if link.link.up {
                ns.add_prefix_route(dev, &address);
            }
            Ok(())
        })
    }

    fn routes(
        &self,
        version: IpVersion,
        table: Option<u32>,
        dev: Option<&str>,
    ) -> Result<Vec<Route>, NetError> {
        let table = table.unwrap_or(TABLE_MAIN);
        self.with_ns(|ns| {
            Ok(ns
                .routes
                .iter()
                .filter(|r| r.version() == version && r.table_id() == table)
                .filter(|r| dev.map_or(true, |d| r.dev == d))
                .cloned()
                .collect())
        })
    }

    fn add_route(&self, route: &Route) -> Result<(), NetError> {
        self.with_ns(|ns| {
            ns.link(&route.dev)?;
            if ns.routes.iter().any(|r| same_route_key(r, route)) {
                return Err(NetError::AlreadyExists(format!("route {}", route)));
            }
            ns.routes.push(route.clone().table(route.table_id()));
            Ok(())
        })
    }

    fn replace_route(&self, route: &Route) -> Result<(), NetError> {
        self.with_ns(|ns| {
            ns.link(&route.dev)?;
            ns.routes.retain(|r| !same_route_key(r, route));
            ns.routes.push(route.clone().table(route.table_id()));
            Ok(())
        })
    }

    fn delete_route(&self, route: &Route) -> Result<(), NetError> {
        self.with_ns(|ns| {
            let pos = ns
                .routes
                .iter()
                .position(|r| {
                    same_route_key(r, route)
                        && (route.dev.is_empty() || r.dev == route.dev)
                        && (route.gateway.is_none() || r.gateway == route.gateway)
                })
                .ok_or_else(|| NetError::NotFound(format!("route {}", route)))?;
            ns.routes.remove(pos);
            Ok(())
        })
    }

    fn rules(&self, version: IpVersion) -> Result<Vec<Rule>, NetError> {
        self.with_ns(|ns| {
            Ok(ns
                .rules
                .iter()
                .filter(|r| r.version == version)
                .cloned()
                .collect())
        })
    }

    fn add_rule(&self, rule: &Rule) -> Result<(), NetError> {
        self.with_ns(|ns| {
            if ns.rules.contains(rule) {
                return Err(NetError::AlreadyExists(format!("rule {}", rule)));
            }
            ns.rules.push(rule.clone());
            Ok(())
        })
    }

    fn delete_rule(&self, rule: &Rule) -> Result<(), NetError> {
        self.with_ns(|ns| {
            let pos = ns
                .rules
                .iter()
                .position(|r| r == rule)
                .ok_or_else(|| NetError::NotFound(format!("rule {}", rule)))?;
            ns.rules.remove(pos);
            Ok(())
        })
    }

    fn announce(&self, dev: &str, ip: IpAddr) -> Result<(), NetError> {
        self.with_ns(|ns| {
            ns.link(dev)?;
            ns.announced.push((dev.to_string(), ip));
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::netlink::Tolerate;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn address_on_up_link_installs_subnet_route() {
        let host = MemoryNet::new();
        host.add_device("eth1", "0a:00:00:00:00:02", 9001);
        host.set_link_up("eth1").unwrap();
        host.add_address("eth1", net("10.0.1.5/24"), Scope::Universe)
            .unwrap();

        let routes = host.routes(IpVersion::V4, None, Some("eth1")).unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].dst, net("10.0.1.0/24"));
        assert_eq!(routes[0].scope, Scope::Link);

        let again = host.add_address("eth1", net("10.0.1.5/24"), Scope::Universe);
        assert!(again.unwrap_err().is_exists());
    }

    #[test]
    fn veth_moves_and_dies_with_its_peer() {
        let host = MemoryNet::new();
        let pod = host.namespace("/run/netns/pod");
        host.add_veth("vethA", "tmpA", Some(1400)).unwrap();
        host.move_link("tmpA", "/run/netns/pod").unwrap();
        pod.rename_link("tmpA", "eth0").unwrap();

        let eth0 = pod.link_by_name("eth0").unwrap().unwrap();
        assert!(eth0.is_veth());
        assert_eq!(eth0.mtu, 1400);
        assert!(host.link_by_name("tmpA").unwrap().is_none());

        host.delete_link("vethA").unwrap();
        assert!(pod.link_by_name("eth0").unwrap().is_none());
        assert!(host.delete_link("vethA").ignore_missing().is_ok());
    }

    #[test]
    fn rename_of_up_link_is_refused() {
        let host = MemoryNet::new();
        host.add_veth("a", "b", None).unwrap();
        host.set_link_up("a").unwrap();
        assert!(matches!(
            host.rename_link("a", "c"),
            Err(NetError::Command { .. })
        ));
    }

    #[test]
    fn routes_are_keyed_by_table_and_destination() {
        let host = MemoryNet::new();
        host.add_device("eth1", "0a:00:00:00:00:02", 9001);
        let route = Route::new(net("10.0.1.0/24"), "eth1").table(12);
        host.add_route(&route).unwrap();
        assert!(host.add_route(&route).unwrap_err().is_exists());
        host.add_route(&Route::new(net("10.0.1.0/24"), "eth1")).unwrap();
        host.replace_route(&route.clone().scope(Scope::Link)).unwrap();

        let table = host.routes(IpVersion::V4, Some(12), None).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].scope, Scope::Link);

        host.delete_route(&route).unwrap();
        assert!(host.delete_route(&route).unwrap_err().is_not_found());
    }

    #[test]
    fn entering_unknown_namespace_fails() {
        let host = MemoryNet::new();
        assert!(matches!(
            host.enter("/run/netns/missing"),
            Err(NetError::Namespace { .. })
        ));
        host.namespace("/run/netns/pod");
        assert!(host.enter("/run/netns/pod").is_ok());
    }
}
