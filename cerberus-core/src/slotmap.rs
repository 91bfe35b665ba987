//! The slot map: which address a given cluster slot currently routes to, and how to rebuild
//! that mapping from a `CLUSTER NODES` reply.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use crate::slot::SLOT_COUNT;

/// One line of `CLUSTER NODES` output, restricted to the fields the proxy cares about.
#[derive(Debug, Clone)]
pub struct RedisNode {
    pub addr: SocketAddr,
    pub node_id: String,
    pub master_id: Option<String>,
    pub slot_ranges: Vec<(u16, u16)>,
}

impl RedisNode {
    pub fn is_master(&self) -> bool {
        self.master_id.is_none()
    }
}

/// Parses a `CLUSTER NODES` bulk reply into a list of nodes. Lines with fewer than 9
/// whitespace-separated fields, or whose flags field contains `fail`, are skipped. A node whose
/// host is empty (the node replying about itself) inherits `default_host` — the address of the
/// updater connection that produced this reply.
pub fn parse_slot_map(nodes_info: &str, default_host: &str) -> Vec<RedisNode> {
    let mut nodes = Vec::new();

    for line in nodes_info.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 9 {
            continue;
        }
        if fields[2].contains("fail") {
            continue;
        }

        let mut host_port = fields[1].splitn(2, ':');
        let host_raw = host_port.next().unwrap_or("");
        let port_field = host_port.next().unwrap_or("0");
        // Newer cluster bus ports are suffixed as `port@busport`; we only want the client port.
        let port_str = port_field.split('@').next().unwrap_or("0");

        let port: u16 = match port_str.parse() {
            Ok(p) => p,
            Err(_) => continue,
        };

        let host = if host_raw.is_empty() { default_host.to_string() } else { host_raw.to_string() };

        let addr: SocketAddr = match format!("{}:{}", host, port).parse() {
            Ok(addr) => addr,
            Err(_) => continue,
        };

        let master_id = match fields[3] {
            "-" => None,
            id => Some(id.to_string()),
        };

        let mut slot_ranges = Vec::new();
        for token in &fields[8..] {
            if token.starts_with('[') {
                continue;
            }
            if let Some((a, b)) = token.split_once('-') {
                if let (Ok(a), Ok(b)) = (a.parse::<u16>(), b.parse::<u16>()) {
                    slot_ranges.push((a, b));
                }
            } else if let Ok(n) = token.parse::<u16>() {
                slot_ranges.push((n, n));
            }
        }

        nodes.push(RedisNode {
            addr,
            node_id: fields[0].to_string(),
            master_id,
            slot_ranges,
        });
    }

    nodes
}

/// Checks whether the union of `nodes`' slot ranges covers every slot in `0..SLOT_COUNT`.
pub fn covers_all_slots(nodes: &[RedisNode]) -> bool {
    let mut covered = vec![false; SLOT_COUNT as usize];
    for node in nodes {
        if !node.is_master() {
            continue;
        }
        for &(a, b) in &node.slot_ranges {
            for s in a..=b {
                covered[s as usize] = true;
            }
        }
    }
    covered.into_iter().all(|c| c)
}

/// Fixed array of `SLOT_COUNT` slots, each naming the address of the master that currently owns
/// it. Server *connections* are not stored here — they live in the worker's arena, lazily
/// created the first time a command is routed to a given address — so the map only needs to
/// remember which addresses are still live after a refresh.
pub struct SlotMap {
    slots: Vec<Option<SocketAddr>>,
    /// One replica address per slot, when the owning master reported one. Only consulted when
    /// `read_slave` is set — this proxy is then a read-only front for a replica set, per the
    /// `--read-slave` mode of the system this one is modeled on.
    replicas: Vec<Option<SocketAddr>>,
    read_slave: bool,
    /// Host prefix preferred when a master has more than one replica, mirroring `--read-slave-filter`.
    /// Empty means no preference — whichever replica is encountered last in the `CLUSTER NODES`
    /// reply wins, same as before this existed.
    read_slave_filter: String,
}

impl SlotMap {
    pub fn new() -> SlotMap {
        SlotMap {
            slots: vec![None; SLOT_COUNT as usize],
            replicas: vec![None; SLOT_COUNT as usize],
            read_slave: false,
            read_slave_filter: String::new(),
        }
    }

    pub fn with_read_slave(read_slave: bool) -> SlotMap {
        SlotMap { read_slave, ..SlotMap::new() }
    }

    pub fn with_read_slave_filter(read_slave: bool, read_slave_filter: String) -> SlotMap {
        SlotMap { read_slave, read_slave_filter, ..SlotMap::new() }
    }

    /// Whether `node` matches the preferred replica host prefix, if one is configured.
    fn prefers_replica(&self, node: &RedisNode) -> bool {
        !self.read_slave_filter.is_empty() && node.addr.ip().to_string().starts_with(&self.read_slave_filter)
    }

    /// The address routing should use for `slot`: a replica when running in `read_slave` mode and
    /// one is known, otherwise the master.
    pub fn get(&self, slot: u16) -> Option<SocketAddr> {
        if self.read_slave {
            if let Some(replica) = self.replicas[slot as usize] {
                return Some(replica);
            }
        }
        self.slots[slot as usize]
    }

    pub fn full_coverage(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    /// Every address routing could hand out right now — masters, plus whichever replicas are
    /// actually in use under `read_slave` mode.
    pub fn all_addresses(&self) -> HashSet<SocketAddr> {
        (0..self.slots.len() as u16).filter_map(|s| self.get(s)).collect()
    }

    /// Rebuilds the map from `nodes`. Returns the set of addresses that were present before the
    /// call but are absent afterward — the caller should close any Server connection to one of
    /// these addresses, since it no longer owns any slot.
    pub fn replace_map(&mut self, nodes: &[RedisNode]) -> HashSet<SocketAddr> {
        let mut new_slots = vec![None; SLOT_COUNT as usize];
        let mut new_replicas = vec![None; SLOT_COUNT as usize];

        for node in nodes {
            if !node.is_master() {
                continue;
            }
            for &(a, b) in &node.slot_ranges {
                for s in a..=b {
                    new_slots[s as usize] = Some(node.addr);
                }
            }
        }

        if self.read_slave {
            let by_id: HashMap<&str, &RedisNode> = nodes.iter().map(|n| (n.node_id.as_str(), n)).collect();
            // Tracks, per slot, whether the replica currently assigned there matched the
            // preferred host prefix — so a later non-preferred replica can never evict one that
            // already matched, while a preferred replica always wins whenever it's seen.
            let mut replica_is_preferred = vec![false; SLOT_COUNT as usize];

            for node in nodes {
                let master_id = match &node.master_id {
                    Some(id) => id,
                    None => continue,
                };
                let master = match by_id.get(master_id.as_str()) {
                    Some(master) => master,
                    None => continue,
                };
                let preferred = self.prefers_replica(node);
                for &(a, b) in &master.slot_ranges {
                    for s in a..=b {
                        let idx = s as usize;
                        if preferred || !replica_is_preferred[idx] {
                            new_replicas[idx] = Some(node.addr);
                            replica_is_preferred[idx] = preferred;
                        }
                    }
                }
            }
        }

        let old_addrs = self.all_addresses();
        self.slots = new_slots;
        self.replicas = new_replicas;
        let new_addrs = self.all_addresses();

        old_addrs.difference(&new_addrs).copied().collect()
    }
}

impl Default for SlotMap {
    fn default() -> SlotMap {
        SlotMap::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
07c37dfeb235213a872192d90877d0cd55635b91 127.0.0.1:30004@31004 slave e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 0 1426238317239 4 connected
e7d1eecce10fd6bb5eb35b9f99a514335d9ba9ca 127.0.0.1:30001@31001 myself,master - 0 0 1 connected 0-5460
67ed2db8d677e59ec4a4cefb06858cf2a1a89fa1 127.0.0.1:30002@31002 master - 0 1426238316232 2 connected 5461-10922
292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f 127.0.0.1:30003@31003 master,fail - 0 1426238318243 3 connected 10923-16383
";

    #[test]
    fn parses_masters_and_skips_failed_and_slave_lines() {
        let nodes = parse_slot_map(SAMPLE, "127.0.0.1");
        let masters: Vec<_> = nodes.iter().filter(|n| n.is_master()).collect();
        assert_eq!(masters.len(), 2);
        assert!(nodes.iter().all(|n| n.node_id != "292f8b365bb7edb5e285caf0b7e6ddc7265d2f4f"));
    }

    #[test]
    fn empty_host_inherits_default() {
        let info = "abc 127.0.0.1:7000@17000 myself,master - 0 0 1 connected 0-100\n\
                     def :7001@17001 master - 0 0 2 connected 101-16383\n";
        let nodes = parse_slot_map(info, "10.0.0.5");
        let with_empty_host = nodes.iter().find(|n| n.node_id == "def").unwrap();
        assert_eq!(with_empty_host.addr.ip().to_string(), "10.0.0.5");
    }

    #[test]
    fn full_coverage_requires_every_slot() {
        let nodes = parse_slot_map(SAMPLE, "127.0.0.1");
        // Sample only covers 0-16383 across two non-failed masters, which happens to be complete.
        assert!(covers_all_slots(&nodes));

        let partial = vec![RedisNode {
            addr: "127.0.0.1:7000".parse().unwrap(),
            node_id: "a".into(),
            master_id: None,
            slot_ranges: vec![(0, 100)],
        }];
        assert!(!covers_all_slots(&partial));
    }

    #[test]
    fn replace_map_reports_dropped_addresses() {
        let mut map = SlotMap::new();
        let first = vec![RedisNode {
            addr: "127.0.0.1:7000".parse().unwrap(),
            node_id: "a".into(),
            master_id: None,
            slot_ranges: vec![(0, 16383)],
        }];
        map.replace_map(&first);
        assert!(map.full_coverage());

        let second = vec![RedisNode {
            addr: "127.0.0.1:7001".parse().unwrap(),
            node_id: "b".into(),
            master_id: None,
            slot_ranges: vec![(0, 16383)],
        }];
        let dropped = map.replace_map(&second);
        assert_eq!(dropped, ["127.0.0.1:7000".parse().unwrap()].into_iter().collect());
    }

    #[test]
    fn read_slave_mode_routes_to_the_replica_when_one_is_known() {
        let mut map = SlotMap::with_read_slave(true);
        let nodes = vec![
            RedisNode {
                addr: "127.0.0.1:7000".parse().unwrap(),
                node_id: "master".into(),
                master_id: None,
                slot_ranges: vec![(0, 16383)],
            },
            RedisNode {
                addr: "127.0.0.1:7001".parse().unwrap(),
                node_id: "replica".into(),
                master_id: Some("master".into()),
                slot_ranges: vec![],
            },
        ];
        map.replace_map(&nodes);

        assert_eq!(map.get(0), Some("127.0.0.1:7001".parse().unwrap()));
    }

    #[test]
    fn read_slave_filter_prefers_a_replica_matching_the_host_prefix() {
        let mut map = SlotMap::with_read_slave_filter(true, "10.0.1.".to_string());
        let nodes = vec![
            RedisNode {
                addr: "127.0.0.1:7000".parse().unwrap(),
                node_id: "master".into(),
                master_id: None,
                slot_ranges: vec![(0, 16383)],
            },
            RedisNode {
                addr: "10.0.2.9:7001".parse().unwrap(),
                node_id: "replica-other-dc".into(),
                master_id: Some("master".into()),
                slot_ranges: vec![],
            },
            RedisNode {
                addr: "10.0.1.5:7001".parse().unwrap(),
                node_id: "replica-preferred".into(),
                master_id: Some("master".into()),
                slot_ranges: vec![],
            },
        ];
        map.replace_map(&nodes);

        assert_eq!(map.get(0), Some("10.0.1.5:7001".parse().unwrap()));
    }

    #[test]
    fn read_slave_filter_preferred_replica_is_not_evicted_by_a_later_non_preferred_one() {
        let mut map = SlotMap::with_read_slave_filter(true, "10.0.1.".to_string());
        let nodes = vec![
            RedisNode {
                addr: "127.0.0.1:7000".parse().unwrap(),
                node_id: "master".into(),
                master_id: None,
                slot_ranges: vec![(0, 16383)],
            },
            RedisNode {
                addr: "10.0.1.5:7001".parse().unwrap(),
                node_id: "replica-preferred".into(),
                master_id: Some("master".into()),
                slot_ranges: vec![],
            },
            RedisNode {
                addr: "10.0.2.9:7001".parse().unwrap(),
                node_id: "replica-other-dc".into(),
                master_id: Some("master".into()),
                slot_ranges: vec![],
            },
        ];
        map.replace_map(&nodes);

        assert_eq!(map.get(0), Some("10.0.1.5:7001".parse().unwrap()));
    }

    #[test]
    fn non_read_slave_mode_ignores_replicas() {
        let mut map = SlotMap::new();
        let nodes = vec![
            RedisNode {
                addr: "127.0.0.1:7000".parse().unwrap(),
                node_id: "master".into(),
                master_id: None,
                slot_ranges: vec![(0, 16383)],
            },
            RedisNode {
                addr: "127.0.0.1:7001".parse().unwrap(),
                node_id: "replica".into(),
                master_id: Some("master".into()),
                slot_ranges: vec![],
            },
        ];
        map.replace_map(&nodes);

        assert_eq!(map.get(0), Some("127.0.0.1:7000".parse().unwrap()));
    }
}
