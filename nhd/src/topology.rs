// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/

//! The discovered-link table and all-pairs route computation.
//!
//! Links are learned from discovery frames (see `packet::disco`) and
//! forgotten when they go unseen for the link TTL.  Every change feeds
//! a Floyd–Warshall pass whose per-switch rows are pushed down into the
//! physical switches, which diff them against the rules currently
//! installed.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use crate::types::SwitchId;

/// The distance meaning "unreachable".  Chosen so it survives being
/// added to itself without overflow while exceeding any real path
/// length.
pub const INFINITE_DIST: u32 = 10_000;

/// One side of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Endpoint {
    pub switch: SwitchId,
    pub port: u32,
}

/// An unordered pair of endpoints.  Construction normalizes the order
/// so each physical link has exactly one table entry no matter which
/// side discovered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LinkKey {
    a: Endpoint,
    b: Endpoint,
}

impl LinkKey {
    pub fn new(x: Endpoint, y: Endpoint) -> LinkKey {
        if x <= y {
            LinkKey { a: x, b: y }
        } else {
            LinkKey { a: y, b: x }
        }
    }

    pub fn endpoints(&self) -> (Endpoint, Endpoint) {
        (self.a, self.b)
    }

    pub fn touches(&self, id: SwitchId) -> bool {
        self.a.switch == id || self.b.switch == id
    }
}

/// The set of currently known links, with the time each was last
/// confirmed by a discovery frame.
#[derive(Default)]
pub struct LinkMap {
    links: BTreeMap<LinkKey, i64>,
}

impl LinkMap {
    pub fn new() -> LinkMap {
        LinkMap::default()
    }

    /// Record a discovery observation.  Returns true when this created
    /// a link the table did not previously hold, i.e. when the graph
    /// changed.
    pub fn upsert(&mut self, x: Endpoint, y: Endpoint, now_ms: i64) -> bool {
        self.links.insert(LinkKey::new(x, y), now_ms).is_none()
    }

    /// Drop links not confirmed within `ttl_ms`.  Returns the expired
    /// keys so the caller can log them and recompute routes.
    pub fn expire(&mut self, ttl_ms: i64, now_ms: i64) -> Vec<LinkKey> {
        let dead: Vec<LinkKey> = self
            .links
            .iter()
            .filter(|(_, seen)| now_ms - **seen > ttl_ms)
            .map(|(k, _)| *k)
            .collect();
        for k in &dead {
            self.links.remove(k);
        }
        dead
    }

    /// Drop every link touching a switch, both endpoints at once.
    /// Returns true if anything was removed.
    pub fn remove_switch(&mut self, id: SwitchId) -> bool {
        let before = self.links.len();
        self.links.retain(|k, _| !k.touches(id));
        self.links.len() != before
    }

    /// Drop the link on a specific port, if one is known.
    pub fn remove_port(&mut self, ep: Endpoint) -> bool {
        let before = self.links.len();
        self.links.retain(|k, _| k.a != ep && k.b != ep);
        self.links.len() != before
    }

    /// Does this port terminate a known link?
    pub fn has_link(&self, ep: Endpoint) -> bool {
        self.links.keys().any(|k| k.a == ep || k.b == ep)
    }

    /// All (local port, neighbor switch) pairs for one switch.
    pub fn neighbors(&self, id: SwitchId) -> Vec<(u32, SwitchId)> {
        let mut v = Vec::new();
        for k in self.links.keys() {
            if k.a.switch == id {
                v.push((k.a.port, k.b.switch));
            } else if k.b.switch == id {
                v.push((k.b.port, k.a.switch));
            }
        }
        v
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// The output of one all-pairs shortest-path run.
#[derive(Debug, Default)]
pub struct RouteTable {
    dist: BTreeMap<(SwitchId, SwitchId), u32>,
    next: BTreeMap<(SwitchId, SwitchId), u32>,
}

impl RouteTable {
    pub fn dist(&self, from: SwitchId, to: SwitchId) -> u32 {
        if from == to {
            return 0;
        }
        *self.dist.get(&(from, to)).unwrap_or(&INFINITE_DIST)
    }

    /// The port on `from` leading toward `to`, if a path exists.
    pub fn next_hop(&self, from: SwitchId, to: SwitchId) -> Option<u32> {
        self.next.get(&(from, to)).copied()
    }

    pub fn reachable(&self, from: SwitchId, to: SwitchId) -> bool {
        self.dist(from, to) < INFINITE_DIST
    }

    /// The (dist, next) rows for one switch, keyed by destination.
    pub fn rows_for(
        &self,
        from: SwitchId,
    ) -> (BTreeMap<SwitchId, u32>, BTreeMap<SwitchId, u32>) {
        let mut dist = BTreeMap::new();
        let mut next = BTreeMap::new();
        for ((a, b), d) in &self.dist {
            if *a == from {
                dist.insert(*b, *d);
            }
        }
        for ((a, b), p) in &self.next {
            if *a == from {
                next.insert(*b, *p);
            }
        }
        (dist, next)
    }
}

/// Run Floyd–Warshall over the current switch set and link table.
pub fn compute_routes(
    switches: &BTreeSet<SwitchId>,
    links: &LinkMap,
) -> RouteTable {
    let mut table = RouteTable::default();

    // Seed with the single-hop links.
    for id in switches {
        for (port, other) in links.neighbors(*id) {
            if !switches.contains(&other) {
                continue;
            }
            table.dist.insert((*id, other), 1);
            table.next.insert((*id, other), port);
        }
    }

    for k in switches {
        for i in switches {
            if i == k {
                continue;
            }
            let d_ik = table.dist(*i, *k);
            if d_ik >= INFINITE_DIST {
                continue;
            }
            for j in switches {
                if j == i || j == k {
                    continue;
                }
                let d_kj = table.dist(*k, *j);
                if d_kj >= INFINITE_DIST {
                    continue;
                }
                if d_ik + d_kj < table.dist(*i, *j) {
                    table.dist.insert((*i, *j), d_ik + d_kj);
                    // First hop toward j is the first hop toward k.
                    if let Some(port) = table.next_hop(*i, *k) {
                        table.next.insert((*i, *j), port);
                    }
                }
            }
        }
    }

    table
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(sw: u16, port: u32) -> Endpoint {
        Endpoint {
            switch: SwitchId(sw),
            port,
        }
    }

    fn switch_set(ids: &[u16]) -> BTreeSet<SwitchId> {
        ids.iter().map(|i| SwitchId(*i)).collect()
    }

    #[test]
    fn test_two_switches_one_link() {
        let mut links = LinkMap::new();
        assert!(links.upsert(ep(1, 1), ep(2, 1), 0));
        // A repeat observation refreshes but does not change the graph.
        assert!(!links.upsert(ep(2, 1), ep(1, 1), 10));
        assert_eq!(links.len(), 1);

        let routes = compute_routes(&switch_set(&[1, 2]), &links);
        assert_eq!(routes.dist(SwitchId(1), SwitchId(2)), 1);
        assert_eq!(routes.next_hop(SwitchId(1), SwitchId(2)), Some(1));
        assert_eq!(routes.next_hop(SwitchId(2), SwitchId(1)), Some(1));
    }

    #[test]
    fn test_multi_hop_chain() {
        let mut links = LinkMap::new();
        links.upsert(ep(1, 10), ep(2, 20), 0);
        links.upsert(ep(2, 21), ep(3, 30), 0);

        let routes = compute_routes(&switch_set(&[1, 2, 3]), &links);
        assert_eq!(routes.dist(SwitchId(1), SwitchId(3)), 2);
        // Traffic from 1 to 3 leaves via the port toward 2.
        assert_eq!(routes.next_hop(SwitchId(1), SwitchId(3)), Some(10));
        assert_eq!(routes.next_hop(SwitchId(2), SwitchId(3)), Some(21));
        assert_eq!(routes.next_hop(SwitchId(3), SwitchId(1)), Some(30));
    }

    #[test]
    fn test_partition_is_infinite() {
        let mut links = LinkMap::new();
        links.upsert(ep(1, 1), ep(2, 1), 0);

        let routes = compute_routes(&switch_set(&[1, 2, 3]), &links);
        assert!(routes.reachable(SwitchId(1), SwitchId(2)));
        assert!(!routes.reachable(SwitchId(1), SwitchId(3)));
        assert_eq!(routes.dist(SwitchId(2), SwitchId(3)), INFINITE_DIST);
        assert_eq!(routes.next_hop(SwitchId(1), SwitchId(3)), None);
    }

    #[test]
    fn test_shortest_path_wins() {
        // A triangle with a detour: 1-2 direct and 1-3-2.
        let mut links = LinkMap::new();
        links.upsert(ep(1, 1), ep(2, 1), 0);
        links.upsert(ep(1, 2), ep(3, 1), 0);
        links.upsert(ep(3, 2), ep(2, 2), 0);

        let routes = compute_routes(&switch_set(&[1, 2, 3]), &links);
        assert_eq!(routes.dist(SwitchId(1), SwitchId(2)), 1);
        assert_eq!(routes.next_hop(SwitchId(1), SwitchId(2)), Some(1));
    }

    #[test]
    fn test_expiry() {
        let mut links = LinkMap::new();
        links.upsert(ep(1, 1), ep(2, 1), 0);
        links.upsert(ep(1, 2), ep(3, 1), 2500);

        // Nothing is old enough yet.
        assert!(links.expire(3000, 2600).is_empty());

        let dead = links.expire(3000, 3500);
        assert_eq!(dead.len(), 1);
        assert!(dead[0].touches(SwitchId(2)));
        assert_eq!(links.len(), 1);
    }

    #[test]
    fn test_remove_switch_removes_both_sides() {
        let mut links = LinkMap::new();
        links.upsert(ep(1, 1), ep(2, 1), 0);
        links.upsert(ep(2, 2), ep(3, 1), 0);

        assert!(links.remove_switch(SwitchId(2)));
        assert!(links.is_empty());
        assert!(!links.has_link(ep(1, 1)));
        assert!(!links.has_link(ep(3, 1)));
    }
}
