//! Mesh adjacency state and route computation.
//!
//! Every node keeps a `meshState`: a mapping from host to that host's last
//! announced neighbor list. Routing runs breadth-first over this view, so a
//! route is only as fresh as the gossip that built it.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

/// Adjacency view gossiped between nodes.
#[derive(Debug, Default, Clone)]
pub struct MeshState {
    adjacency: HashMap<String, Vec<String>>,
}

impl MeshState {
    /// Replace one host's announced neighbor list.
    pub fn set(&mut self, host: &str, neighbors: Vec<String>) {
        self.adjacency.insert(host.to_string(), neighbors);
    }

    /// Forget a host entirely (operator-driven; gossip normally ages rows out).
    pub fn remove(&mut self, host: &str) {
        self.adjacency.remove(host);
        for neighbors in self.adjacency.values_mut() {
            neighbors.retain(|n| n != host);
        }
    }

    /// The last announced neighbor list for `host`.
    pub fn neighbors(&self, host: &str) -> &[String] {
        self.adjacency.get(host).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every host reachable from `from`, excluding `from` itself.
    ///
    /// Walks announced edges in both directions: an edge is usable as soon
    /// as either endpoint has announced it.
    pub fn reachable(&self, from: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::new();
        seen.insert(from.to_string());
        queue.push_back(from.to_string());

        while let Some(host) = queue.pop_front() {
            for next in self.edges_of(&host) {
                if seen.insert(next.clone()) {
                    queue.push_back(next);
                }
            }
        }

        seen.remove(from);
        let mut hosts: Vec<String> = seen.into_iter().collect();
        hosts.sort();
        hosts
    }

    /// First hop of a shortest path `from` → `to`, or `None` if unroutable.
    pub fn next_hop(&self, from: &str, to: &str) -> Option<String> {
        if from == to {
            return None;
        }

        let mut parent: HashMap<String, String> = HashMap::new();
        let mut queue = VecDeque::new();
        parent.insert(from.to_string(), from.to_string());
        queue.push_back(from.to_string());

        while let Some(host) = queue.pop_front() {
            if host == to {
                // Walk back to the hop adjacent to `from`.
                let mut hop = to.to_string();
                while parent[&hop] != from {
                    hop = parent[&hop].clone();
                }
                return Some(hop);
            }
            for next in self.edges_of(&host) {
                if !parent.contains_key(&next) {
                    parent.insert(next.clone(), host.clone());
                    queue.push_back(next);
                }
            }
        }
        None
    }

    /// Hosts known to the state but not in `peered`, candidates for dialing.
    pub fn dial_candidates(&self, own_host: &str, peered: &HashSet<String>) -> Vec<String> {
        let mut hosts: HashSet<String> = self.adjacency.keys().cloned().collect();
        for neighbors in self.adjacency.values() {
            hosts.extend(neighbors.iter().cloned());
        }
        hosts.remove(own_host);
        let mut candidates: Vec<String> = hosts
            .into_iter()
            .filter(|h| !peered.contains(h))
            .collect();
        candidates.sort();
        candidates
    }

    /// Sorted copy of the full adjacency view, for `mesh list`.
    pub fn dump(&self) -> BTreeMap<String, Vec<String>> {
        let mut out = BTreeMap::new();
        for (host, neighbors) in &self.adjacency {
            let mut sorted = neighbors.clone();
            sorted.sort();
            out.insert(host.clone(), sorted);
        }
        out
    }

    /// Number of hosts with an adjacency row.
    pub fn len(&self) -> usize {
        self.adjacency.len()
    }

    /// Whether no host has announced yet.
    pub fn is_empty(&self) -> bool {
        self.adjacency.is_empty()
    }

    fn edges_of(&self, host: &str) -> Vec<String> {
        let mut edges: Vec<String> = self.neighbors(host).to_vec();
        // Reverse edges: hosts that announced `host` as a neighbor.
        for (other, neighbors) in &self.adjacency {
            if neighbors.iter().any(|n| n == host) && !edges.contains(other) {
                edges.push(other.clone());
            }
        }
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line_topology() -> MeshState {
        // a - b - c - d
        let mut state = MeshState::default();
        state.set("a", vec!["b".into()]);
        state.set("b", vec!["a".into(), "c".into()]);
        state.set("c", vec!["b".into(), "d".into()]);
        state.set("d", vec!["c".into()]);
        state
    }

    #[test]
    fn reachable_covers_whole_line() {
        let state = line_topology();
        assert_eq!(state.reachable("a"), vec!["b", "c", "d"]);
        assert_eq!(state.reachable("c"), vec!["a", "b", "d"]);
    }

    #[test]
    fn next_hop_walks_shortest_path() {
        let state = line_topology();
        assert_eq!(state.next_hop("a", "d").unwrap(), "b");
        assert_eq!(state.next_hop("a", "b").unwrap(), "b");
        assert_eq!(state.next_hop("d", "a").unwrap(), "c");
    }

    #[test]
    fn unroutable_is_none() {
        let mut state = line_topology();
        state.set("x", vec![]);
        assert!(state.next_hop("a", "x").is_none());
        assert!(state.next_hop("a", "unknown").is_none());
    }

    #[test]
    fn one_sided_announcement_still_routes() {
        // Only b has announced the a-b edge so far.
        let mut state = MeshState::default();
        state.set("b", vec!["a".into()]);
        assert_eq!(state.next_hop("a", "b").unwrap(), "b");
        assert_eq!(state.reachable("a"), vec!["b"]);
    }

    #[test]
    fn dial_candidates_excludes_self_and_peered() {
        let state = line_topology();
        let peered: std::collections::HashSet<String> = ["b".to_string()].into();
        assert_eq!(state.dial_candidates("a", &peered), vec!["c", "d"]);
    }

    #[test]
    fn remove_prunes_both_directions() {
        let mut state = line_topology();
        state.remove("b");
        assert!(state.next_hop("a", "c").is_none());
        assert!(state.neighbors("a").is_empty() || !state.neighbors("a").contains(&"b".to_string()));
    }
}
