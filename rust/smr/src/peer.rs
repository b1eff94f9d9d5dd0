//! Endpoint-local table of peers we exchange commands with.

use crate::error::SmrError;
use crate::region::SmrRegion;

/// A peer's region and the id it knows us by.
#[derive(Clone)]
pub struct Peer {
    pub region: SmrRegion,
    /// Our id in the peer's own map. Written into every command we send so
    /// the peer can resolve us.
    pub remote_id: u32,
}

impl Peer {
    #[inline]
    pub fn pid(&self) -> i32 {
        self.region.pid()
    }

    #[inline]
    pub fn name(&self) -> &str {
        self.region.name()
    }
}

#[derive(Default)]
pub struct PeerMap {
    peers: Vec<Option<Peer>>,
}

impl PeerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lowest unused id.
    pub fn next_id(&self) -> u32 {
        self.peers
            .iter()
            .position(Option::is_none)
            .unwrap_or(self.peers.len()) as u32
    }

    pub fn insert(&mut self, id: u32, peer: Peer) {
        let idx = id as usize;
        if self.peers.len() <= idx {
            self.peers.resize_with(idx + 1, || None);
        }
        self.peers[idx] = Some(peer);
    }

    pub fn get(&self, id: u32) -> Result<&Peer, SmrError> {
        self.peers
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or(SmrError::NoPeer(id))
    }

    pub fn remove(&mut self, id: u32) -> Option<Peer> {
        self.peers.get_mut(id as usize)?.take()
    }

    pub fn len(&self) -> usize {
        self.peers.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SmrConfig;

    fn region(name: &str) -> SmrRegion {
        let cfg = SmrConfig {
            cmd_queue_size: 4,
            resp_queue_size: 4,
            inject_count: 1,
            ..SmrConfig::default()
        };
        SmrRegion::create(name, &cfg).unwrap()
    }

    #[test]
    fn ids_are_reused_after_remove() {
        let mut map = PeerMap::new();
        assert_eq!(map.next_id(), 0);
        map.insert(0, Peer { region: region("a"), remote_id: 3 });
        map.insert(1, Peer { region: region("b"), remote_id: 4 });
        assert_eq!(map.next_id(), 2);
        assert_eq!(map.get(1).unwrap().name(), "b");

        assert!(map.remove(0).is_some());
        assert_eq!(map.next_id(), 0);
        assert_eq!(map.get(0).err(), Some(SmrError::NoPeer(0)));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn sparse_insert_grows_table() {
        let mut map = PeerMap::new();
        map.insert(5, Peer { region: region("far"), remote_id: 0 });
        assert_eq!(map.get(5).unwrap().remote_id, 0);
        assert!(map.get(4).is_err());
        assert_eq!(map.next_id(), 0);
    }
}
