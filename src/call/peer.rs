//! Per-peer connection records

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::media::RemoteStream;
use crate::rtc::{PeerLink, RemoteTrack};
use crate::signaling::PeerId;

/// Connection state for one remote participant
pub struct PeerConnectionRecord {
    pub peer_id: PeerId,
    /// Identifies this connection instance among records for the same peer
    pub link_id: u64,
    pub link: Arc<dyn PeerLink>,
    /// An offer is being produced right now
    pub making_offer: bool,
    /// Remote camera state; assumed on until told otherwise
    pub camera_on: bool,
}

impl PeerConnectionRecord {
    pub fn new(peer_id: PeerId, link_id: u64, link: Arc<dyn PeerLink>) -> Self {
        Self {
            peer_id,
            link_id,
            link,
            making_offer: false,
            camera_on: true,
        }
    }
}

impl std::fmt::Debug for PeerConnectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConnectionRecord")
            .field("peer_id", &self.peer_id)
            .field("link_id", &self.link_id)
            .field("signaling_state", &self.link.signaling_state())
            .field("making_offer", &self.making_offer)
            .field("camera_on", &self.camera_on)
            .finish()
    }
}

/// Records and remote streams, keyed by peer id
///
/// A remote stream only exists while its peer's record does.
#[derive(Debug, Default)]
pub struct PeerTable {
    records: BTreeMap<PeerId, PeerConnectionRecord>,
    streams: BTreeMap<PeerId, RemoteStream>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.records.contains_key(peer_id)
    }

    /// Whether `link_id` is the live connection for `peer_id`
    pub fn is_current(&self, peer_id: &PeerId, link_id: u64) -> bool {
        self.records
            .get(peer_id)
            .map(|record| record.link_id == link_id)
            .unwrap_or(false)
    }

    pub fn get_mut(&mut self, peer_id: &PeerId) -> Option<&mut PeerConnectionRecord> {
        self.records.get_mut(peer_id)
    }

    /// Insert a record; an existing record for the same peer is kept
    ///
    /// Returns `false` (and drops `record`) if one already existed.
    pub fn insert(&mut self, record: PeerConnectionRecord) -> bool {
        if self.records.contains_key(&record.peer_id) {
            return false;
        }
        self.records.insert(record.peer_id.clone(), record);
        true
    }

    /// Remove a peer's record together with its stream
    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerConnectionRecord> {
        self.streams.remove(peer_id);
        self.records.remove(peer_id)
    }

    /// Remove every record and stream
    pub fn drain(&mut self) -> Vec<PeerConnectionRecord> {
        self.streams.clear();
        std::mem::take(&mut self.records).into_values().collect()
    }

    pub fn records_mut(&mut self) -> impl Iterator<Item = &mut PeerConnectionRecord> {
        self.records.values_mut()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.records.keys().cloned().collect()
    }

    /// Record a remote track for `peer_id`
    ///
    /// Returns the stream id when this is the first track of the peer's
    /// stream. Tracks for peers without a record are ignored.
    pub fn add_remote_track(&mut self, peer_id: &PeerId, remote: RemoteTrack) -> Option<String> {
        if !self.records.contains_key(peer_id) {
            return None;
        }
        match self.streams.get_mut(peer_id) {
            Some(stream) => {
                stream.add_track(remote.track);
                None
            }
            None => {
                let mut stream = RemoteStream::new(remote.stream_id.clone());
                stream.add_track(remote.track);
                self.streams.insert(peer_id.clone(), stream);
                Some(remote.stream_id)
            }
        }
    }

    pub fn streams(&self) -> &BTreeMap<PeerId, RemoteStream> {
        &self.streams
    }

    pub fn camera_states(&self) -> BTreeMap<PeerId, bool> {
        self.records
            .iter()
            .map(|(id, record)| (id.clone(), record.camera_on))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{RemoteTrackInfo, TrackKind};
    use crate::rtc::{LoopbackLink, PeerEventSink};
    use tokio::sync::mpsc;

    fn record(peer: &str, link_id: u64) -> PeerConnectionRecord {
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer_id = PeerId::from(peer);
        let link = Arc::new(LoopbackLink::new(
            link_id,
            PeerEventSink::new(peer_id.clone(), link_id, tx),
        ));
        PeerConnectionRecord::new(peer_id, link_id, link)
    }

    fn track(stream: &str, id: &str) -> RemoteTrack {
        RemoteTrack {
            stream_id: stream.into(),
            track: RemoteTrackInfo {
                id: id.into(),
                kind: TrackKind::Video,
            },
        }
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut table = PeerTable::new();
        assert!(table.insert(record("bbb", 1)));
        assert!(!table.insert(record("bbb", 2)));
        assert_eq!(table.len(), 1);
        assert!(table.is_current(&PeerId::from("bbb"), 1));
        assert!(!table.is_current(&PeerId::from("bbb"), 2));
    }

    #[test]
    fn test_streams_follow_records() {
        let mut table = PeerTable::new();
        let bbb = PeerId::from("bbb");

        assert_eq!(table.add_remote_track(&bbb, track("s", "t1")), None);
        assert!(table.streams().is_empty());

        table.insert(record("bbb", 1));
        assert_eq!(table.add_remote_track(&bbb, track("s", "t1")), Some("s".into()));
        assert_eq!(table.add_remote_track(&bbb, track("s", "t2")), None);
        assert_eq!(table.streams()[&bbb].tracks.len(), 2);

        table.remove(&bbb);
        assert!(table.streams().is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn test_drain_clears_everything() {
        let mut table = PeerTable::new();
        table.insert(record("bbb", 1));
        table.insert(record("ccc", 2));
        table.add_remote_track(&PeerId::from("ccc"), track("s", "t"));

        assert_eq!(table.drain().len(), 2);
        assert!(table.is_empty());
        assert!(table.streams().is_empty());
    }
}
