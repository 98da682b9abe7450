use std::{fmt, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcConfiguration {
    pub ice_servers: Vec<IceServer>,
}

impl Default for RtcConfiguration {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|url| IceServer::stun(*url)).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_m_line_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CameraFacing {
    #[default]
    Front,
    Back,
}

impl CameraFacing {
    pub fn flipped(self) -> Self {
        match self {
            CameraFacing::Front => CameraFacing::Back,
            CameraFacing::Back => CameraFacing::Front,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub facing: CameraFacing,
}

impl MediaConstraints {
    pub fn voice() -> Self {
        Self {
            audio: true,
            video: false,
            facing: CameraFacing::Front,
        }
    }

    pub fn video() -> Self {
        Self {
            audio: true,
            video: true,
            facing: CameraFacing::Front,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("media permission denied: {0}")]
    PermissionDenied(String),
    #[error("media device unavailable: {0}")]
    Unavailable(String),
}

/// A platform media track; `stop` releases the underlying device.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    fn stop(&self);
}

#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    tracks: Vec<Arc<dyn MediaTrack>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<dyn MediaTrack>>) -> Self {
        let mut stream = Self::default();
        for track in tracks {
            stream.add_track(track);
        }
        stream
    }

    /// Returns false when a track with the same id is already present.
    pub fn add_track(&mut self, track: Arc<dyn MediaTrack>) -> bool {
        if self.tracks.iter().any(|existing| existing.id() == track.id()) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &Arc<dyn MediaTrack>> {
        self.tracks.iter().filter(move |track| track.kind() == kind)
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    LocalIceCandidate(IceCandidate),
    RemoteTrack(Arc<dyn MediaTrack>),
    StateChanged(PeerConnectionState),
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> anyhow::Result<()>;
    async fn set_remote_description(&self, description: SessionDescription)
        -> anyhow::Result<()>;
    /// Rejected by implementations when no remote description is set yet.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;
    fn add_track(&self, track: Arc<dyn MediaTrack>) -> anyhow::Result<()>;
    fn close(&self);
    fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, config: RtcConfiguration) -> anyhow::Result<Arc<dyn PeerConnection>>;
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaError>;
    async fn switch_camera(
        &self,
        track: &Arc<dyn MediaTrack>,
        facing: CameraFacing,
    ) -> Result<(), MediaError>;
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[derive(Debug)]
    struct StubTrack {
        id: String,
        kind: TrackKind,
        stopped: AtomicBool,
    }

    impl MediaTrack for StubTrack {
        fn id(&self) -> &str {
            &self.id
        }
        fn kind(&self) -> TrackKind {
            self.kind
        }
        fn set_enabled(&self, _enabled: bool) {}
        fn is_enabled(&self) -> bool {
            true
        }
        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
        }
    }

    fn track(id: &str, kind: TrackKind) -> Arc<StubTrack> {
        Arc::new(StubTrack {
            id: id.into(),
            kind,
            stopped: AtomicBool::new(false),
        })
    }

    #[test]
    fn stream_ignores_duplicate_track_ids() {
        let audio = track("a1", TrackKind::Audio);
        let mut stream = MediaStream::default();
        assert!(stream.add_track(audio.clone()));
        assert!(!stream.add_track(track("a1", TrackKind::Audio)));
        assert!(stream.add_track(track("v1", TrackKind::Video)));
        assert_eq!(stream.tracks().len(), 2);
        assert_eq!(stream.tracks_of(TrackKind::Video).count(), 1);

        stream.stop_all();
        assert!(audio.stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn default_configuration_uses_two_public_stun_servers() {
        let config = RtcConfiguration::default();
        assert_eq!(config.ice_servers.len(), 2);
        assert!(config
            .ice_servers
            .iter()
            .all(|server| server.urls[0].starts_with("stun:")));
    }
}
