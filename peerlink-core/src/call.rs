//! Call negotiation state and local media selection.

use crate::store::CallRole;

/// Media picker choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaSource {
    AudioOnly,
    Screen,
    FrontCamera,
    BackCamera,
    Cancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facing {
    User,
    Environment,
}

/// What the host should ask the media devices for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    /// Capture the display instead of a camera.
    pub display: bool,
    pub facing: Option<Facing>,
    pub frame_rate: u32,
    pub max_width: u32,
    pub max_height: u32,
}

impl MediaSource {
    /// Constraints for this source; `None` for [`MediaSource::Cancel`].
    pub fn constraints(self) -> Option<MediaConstraints> {
        let base = MediaConstraints {
            audio: true,
            video: true,
            display: false,
            facing: None,
            frame_rate: 20,
            max_width: 1080,
            max_height: 1080,
        };
        match self {
            MediaSource::AudioOnly => Some(MediaConstraints {
                video: false,
                ..base
            }),
            MediaSource::Screen => Some(MediaConstraints {
                display: true,
                ..base
            }),
            MediaSource::FrontCamera => Some(MediaConstraints {
                facing: Some(Facing::User),
                ..base
            }),
            MediaSource::BackCamera => Some(MediaConstraints {
                facing: Some(Facing::Environment),
                ..base
            }),
            MediaSource::Cancel => None,
        }
    }
}

/// Ephemeral state of one call. The host owns the actual streams and connection; this
/// tracks which of them exist so teardown knows what to release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSession {
    pub role: CallRole,
    pub local_stream: bool,
    pub remote_stream: bool,
    /// A media connection handle exists (placed, or offered by the peer).
    pub media_connection: bool,
}

impl CallSession {
    pub fn requested() -> Self {
        Self {
            role: CallRole::Requestor,
            local_stream: false,
            remote_stream: false,
            media_connection: false,
        }
    }

    /// The peer offered a call; its media connection is waiting for an answer.
    pub fn offered() -> Self {
        Self {
            role: CallRole::Grantor,
            local_stream: false,
            remote_stream: false,
            media_connection: true,
        }
    }
}
