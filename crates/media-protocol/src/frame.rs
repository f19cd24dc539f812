//! Media frame types.

use bytes::Bytes;
use uuid::Uuid;

/// Kind of media carried by a frame.
///
/// Voice audio and screen-share video are routed independently: audio goes to
/// every other voice member, screen video only to explicit subscribers of the
/// active screen-share publisher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Microphone audio
    Audio = 0x00,
    /// Screen-share video keyframe
    ScreenKey = 0x01,
    /// Screen-share video delta frame
    ScreenDelta = 0x02,
}

impl FrameKind {
    /// Parse a kind from its wire byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Audio),
            0x01 => Some(Self::ScreenKey),
            0x02 => Some(Self::ScreenDelta),
            _ => None,
        }
    }

    /// Whether this frame belongs to the screen-share stream.
    #[must_use]
    pub const fn is_screen(self) -> bool {
        matches!(self, Self::ScreenKey | Self::ScreenDelta)
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameFlags {
    /// End of frame marker
    pub end_of_frame: bool,
    /// Frame can be discarded without affecting others
    pub discardable: bool,
}

impl FrameFlags {
    /// Convert flags to u16
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        let mut flags = 0u16;
        if self.end_of_frame {
            flags |= 0x0001;
        }
        if self.discardable {
            flags |= 0x0002;
        }
        flags
    }

    /// Parse flags from u16
    #[must_use]
    pub const fn from_u16(value: u16) -> Self {
        Self {
            end_of_frame: (value & 0x0001) != 0,
            discardable: (value & 0x0002) != 0,
        }
    }
}

/// A media frame with routing metadata.
///
/// Frame format (38 bytes header):
/// - Version: 1 byte
/// - Kind: 1 byte
/// - Publisher: 16 bytes (user UUID, overwritten by the server on ingest)
/// - Timestamp: 8 bytes (microseconds since epoch)
/// - Sequence Number: 4 bytes
/// - Payload Length: 4 bytes
/// - Flags: 2 bytes
/// - Reserved: 2 bytes
/// - Payload: variable (opaque, already encoded by the client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFrame {
    /// Protocol version (currently 1)
    pub version: u8,
    /// Kind of media
    pub kind: FrameKind,
    /// User who published this frame
    pub publisher: Uuid,
    /// Timestamp in microseconds since epoch
    pub timestamp: u64,
    /// Per-publisher sequence number
    pub sequence: u32,
    /// Frame flags
    pub flags: FrameFlags,
    /// Frame payload
    pub payload: Bytes,
}

impl MediaFrame {
    /// Header size in bytes
    pub const HEADER_SIZE: usize = 38;

    /// Current protocol version
    pub const VERSION: u8 = 1;

    /// Largest payload accepted on ingest (256 KiB).
    pub const MAX_PAYLOAD_SIZE: usize = 256 * 1024;

    /// Build a version-1 frame.
    #[must_use]
    pub fn new(kind: FrameKind, publisher: Uuid, sequence: u32, payload: Bytes) -> Self {
        Self {
            version: Self::VERSION,
            kind,
            publisher,
            timestamp: 0,
            sequence,
            flags: FrameFlags::default(),
            payload,
        }
    }

    /// Replace the publisher with the authenticated sender.
    ///
    /// Clients fill the publisher field themselves, so the SFU stamps the
    /// identity it authenticated before forwarding anything.
    #[must_use]
    pub fn stamped(mut self, publisher: Uuid) -> Self {
        self.publisher = publisher;
        self
    }
}
