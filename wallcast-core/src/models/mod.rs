pub mod asset;
pub mod device;
pub mod id;
pub mod playback;
pub mod status;

pub use asset::{mime_for_name, Asset, MediaInfo};
pub use device::{Capabilities, Device};
pub use id::{DeviceId, SessionId};
pub use playback::{
    Lifecycle, MediaKind, PlaybackKind, PlaybackState, AUDIO_EXTENSIONS, IMAGE_EXTENSIONS,
    VIDEO_EXTENSIONS,
};
pub use status::{ProcessingPhase, ProcessingStatus};
