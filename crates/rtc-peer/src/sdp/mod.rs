//! Session Description Protocol codec

mod description;
mod document;

pub use description::{SdpType, SessionDescription};
pub use document::{MediaDescription, Origin, SdpDocument, SdpLine};
