//! Ingress normalization: wire protocols in, [crate::frame::Frame]s out.

#[cfg(feature = "rtmp")]
pub mod rtmp;
#[cfg(feature = "whip")]
pub mod whip;
