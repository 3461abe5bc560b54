pub mod aac;
pub mod egress;
pub mod error;
pub mod frame;
pub mod h264;
pub mod http;
pub mod hub;
pub mod ingress;
pub mod settings;
pub mod supervisor;
pub mod transcode;
