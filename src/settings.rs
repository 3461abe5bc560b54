use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtmpSettings {
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhipSettings {
    pub port: u16,
    /// "30000-30500"
    pub ice_port_range: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSettings {
    pub port: u16,
    /// When true, HLS egress writes Low-Latency fMP4 parts instead of
    /// MPEG-TS segments (see `egress::hls::fmp4`).
    pub llhls: bool,
    /// When true, HLS segment scratch directory is /tmp instead of [output_dir]
    pub disk_ram: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerSettings {
    pub mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mp4Settings {
    pub record: bool,
    pub split_interval_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EbmlSettings {
    pub record: bool,
    pub split_interval_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub rtmp: RtmpSettings,
    pub whip: WhipSettings,
    pub service: ServiceSettings,
    pub docker: DockerSettings,
    pub mp4: Mp4Settings,
    pub ebml: EbmlSettings,

    /// Where HLS segments and recordings are written
    pub output_dir: String,
}

impl Settings {
    /// Scratch directory for HLS segments, honoring [ServiceSettings::disk_ram].
    pub fn hls_scratch_dir(&self) -> String {
        if self.service.disk_ram {
            "/tmp".to_string()
        } else {
            self.output_dir.clone()
        }
    }

    /// `docker.mode`, overridable by the `DOCKER_MODE` environment variable.
    pub fn docker_mode(&self) -> bool {
        match std::env::var("DOCKER_MODE") {
            Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
            Err(_) => self.docker.mode,
        }
    }
}
