//! Supervisor (ambient): a long-lived task that drains the hub's
//! source-announcement channel and spawns one egress task per enabled
//! family for each newly-announced stream. HLS is always on; MP4/EBML are
//! gated by settings; WHEP is spawned lazily by the HTTP router on the
//! stream's first offer, since it has no independent consumer until a
//! viewer connects.

use crate::egress::hls::{self, HlsHub};
#[cfg(feature = "mp4-record")]
use crate::egress::mp4;
#[cfg(feature = "ebml-record")]
use crate::egress::webm;
#[cfg(feature = "whip")]
use crate::egress::whep::{self, WhepHub};
use crate::frame::{Codec, MediaSpec, MediaType};
use crate::hub::{Hub, Source};
use crate::settings::Settings;
use log::{info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

struct ActiveSource {
    media_specs: Vec<MediaSpec>,
    #[cfg_attr(not(feature = "whip"), allow(dead_code))]
    whep_spawned: bool,
}

/// Owns the egress pipelines' lifetimes: each task exits on its own once the
/// hub closes its subscriber channel (on `Unpublish`), so the supervisor
/// never needs to track or cancel them directly. It keeps only the bookkeeping
/// the HTTP router needs to lazily spawn WHEP.
pub struct Supervisor {
    hub: Arc<Hub>,
    hls_hub: Arc<HlsHub>,
    #[cfg(feature = "whip")]
    whep_hub: Arc<WhepHub>,
    settings: Settings,
    active: RwLock<HashMap<String, ActiveSource>>,
}

impl Supervisor {
    pub fn new(
        hub: Arc<Hub>,
        hls_hub: Arc<HlsHub>,
        #[cfg(feature = "whip")] whep_hub: Arc<WhepHub>,
        settings: Settings,
    ) -> Arc<Self> {
        Arc::new(Self {
            hub,
            hls_hub,
            #[cfg(feature = "whip")]
            whep_hub,
            settings,
            active: RwLock::new(HashMap::new()),
        })
    }

    /// Drives the announcement loop until the hub's notification channel is
    /// closed. There is meant to be exactly one of these per process; a
    /// second call observes `subscribe_sources` already taken and returns
    /// immediately.
    pub async fn run(self: Arc<Self>) {
        let Some(mut rx) = self.hub.subscribe_sources().await else {
            warn!("supervisor: source announcement channel already taken, not starting");
            return;
        };
        info!("supervisor started");
        while let Some(source) = rx.recv().await {
            self.clone().spawn_for_source(source);
        }
        info!("supervisor: source announcement channel closed, exiting");
    }

    fn spawn_for_source(self: Arc<Self>, source: Source) {
        let audio_codec = source
            .media_specs
            .iter()
            .find(|m| m.media_type == MediaType::Audio)
            .map(|m| m.codec)
            .unwrap_or(Codec::Aac);
        let stream_id = source.stream_id.clone();
        let out_dir = PathBuf::from(&self.settings.output_dir);

        let supervisor = self.clone();
        tokio::spawn(async move {
            supervisor
                .active
                .write()
                .await
                .insert(
                    stream_id.clone(),
                    ActiveSource {
                        media_specs: source.media_specs.clone(),
                        whep_spawned: false,
                    },
                );

            let hub = supervisor.hub.clone();
            let hls_hub = supervisor.hls_hub.clone();
            let llhls = supervisor.settings.service.llhls;
            tokio::spawn(hls::run(hub, hls_hub, stream_id.clone(), out_dir.clone(), audio_codec, llhls));

            #[cfg(feature = "mp4-record")]
            if supervisor.settings.mp4.record {
                let hub = supervisor.hub.clone();
                let stream_id = stream_id.clone();
                let out_dir = out_dir.clone();
                let split = Duration::from_millis(supervisor.settings.mp4.split_interval_ms.max(0) as u64);
                tokio::spawn(mp4::run(hub, stream_id, out_dir, Some(split)));
            }

            #[cfg(feature = "ebml-record")]
            if supervisor.settings.ebml.record {
                let hub = supervisor.hub.clone();
                let stream_id = stream_id.clone();
                let out_dir = out_dir.clone();
                let split = Duration::from_millis(supervisor.settings.ebml.split_interval_ms.max(0) as u64);
                tokio::spawn(webm::run(hub, stream_id, out_dir, Some(split)));
            }

            info!("supervisor spawned egress pipelines for {stream_id}");
        });
    }

    /// Spawns WHEP egress for `stream_id` on first call; a no-op on every
    /// call after. Fails if the stream isn't currently live.
    #[cfg(feature = "whip")]
    pub async fn ensure_whep(&self, stream_id: &str) -> anyhow::Result<()> {
        let mut active = self.active.write().await;
        let Some(entry) = active.get_mut(stream_id) else {
            anyhow::bail!("stream {stream_id} is not live");
        };
        if entry.whep_spawned {
            return Ok(());
        }
        entry.whep_spawned = true;
        let media_specs = entry.media_specs.clone();
        drop(active);

        let hub = self.hub.clone();
        let whep_hub = self.whep_hub.clone();
        let stream_id = stream_id.to_string();
        tokio::spawn(whep::run(hub, whep_hub, stream_id, media_specs));
        Ok(())
    }

    #[cfg(feature = "whip")]
    pub fn whep_hub(&self) -> Arc<WhepHub> {
        self.whep_hub.clone()
    }
}
