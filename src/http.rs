//! HTTP router (ambient): WHIP/WHEP signaling, HLS playlist/segment
//! serving, and a static-file fallback for `output_dir` recordings, built
//! on the same `hyper`/`hyper-util`/`http-body-util` `Service` pattern used
//! elsewhere in this crate.

#[cfg(feature = "whip")]
use crate::egress::whep;
#[cfg(feature = "rtmp")]
#[allow(unused_imports)]
use crate::hub::Hub;
#[cfg(feature = "whip")]
use crate::ingress::whip;
use crate::supervisor::Supervisor;
use anyhow::Result;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame as BodyFrame, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use log::error;
use std::future::Future;
use std::net::IpAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::time::sleep;
use tokio_util::io::ReaderStream;

/// How long the WHEP handler waits for the egress pipeline to pre-negotiate
/// local tracks after a lazy spawn, matching the WHIP ingress's own
/// track-wait deadline.
const WHEP_TRACK_WAIT: Duration = Duration::from_secs(3);
const WHEP_TRACK_POLL: Duration = Duration::from_millis(50);

type BoxResponse = Response<BoxBody<Bytes, anyhow::Error>>;

#[derive(Clone)]
pub struct HttpServer {
    supervisor: Arc<Supervisor>,
    output_dir: PathBuf,
    #[cfg(feature = "whip")]
    hub: Arc<crate::hub::Hub>,
    #[cfg(feature = "whip")]
    public_ip: Option<IpAddr>,
}

impl HttpServer {
    pub fn new(
        supervisor: Arc<Supervisor>,
        output_dir: PathBuf,
        #[cfg(feature = "whip")] hub: Arc<crate::hub::Hub>,
        #[cfg(feature = "whip")] public_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            supervisor,
            output_dir,
            #[cfg(feature = "whip")]
            hub,
            #[cfg(feature = "whip")]
            public_ip,
        }
    }
}

fn bearer_token(req: &Request<Incoming>) -> Option<String> {
    let value = req.headers().get(hyper::header::AUTHORIZATION)?.to_str().ok()?;
    value.strip_prefix("Bearer ").map(|s| s.trim().to_string())
}

fn empty(status: StatusCode) -> Result<BoxResponse> {
    Ok(Response::builder().status(status).body(BoxBody::default())?)
}

fn text(status: StatusCode, content_type: &str, body: String) -> Result<BoxResponse> {
    Ok(Response::builder()
        .status(status)
        .header("content-type", content_type)
        .header("access-control-allow-origin", "*")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())?)
}

/// `.m3u8` playlists are cheap to regenerate and change every segment, so
/// they get a 1s cache; `.ts`/`.mp4`/`.webm` segments are immutable once
/// written.
fn cache_control_for(path: &str) -> &'static str {
    if path.ends_with(".m3u8") {
        "max-age=1"
    } else {
        "max-age=3600"
    }
}

async fn serve_file(path: PathBuf) -> Result<BoxResponse> {
    if !path.exists() {
        return empty(StatusCode::NOT_FOUND);
    }
    let cache_control = cache_control_for(&path.to_string_lossy());
    let f = File::open(&path).await?;
    let stream = ReaderStream::new(f);
    let body = StreamBody::new(stream.map_ok(BodyFrame::data).map_err(anyhow::Error::new)).boxed();
    Ok(Response::builder()
        .header("server", "live-relay-core")
        .header("access-control-allow-origin", "*")
        .header("access-control-allow-headers", "*")
        .header("access-control-allow-methods", "HEAD, GET")
        .header("cache-control", cache_control)
        .body(body)?)
}

impl Service<Request<Incoming>> for HttpServer {
    type Response = BoxResponse;
    type Error = anyhow::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let segments: Vec<String> = path.trim_start_matches('/').split('/').map(str::to_string).collect();
        let this = self.clone();

        match (method, segments.as_slice()) {
            #[cfg(feature = "whip")]
            (Method::POST, [w]) if w == "whip" => {
                Box::pin(async move {
                    let Some(stream_id) = bearer_token(&req) else {
                        return text(StatusCode::UNAUTHORIZED, "text/plain", "missing bearer token".to_string());
                    };
                    let offer_sdp = String::from_utf8(req.collect().await?.to_bytes().to_vec())?;
                    match whip::handle_offer(this.hub.clone(), stream_id, offer_sdp, this.public_ip).await {
                        Ok(answer_sdp) => Ok(Response::builder()
                            .status(StatusCode::CREATED)
                            .header("content-type", "application/sdp")
                            .header("location", "/whip")
                            .body(Full::new(Bytes::from(answer_sdp)).map_err(|e| match e {}).boxed())?),
                        Err(e) => {
                            error!("whip offer failed: {e}");
                            text(StatusCode::BAD_REQUEST, "text/plain", e.to_string())
                        }
                    }
                })
            }
            #[cfg(feature = "whip")]
            (Method::POST, [w]) if w == "whep" => {
                Box::pin(async move {
                    let Some(stream_id) = bearer_token(&req) else {
                        return text(StatusCode::UNAUTHORIZED, "text/plain", "missing bearer token".to_string());
                    };
                    let offer_sdp = String::from_utf8(req.collect().await?.to_bytes().to_vec())?;

                    if let Err(e) = this.supervisor.ensure_whep(&stream_id).await {
                        return text(StatusCode::NOT_FOUND, "text/plain", e.to_string());
                    }
                    let waited = wait_for_whep_tracks(&this, &stream_id).await;
                    if !waited {
                        return text(
                            StatusCode::SERVICE_UNAVAILABLE,
                            "text/plain",
                            format!("stream {stream_id} has no tracks yet"),
                        );
                    }

                    match whep::handle_offer(this.whep_hub(), stream_id, offer_sdp).await {
                        Ok(answer_sdp) => Ok(Response::builder()
                            .status(StatusCode::CREATED)
                            .header("content-type", "application/sdp")
                            .header("location", "/whep")
                            .body(Full::new(Bytes::from(answer_sdp)).map_err(|e| match e {}).boxed())?),
                        Err(e) => {
                            error!("whep offer failed: {e}");
                            text(StatusCode::BAD_REQUEST, "text/plain", e.to_string())
                        }
                    }
                })
            }
            (Method::GET, [h, stream_id, file]) if h == "hls" && file == "master.m3u8" => {
                let path = this.output_dir.join(stream_id).join("master.m3u8");
                Box::pin(serve_file(path))
            }
            (Method::GET, [h, stream_id, variant, file]) if h == "hls" && file == "stream.m3u8" => {
                let path = this.output_dir.join(stream_id).join(variant).join("index.m3u8");
                Box::pin(serve_file(path))
            }
            (Method::GET, [h, stream_id, variant, resource]) if h == "hls" => {
                let path = this.output_dir.join(stream_id).join(variant).join(resource);
                Box::pin(serve_file(path))
            }
            _ => {
                let path = this.output_dir.join(path.trim_start_matches('/'));
                Box::pin(serve_file(path))
            }
        }
    }
}

#[cfg(feature = "whip")]
impl HttpServer {
    fn whep_hub(&self) -> Arc<whep::WhepHub> {
        // Threaded through the supervisor rather than stored twice; see
        // `Supervisor::ensure_whep`, which owns the same handle.
        self.supervisor.whep_hub()
    }
}

#[cfg(feature = "whip")]
async fn wait_for_whep_tracks(server: &HttpServer, stream_id: &str) -> bool {
    let deadline = tokio::time::Instant::now() + WHEP_TRACK_WAIT;
    loop {
        if server.whep_hub().get(stream_id).await.is_some() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(WHEP_TRACK_POLL).await;
    }
}
