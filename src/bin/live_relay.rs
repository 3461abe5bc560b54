use anyhow::Result;
use clap::Parser;
use config::Config;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use live_relay_core::egress::hls::HlsHub;
use live_relay_core::http::HttpServer;
use live_relay_core::hub::Hub;
#[cfg(feature = "rtmp")]
use live_relay_core::ingress::rtmp;
use live_relay_core::settings::Settings;
use live_relay_core::supervisor::Supervisor;
use log::{error, info};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
struct Args {
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let builder = Config::builder()
        .add_source(config::File::with_name(&args.config))
        .add_source(config::Environment::with_prefix("APP"))
        .build()?;
    let settings: Settings = builder.try_deserialize()?;

    let hub = Hub::new();
    let hls_hub = HlsHub::new();
    #[cfg(feature = "whip")]
    let whep_hub = live_relay_core::egress::whep::WhepHub::new();

    let supervisor = Supervisor::new(
        hub.clone(),
        hls_hub.clone(),
        #[cfg(feature = "whip")]
        whep_hub.clone(),
        settings.clone(),
    );
    tokio::spawn(supervisor.clone().run());

    #[cfg(feature = "rtmp")]
    {
        let addr = format!("0.0.0.0:{}", settings.rtmp.port);
        let hub = hub.clone();
        tokio::spawn(async move {
            if let Err(e) = rtmp::listen(addr, hub, rtmp::RtmpIngressConfig::default()).await {
                error!("rtmp listener exited: {e}");
            }
        });
    }

    #[cfg(feature = "whip")]
    let public_ip = std::env::var("PUBLIC_IP").ok().and_then(|s| s.parse().ok());
    let http_server = HttpServer::new(
        supervisor,
        PathBuf::from(&settings.output_dir),
        #[cfg(feature = "whip")]
        hub,
        #[cfg(feature = "whip")]
        public_ip,
    );

    let addr: SocketAddr = format!("0.0.0.0:{}", settings.service.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP listening on {addr}");
    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let server = http_server.clone();
        tokio::spawn(async move {
            if let Err(e) = http1::Builder::new().serve_connection(io, server).await {
                error!("HTTP connection from {peer} closed: {e}");
            }
        });
    }
}
