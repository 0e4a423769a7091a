use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use clap::Parser;
use muxrpc::{
    CompressorFactory, MsgpackSerializer, Protocol, ResourceLimits, Server, ServerOptions,
    ZstdFactory,
};
use muxrpc_demo::{ECHO, GREET, NOTIFY, Request};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Listen address.
    #[arg(default_value = "0.0.0.0:8000")]
    pub addr: std::net::SocketAddr,

    /// Offer zstd compression during negotiation.
    #[arg(long, default_value_t = false)]
    pub compress: bool,

    /// Admission budget in bytes.
    #[arg(long, default_value = "10000000")]
    pub max_memory: usize,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    let proto = Arc::new(Protocol::new(MsgpackSerializer));
    let _echo = proto.register(ECHO, |(r,): (Request,)| async move { Ok::<_, String>(r.0) });

    let greeted = Arc::new(AtomicU64::new(0));
    let _greet = proto.register(GREET, {
        let greeted = greeted.clone();
        move |(r,): (Request,)| {
            let val = greeted.fetch_add(1, Ordering::AcqRel);
            async move { Ok::<_, String>(format!("hello {}({})!", r.0, val)) }
        }
    });

    let _notify = proto.register_oneway_with_info(NOTIFY, |info, (r,): (Request,)| async move {
        tracing::info!("notify from {}: {}", info.peer, r.0);
        Ok::<_, String>(())
    });

    let server = Server::create(
        proto,
        ResourceLimits {
            max_memory: args.max_memory,
            ..ResourceLimits::default()
        },
        ServerOptions {
            compressor_factory: args
                .compress
                .then(|| Arc::new(ZstdFactory::default()) as Arc<dyn CompressorFactory>),
        },
    );

    let addr = server.listen(args.addr).await.unwrap();
    tracing::info!("Serving echo/greet/notify on {addr}...");
    server.join().await;
}
