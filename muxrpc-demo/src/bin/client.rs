use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use clap::Parser;
use muxrpc::{Client, ClientOptions, CompressorFactory, MsgpackSerializer, Protocol, ZstdFactory};
use muxrpc_demo::{DemoStubs, Request};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Server address.
    #[arg(default_value = "127.0.0.1:8000")]
    pub addr: std::net::SocketAddr,

    /// Request value.
    #[arg(short, long, default_value = "alice")]
    pub value: String,

    /// Offer zstd compression during negotiation.
    #[arg(long, default_value_t = false)]
    pub compress: bool,

    /// Enable stress testing.
    #[arg(long, default_value_t = false)]
    pub stress: bool,

    /// Stress testing duration.
    #[arg(long, default_value = "60")]
    pub secs: u64,

    /// The number of coroutines.
    #[arg(long, default_value = "32")]
    pub coroutines: usize,
}

fn options(args: &Args) -> ClientOptions {
    ClientOptions {
        compressor_factory: args
            .compress
            .then(|| Arc::new(ZstdFactory::default()) as Arc<dyn CompressorFactory>),
        ..ClientOptions::default()
    }
}

#[derive(Default)]
struct State {
    total: AtomicUsize,
    fails: AtomicUsize,
}

async fn stress_test(args: Args) {
    let state = Arc::new(State::default());
    let start_time = std::time::Instant::now();
    let proto = Protocol::new(MsgpackSerializer);
    let stubs = Arc::new(DemoStubs::new(&proto));
    let client = Client::connect(args.addr, options(&args), MsgpackSerializer)
        .await
        .unwrap();

    let mut tasks = vec![];
    for _ in 0..args.coroutines {
        let value = Request(args.value.clone());
        let state = state.clone();
        let stubs = stubs.clone();
        let client = client.clone();
        let secs = args.secs;
        tasks.push(tokio::spawn(async move {
            while start_time.elapsed().as_secs() < secs {
                for _ in 0..256 {
                    let result = stubs
                        .echo
                        .call_with_timeout(&client, Duration::from_secs(5), (value.clone(),))
                        .await;
                    state.total.fetch_add(1, Ordering::AcqRel);
                    if result.is_err() {
                        state.fails.fetch_add(1, Ordering::AcqRel);
                    }
                }
            }
        }));
    }
    tokio::select! {
        _ = async {
            for task in tasks {
                task.await.unwrap();
            }
        } => {}
        _ = async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                let total = state.total.swap(0, Ordering::AcqRel);
                let fails = state.fails.swap(0, Ordering::AcqRel);
                tracing::info!("QPS: {total}/s, fails: {fails}/s");
            }
        } => {}
    }
    tracing::info!("stats: {:?}", client.stats());
    client.stop().await;
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    if args.stress {
        stress_test(args).await;
        return;
    }

    let proto = Protocol::new(MsgpackSerializer);
    let stubs = DemoStubs::new(&proto);
    let client = Client::connect(args.addr, options(&args), MsgpackSerializer)
        .await
        .unwrap();

    let rsp = stubs.echo.call(&client, (Request(args.value.clone()),)).await;
    tracing::info!("echo rsp: {rsp:?}");

    let rsp = stubs.greet.call(&client, (Request(args.value.clone()),)).await;
    tracing::info!("greet rsp: {rsp:?}");

    let rsp = stubs.notify.call(&client, (Request(args.value),)).await;
    tracing::info!("notify sent: {rsp:?}");

    client.stop().await;
}
