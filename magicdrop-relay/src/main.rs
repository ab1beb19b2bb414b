use clap::Parser;
use magicdrop_relay::{AppState, serve};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "magicdrop-relay", about = "Pub/sub relay for Magic Drop pairing channels")]
struct RelayArgs {
    #[arg(long, env = "MAGICDROP_BIND", default_value = "0.0.0.0:8080")]
    bind_address: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = RelayArgs::parse();
    let listener = match tokio::net::TcpListener::bind(&args.bind_address).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(bind_address = %args.bind_address, "failed to bind: {}", err);
            std::process::exit(1);
        }
    };

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("ctrl-c handler unavailable: {}", err);
            std::future::pending::<()>().await;
        }
        info!("shutdown requested");
    };

    if let Err(err) = serve(listener, AppState::new(), shutdown).await {
        error!("relay server exited: {}", err);
        std::process::exit(1);
    }
}
