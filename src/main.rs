//! A SOCKS proxy implemented in Rust
//!
//! peersocksd runs both halves of the peersocks proxy in one process, joined
//! by the in-memory loopback transport.
//!
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::*;

use peersocks as ps;

#[derive(Parser, Debug)]
#[command(name = "peersocksd")]
struct Opt {
    /// Set port to listen on
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Set ipaddress to listen on
    #[arg(short = 'i', long = "ip")]
    ipaddr: Option<IpAddr>,

    /// Set path to config file (format: yaml)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Count sessions against this user's limit
    #[arg(short = 'u', long = "user")]
    user: Option<String>,
}

fn set_handler(signals: &[i32], handler: impl Fn(i32) + Send + 'static) -> io::Result<()> {
    use signal_hook::*;
    let mut signals = iterator::Signals::new(signals)?;
    std::thread::spawn(move || signals.forever().for_each(handler));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use signal_hook::consts::*;
    env_logger::init();

    println!("peersocksd");
    let opt = Opt::parse();
    debug!("option: {:?}", opt);

    let mut config = match opt.config {
        Some(ref path) => ps::Config::with_file(path).context("config file")?,
        None => ps::Config::default(),
    };
    if let Some(ip) = opt.ipaddr {
        config.frontend.listen_ip = ip;
    }
    if let Some(port) = opt.port {
        config.frontend.listen_port = port;
    }

    let limiter = Arc::new(ps::SessionLimiter::new(config.backend.session_limit));
    let backend = ps::Backend::new(config.backend, opt.user, limiter);
    let frontend = ps::Frontend::new(config.frontend);
    let (a, b) = ps::loopback::pair();

    {
        let frontend = frontend.clone();
        let backend = backend.clone();
        set_handler(&[SIGTERM, SIGINT, SIGQUIT], move |signal| {
            info!("received signal {}, stopping", signal);
            frontend.stop();
            backend.stop();
        })
        .context("setting signal handler")?;
    }

    backend.start(b).await.context("starting backend")?;
    let endpoint = frontend.start(a).await.context("starting frontend")?;
    info!("accepting SOCKS clients on {}", endpoint);

    frontend.once_stopped().await;
    backend.stop();
    backend.once_stopped().await;
    let traffic = frontend.traffic();
    info!(
        "stopped after sending {} bytes and receiving {} bytes",
        traffic.total_sent_to_peer(),
        traffic.total_received_from_peer()
    );
    Ok(())
}
