use std::sync::atomic::Ordering;
use std::sync::Arc;

use tcp_acceptor::config::AppConfig;
use tcp_acceptor::{logger, Acceptor, Connection, PollingEngine, TcpServer};
use tokio::sync::oneshot;
use tracing::{info, warn};

mod signal;

use signal::{start_signal_handler, SignalHandler};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config".to_string());
    let cfg = AppConfig::load_from(&config_path)?;
    logger::init(&cfg.logging)?;

    // Worker threads drive every accept loop and the connection dispatcher
    let mut runtime_builder = tokio::runtime::Builder::new_multi_thread();
    runtime_builder.enable_all();

    if let Some(workers) = cfg.runtime.workers {
        runtime_builder.worker_threads(workers);
        info!(workers, "using configured worker threads");
    } else {
        info!("using default worker threads (CPU cores)");
    }

    let runtime = runtime_builder.build()?;

    runtime.block_on(async_main(cfg))
}

async fn async_main(cfg: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let addrs = cfg.listen_addrs()?;
    let (done_tx, done_rx) = oneshot::channel();
    let server = TcpServer::create_with_shutdown(cfg.server, move || {
        let _ = done_tx.send(());
    });

    for addr in addrs {
        let port = server.add_port(addr)?;
        info!(%addr, port, "listening");
    }

    let engine = PollingEngine::current()?;
    server.start(&engine, |connection: Connection, acceptor: Acceptor| {
        info!(
            peer = %connection.peer_addr(),
            local = %connection.local_addr(),
            port_index = acceptor.port_index(),
            fd_index = acceptor.fd_index(),
            "connection"
        );
    })?;

    let signals = SignalHandler::new();
    start_signal_handler(Arc::clone(&signals));

    while !signals.shutdown_requested.load(Ordering::SeqCst) {
        tokio::select! {
            () = signals.shutdown.notified() => break,
            () = signals.report.notified() => log_port_table(&server),
        }
    }

    server.unref();
    if done_rx.await.is_err() {
        warn!("server dropped its shutdown notifier without firing it");
    }
    info!("shutdown complete");
    Ok(())
}

fn log_port_table(server: &TcpServer) {
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
    info!(at = %now, listeners = server.port_count(), refs = server.ref_count(), "listener table");
    for port_index in 0..server.port_count() {
        for fd_index in 0..server.port_fd_count(port_index) {
            match (server.port_addr(port_index, fd_index), server.port_fd(port_index, fd_index)) {
                (Some(addr), Some(fd)) => info!(port_index, fd_index, %addr, fd, "open"),
                _ => info!(port_index, fd_index, "closed"),
            }
        }
    }
}
