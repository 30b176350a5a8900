use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use crate::api::{RegisterFn, API_V1};
use crate::app::{App, AppInit};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::metrics::WorkerMetrics;
use crate::syscalls;
use crate::template::TemplateEngine;
use crate::tls::TlsContext;
use crate::worker::Worker;

/// Multi-worker front end. Each worker owns its own SO_REUSEPORT listener
/// and event loop; the kernel spreads accepts across them. Worker process
/// supervision (fork, respawn, signal fan-out) belongs to the outer CLI —
/// here workers are share-nothing threads pinned one per core.
pub struct Server {
    host_port: String,
    workers: usize,
    config: Config,
    tls: Option<Arc<TlsContext>>,
}

impl Server {
    pub fn bind(host_port: &str) -> Self {
        Self {
            host_port: host_port.to_string(),
            workers: 0, // resolved from config at serve time
            config: Config::default(),
            tls: None,
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Terminate TLS with the given PEM cert chain and private key.
    pub fn tls(mut self, cert_path: &str, key_path: &str) -> Result<Self> {
        self.tls = Some(Arc::new(TlsContext::from_pem_files(cert_path, key_path)?));
        Ok(self)
    }

    /// Precompile templates, run the user registration entry point in every
    /// worker, and serve until ctrl-c.
    pub fn serve(self, register: RegisterFn) -> Result<()> {
        self.config.validate()?;
        let cfg = Arc::new(self.config);

        let worker_count = if self.workers > 0 {
            self.workers
        } else {
            (cfg.os.worker_processes as usize).clamp(1, num_cpus::get().max(1))
        };

        let (host, port) = parse_host_port(&self.host_port)?;

        // Compiled once; the map is immutable and shared read-only
        let templates = Arc::new(TemplateEngine::precompile(
            &cfg.project.template_dir,
            &cfg.project.project_name,
        ));

        let shutdown = Arc::new(AtomicBool::new(false));

        // One wake pipe per worker so ctrl-c breaks every epoll_wait
        let mut wake_rx = Vec::with_capacity(worker_count);
        let mut wake_tx = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (rx, tx) = syscalls::create_pipe()?;
            wake_rx.push(rx);
            wake_tx.push(tx);
        }

        {
            let shutdown = Arc::clone(&shutdown);
            let wake_tx = wake_tx.clone();
            ctrlc::set_handler(move || {
                tracing::info!("shutdown signal received; draining workers");
                shutdown.store(true, Ordering::Release);
                for &fd in &wake_tx {
                    syscalls::pipe_wake(fd);
                }
            })
            .map_err(|e| Error::Other(format!("failed to install signal handler: {e}")))?;
        }

        let mut worker_metrics = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            worker_metrics.push(Arc::new(WorkerMetrics::new()));
        }

        spawn_metrics_reporter(Arc::clone(&shutdown), worker_metrics.clone());

        let core_ids = core_affinity::get_core_ids().unwrap_or_default();
        tracing::info!("starting {worker_count} workers on {host}:{port} with SO_REUSEPORT");

        let mut handles: Vec<thread::JoinHandle<()>> = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let core_id = core_ids.get(i % core_ids.len().max(1)).copied();
            let cfg = Arc::clone(&cfg);
            let templates = Arc::clone(&templates);
            let tls = self.tls.clone();
            let shutdown = Arc::clone(&shutdown);
            let metrics = Arc::clone(&worker_metrics[i]);
            let host = host.clone();
            let rx = wake_rx[i];

            let handle = thread::Builder::new()
                .name(format!("vivace-worker-{i}"))
                .spawn(move || {
                    if let Some(id) = core_id {
                        core_affinity::set_for_current(id);
                    }

                    let listen_fd = match syscalls::create_listen_socket_reuseport(&host, port, cfg.os.backlog)
                    {
                        Ok(fd) => fd,
                        Err(e) => {
                            tracing::error!("worker {i} failed to bind: {e}");
                            return;
                        }
                    };

                    // Every worker runs the registration entry point against
                    // its own router/middleware — nothing mutable is shared
                    let mut init = AppInit::new();
                    register(&API_V1, &mut init);
                    let app = App::build(init, templates, &cfg.project.middleware_list);

                    match Worker::new(cfg, app, tls, listen_fd, rx, metrics) {
                        Ok(mut worker) => worker.run(shutdown),
                        Err(e) => {
                            tracing::error!("worker {i} failed to initialize: {e}");
                            syscalls::close_fd(listen_fd);
                        }
                    }
                })
                .map_err(|e| Error::Other(format!("failed to spawn worker thread: {e}")))?;

            handles.push(handle);
        }

        for handle in handles {
            let _ = handle.join();
        }
        for fd in wake_rx.into_iter().chain(wake_tx) {
            syscalls::close_fd(fd);
        }

        Ok(())
    }
}

fn spawn_metrics_reporter(shutdown: Arc<AtomicBool>, metrics: Vec<Arc<WorkerMetrics>>) {
    let _ = thread::Builder::new()
        .name("vivace-metrics".to_string())
        .spawn(move || {
            while !shutdown.load(Ordering::Acquire) {
                thread::sleep(std::time::Duration::from_secs(5));
                if shutdown.load(Ordering::Acquire) {
                    break;
                }

                let mut active = 0u64;
                let mut requests = 0u64;
                let mut bytes = 0u64;
                for m in &metrics {
                    active += m.active_conns.load(Ordering::Relaxed);
                    requests += m.req_count.load(Ordering::Relaxed);
                    bytes += m.bytes_sent.load(Ordering::Relaxed);
                }
                tracing::info!("active connections: {active} | total requests: {requests} | bytes sent: {bytes}");
            }
        });
}

fn parse_host_port(host_port: &str) -> Result<(String, u16)> {
    let (host, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| Error::Other(format!("missing port in address '{host_port}'")))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| Error::Other(format!("invalid port in address '{host_port}'")))?;
    let host = if host.is_empty() { "0.0.0.0" } else { host };
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_port_parsing() {
        assert_eq!(parse_host_port("127.0.0.1:8080").unwrap(), ("127.0.0.1".to_string(), 8080));
        assert_eq!(parse_host_port(":9000").unwrap(), ("0.0.0.0".to_string(), 9000));
        assert!(parse_host_port("nocolon").is_err());
        assert!(parse_host_port("x:notaport").is_err());
    }
}
