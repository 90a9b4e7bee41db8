//! Process lifecycle: bind, spawn workers and server, shut down in order
//!
//! Shutdown runs in a fixed order so that viewers end on a placeholder
//! rather than a frozen live frame:
//! 1. seal the store and publish the terminal placeholder for every camera
//! 2. give streams `placeholder_grace` to push it out
//! 3. stop the server and wait up to `drain_grace`
//! 4. stop the workers (closing their render sessions) and wait up to
//!    `drain_grace`

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::camera::CameraId;
use crate::capture::{CaptureWorker, RenderBackend, WorkerContext, WorkerSettings};
use crate::channel::config_channel;
use crate::config::{Config, ShutdownConfig};
use crate::placeholder::Placeholders;
use crate::server::{AppState, StreamServer, StreamSettings, UpdateGate};
use crate::store::FrameStore;

/// Exit status when the listen address is taken
pub const EXIT_ADDR_IN_USE: i32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("listen address {addr} is already in use")]
    AddrInUse { addr: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// A configured relay that has not bound its listener yet
pub struct Relay {
    config: Config,
    backend: Arc<dyn RenderBackend>,
    placeholders: Placeholders,
}

impl Relay {
    pub fn new(config: Config, backend: Arc<dyn RenderBackend>, placeholders: Placeholders) -> Self {
        Self {
            config,
            backend,
            placeholders,
        }
    }

    /// Bind the listen address. Nothing else starts before this succeeds.
    pub async fn bind(self) -> Result<BoundRelay, SupervisorError> {
        let addr = self.config.server.bind.clone();
        let listener = match TcpListener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                return Err(SupervisorError::AddrInUse { addr });
            }
            Err(source) => return Err(SupervisorError::Bind { addr, source }),
        };
        let local_addr = listener
            .local_addr()
            .map_err(|source| SupervisorError::Bind {
                addr: addr.clone(),
                source,
            })?;

        Ok(BoundRelay {
            relay: self,
            listener,
            local_addr,
        })
    }
}

/// A relay holding its listener, ready to start
pub struct BoundRelay {
    relay: Relay,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl BoundRelay {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the nine capture workers and the stream server
    pub fn start(self) -> RunningRelay {
        let Relay {
            config,
            backend,
            placeholders,
        } = self.relay;

        let store = Arc::new(FrameStore::from_config(&config.capture));
        let placeholders = Arc::new(placeholders);
        let (channel, receivers) = config_channel();

        let worker_stop = CancellationToken::new();
        let ctx = Arc::new(WorkerContext {
            store: store.clone(),
            placeholders: placeholders.clone(),
            backend,
            settings: WorkerSettings::from_config(&config),
        });

        let urls = config.camera_urls();
        info!(
            "Starting {} capture workers ({} configured)",
            receivers.len(),
            urls.configured()
        );

        let mut health = Vec::with_capacity(receivers.len());
        let mut workers = Vec::with_capacity(receivers.len());
        for ((camera, url), updates) in urls.iter().zip(receivers) {
            let (worker, health_rx) = CaptureWorker::new(
                camera,
                url.map(str::to_string),
                ctx.clone(),
                updates,
                worker_stop.child_token(),
            );
            health.push(health_rx);
            workers.push(worker.spawn());
        }

        let shutdown = CancellationToken::new();
        let server_stop = CancellationToken::new();
        let shutdown_config = config.shutdown.clone();

        let state = AppState {
            store: store.clone(),
            placeholders: placeholders.clone(),
            channel,
            gate: Arc::new(UpdateGate::new(config.server.update_interval())),
            stream: StreamSettings::from_config(&config.stream),
            config: Arc::new(Mutex::new(config)),
            health: Arc::new(health),
            stop: server_stop.clone(),
            shutdown: shutdown.clone(),
        };
        let server = StreamServer::new(self.listener, state).spawn();

        RunningRelay {
            local_addr: self.local_addr,
            store,
            placeholders,
            shutdown_config,
            shutdown,
            server_stop,
            worker_stop,
            server,
            workers,
        }
    }
}

/// A started relay
pub struct RunningRelay {
    local_addr: SocketAddr,
    store: Arc<FrameStore>,
    placeholders: Arc<Placeholders>,
    shutdown_config: ShutdownConfig,
    shutdown: CancellationToken,
    server_stop: CancellationToken,
    worker_stop: CancellationToken,
    server: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

impl RunningRelay {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cancel this token to request shutdown
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn store(&self) -> Arc<FrameStore> {
        self.store.clone()
    }

    /// Block until shutdown is requested, then run the shutdown protocol
    pub async fn wait(self) {
        self.shutdown.cancelled().await;
        self.shut_down().await;
    }

    /// Run the shutdown protocol now
    pub async fn shut_down(mut self) {
        self.shutdown.cancel();

        info!("Shutdown: publishing terminal placeholder");
        self.store.seal();
        let terminal = self.placeholders.terminal();
        for camera in CameraId::all() {
            self.store.publish_terminal(camera, terminal.clone()).await;
        }
        tokio::time::sleep(self.shutdown_config.placeholder_grace()).await;

        info!("Shutdown: stopping stream server");
        self.server_stop.cancel();
        let drain = self.shutdown_config.drain_grace();
        if tokio::time::timeout(drain, &mut self.server).await.is_err() {
            warn!("Stream server did not stop within {:?}, aborting", drain);
            self.server.abort();
        }

        info!("Shutdown: closing render sessions");
        self.worker_stop.cancel();
        let deadline = Instant::now() + drain;
        let mut stragglers = 0;
        for worker in &mut self.workers {
            if tokio::time::timeout_at(deadline, &mut *worker).await.is_err() {
                worker.abort();
                stragglers += 1;
            }
        }
        if stragglers > 0 {
            warn!("{} capture worker(s) aborted after {:?}", stragglers, drain);
        }

        info!("Shutdown complete");
    }
}
