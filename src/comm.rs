// Brings up every enabled transport from one configuration

use anyhow::{Context, Result};
use log::{info, warn};
use std::sync::Arc;

use crate::ble_server::{AttributeServer, ServerOptions};
use crate::ble_stack::BleStack;
use crate::ble_transport::{service_uuid, BleTransport};
use crate::config::{CommConfig, SocketTuning, WifiMode, LOCAL_SERVER_PORT};
use crate::discovery::DiscoveryBroadcaster;
use crate::packet::{PacketBoundary, PayloadHandler};
use crate::tcp_hub::{HubClient, Resolver, SystemResolver};
use crate::tcp_local::LocalServer;
use crate::wifi_driver::WifiDriver;
use crate::wifi_manager::WifiManager;
use crate::worker::WorkerHandle;

/// Radio handles and packet boundary the node is built on
pub struct CommParts {
    pub wifi: Arc<dyn WifiDriver>,
    pub ble: Option<Arc<dyn BleStack>>,
    pub boundary: Arc<dyn PacketBoundary>,
    pub handler: PayloadHandler,
    pub resolver: Arc<dyn Resolver>,
    /// Local server port, `LOCAL_SERVER_PORT` unless overridden
    pub local_port: u16,
}

impl CommParts {
    pub fn new(
        wifi: Arc<dyn WifiDriver>,
        ble: Option<Arc<dyn BleStack>>,
        boundary: Arc<dyn PacketBoundary>,
        handler: PayloadHandler,
    ) -> Self {
        Self {
            wifi,
            ble,
            boundary,
            handler,
            resolver: Arc::new(SystemResolver),
            local_port: LOCAL_SERVER_PORT,
        }
    }
}

/// A running communication node
pub struct CommNode {
    config: CommConfig,
    manager: Arc<WifiManager>,
    local: Option<Arc<LocalServer>>,
    ble: Option<BleTransport>,
    workers: Vec<WorkerHandle>,
}

impl CommNode {
    pub fn start(config: CommConfig, parts: CommParts) -> Result<Self> {
        config.validate().context("invalid communication config")?;
        info!(
            "🚀 Starting comm node '{}' (wifi {:?}, local {}, hub {}, ble {})",
            config.device_name, config.wifi_mode, config.use_local_server, config.use_hub, config.ble_enabled
        );

        let manager = WifiManager::new(parts.wifi.clone(), &config);
        let tuning = SocketTuning::default();
        let mut workers = Vec::new();
        let mut local = None;
        let wifi_enabled = config.wifi_mode != WifiMode::Disabled;

        if wifi_enabled && config.use_local_server {
            let server = LocalServer::new(
                parts.local_port,
                tuning,
                parts.boundary.clone(),
                parts.handler.clone(),
            );
            workers.push(server.spawn(&manager).context("local server worker")?);

            let discovery =
                DiscoveryBroadcaster::new(&config.device_name, parts.local_port, manager.clone());
            workers.push(discovery.spawn().context("discovery worker")?);
            local = Some(server);
        }

        if wifi_enabled && config.use_hub {
            let hub = Arc::new(HubClient::new(
                config.hub.clone(),
                tuning,
                parts.resolver.clone(),
                parts.boundary.clone(),
                parts.handler.clone(),
            ));
            workers.push(hub.spawn(&manager).context("hub worker")?);
        }

        let ble = match start_ble(&config, &parts) {
            Ok(ble) => ble,
            Err(e) => {
                // Dropping the handles joins the workers once their sockets are closed
                for worker in &workers {
                    worker.stop();
                }
                manager.disconnect();
                return Err(e);
            }
        };

        Ok(Self {
            config,
            manager,
            local,
            ble,
            workers,
        })
    }

    pub fn config(&self) -> &CommConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<WifiManager> {
        &self.manager
    }

    pub fn attribute_server(&self) -> Option<&Arc<AttributeServer>> {
        self.ble.as_ref().map(|t| t.server())
    }

    pub fn ble_transport(&self) -> Option<&BleTransport> {
        self.ble.as_ref()
    }

    /// Port the local server is bound to, if it runs
    pub fn local_port(&self) -> Option<u16> {
        self.local.as_ref().map(|s| s.port())
    }

    /// Stop every worker, closing sockets so blocked readers return
    pub fn shutdown(self) {
        for worker in &self.workers {
            worker.stop();
        }
        self.manager.disconnect();
        for worker in self.workers {
            worker.join();
        }
        info!("🛑 Comm node stopped");
    }
}

fn start_ble(config: &CommConfig, parts: &CommParts) -> Result<Option<BleTransport>> {
    match (&parts.ble, config.ble_enabled) {
        (Some(stack), true) => {
            let server = AttributeServer::new(
                stack.clone(),
                &config.device_name,
                Some(service_uuid()),
                ServerOptions::default(),
            );
            server.start().context("BLE server start")?;
            let transport = BleTransport::register(&server, parts.boundary.as_ref(), parts.handler.clone())
                .context("BLE packet service")?;
            Ok(Some(transport))
        }
        (None, true) => {
            warn!("⚠️ BLE enabled but no BLE stack available");
            Ok(None)
        }
        _ => Ok(None),
    }
}
