//! Bridge lifecycle: connect, subscribe, dispatch, shut down.
//!
//! Every inbound message is handled in its own task; handlers only meet in
//! the [`DeviceRegistry`]. Accessory bring-up for a new device runs in the
//! background and reports failure on a fatal channel, which ends [`Bridge::run`].

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::accessory::render_pairing_aid;
use crate::accessory::setup_id;
use crate::accessory::setup_uri;
use crate::accessory::Accessory;
use crate::accessory::AccessoryService;
use crate::accessory::AccessoryTransport;
use crate::accessory::TransportConfig;
use crate::config::Config;
use crate::device::Device;
use crate::discovery::DiscoveryDispatcher;
use crate::error::BridgeError;
use crate::mqtt::Inbox;
use crate::mqtt::MqttClient;
use crate::mqtt::MqttMessage;
use crate::registry::DeviceRegistry;
use crate::registry::Registration;
use crate::sync::StateSynchronizer;

#[derive(Default)]
struct Transports {
    running: Vec<(String, Box<dyn AccessoryTransport>)>,

    /// Set once shutdown has taken the running transports
    closed: bool,
}

struct Shared<C> {
    config: Config,
    registry: Arc<DeviceRegistry>,
    discovery: DiscoveryDispatcher,
    sync: Arc<StateSynchronizer<C>>,
    service: Arc<dyn AccessoryService>,
    transports: tokio::sync::Mutex<Transports>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
    fatal_tx: mpsc::UnboundedSender<BridgeError>,
}

/// A connected bridge, ready to [`run`](Bridge::run)
pub struct Bridge<C> {
    shared: Arc<Shared<C>>,
    inbox: Inbox,
    fatal_rx: mpsc::UnboundedReceiver<BridgeError>,
}

impl<C: MqttClient + 'static> Bridge<C> {
    /// Connect to the broker and subscribe to discovery and family state
    /// topics. An unreachable broker is fatal.
    pub async fn connect(
        mut client: C,
        config: &Config,
        service: Arc<dyn AccessoryService>,
    ) -> Result<Self, BridgeError> {
        info!(
            "Connecting to MQTT broker at {}:{}",
            config.broker.host, config.broker.port
        );
        let inbox = client
            .connect()
            .await
            .map_err(BridgeError::BrokerConnectFailed)?;
        info!("Connected to MQTT broker");

        let client = Arc::new(client);
        let registry = Arc::new(DeviceRegistry::new());
        let discovery = DiscoveryDispatcher::new(
            config.broker.discovery_prefix.clone(),
            config.families.clone(),
        );
        let sync = Arc::new(StateSynchronizer::new(
            client.clone(),
            registry.clone(),
            config.families.clone(),
        ));

        let topics = discovery
            .subscriptions()
            .into_iter()
            .chain(sync.subscriptions());
        for topic in topics {
            match client.subscribe(&topic).await {
                Ok(()) => info!("Subscribed to {}", topic),
                Err(source) => warn!("{}", BridgeError::Subscribe { topic, source }),
            }
        }

        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

        Ok(Self {
            shared: Arc::new(Shared {
                config: config.clone(),
                registry,
                discovery,
                sync,
                service,
                transports: tokio::sync::Mutex::new(Transports::default()),
                forwarders: Mutex::new(Vec::new()),
                fatal_tx,
            }),
            inbox,
            fatal_rx,
        })
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.shared.registry
    }

    /// Dispatch messages until `shutdown` resolves or a fatal error occurs,
    /// then stop every accessory transport.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<(), BridgeError> {
        tokio::pin!(shutdown);

        let result = loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                Some(e) = self.fatal_rx.recv() => {
                    error!("{}", e);
                    break Err(e);
                }
                msg = self.inbox.recv() => match msg {
                    Some(msg) => {
                        let shared = self.shared.clone();
                        tokio::spawn(async move { shared.dispatch(msg).await });
                    }
                    None => {
                        warn!("MQTT message stream closed");
                        break Ok(());
                    }
                },
            }
        };

        self.shared.shutdown().await;
        result
    }
}

impl<C: MqttClient + 'static> Shared<C> {
    async fn dispatch(self: &Arc<Self>, msg: MqttMessage) {
        let result = if self.discovery.is_discovery(&msg.topic) {
            self.handle_discovery(&msg).await
        } else {
            self.handle_state(&msg).await
        };

        // Message-local errors end here
        if let Err(e) = result {
            warn!("Dropping message on {}: {}", msg.topic, e);
        }
    }

    async fn handle_discovery(self: &Arc<Self>, msg: &MqttMessage) -> Result<(), BridgeError> {
        let Some(config) = self.discovery.classify(msg)? else {
            return Ok(());
        };

        match self.registry.register(config).await {
            Registration::Created(device) => {
                info!("Discovered {} {}", device.class(), device.name());
                self.adopt(device).await;
            }
            Registration::Existing(device) => {
                debug!("{} is already registered", device.name());
            }
        }
        Ok(())
    }

    async fn handle_state(self: &Arc<Self>, msg: &MqttMessage) -> Result<(), BridgeError> {
        debug!("State update on {}", msg.topic);
        if let Some(registration) = self.sync.handle_state(msg).await? {
            self.adopt(registration.device().clone()).await;
        }
        Ok(())
    }

    /// Take over a freshly registered device: subscribe to its state and
    /// bring up its accessory in the background.
    async fn adopt(self: &Arc<Self>, device: Arc<Device>) {
        // Subscribe after registry insert so the retained state message finds
        // the device already registered
        if let Err(e) = self.sync.track(&device).await {
            warn!("{}", e);
        }

        let shared = self.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.bring_up(&device).await {
                // Nobody listening means the bridge is already stopping
                let _ = shared.fatal_tx.send(e);
            }
        });
    }

    async fn bring_up(&self, device: &Arc<Device>) -> Result<(), BridgeError> {
        let accessory = Arc::new(Accessory::new(
            device.accessory_kind(),
            device.accessory_info().clone(),
        ));
        if !device.attach_accessory(accessory.clone()) {
            return Ok(());
        }

        if let Some(mut writes) = accessory.take_write_events() {
            let sync = self.sync.clone();
            let device = device.clone();
            let forwarder = tokio::spawn(async move {
                while let Some(write) = writes.recv().await {
                    if let Err(e) = sync.handle_write(&device, write).await {
                        warn!("Dropping write for {}: {}", device.name(), e);
                    }
                }
            });
            self.forwarders
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(forwarder);
        }

        let transport_config = TransportConfig {
            pin: self.config.pin.clone(),
            storage_path: self.config.device_storage(device.name()),
        };
        let transport = self
            .service
            .start(accessory, &transport_config)
            .await
            .map_err(|source| BridgeError::TransportStartupFailed {
                name: device.name().to_string(),
                source,
            })?;

        let uri = setup_uri(
            device.accessory_kind(),
            &self.config.pin,
            &setup_id(device.name()),
        );
        render_pairing_aid(device.name(), &uri, transport_config.storage_path.as_deref()).await;

        let mut transports = self.transports.lock().await;
        if transports.closed {
            drop(transports);
            debug!("Stopping late transport for {}", device.name());
            stop_transport(device.name().to_string(), transport, self.config.shutdown_grace).await;
        } else {
            transports
                .running
                .push((device.name().to_string(), transport));
        }
        Ok(())
    }

    async fn shutdown(&self) {
        info!("Stopping accessory transports");

        for forwarder in self
            .forwarders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            forwarder.abort();
        }

        let running = {
            let mut transports = self.transports.lock().await;
            transports.closed = true;
            std::mem::take(&mut transports.running)
        };

        let grace = self.config.shutdown_grace;
        let mut stopping = JoinSet::new();
        for (name, transport) in running {
            stopping.spawn(stop_transport(name, transport, grace));
        }
        while stopping.join_next().await.is_some() {}

        info!("Bridge stopped");
    }
}

async fn stop_transport(name: String, transport: Box<dyn AccessoryTransport>, grace: Duration) {
    match tokio::time::timeout(grace, transport.stop()).await {
        Ok(Ok(())) => debug!("Stopped transport for {}", name),
        Ok(Err(e)) => warn!("Error stopping transport for {}: {}", name, e),
        Err(_) => warn!("Transport for {} did not stop within {:?}", name, grace),
    }
}
