use std::net::IpAddr;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::Accessory;
use super::AccessoryError;
use super::AccessoryService;
use super::AccessoryTransport;
use super::Characteristic;
use super::CharacteristicValue;
use super::TransportConfig;

/// File in the device storage directory remembering the bound port
const PORT_FILE: &str = "port";

/// Accessory id; each transport serves exactly one accessory
const AID: u64 = 1;

#[derive(Serialize)]
struct AccessoriesResponse {
    accessories: Vec<AccessoryEntry>,
}

#[derive(Serialize)]
struct AccessoryEntry {
    aid: u64,
    name: String,
    manufacturer: String,
    model: String,
    serial_number: String,
    category: u8,
    characteristics: Vec<CharacteristicEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CharacteristicEntry {
    iid: u64,
    #[serde(rename = "type")]
    kind: Characteristic,
    value: CharacteristicValue,
}

#[derive(Serialize, Deserialize)]
struct CharacteristicsBody<T> {
    characteristics: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct CharacteristicWriteEntry {
    iid: u64,
    value: CharacteristicValue,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

fn characteristic_entries(accessory: &Accessory) -> Vec<CharacteristicEntry> {
    accessory
        .characteristics()
        .into_iter()
        .map(|(kind, value)| CharacteristicEntry {
            iid: kind.iid(),
            kind,
            value,
        })
        .collect()
}

/// Handler for GET /accessories
#[tracing::instrument(skip_all)]
async fn accessories(State(accessory): State<Arc<Accessory>>) -> impl IntoResponse {
    let info = accessory.info();
    Json(AccessoriesResponse {
        accessories: vec![AccessoryEntry {
            aid: AID,
            name: info.name.clone(),
            manufacturer: info.manufacturer.clone(),
            model: info.model.clone(),
            serial_number: info.serial_number.clone(),
            category: accessory.kind().category(),
            characteristics: characteristic_entries(&accessory),
        }],
    })
}

/// Handler for GET /characteristics
#[tracing::instrument(skip_all)]
async fn read_characteristics(State(accessory): State<Arc<Accessory>>) -> impl IntoResponse {
    Json(CharacteristicsBody {
        characteristics: characteristic_entries(&accessory),
    })
}

/// Handler for PUT /characteristics
#[tracing::instrument(skip_all)]
async fn write_characteristics(
    State(accessory): State<Arc<Accessory>>,
    Json(body): Json<CharacteristicsBody<CharacteristicWriteEntry>>,
) -> impl IntoResponse {
    for entry in body.characteristics {
        let result = Characteristic::from_iid(entry.iid)
            .ok_or(AccessoryError::UnknownCharacteristic(entry.iid))
            .and_then(|characteristic| accessory.remote_write(characteristic, entry.value));

        if let Err(e) = result {
            debug!("Rejected write to {}: {}", accessory.info().name, e);
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response();
        }
    }
    StatusCode::NO_CONTENT.into_response()
}

/// Handler for POST /identify
async fn identify(State(accessory): State<Arc<Accessory>>) -> impl IntoResponse {
    accessory.identify();
    StatusCode::NO_CONTENT
}

fn create_router(accessory: Arc<Accessory>) -> Router {
    Router::new()
        .route("/accessories", get(accessories))
        .route(
            "/characteristics",
            get(read_characteristics).put(write_characteristics),
        )
        .route("/identify", post(identify))
        .layer(TraceLayer::new_for_http())
        .with_state(accessory)
}

/// Serves each accessory over plain HTTP on its own listener.
///
/// Characteristics are exposed as JSON keyed by instance id. Pairing is not
/// enforced; put a paired accessory-protocol stack behind
/// [`AccessoryService`] where that matters.
#[derive(Debug, Clone)]
pub struct HttpAccessoryService {
    bind: IpAddr,
}

impl HttpAccessoryService {
    pub fn new(bind: IpAddr) -> Self {
        Self { bind }
    }
}

async fn remembered_port(storage_path: Option<&Path>) -> u16 {
    let Some(dir) = storage_path else {
        return 0;
    };
    tokio::fs::read_to_string(dir.join(PORT_FILE))
        .await
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

async fn remember_port(storage_path: &Path, port: u16) -> std::io::Result<()> {
    tokio::fs::create_dir_all(storage_path).await?;
    tokio::fs::write(storage_path.join(PORT_FILE), port.to_string()).await
}

#[async_trait]
impl AccessoryService for HttpAccessoryService {
    async fn start(
        &self,
        accessory: Arc<Accessory>,
        config: &TransportConfig,
    ) -> Result<Box<dyn AccessoryTransport>, AccessoryError> {
        let storage_path = config.storage_path.as_deref();
        let port = remembered_port(storage_path).await;

        let listener = match TcpListener::bind(SocketAddr::new(self.bind, port)).await {
            Ok(listener) => listener,
            Err(e) if port != 0 => {
                warn!("Port {} unavailable ({}), binding a new one", port, e);
                TcpListener::bind(SocketAddr::new(self.bind, 0)).await?
            }
            Err(e) => return Err(e.into()),
        };
        let addr = listener.local_addr()?;

        if let Some(dir) = storage_path {
            if let Err(e) = remember_port(dir, addr.port()).await {
                warn!("Could not persist port for {}: {}", accessory.info().name, e);
            }
        }

        let name = accessory.info().name.clone();
        info!("Serving accessory {} on {}", name, addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = create_router(accessory);
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await;
            if let Err(e) = result {
                warn!("Accessory transport for {} failed: {}", name, e);
            }
        });

        Ok(Box::new(HttpTransport {
            addr,
            shutdown_tx,
            task,
        }))
    }
}

struct HttpTransport {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

#[async_trait]
impl AccessoryTransport for HttpTransport {
    fn local_addr(&self) -> Option<SocketAddr> {
        Some(self.addr)
    }

    async fn stop(self: Box<Self>) -> Result<(), AccessoryError> {
        // Already-finished servers have dropped the receiver
        let _ = self.shutdown_tx.send(());
        self.task
            .await
            .map_err(|e| AccessoryError::Rejected(e.to_string()))
    }
}
