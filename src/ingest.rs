//! The ingestion loop.
//!
//! Orchestrates tunnel, broker subscription and store into one supervised
//! cycle and restarts the cycle after a failure.
//!
//! ```text
//! Idle ─▶ Tunneling ─▶ Subscribing ─▶ Streaming ─┬─▶ Error ─(backoff)─▶ Tunneling
//!                                                 └─▶ ShuttingDown
//! ```
//!
//! - **Tunneling**: open the tunnel and forward a local port to the broker;
//!   unless in display-all mode, connect the store and ensure the default
//!   table exists.
//! - **Subscribing**: connect the broker client to the forwarded port and
//!   wait for the subscription to be acknowledged.
//! - **Streaming**: poll the broker in short slices while the tunnel is
//!   alive and dispatch messages one at a time, in arrival order.
//! - **Error**: every session of the cycle is released, the failure is
//!   logged, and the loop sleeps `retry_delay` before tunneling again. In
//!   debug mode the error is returned instead.
//!
//! A store failure while persisting a message recycles only the store
//! session; the message being persisted is lost. If the store cannot be
//! reconnected, the whole cycle fails.
//!
//! Stop requests are honoured between messages, between poll slices and
//! during the backoff pause.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerSession, MqttSession};
use crate::config::Config;
use crate::error::{Disposition, IngestError, IngestResult};
use crate::models::{InboundMessage, TelemetryMessage};
use crate::progress::{IngestProgressEvent, ProgressReporter};
use crate::schema::TableSchema;
use crate::store::{RowSink, StoreConnector};
use crate::tunnel::{SshTunnel, Tunnel, TunnelError, TunnelTarget};

/// Number of transitions kept for [`IngestLoop::transitions`].
const TRANSITION_HISTORY: usize = 64;

/// States of the ingestion cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CycleState {
    Idle,
    Tunneling,
    Subscribing,
    Streaming,
    Error,
    ShuttingDown,
}

/// Sending half of the stop signal.
#[derive(Debug, Clone)]
pub struct ShutdownTx(Arc<watch::Sender<bool>>);

impl ShutdownTx {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn subscribe(&self) -> ShutdownRx {
        self.0.subscribe()
    }
}

pub type ShutdownRx = watch::Receiver<bool>;

pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTx(Arc::new(tx)), rx)
}

/// Opens the external sessions a cycle needs.
///
/// The live implementation is [`LiveEndpoints`]; tests substitute fakes to
/// drive the state machine without network or database.
#[async_trait]
pub trait Endpoints: Send {
    /// Open the tunnel with its local port forward in place.
    async fn open_tunnel(&mut self) -> IngestResult<Box<dyn Tunnel>>;

    /// Connect a broker client to the forwarded local port.
    async fn connect_broker(&mut self, local_port: u16) -> IngestResult<Box<dyn BrokerSession>>;

    /// Open a store session with the configured database selected.
    async fn connect_store(&mut self) -> IngestResult<Box<dyn RowSink>>;
}

/// Runtime switches of the loop.
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub location: String,
    pub device_name: String,
    /// Store every message in this table instead of one per unit name.
    pub table_override: Option<String>,
    /// Display each device message before storing it.
    pub show: bool,
    /// Subscribe to every topic and display messages without storing them.
    pub show_all: bool,
    /// Return loop-level errors instead of retrying.
    pub debug: bool,
    pub retry_delay: Duration,
    pub poll_interval: Duration,
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            location: config.device.location.clone(),
            device_name: config.device.name.clone(),
            table_override: None,
            show: false,
            show_all: false,
            debug: false,
            retry_delay: config.ingest.retry_delay(),
            poll_interval: config.ingest.poll_interval(),
        }
    }

    pub fn topic(&self) -> String {
        if self.show_all {
            "#".to_string()
        } else {
            format!("{}/{}/#", self.location, self.device_name)
        }
    }

    /// Table ensured when the store session is opened.
    pub fn default_table(&self) -> &str {
        self.table_override.as_deref().unwrap_or(&self.device_name)
    }
}

/// Sessions owned by one cycle. Released by [`CycleSessions::teardown`]
/// after every cycle, whatever its outcome.
#[derive(Default)]
struct CycleSessions {
    tunnel: Option<Box<dyn Tunnel>>,
    broker: Option<Box<dyn BrokerSession>>,
    store: Option<Box<dyn RowSink>>,
    ensured_tables: HashSet<String>,
}

impl CycleSessions {
    fn tunnel_active(&self) -> bool {
        self.tunnel.as_ref().is_some_and(|t| t.is_active())
    }

    async fn close_store(&mut self) {
        if let Some(mut store) = self.store.take() {
            store.disconnect().await;
        }
        self.ensured_tables.clear();
    }

    async fn teardown(&mut self) {
        if let Some(mut broker) = self.broker.take() {
            broker.disconnect().await;
        }
        if let Some(mut tunnel) = self.tunnel.take() {
            tunnel.close().await;
        }
        self.close_store().await;
    }
}

pub struct IngestLoop<E: Endpoints> {
    endpoints: E,
    schema: TableSchema,
    settings: IngestSettings,
    progress: Box<dyn ProgressReporter>,
    shutdown: ShutdownRx,
    state: CycleState,
    transitions: VecDeque<(CycleState, CycleState)>,
    inserted: u64,
    started_at: DateTime<Utc>,
}

impl<E: Endpoints> IngestLoop<E> {
    pub fn new(
        endpoints: E,
        schema: TableSchema,
        settings: IngestSettings,
        progress: Box<dyn ProgressReporter>,
        shutdown: ShutdownRx,
    ) -> Self {
        Self {
            endpoints,
            schema,
            settings,
            progress,
            shutdown,
            state: CycleState::Idle,
            transitions: VecDeque::with_capacity(TRANSITION_HISTORY),
            inserted: 0,
            started_at: Utc::now(),
        }
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    /// Most recent state transitions, oldest first.
    pub fn transitions(&self) -> Vec<(CycleState, CycleState)> {
        self.transitions.iter().copied().collect()
    }

    /// Rows stored since this loop was created.
    pub fn inserted_count(&self) -> u64 {
        self.inserted
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn endpoints(&self) -> &E {
        &self.endpoints
    }

    fn transition(&mut self, next: CycleState) {
        if self.state == next {
            return;
        }
        debug!("cycle state {:?} -> {:?}", self.state, next);
        if self.transitions.len() == TRANSITION_HISTORY {
            self.transitions.pop_front();
        }
        self.transitions.push_back((self.state, next));
        self.state = next;
    }

    fn stop_requested(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Run until a stop is requested. Only returns an error for fatal
    /// failures, or for any failure in debug mode.
    pub async fn run(&mut self) -> IngestResult<()> {
        loop {
            if self.stop_requested() {
                break;
            }

            let mut sessions = CycleSessions::default();
            let outcome = self.run_cycle(&mut sessions).await;
            sessions.teardown().await;

            match outcome {
                Ok(()) => break,
                Err(e) => {
                    self.transition(CycleState::Error);
                    error!("{}", e);
                    if self.settings.debug || e.is_fatal() {
                        return Err(e);
                    }
                    if !self.backoff().await {
                        break;
                    }
                }
            }
        }

        self.transition(CycleState::ShuttingDown);
        info!(
            "Stopped after storing {} rows since {}",
            self.inserted,
            self.started_at.to_rfc3339()
        );
        Ok(())
    }

    /// Sleep for the retry delay. Returns false if a stop was requested
    /// meanwhile.
    async fn backoff(&mut self) -> bool {
        info!(
            "Retrying in {} seconds",
            self.settings.retry_delay.as_secs_f64()
        );
        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.settings.retry_delay) => !self.stop_requested(),
            _ = async move {
                // A dropped sender can never request a stop.
                if shutdown.wait_for(|stop| *stop).await.is_err() {
                    std::future::pending::<()>().await;
                }
            } => false,
        }
    }

    /// One cycle. `Ok(())` means a stop was requested.
    async fn run_cycle(&mut self, sessions: &mut CycleSessions) -> IngestResult<()> {
        self.transition(CycleState::Tunneling);
        let tunnel = self.endpoints.open_tunnel().await?;
        let local_port = tunnel.local_port().ok_or(TunnelError::NotOpen)?;
        sessions.tunnel = Some(tunnel);
        if !sessions.tunnel_active() {
            return Err(TunnelError::Dropped.into());
        }

        if !self.settings.show_all {
            self.open_store(sessions).await?;
        }

        self.transition(CycleState::Subscribing);
        let mut broker = self.endpoints.connect_broker(local_port).await?;
        let topic = self.settings.topic();
        let subscribed = broker.subscribe(&topic).await;
        sessions.broker = Some(broker);
        subscribed?;

        self.transition(CycleState::Streaming);
        loop {
            if self.stop_requested() {
                return Ok(());
            }
            if !sessions.tunnel_active() {
                warn!("Tunnel transport is no longer active");
                return Err(TunnelError::Dropped.into());
            }

            let Some(broker) = sessions.broker.as_mut() else {
                return Err(TunnelError::NotOpen.into());
            };
            if let Some(message) = broker.poll(self.settings.poll_interval).await? {
                self.handle_message(sessions, message).await?;
            }
        }
    }

    async fn open_store(&mut self, sessions: &mut CycleSessions) -> IngestResult<()> {
        sessions.close_store().await;
        let store = self.endpoints.connect_store().await?;
        sessions.store = Some(store);
        info!("Connected to database");

        let table = self.settings.default_table().to_string();
        self.ensure_table(sessions, &table).await?;
        Ok(())
    }

    async fn ensure_table(&mut self, sessions: &mut CycleSessions, table: &str) -> IngestResult<()> {
        if sessions.ensured_tables.contains(table) {
            return Ok(());
        }
        let store = sessions
            .store
            .as_mut()
            .ok_or(crate::store::StoreError::NotConnected)?;
        store.ensure_table_exists(table, &self.schema, true).await?;
        sessions.ensured_tables.insert(table.to_string());
        Ok(())
    }

    async fn handle_message(
        &mut self,
        sessions: &mut CycleSessions,
        message: InboundMessage,
    ) -> IngestResult<()> {
        let mut record = match TelemetryMessage::decode(&message.payload) {
            Ok(record) => record,
            Err(e) if e.is_malformed() => {
                warn!("Dropping message on {}: {}", message.topic, IngestError::from(e));
                return Ok(());
            }
            Err(e) => {
                debug!("Ignoring message on {}: {}", message.topic, e);
                return Ok(());
            }
        };

        if self.settings.show || self.settings.show_all {
            self.progress.report(IngestProgressEvent::Received {
                topic: message.topic.clone(),
                location: record
                    .location
                    .clone()
                    .unwrap_or_else(|| self.settings.location.clone()),
                unit_name: record.unit_name.clone(),
                attributes: record.attributes.clone(),
            });
        }
        if self.settings.show_all {
            return Ok(());
        }

        let table = self
            .settings
            .table_override
            .clone()
            .unwrap_or_else(|| record.unit_name.clone());
        record.inject_location(&self.settings.location);

        match self.persist(sessions, &table, &record).await {
            Ok(()) => {
                self.inserted += 1;
                self.progress.report(IngestProgressEvent::Inserted {
                    table,
                    total: self.inserted,
                });
                Ok(())
            }
            Err(e) if !self.settings.debug && e.kind().disposition() == Disposition::ReconnectStore => {
                error!("{}", e);
                warn!("Reconnecting to the database");
                self.open_store(sessions).await
            }
            Err(e) => Err(e),
        }
    }

    async fn persist(
        &mut self,
        sessions: &mut CycleSessions,
        table: &str,
        record: &TelemetryMessage,
    ) -> IngestResult<()> {
        if sessions.store.is_none() {
            self.open_store(sessions).await?;
        }
        self.ensure_table(sessions, table).await?;

        let store = sessions
            .store
            .as_mut()
            .ok_or(crate::store::StoreError::NotConnected)?;
        store.insert_row(&record.to_row(), table, &self.schema).await?;
        Ok(())
    }
}

/// Endpoints backed by SSH, MQTT and MySQL as configured.
pub struct LiveEndpoints {
    config: Config,
    client_id: String,
}

impl LiveEndpoints {
    pub fn new(config: Config) -> Self {
        let client_id = config
            .ingest
            .client_id
            .clone()
            .unwrap_or_else(|| format!("ydev2db-{}", Utc::now().timestamp_millis()));
        Self { config, client_id }
    }
}

#[async_trait]
impl Endpoints for LiveEndpoints {
    async fn open_tunnel(&mut self) -> IngestResult<Box<dyn Tunnel>> {
        let tunnel_cfg = &self.config.tunnel;
        let mut tunnel = SshTunnel::open(TunnelTarget {
            host: tunnel_cfg.host.clone(),
            port: tunnel_cfg.port,
            username: tunnel_cfg.username.clone(),
            key_file: tunnel_cfg.key_file.clone(),
            known_hosts: tunnel_cfg.known_hosts_path(),
        })
        .await?;

        if let Err(e) = tunnel
            .forward_local_port(
                0,
                &self.config.ingest.broker_host,
                self.config.ingest.broker_port,
            )
            .await
        {
            tunnel.close().await;
            return Err(e.into());
        }
        Ok(Box::new(tunnel))
    }

    async fn connect_broker(&mut self, local_port: u16) -> IngestResult<Box<dyn BrokerSession>> {
        Ok(Box::new(MqttSession::new(
            &self.client_id,
            "127.0.0.1",
            local_port,
            self.config.ingest.max_packet_size,
        )))
    }

    async fn connect_store(&mut self) -> IngestResult<Box<dyn RowSink>> {
        let mut store = StoreConnector::new(self.config.store.clone());
        store.connect(true).await?;
        Ok(Box::new(store))
    }
}

/// Run the collector until interrupted.
pub async fn run_collect(
    config: &Config,
    settings: IngestSettings,
    progress: Box<dyn ProgressReporter>,
) -> anyhow::Result<()> {
    let schema = config.table_schema()?;
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown_tx.shutdown();
        }
    });

    if settings.show_all {
        info!("Displaying all messages; nothing will be stored");
    }

    let mut ingest = IngestLoop::new(
        LiveEndpoints::new(config.clone()),
        schema,
        settings,
        progress,
        shutdown_rx,
    );
    ingest.run().await?;
    Ok(())
}
