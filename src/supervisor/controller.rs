//! Connection supervisor task and its control handle

use super::state::{
    decide_next_action, ControlFlags, SupervisorAction, SupervisorSettings, SupervisorState,
    SupervisorStats,
};
use crate::config::{ConfigError, ConnectorConfig};
use crate::transport::{SessionCallbacks, SessionClient, SessionEvent, Transport};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Connection supervisor has been stopped")]
    Stopped,
    #[error("Not connected to IoT Hub within {0:?}")]
    ConnectTimeout(Duration),
}

/// Session callbacks that forward every event into a channel for the supervisor
pub fn event_channel() -> (SessionCallbacks, mpsc::UnboundedReceiver<SessionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let connect_tx = tx.clone();

    let callbacks = SessionCallbacks::new()
        .on_connect(move |event| {
            let _ = connect_tx.send(event.clone());
        })
        .on_disconnect(move |event| {
            let _ = tx.send(event.clone());
        });

    (callbacks, rx)
}

/// Keeps a broker session connected until stopped
///
/// The background task starts on construction and calls `connect` on the
/// session whenever it is not connected, not paused and the retry spacing has
/// elapsed. Must be created inside a Tokio runtime.
pub struct ConnectionSupervisor<T: Transport> {
    session: Arc<T>,
    control_tx: watch::Sender<ControlFlags>,
    connected_tx: Arc<watch::Sender<bool>>,
    state_tx: Arc<watch::Sender<SupervisorState>>,
    stats_tx: Arc<watch::Sender<SupervisorStats>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionSupervisor<SessionClient> {
    /// Build the IoT Hub session from configuration and start supervising it
    ///
    /// `gateway_callbacks` run after the supervisor has been notified.
    pub fn from_config(
        config: &ConnectorConfig,
        gateway_callbacks: SessionCallbacks,
    ) -> Result<Self, ConfigError> {
        let (callbacks, events) = event_channel();
        let session = SessionClient::from_config(config, callbacks.chain(gateway_callbacks))?;

        info!(
            host = %session.host(),
            device_id = %session.device_id(),
            "Supervising IoT Hub session"
        );

        Ok(Self::spawn(
            Arc::new(session),
            events,
            SupervisorSettings::from(&config.reconnect),
        ))
    }
}

impl<T: Transport> ConnectionSupervisor<T> {
    /// Start supervising `session`; `events` must receive the session's callbacks
    pub fn spawn(
        session: Arc<T>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        settings: SupervisorSettings,
    ) -> Self {
        let (control_tx, control_rx) =
            watch::channel(ControlFlags::new(settings.min_reconnect_delay));
        let (connected_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(SupervisorState::Idle);
        let (stats_tx, _) = watch::channel(SupervisorStats::default());

        let connected_tx = Arc::new(connected_tx);
        let state_tx = Arc::new(state_tx);
        let stats_tx = Arc::new(stats_tx);

        let span = crate::supervisor_span!(
            connect_poll_ms = settings.connect_poll_interval.as_millis() as u64
        );
        let task = SupervisorTask {
            session: session.clone(),
            control_rx,
            events,
            connected_tx: connected_tx.clone(),
            state_tx: state_tx.clone(),
            stats_tx: stats_tx.clone(),
            settings,
        };
        let handle = tokio::spawn(task.run().instrument(span));

        Self {
            session,
            control_tx,
            connected_tx,
            state_tx,
            stats_tx,
            task: Mutex::new(Some(handle)),
        }
    }

    /// The supervised session, for publishing
    pub fn session(&self) -> &Arc<T> {
        &self.session
    }

    pub fn pause(&self) {
        self.control_tx.send_modify(|flags| flags.paused = true);
        debug!("Connection attempts paused");
    }

    pub fn unpause(&self) {
        self.control_tx.send_modify(|flags| flags.paused = false);
        debug!("Connection attempts resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.control_tx.borrow().paused
    }

    pub fn is_stopped(&self) -> bool {
        self.control_tx.borrow().stopped
    }

    /// Whether the last session event reported a live connection
    pub fn is_connected(&self) -> bool {
        *self.connected_tx.borrow()
    }

    pub fn state(&self) -> SupervisorState {
        *self.state_tx.borrow()
    }

    /// Watch supervisor state changes
    pub fn subscribe_state(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats_tx.borrow().clone()
    }

    /// Resume connect attempts, spaced at least `min_reconnect_delay` apart
    pub fn connect(&self, min_reconnect_delay: Duration) {
        if self.is_stopped() {
            warn!("connect() called on a stopped supervisor, ignoring");
            return;
        }

        self.control_tx.send_modify(|flags| {
            flags.paused = false;
            flags.min_reconnect_delay = min_reconnect_delay;
        });
        debug!(?min_reconnect_delay, "Connection attempts enabled");
    }

    /// Disconnect the session and end the supervisor task; terminal
    pub async fn stop(&self) {
        if self.is_stopped() {
            debug!("Supervisor already stopped");
            return;
        }

        info!("Stopping connection supervisor");
        self.control_tx.send_modify(|flags| flags.stopped = true);

        // The task disconnects on exit, after any connect it had in flight
        let task_ran = self.join().await;
        if !task_ran && (self.session.is_connected() || self.session.connection_in_progress()) {
            if let Err(e) = self.session.disconnect().await {
                warn!("Session disconnect failed during stop: {}", e);
            }
        }

        self.mark_disconnected();
        self.state_tx.send_replace(SupervisorState::Stopped);
    }

    /// Pause attempts and disconnect the session; `connect()` resumes
    pub async fn disconnect(&self) {
        self.pause();
        self.unsubscribe("*");

        if let Err(e) = self.session.disconnect().await {
            warn!("Session disconnect failed: {}", e);
        }

        self.mark_disconnected();
        if !self.is_stopped() {
            self.state_tx.send_replace(SupervisorState::Disconnected);
        }
        info!("Disconnected from IoT Hub");
    }

    /// IoT Hub sessions hold no per-device subscriptions, so there is nothing to remove
    pub fn unsubscribe(&self, subscription_id: &str) {
        debug!(subscription_id, "No subscriptions to remove");
    }

    /// Wait until the session reports connected
    pub async fn wait_connected(&self, timeout: Duration) -> Result<(), SupervisorError> {
        let mut connected_rx = self.connected_tx.subscribe();
        let mut control_rx = self.control_tx.subscribe();

        let wait = async {
            loop {
                if *connected_rx.borrow_and_update() {
                    return Ok(());
                }
                if control_rx.borrow_and_update().stopped {
                    return Err(SupervisorError::Stopped);
                }

                tokio::select! {
                    changed = connected_rx.changed() => {
                        if changed.is_err() {
                            return Err(SupervisorError::Stopped);
                        }
                    }
                    changed = control_rx.changed() => {
                        if changed.is_err() {
                            return Err(SupervisorError::Stopped);
                        }
                    }
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SupervisorError::ConnectTimeout(timeout))?
    }

    /// Wait for the supervisor task to exit
    ///
    /// Returns `true` if this call observed the task run to completion.
    pub async fn join(&self) -> bool {
        let handle = self.task.lock().await.take();
        match handle {
            Some(handle) => match handle.await {
                Ok(()) => true,
                Err(e) => {
                    if !e.is_cancelled() {
                        warn!("Supervisor task failed: {}", e);
                    }
                    false
                }
            },
            None => false,
        }
    }

    fn mark_disconnected(&self) {
        if self.connected_tx.send_replace(false) {
            self.stats_tx.send_modify(|stats| stats.record_disconnection());
        }
    }
}

impl<T: Transport> Drop for ConnectionSupervisor<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

struct SupervisorTask<T: Transport> {
    session: Arc<T>,
    control_rx: watch::Receiver<ControlFlags>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    connected_tx: Arc<watch::Sender<bool>>,
    state_tx: Arc<watch::Sender<SupervisorState>>,
    stats_tx: Arc<watch::Sender<SupervisorStats>>,
    settings: SupervisorSettings,
}

impl<T: Transport> SupervisorTask<T> {
    async fn run(mut self) {
        info!("Connection supervisor started");

        let mut last_attempt: Option<Instant> = None;
        let mut events_open = true;

        loop {
            let flags = self.control_rx.borrow_and_update().clone();
            let connected = *self.connected_tx.borrow();
            let in_flight = !connected && self.session.connection_in_progress();

            if !in_flight && !connected && *self.state_tx.borrow() == SupervisorState::Connecting {
                self.state_tx.send_replace(SupervisorState::Disconnected);
            }

            let since_last_attempt = last_attempt.map(|at| at.elapsed());
            match decide_next_action(
                &flags,
                connected,
                in_flight,
                since_last_attempt,
                &self.settings,
            ) {
                SupervisorAction::Exit => break,
                SupervisorAction::Connect => {
                    self.stats_tx.send_modify(|stats| stats.record_attempt());
                    self.state_tx.send_replace(SupervisorState::Connecting);
                    last_attempt = Some(Instant::now());

                    debug!(
                        attempt = self.stats_tx.borrow().connect_attempts,
                        "Connecting to IoT Hub"
                    );
                    self.session.connect(None).await;

                    if self.control_rx.borrow().stopped {
                        break;
                    }
                }
                SupervisorAction::Wait(delay) => {
                    tokio::select! {
                        changed = self.control_rx.changed() => {
                            if changed.is_err() {
                                debug!("Supervisor handle dropped");
                                break;
                            }
                        }
                        event = self.events.recv(), if events_open => {
                            match event {
                                Some(event) => self.handle_event(event),
                                None => events_open = false,
                            }
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if let Err(e) = self.session.disconnect().await {
            warn!("Session disconnect failed during stop: {}", e);
        }
        if self.connected_tx.send_replace(false) {
            self.stats_tx
                .send_modify(|stats| stats.record_disconnection());
        }
        self.state_tx.send_replace(SupervisorState::Stopped);
        info!("Connection supervisor stopped");
    }

    fn handle_event(&self, event: SessionEvent) {
        let stopped = *self.state_tx.borrow() == SupervisorState::Stopped;

        match event {
            SessionEvent::Connected => {
                self.connected_tx.send_replace(true);
                self.stats_tx
                    .send_modify(|stats| stats.record_connected(Utc::now()));
                if !stopped {
                    self.state_tx.send_replace(SupervisorState::Connected);
                }
                info!("Connected to IoT Hub");
            }
            SessionEvent::ConnectFailed(code) => {
                self.connected_tx.send_replace(false);
                self.stats_tx.send_modify(|stats| stats.record_refusal());
                if !stopped {
                    self.state_tx.send_replace(SupervisorState::Disconnected);
                }
                warn!(code = code.code(), "IoT Hub refused the connection");
            }
            SessionEvent::Disconnected { reason } => {
                if self.connected_tx.send_replace(false) {
                    self.stats_tx
                        .send_modify(|stats| stats.record_disconnection());
                }
                if !stopped {
                    self.state_tx.send_replace(SupervisorState::Disconnected);
                }
                info!(reason = %reason, "IoT Hub session ended");
            }
        }
    }
}
