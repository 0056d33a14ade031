//! Lifecycle controller: drives one [`Coordinator`] from a single task.
//!
//! API commands, transport events, timer ticks and the results of directory
//! calls all funnel into one `select!` loop, so coordinator state is only
//! ever touched by one handler at a time. Anything that completes later
//! (directory lookups, the startup guard, reconnect backoff) comes back as a
//! [`Continuation`] tagged with the generation it was issued under.
//!
//! Directory calls run one at a time on a per-session worker, in the order
//! they were issued, so an unregister sent by `stop` always lands after any
//! keep-alive that was already in flight.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use crate::config::MeshConfig;
use crate::coordinator::{Coordinator, MeshSnapshot, MeshStatus, TransportOutcome};
use crate::directory::Directory;
use crate::events::{Event, EventBus};
use crate::fanout::ChatMessage;
use crate::transport::{Transport, TransportEvent};

const COMMAND_BUFFER: usize = 64;

/// Host-environment signals the session reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleSignal {
    /// The app came back to the foreground.
    Foreground,
    NetworkOnline,
    NetworkOffline,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("mesh session has shut down")]
    Closed,
}

enum Command {
    Start {
        self_id: String,
        done: oneshot::Sender<bool>,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
    SendChat {
        text: String,
        done: oneshot::Sender<Option<ChatMessage>>,
    },
    Signal {
        signal: LifecycleSignal,
        done: oneshot::Sender<()>,
    },
}

enum DirectoryCall {
    Register { self_id: String },
    Unregister { self_id: String },
    ListOnline { generation: u64 },
}

enum Continuation {
    Bootstrap {
        generation: u64,
        candidates: Vec<String>,
    },
    StartupDeadline {
        generation: u64,
    },
    Reconnect {
        generation: u64,
    },
}

/// Cloneable front door to a running [`MeshSession`].
#[derive(Clone)]
pub struct MeshHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<MeshSnapshot>,
    bus: EventBus,
}

impl MeshHandle {
    /// Start the coordinator as `self_id`. Returns false if it was already
    /// running.
    pub async fn start(&self, self_id: &str) -> Result<bool, SessionError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Start {
            self_id: self_id.to_string(),
            done,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Stop the coordinator. State is cleared by the time this returns.
    pub async fn stop(&self) -> Result<(), SessionError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Stop { done }).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    /// Broadcast a chat message. `Ok(None)` means the text was blank or the
    /// coordinator is not running.
    pub async fn send_chat(&self, text: &str) -> Result<Option<ChatMessage>, SessionError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::SendChat {
            text: text.to_string(),
            done,
        })
        .await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    pub async fn signal(&self, signal: LifecycleSignal) -> Result<(), SessionError> {
        let (done, rx) = oneshot::channel();
        self.send(Command::Signal { signal, done }).await?;
        rx.await.map_err(|_| SessionError::Closed)
    }

    async fn send(&self, command: Command) -> Result<(), SessionError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| SessionError::Closed)
    }

    pub fn snapshot(&self) -> MeshSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> MeshStatus {
        self.snapshot.borrow().status.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.snapshot.borrow().is_ready
    }

    pub fn active_count(&self) -> usize {
        self.snapshot.borrow().active_count
    }

    pub fn messages(&self) -> Vec<ChatMessage> {
        self.snapshot.borrow().messages.clone()
    }

    /// Wait until a published snapshot satisfies `condition`.
    pub async fn wait_for(
        &self,
        condition: impl FnMut(&MeshSnapshot) -> bool,
    ) -> Result<MeshSnapshot, SessionError> {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(condition)
            .await
            .map_err(|_| SessionError::Closed)?;
        Ok(snapshot.clone())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.bus.subscribe()
    }
}

/// Owns the coordinator and the loop that feeds it.
pub struct MeshSession<T: Transport> {
    coordinator: Coordinator<T>,
    directory_calls: mpsc::UnboundedSender<DirectoryCall>,
    config: MeshConfig,
    commands: mpsc::Receiver<Command>,
    continuation_tx: mpsc::UnboundedSender<Continuation>,
    continuations: mpsc::UnboundedReceiver<Continuation>,
    transport_events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    snapshot: watch::Sender<MeshSnapshot>,
}

impl<T: Transport> MeshSession<T> {
    /// Spawn the session loop on the current tokio runtime. The loop runs
    /// until every handle is dropped, stopping the coordinator on the way out.
    pub fn spawn<D: Directory>(
        transport: Arc<T>,
        directory: Arc<D>,
        config: MeshConfig,
    ) -> MeshHandle {
        let bus = EventBus::default();
        let (command_tx, commands) = mpsc::channel(COMMAND_BUFFER);
        let (continuation_tx, continuations) = mpsc::unbounded_channel();
        let (directory_calls, directory_rx) = mpsc::unbounded_channel();
        let (snapshot, snapshot_rx) = watch::channel(MeshSnapshot::default());

        tokio::spawn(serve_directory(
            directory,
            directory_rx,
            continuation_tx.clone(),
        ));
        let session = Self {
            coordinator: Coordinator::new(transport, &config, bus.clone()),
            directory_calls,
            config,
            commands,
            continuation_tx,
            continuations,
            transport_events: None,
            snapshot,
        };
        tokio::spawn(session.run());

        MeshHandle {
            commands: command_tx,
            snapshot: snapshot_rx,
            bus,
        }
    }

    async fn run(mut self) {
        let mut keepalive = ticker(self.config.keepalive_interval());
        let mut discovery = ticker(self.config.discovery_interval());
        let mut roster_gossip = ticker(self.config.roster_gossip_interval());

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(event) = next_event(&mut self.transport_events) => self.on_transport(event),
                Some(continuation) = self.continuations.recv() => self.on_continuation(continuation),
                _ = keepalive.tick() => self.keepalive(),
                _ = discovery.tick() => {
                    if self.coordinator.needs_discovery() {
                        self.request_bootstrap();
                    }
                }
                _ = roster_gossip.tick() => {
                    let links = self.coordinator.gossip_roster();
                    tracing::debug!(links, "roster gossip round");
                }
            }
            self.publish();
        }

        self.stop();
        self.publish();
        tracing::debug!("mesh session loop exited");
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.coordinator.snapshot());
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Start { self_id, done } => {
                let started = self.start(&self_id);
                self.publish();
                let _ = done.send(started);
            }
            Command::Stop { done } => {
                self.stop();
                self.publish();
                let _ = done.send(());
            }
            Command::SendChat { text, done } => {
                let message = self.coordinator.send_chat(&text);
                self.publish();
                let _ = done.send(message);
            }
            Command::Signal { signal, done } => {
                self.on_signal(signal);
                self.publish();
                let _ = done.send(());
            }
        }
    }

    fn start(&mut self, self_id: &str) -> bool {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if !self.coordinator.start(self_id, events_tx) {
            return false;
        }
        self.transport_events = Some(events_rx);

        let generation = self.coordinator.generation();
        let delay = self.config.startup_timeout();
        self.after(delay, Continuation::StartupDeadline { generation });
        true
    }

    fn stop(&mut self) {
        let Some(self_id) = self.coordinator.stop() else {
            return;
        };
        self.transport_events = None;
        self.call_directory(DirectoryCall::Unregister { self_id });
    }

    fn on_transport(&mut self, event: TransportEvent) {
        match self.coordinator.handle_transport(event) {
            TransportOutcome::Handled => {}
            TransportOutcome::EndpointOpened => {
                self.keepalive();
                self.request_bootstrap();
            }
            TransportOutcome::EndpointLost => self.schedule_reconnect(),
        }
    }

    fn on_continuation(&mut self, continuation: Continuation) {
        match continuation {
            Continuation::Bootstrap {
                generation,
                candidates,
            } => {
                if self.coordinator.bootstrap(generation, &candidates).is_none() {
                    tracing::debug!(candidates = candidates.len(), "no bootstrap peer dialed");
                }
            }
            Continuation::StartupDeadline { generation } => {
                self.coordinator.startup_deadline(generation)
            }
            Continuation::Reconnect { generation } => {
                if generation != self.coordinator.generation() || self.coordinator.is_ready() {
                    return;
                }
                // An accepted attempt may still never open; keep trying until it does.
                self.coordinator.reconnect(generation);
                self.schedule_reconnect();
            }
        }
    }

    fn on_signal(&mut self, signal: LifecycleSignal) {
        if !self.coordinator.is_running() {
            return;
        }
        tracing::info!(?signal, "lifecycle signal");
        match signal {
            LifecycleSignal::Foreground | LifecycleSignal::NetworkOnline => {
                self.keepalive();
                // Bootstrap follows from the EndpointOpen this produces.
                if self.coordinator.endpoint_lost()
                    && !self.coordinator.reconnect(self.coordinator.generation())
                {
                    self.schedule_reconnect();
                }
            }
            LifecycleSignal::NetworkOffline => self.coordinator.network_offline(),
        }
    }

    /// Re-announce ourselves to the directory. Failures are logged only.
    fn keepalive(&self) {
        let Some(self_id) = self.coordinator.self_id().map(String::from) else {
            return;
        };
        self.call_directory(DirectoryCall::Register { self_id });
    }

    /// Ask the directory who is online; the answer comes back as a
    /// continuation and dials at most one peer.
    fn request_bootstrap(&self) {
        if !self.coordinator.is_running() {
            return;
        }
        let generation = self.coordinator.generation();
        self.call_directory(DirectoryCall::ListOnline { generation });
    }

    fn call_directory(&self, call: DirectoryCall) {
        if self.directory_calls.send(call).is_err() {
            tracing::warn!("directory worker gone; call dropped");
        }
    }

    fn schedule_reconnect(&self) {
        let generation = self.coordinator.generation();
        self.after(
            self.config.reconnect_delay(),
            Continuation::Reconnect { generation },
        );
    }

    fn after(&self, delay: Duration, continuation: Continuation) {
        let continuations = self.continuation_tx.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = continuations.send(continuation);
        });
    }
}

/// Runs a session's directory calls sequentially until the session is gone.
async fn serve_directory<D: Directory>(
    directory: Arc<D>,
    mut calls: mpsc::UnboundedReceiver<DirectoryCall>,
    continuations: mpsc::UnboundedSender<Continuation>,
) {
    while let Some(call) = calls.recv().await {
        match call {
            DirectoryCall::Register { self_id } => {
                if let Err(e) = directory.register_online(&self_id).await {
                    tracing::warn!(%self_id, error = %e, "directory keep-alive failed");
                }
            }
            DirectoryCall::Unregister { self_id } => {
                if let Err(e) = directory.unregister_online(&self_id).await {
                    tracing::warn!(%self_id, error = %e, "directory unregister failed");
                }
            }
            DirectoryCall::ListOnline { generation } => match directory.list_online().await {
                Ok(candidates) => {
                    let _ = continuations.send(Continuation::Bootstrap {
                        generation,
                        candidates,
                    });
                }
                Err(e) => tracing::warn!(error = %e, "directory lookup failed"),
            },
        }
    }
    tracing::debug!("directory worker exited");
}

/// Interval whose first tick is one full period away.
fn ticker(period: Duration) -> Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

async fn next_event(
    events: &mut Option<mpsc::UnboundedReceiver<TransportEvent>>,
) -> Option<TransportEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}
