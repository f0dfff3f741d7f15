//! Async link supervisor: owns the transport exclusively and drives the
//! reconnection state machine.
//!
//! One `LinkManager` instance is active per logical link. Replacing the
//! connection options means disconnecting this instance (awaited) before
//! spawning its successor; two live sockets to the same device could race
//! actuator commands.

use std::time::Instant;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::state::{LinkState, LinkStateMachine};
use crate::core::{ConnectionOptions, LinkError, LinkTiming, TransportError};
use crate::retry::{RetryPolicy, RetrySchedule};
use crate::transport::{self, TransportReader, TransportWriter};

/// Capacity of the send-request channel between callers and the supervisor.
const SEND_QUEUE_DEPTH: usize = 32;

/// Link-health events published to subscribers.
///
/// Every event carries the connect-cycle generation that produced it, so
/// consumers can discard events from superseded cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// A connect attempt succeeded.
    Connected {
        /// Connect-cycle generation.
        generation: u64,
    },
    /// A connect attempt failed.
    ConnectFailed {
        /// Connect-cycle generation.
        generation: u64,
        /// Consecutive failures including this one.
        failures: u32,
    },
    /// An established link dropped.
    Lost {
        /// Connect-cycle generation.
        generation: u64,
        /// Consecutive failures including this loss.
        failures: u32,
    },
    /// No inbound traffic within the stale threshold; link is `Degraded`.
    Stale {
        /// Connect-cycle generation.
        generation: u64,
    },
    /// Inbound traffic resumed on a degraded link.
    Recovered {
        /// Connect-cycle generation.
        generation: u64,
    },
    /// Retry budget exhausted; the link is terminally `Failed`.
    Failed {
        /// Connect-cycle generation.
        generation: u64,
        /// Total connect attempts made.
        attempts: u32,
    },
}

struct SendRequest {
    line: String,
    reply: oneshot::Sender<Result<(), LinkError>>,
}

/// Handle to one supervised link.
#[derive(Debug)]
pub struct LinkManager {
    options: ConnectionOptions,
    state_rx: watch::Receiver<LinkState>,
    send_tx: mpsc::Sender<SendRequest>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl LinkManager {
    /// Validate configuration and spawn the supervisor task.
    ///
    /// Inbound sentence lines go to `line_tx`, health events to `event_tx`;
    /// the caller owns both channels so subscriptions survive link
    /// replacement.
    pub fn spawn(
        options: ConnectionOptions,
        policy: RetryPolicy,
        timing: LinkTiming,
        line_tx: broadcast::Sender<String>,
        event_tx: broadcast::Sender<LinkEvent>,
    ) -> Result<Self, LinkError> {
        options.validate()?;
        policy.validate()?;

        let (state_tx, state_rx) = watch::channel(LinkState::Disconnected);
        let (send_tx, send_rx) = mpsc::channel(SEND_QUEUE_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let supervisor = Supervisor {
            options: options.clone(),
            timing,
            machine: LinkStateMachine::new(),
            schedule: RetrySchedule::new(policy),
            state_tx,
            line_tx,
            event_tx,
            send_rx,
            shutdown_rx,
        };
        let task = tokio::spawn(supervisor.run());

        Ok(Self {
            options,
            state_rx,
            send_tx,
            shutdown_tx,
            task: Some(task),
        })
    }

    /// Options this link was created with.
    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    /// Current link state.
    pub fn state(&self) -> LinkState {
        *self.state_rx.borrow()
    }

    /// Watch link-state transitions.
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_rx.clone()
    }

    /// Send one sentence line over the link.
    ///
    /// Fails with [`LinkError::NotConnected`] unless the link is
    /// `Connected` or `Degraded`.
    pub async fn send(&self, line: &str) -> Result<(), LinkError> {
        if !self.state().accepts_sends() {
            return Err(LinkError::NotConnected);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_tx
            .send(SendRequest {
                line: line.to_owned(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| LinkError::NotConnected)?;
        reply_rx.await.map_err(|_| LinkError::NotConnected)?
    }

    /// Disconnect and release the link. Idempotent; awaits full teardown
    /// so a successor can be spawned without socket overlap.
    pub async fn disconnect(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for LinkManager {
    fn drop(&mut self) {
        // Backstop for callers that drop without disconnect().
        if let Some(task) = self.task.take() {
            let _ = self.shutdown_tx.send(true);
            task.abort();
        }
    }
}

enum Exit {
    Lost,
    Shutdown,
}

struct Supervisor {
    options: ConnectionOptions,
    timing: LinkTiming,
    machine: LinkStateMachine,
    schedule: RetrySchedule,
    state_tx: watch::Sender<LinkState>,
    line_tx: broadcast::Sender<String>,
    event_tx: broadcast::Sender<LinkEvent>,
    send_rx: mpsc::Receiver<SendRequest>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            let generation = self.machine.begin_connect();
            self.publish_state();
            debug!(generation, address = %self.options.address, "connecting");

            let attempt = tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    self.finish_disconnected();
                    return;
                }
                result = tokio::time::timeout(
                    self.timing.connect_timeout,
                    transport::connect(&self.options),
                ) => result,
            };

            match attempt {
                Ok(Ok((mut reader, mut writer))) => {
                    self.schedule.reset();
                    self.machine.on_connected();
                    self.publish_state();
                    info!(generation, address = %self.options.address, "link connected");
                    self.emit(LinkEvent::Connected { generation });

                    match self.run_connected(&mut reader, &mut writer, generation).await {
                        Exit::Shutdown => {
                            writer.shutdown().await;
                            self.finish_disconnected();
                            return;
                        }
                        Exit::Lost => {
                            let failures = self.machine.on_link_lost();
                            self.publish_state();
                            warn!(generation, failures, "link lost");
                            self.emit(LinkEvent::Lost {
                                generation,
                                failures,
                            });
                            self.fail_queued_sends();
                            if !self.backoff_or_fail().await {
                                return;
                            }
                        }
                    }
                }
                Ok(Err(err)) => {
                    if !self.handle_connect_failure(generation, err).await {
                        return;
                    }
                }
                Err(_elapsed) => {
                    let err = TransportError::ConnectTimeout;
                    if !self.handle_connect_failure(generation, err).await {
                        return;
                    }
                }
            }
        }
    }

    async fn handle_connect_failure(&mut self, generation: u64, err: TransportError) -> bool {
        let failures = self.machine.on_connect_failed();
        self.publish_state();
        warn!(generation, failures, error = %err, "connect failed");
        self.emit(LinkEvent::ConnectFailed {
            generation,
            failures,
        });
        self.backoff_or_fail().await
    }

    /// Fail every send request still queued at the moment of link loss.
    ///
    /// A request accepted just before the drop must error out immediately,
    /// not sit in the channel through the backoff and ride out over the
    /// next connection with a stale line.
    fn fail_queued_sends(&mut self) {
        while let Ok(req) = self.send_rx.try_recv() {
            let _ = req.reply.send(Err(LinkError::NotConnected));
        }
    }

    /// Wait out the backoff delay; returns `false` when the supervisor is
    /// done (shut down or terminally failed).
    async fn backoff_or_fail(&mut self) -> bool {
        match self.schedule.next_delay() {
            Some(delay) => {
                debug!(delay_ms = delay.as_millis() as u64, "reconnect backoff");
                tokio::select! {
                    _ = self.shutdown_rx.changed() => {
                        self.finish_disconnected();
                        return false;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                if self.schedule.is_exhausted() {
                    self.fail().await;
                    return false;
                }
                true
            }
            None => {
                self.fail().await;
                false
            }
        }
    }

    async fn run_connected(
        &mut self,
        reader: &mut TransportReader,
        writer: &mut TransportWriter,
        generation: u64,
    ) -> Exit {
        let mut last_line = Instant::now();
        loop {
            let degraded = self.machine.state() == LinkState::Degraded;
            let stale_at =
                tokio::time::Instant::from_std(last_line + self.timing.stale_after);
            let dead_at =
                tokio::time::Instant::from_std(last_line + self.timing.dead_interval);

            tokio::select! {
                _ = self.shutdown_rx.changed() => return Exit::Shutdown,
                req = self.send_rx.recv() => {
                    let Some(req) = req else { return Exit::Shutdown };
                    match writer.send_line(&req.line).await {
                        Ok(()) => {
                            let _ = req.reply.send(Ok(()));
                        }
                        Err(err) => {
                            warn!(generation, error = %err, "send failed");
                            let _ = req.reply.send(Err(err.into()));
                            return Exit::Lost;
                        }
                    }
                }
                line = reader.next_line() => match line {
                    Ok(line) => {
                        last_line = Instant::now();
                        if degraded {
                            self.machine.on_recovered();
                            self.publish_state();
                            info!(generation, "inbound traffic resumed");
                            self.emit(LinkEvent::Recovered { generation });
                        }
                        // Lagging subscribers miss lines rather than
                        // blocking the link.
                        let _ = self.line_tx.send(line);
                    }
                    Err(err) => {
                        warn!(generation, error = %err, "receive failed");
                        return Exit::Lost;
                    }
                },
                _ = tokio::time::sleep_until(dead_at) => {
                    warn!(generation, "no inbound traffic within dead interval");
                    return Exit::Lost;
                }
                _ = tokio::time::sleep_until(stale_at), if !degraded => {
                    self.machine.on_stale();
                    self.publish_state();
                    warn!(generation, "inbound traffic stale");
                    self.emit(LinkEvent::Stale { generation });
                }
            }
        }
    }

    /// Terminal failure: report upward and keep answering send requests
    /// with the failure until shut down.
    async fn fail(&mut self) {
        let attempts = self.schedule.attempt();
        self.machine.on_failed();
        self.publish_state();
        error!(attempts, "link failed; retry budget exhausted");
        self.emit(LinkEvent::Failed {
            generation: self.machine.generation(),
            attempts,
        });

        loop {
            tokio::select! {
                _ = self.shutdown_rx.changed() => {
                    self.finish_disconnected();
                    return;
                }
                req = self.send_rx.recv() => match req {
                    Some(req) => {
                        let _ = req.reply.send(Err(LinkError::Failed { attempts }));
                    }
                    None => {
                        self.finish_disconnected();
                        return;
                    }
                },
            }
        }
    }

    fn finish_disconnected(&mut self) {
        self.machine.on_disconnected();
        self.publish_state();
        debug!("link disconnected");
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.machine.state());
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.event_tx.send(event);
    }
}
