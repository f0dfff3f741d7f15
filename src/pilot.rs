//! Top-level orchestrator: safety-gated command dispatch over a supervised
//! link.
//!
//! [`PilotLink`] owns the dispatch task, which is the single writer for the
//! command queue, the safety manager, the rolling health window, and the
//! degradation tier. Callers interact through message passing: command
//! submission returns a future that resolves with the command's terminal
//! outcome, and health transitions are pushed to subscribers.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::command::{
    Command, CommandCategory, CommandOutcome, CommandQueue, EntryId,
};
use crate::core::{
    ConnectionOptions, DegradationThresholds, LinkTiming, PilotError, SafetyLimits,
};
use crate::degrade::{DegradationController, DegradationTier, TierChange};
use crate::link::{LinkEvent, LinkManager, LinkState};
use crate::monitor::{HealthSample, Monitor};
use crate::retry::RetryPolicy;
use crate::safety::SafetyManager;

/// Capacity of the control channel into the dispatch task.
const CONTROL_QUEUE_DEPTH: usize = 64;

/// Capacity of the inbound-line broadcast channel.
const LINE_CHANNEL_DEPTH: usize = 256;

/// Capacity of the link-event and tier-change broadcast channels.
const EVENT_CHANNEL_DEPTH: usize = 64;

/// Full configuration for a [`PilotLink`].
#[derive(Debug, Clone)]
pub struct PilotConfig {
    /// Where and how to connect.
    pub connection: ConnectionOptions,
    /// Backoff policy for link reconnection.
    pub link_retry: RetryPolicy,
    /// Backoff policy for command acknowledgment retries. Independent of
    /// `link_retry`: the two never share attempt counters.
    pub command_retry: RetryPolicy,
    /// Link staleness and connect-timeout thresholds.
    pub timing: LinkTiming,
    /// Safety interlock limits.
    pub safety: SafetyLimits,
    /// Degradation escalation/recovery thresholds.
    pub degradation: DegradationThresholds,
    /// How long to wait for a device acknowledgment per attempt.
    pub ack_timeout: Duration,
    /// Interval between background health samples while the link is up.
    pub health_interval: Duration,
    /// Rolling health window capacity.
    pub health_window: usize,
    /// Payload transmitted for the forced disengage at the worst tier.
    /// The embedding application supplies the real sentence.
    pub disengage_payload: String,
    /// Deadline budget for the forced disengage command.
    pub disengage_deadline: Duration,
}

/// Builder for [`PilotLink`] construction.
#[derive(Debug)]
pub struct PilotLinkBuilder {
    config: PilotConfig,
}

impl PilotLinkBuilder {
    /// Start from the given connection options and default policies.
    pub fn new(connection: ConnectionOptions) -> Self {
        Self {
            config: PilotConfig {
                connection,
                link_retry: RetryPolicy::default(),
                command_retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(250),
                    max_delay: Duration::from_secs(5),
                    backoff_multiplier: 2.0,
                    jitter_ratio: 0.1,
                },
                timing: LinkTiming::default(),
                safety: SafetyLimits::default(),
                degradation: DegradationThresholds::default(),
                ack_timeout: Duration::from_secs(2),
                health_interval: Duration::from_secs(1),
                health_window: 50,
                disengage_payload: "DISENGAGE".to_owned(),
                disengage_deadline: Duration::from_secs(5),
            },
        }
    }

    /// Set the link reconnection policy.
    pub fn link_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.link_retry = policy;
        self
    }

    /// Set the command acknowledgment retry policy.
    pub fn command_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.command_retry = policy;
        self
    }

    /// Set link timing thresholds.
    pub fn timing(mut self, timing: LinkTiming) -> Self {
        self.config.timing = timing;
        self
    }

    /// Set safety limits.
    pub fn safety(mut self, safety: SafetyLimits) -> Self {
        self.config.safety = safety;
        self
    }

    /// Set degradation thresholds.
    pub fn degradation(mut self, thresholds: DegradationThresholds) -> Self {
        self.config.degradation = thresholds;
        self
    }

    /// Set the per-attempt acknowledgment timeout.
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    /// Set the background health sampling interval.
    pub fn health_interval(mut self, interval: Duration) -> Self {
        self.config.health_interval = interval;
        self
    }

    /// Set the rolling health window capacity.
    pub fn health_window(mut self, capacity: usize) -> Self {
        self.config.health_window = capacity;
        self
    }

    /// Set the payload sent for a forced disengage.
    pub fn disengage_payload(mut self, payload: impl Into<String>) -> Self {
        self.config.disengage_payload = payload.into();
        self
    }

    /// Finish the configuration.
    pub fn build(self) -> PilotConfig {
        self.config
    }

    /// Validate and spawn directly.
    pub fn spawn(self) -> Result<PilotLink, PilotError> {
        PilotLink::spawn(self.build())
    }
}

enum Control {
    Submit {
        category: CommandCategory,
        payload: String,
        deadline: Instant,
        reply: oneshot::Sender<CommandOutcome>,
    },
    Ack {
        category: CommandCategory,
        at: Instant,
    },
    ContextUpdate {
        at: Instant,
    },
    UpdateConnection {
        options: ConnectionOptions,
        reply: oneshot::Sender<Result<(), PilotError>>,
    },
    Shutdown,
}

/// Handle to the dispatch task.
#[derive(Debug)]
pub struct PilotLink {
    ctrl_tx: mpsc::Sender<Control>,
    line_tx: broadcast::Sender<String>,
    tier_change_tx: broadcast::Sender<TierChange>,
    tier_rx: watch::Receiver<DegradationTier>,
    link_state_rx: watch::Receiver<LinkState>,
    task: Option<JoinHandle<()>>,
}

impl PilotLink {
    /// Validate the configuration and spawn the dispatch task.
    pub fn spawn(config: PilotConfig) -> Result<Self, PilotError> {
        config.connection.validate()?;
        config.link_retry.validate()?;
        config.command_retry.validate()?;
        config.degradation.validate()?;
        let monitor = Monitor::new(config.health_window)?;

        let (line_tx, _) = broadcast::channel(LINE_CHANNEL_DEPTH);
        let (event_tx, link_events) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        let (tier_change_tx, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        let (tier_watch_tx, tier_rx) = watch::channel(DegradationTier::Nominal);
        let (state_watch_tx, link_state_rx) = watch::channel(LinkState::Disconnected);
        let (ctrl_tx, ctrl_rx) = mpsc::channel(CONTROL_QUEUE_DEPTH);

        let link = LinkManager::spawn(
            config.connection.clone(),
            config.link_retry.clone(),
            config.timing.clone(),
            line_tx.clone(),
            event_tx.clone(),
        )?;
        let link_watch = link.watch_state();
        let safety = SafetyManager::new(config.safety.clone());
        let degradation = DegradationController::new(config.degradation.clone());

        let dispatcher = Dispatcher {
            config,
            link,
            link_watch,
            link_events,
            line_tx: line_tx.clone(),
            event_tx,
            queue: CommandQueue::new(),
            safety,
            monitor,
            degradation,
            waiters: HashMap::new(),
            in_flight: None,
            ctrl_rx,
            tier_change_tx: tier_change_tx.clone(),
            tier_watch_tx,
            state_watch_tx,
            command_failures: 0,
        };
        let task = tokio::spawn(dispatcher.run());

        Ok(Self {
            ctrl_tx,
            line_tx,
            tier_change_tx,
            tier_rx,
            link_state_rx,
            task: Some(task),
        })
    }

    /// Submit an autopilot command.
    ///
    /// Resolves with the command's terminal outcome: acknowledged,
    /// rejected, expired, superseded, or denied by the safety manager. A
    /// steering input is never dropped without a reported outcome.
    pub fn submit_command(
        &self,
        category: CommandCategory,
        payload: impl Into<String>,
        deadline: Instant,
    ) -> impl std::future::Future<Output = Result<CommandOutcome, PilotError>> + 'static {
        let ctrl_tx = self.ctrl_tx.clone();
        let payload = payload.into();
        async move {
            let (reply, rx) = oneshot::channel();
            ctrl_tx
                .send(Control::Submit {
                    category,
                    payload,
                    deadline,
                    reply,
                })
                .await
                .map_err(|_| PilotError::ShutDown)?;
            rx.await.map_err(|_| PilotError::ShutDown)
        }
    }

    /// Report a device acknowledgment for the in-flight command of the
    /// given category. Called by the external sentence parser.
    pub async fn notify_ack(&self, category: CommandCategory) -> Result<(), PilotError> {
        self.ctrl_tx
            .send(Control::Ack {
                category,
                at: Instant::now(),
            })
            .await
            .map_err(|_| PilotError::ShutDown)
    }

    /// Report that fresh vessel-state context was parsed.
    pub async fn record_context_update(&self) -> Result<(), PilotError> {
        self.ctrl_tx
            .send(Control::ContextUpdate { at: Instant::now() })
            .await
            .map_err(|_| PilotError::ShutDown)
    }

    /// Replace the connection. The active link is fully disconnected
    /// before the replacement starts connecting.
    pub async fn update_connection(
        &self,
        options: ConnectionOptions,
    ) -> Result<(), PilotError> {
        let (reply, rx) = oneshot::channel();
        self.ctrl_tx
            .send(Control::UpdateConnection { options, reply })
            .await
            .map_err(|_| PilotError::ShutDown)?;
        rx.await.map_err(|_| PilotError::ShutDown)?
    }

    /// Subscribe to inbound telemetry lines. The subscription survives
    /// connection replacement.
    pub fn subscribe_lines(&self) -> broadcast::Receiver<String> {
        self.line_tx.subscribe()
    }

    /// Subscribe to degradation-tier transitions.
    pub fn subscribe_health(&self) -> broadcast::Receiver<TierChange> {
        self.tier_change_tx.subscribe()
    }

    /// Watch the current degradation tier.
    pub fn watch_tier(&self) -> watch::Receiver<DegradationTier> {
        self.tier_rx.clone()
    }

    /// Current degradation tier.
    pub fn current_tier(&self) -> DegradationTier {
        *self.tier_rx.borrow()
    }

    /// Watch the link state.
    pub fn watch_link_state(&self) -> watch::Receiver<LinkState> {
        self.link_state_rx.clone()
    }

    /// Current link state.
    pub fn link_state(&self) -> LinkState {
        *self.link_state_rx.borrow()
    }

    /// Shut down the dispatch task and release the link. Outstanding
    /// command futures resolve as `Rejected`.
    pub async fn shutdown(&mut self) {
        let _ = self.ctrl_tx.send(Control::Shutdown).await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for PilotLink {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct InFlight {
    id: EntryId,
    attempts: u32,
    ack_deadline: Instant,
}

struct Dispatcher {
    config: PilotConfig,
    link: LinkManager,
    link_watch: watch::Receiver<LinkState>,
    link_events: broadcast::Receiver<LinkEvent>,
    line_tx: broadcast::Sender<String>,
    event_tx: broadcast::Sender<LinkEvent>,
    queue: CommandQueue,
    safety: SafetyManager,
    monitor: Monitor,
    degradation: DegradationController,
    waiters: HashMap<EntryId, oneshot::Sender<CommandOutcome>>,
    in_flight: Option<InFlight>,
    ctrl_rx: mpsc::Receiver<Control>,
    tier_change_tx: broadcast::Sender<TierChange>,
    tier_watch_tx: watch::Sender<DegradationTier>,
    state_watch_tx: watch::Sender<LinkState>,
    command_failures: u32,
}

impl Dispatcher {
    async fn run(mut self) {
        let mut next_tick = Instant::now() + self.config.health_interval;
        loop {
            let wake = self.next_wake(next_tick);

            tokio::select! {
                ctrl = self.ctrl_rx.recv() => match ctrl {
                    None | Some(Control::Shutdown) => {
                        self.finish().await;
                        return;
                    }
                    Some(Control::Submit { category, payload, deadline, reply }) => {
                        self.handle_submit(category, payload, deadline, reply);
                    }
                    Some(Control::Ack { category, at }) => {
                        self.handle_ack(category, at);
                    }
                    Some(Control::ContextUpdate { at }) => {
                        self.safety.record_context_update(at);
                    }
                    Some(Control::UpdateConnection { options, reply }) => {
                        let result = self.replace_link(options).await;
                        let _ = reply.send(result);
                    }
                },
                event = self.link_events.recv() => match event {
                    Ok(event) => self.handle_link_event(event),
                    // Lagged or closed: both recoverable, the receiver
                    // resumes from the current position.
                    Err(_) => {}
                },
                result = self.link_watch.changed() => {
                    if result.is_ok() {
                        let state = *self.link_watch.borrow_and_update();
                        self.state_watch_tx.send_replace(state);
                    }
                },
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(wake)) => {
                    let now = Instant::now();
                    self.handle_ack_timeout(now);
                    if now >= next_tick {
                        self.record_tick_sample(now);
                        next_tick = now + self.config.health_interval;
                    }
                },
            }

            self.pump().await;
        }
    }

    /// Earliest instant the task must wake without external input.
    fn next_wake(&self, next_tick: Instant) -> Instant {
        let now = Instant::now();
        let mut wake = next_tick;
        if let Some(queue_wake) = self.queue.next_wake(now) {
            wake = wake.min(queue_wake);
        }
        if let Some(in_flight) = &self.in_flight {
            wake = wake.min(in_flight.ack_deadline);
        }
        wake
    }

    fn handle_submit(
        &mut self,
        category: CommandCategory,
        payload: String,
        deadline: Instant,
        reply: oneshot::Sender<CommandOutcome>,
    ) {
        let now = Instant::now();
        let authorized = self.safety.authorize(
            category,
            self.degradation.tier(),
            self.queue.has_live_disengage(),
            now,
        );
        if let Err(reason) = authorized {
            let _ = reply.send(CommandOutcome::Denied(reason));
            return;
        }

        let command = Command::new(category, payload, now, deadline);
        let id = self.queue.enqueue(command, now);
        debug!(id, ?category, "command enqueued");
        self.waiters.insert(id, reply);
    }

    fn handle_ack(&mut self, category: CommandCategory, at: Instant) {
        let Some((id, sent_at)) = self.queue.acknowledge(category, at) else {
            debug!(?category, "ack with no matching in-flight command");
            return;
        };
        let latency = at.duration_since(sent_at);
        debug!(id, ?category, latency_ms = latency.as_millis() as u64, "command acked");

        self.command_failures = 0;
        self.record_sample(HealthSample {
            at,
            link_up: true,
            consecutive_failures: 0,
            ack_latency: Some(latency),
        });
    }

    fn handle_ack_timeout(&mut self, now: Instant) {
        let Some(in_flight) = &self.in_flight else {
            return;
        };
        if now < in_flight.ack_deadline {
            return;
        }

        let (id, attempts) = (in_flight.id, in_flight.attempts);
        self.in_flight = None;
        self.command_failures = self.command_failures.saturating_add(1);
        warn!(id, attempts, "no acknowledgment within timeout");

        let retry_at = if self.config.command_retry.should_retry(attempts) {
            let delay = self
                .config
                .command_retry
                .delay_for(attempts.saturating_sub(1));
            Some(now + delay)
        } else {
            None
        };
        self.queue.attempt_failed(id, retry_at);

        self.record_sample(HealthSample {
            at: now,
            link_up: self.link.state().accepts_sends(),
            consecutive_failures: self.command_failures,
            ack_latency: None,
        });
    }

    fn handle_link_event(&mut self, event: LinkEvent) {
        let now = Instant::now();
        let sample = match event {
            LinkEvent::Connected { .. } | LinkEvent::Recovered { .. } => {
                HealthSample::healthy(now)
            }
            LinkEvent::ConnectFailed { failures, .. } | LinkEvent::Lost { failures, .. } => {
                HealthSample::link_down(now, failures)
            }
            // Link is up but quiet: unhealthy, below the escalation bar
            // unless it keeps happening.
            LinkEvent::Stale { .. } => HealthSample {
                at: now,
                link_up: true,
                consecutive_failures: 1,
                ack_latency: None,
            },
            LinkEvent::Failed { attempts, .. } => HealthSample::link_down(now, attempts),
        };
        self.record_sample(sample);
    }

    /// Periodic liveness heartbeat so recovery hysteresis can make progress
    /// on a quiet-but-up link. Failures are reported by the event that
    /// produced them, never replayed here.
    fn record_tick_sample(&mut self, now: Instant) {
        let link_up = self.link.state().accepts_sends();
        self.record_sample(HealthSample {
            at: now,
            link_up,
            consecutive_failures: 0,
            ack_latency: None,
        });
    }

    fn record_sample(&mut self, sample: HealthSample) {
        self.monitor.record(sample);
        let status = self.monitor.status();
        if let Some(change) = self.degradation.observe(&status) {
            self.tier_watch_tx.send_replace(change.to);
            let _ = self.tier_change_tx.send(change);
            if change.entered_disengaged() {
                self.force_disengage(Instant::now());
            }
        }
    }

    /// Safety override: at the worst tier the autopilot is released
    /// unconditionally, bypassing authorization and conflict suppression.
    fn force_disengage(&mut self, now: Instant) {
        info!("forcing autopilot disengage");
        let command = Command::new(
            CommandCategory::Disengage,
            self.config.disengage_payload.clone(),
            now,
            now + self.config.disengage_deadline,
        );
        let id = self.queue.enqueue(command, now);
        debug!(id, "forced disengage enqueued");
    }

    async fn replace_link(
        &mut self,
        options: ConnectionOptions,
    ) -> Result<(), PilotError> {
        options.validate()?;
        info!(address = %options.address, port = options.port, "replacing connection");

        // Invariant: the old instance is fully released before the
        // replacement starts connecting. Two live sockets to the same
        // device could race actuator commands.
        self.link.disconnect().await;

        let link = LinkManager::spawn(
            options,
            self.config.link_retry.clone(),
            self.config.timing.clone(),
            self.line_tx.clone(),
            self.event_tx.clone(),
        )?;
        self.link_events = self.event_tx.subscribe();
        self.link_watch = link.watch_state();
        self.link = link;
        self.state_watch_tx
            .send_replace(*self.link_watch.borrow_and_update());

        // The in-flight command (if any) was sent on the old socket; its
        // ack can no longer be trusted to arrive.
        if let Some(in_flight) = self.in_flight.take() {
            self.queue.attempt_failed(in_flight.id, Some(Instant::now()));
        }
        Ok(())
    }

    /// Dispatch ready commands while the line is idle.
    async fn pump(&mut self) {
        self.resolve_terminal();

        while self.in_flight.is_none() {
            let now = Instant::now();
            if !self.link.state().accepts_sends() {
                // Commands wait for the link rather than burning their
                // retry budget; deadlines keep ticking regardless.
                self.queue.expire_pending(now);
                break;
            }

            let Some(entry) = self.queue.begin_send(now) else {
                break;
            };

            // Mandatory re-check at send time: approval at enqueue is
            // advisory and health may have degraded since.
            let authorized = self.safety.authorize(
                entry.command.category,
                self.degradation.tier(),
                self.queue.has_live_disengage(),
                now,
            );
            if let Err(reason) = authorized {
                warn!(id = entry.id, %reason, "denied at send time");
                self.queue.reject(entry.id);
                if let Some(waiter) = self.waiters.remove(&entry.id) {
                    let _ = waiter.send(CommandOutcome::Denied(reason));
                }
                continue;
            }

            match self.link.send(&entry.command.payload).await {
                Ok(()) => {
                    debug!(id = entry.id, attempts = entry.attempts, "command transmitted");
                    self.in_flight = Some(InFlight {
                        id: entry.id,
                        attempts: entry.attempts,
                        ack_deadline: now + self.config.ack_timeout,
                    });
                }
                Err(err) => {
                    warn!(id = entry.id, error = %err, "transmit failed");
                    let retry_at = if self.config.command_retry.should_retry(entry.attempts) {
                        let delay = self
                            .config
                            .command_retry
                            .delay_for(entry.attempts.saturating_sub(1));
                        Some(now + delay)
                    } else {
                        None
                    };
                    self.queue.attempt_failed(entry.id, retry_at);
                    break;
                }
            }
        }

        self.resolve_terminal();
    }

    /// Resolve waiters for entries that reached a terminal status. A
    /// command without a waiter (forced disengage) is logged instead.
    fn resolve_terminal(&mut self) {
        for entry in self.queue.drain_terminal() {
            if let Some(in_flight) = &self.in_flight
                && in_flight.id == entry.id
            {
                self.in_flight = None;
            }
            let Some(outcome) = CommandOutcome::from_status(entry.status) else {
                continue;
            };
            match self.waiters.remove(&entry.id) {
                Some(waiter) => {
                    let _ = waiter.send(outcome);
                }
                None => {
                    debug!(id = entry.id, ?outcome, "unwaited command resolved");
                }
            }
        }
    }

    async fn finish(&mut self) {
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(CommandOutcome::Rejected);
        }
        self.link.disconnect().await;
        debug!("dispatch task shut down");
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc::unbounded_channel;

    use super::*;

    /// Opt-in tracing output, e.g. `RUST_LOG=helmlink=debug cargo test`.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    fn no_jitter(max_attempts: u32, base_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_ratio: 0.0,
        }
    }

    fn quiet_degradation() -> DegradationThresholds {
        DegradationThresholds {
            escalate_failures: 100,
            recovery_samples: 100,
        }
    }

    fn builder(port: u16) -> PilotLinkBuilder {
        init_tracing();
        PilotLinkBuilder::new(ConnectionOptions::tcp("127.0.0.1", port))
            .link_retry(no_jitter(5, 20))
            .command_retry(no_jitter(2, 50))
            .ack_timeout(Duration::from_millis(300))
            .health_interval(Duration::from_secs(60))
            .degradation(quiet_degradation())
    }

    async fn wait_connected(pilot: &PilotLink) {
        let mut state = pilot.watch_link_state();
        state
            .wait_for(|s| *s == LinkState::Connected)
            .await
            .unwrap();
    }

    fn deadline_in(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    /// Fake device: accepts one connection, forwards each received line,
    /// and keeps the socket open.
    fn spawn_device(
        listener: TcpListener,
    ) -> tokio::sync::mpsc::UnboundedReceiver<String> {
        let (tx, rx) = unbounded_channel();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, _write) = stream.into_split();
            let mut reader = BufReader::new(read);
            loop {
                let mut line = String::new();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    return;
                }
                while line.ends_with('\n') || line.ends_with('\r') {
                    line.pop();
                }
                if tx.send(line).is_err() {
                    return;
                }
            }
        });
        rx
    }

    #[tokio::test]
    async fn test_submit_transmit_and_ack() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut received = spawn_device(listener);

        let mut pilot = builder(port).spawn().unwrap();
        wait_connected(&pilot).await;
        pilot.record_context_update().await.unwrap();

        let submit = pilot.submit_command(
            CommandCategory::HeadingChange,
            "$APHDG,095.0",
            deadline_in(2_000),
        );

        let pilot_ref = &pilot;
        let (outcome, line) = tokio::join!(submit, async {
            let line = received.recv().await.unwrap();
            pilot_ref
                .notify_ack(CommandCategory::HeadingChange)
                .await
                .unwrap();
            line
        });

        assert_eq!(line, "$APHDG,095.0");
        assert_eq!(outcome.unwrap(), CommandOutcome::Acked);

        pilot.shutdown().await;
    }

    #[tokio::test]
    async fn test_stale_context_denied_before_enqueue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _received = spawn_device(listener);

        let mut pilot = builder(port).spawn().unwrap();
        wait_connected(&pilot).await;

        // No context update recorded
        let outcome = pilot
            .submit_command(
                CommandCategory::HeadingChange,
                "$APHDG,010.0",
                deadline_in(1_000),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CommandOutcome::Denied(crate::core::DenyReason::StaleContext)
        );

        pilot.shutdown().await;
    }

    #[tokio::test]
    async fn test_pending_disengage_blocks_engage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut received = spawn_device(listener);

        let mut pilot = builder(port).spawn().unwrap();
        wait_connected(&pilot).await;
        pilot.record_context_update().await.unwrap();

        // Disengage sits in flight (device never acks it yet). Poll the
        // submission long enough to drive it onto the wire.
        let disengage =
            pilot.submit_command(CommandCategory::Disengage, "$APDIS", deadline_in(5_000));
        tokio::pin!(disengage);
        assert!(
            tokio::time::timeout(Duration::from_millis(100), &mut disengage)
                .await
                .is_err(),
            "disengage must stay unresolved until acked"
        );

        let line = received.recv().await.unwrap();
        assert_eq!(line, "$APDIS");

        let outcome = pilot
            .submit_command(CommandCategory::Engage, "$APENG", deadline_in(1_000))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CommandOutcome::Denied(crate::core::DenyReason::ConflictingCommand)
        );

        pilot.notify_ack(CommandCategory::Disengage).await.unwrap();
        assert_eq!(disengage.await.unwrap(), CommandOutcome::Acked);

        pilot.shutdown().await;
    }

    #[tokio::test]
    async fn test_newer_command_supersedes_pending() {
        // Nothing listening yet: commands stay pending while the link
        // retries, so the second submission supersedes the first.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut pilot = builder(port).spawn().unwrap();
        pilot.record_context_update().await.unwrap();

        // Drive both submissions far enough to enqueue without resolving
        let first = pilot.submit_command(
            CommandCategory::HeadingChange,
            "$APHDG,100.0",
            deadline_in(5_000),
        );
        tokio::pin!(first);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut first)
                .await
                .is_err()
        );

        let second = pilot.submit_command(
            CommandCategory::HeadingChange,
            "$APHDG,110.0",
            deadline_in(5_000),
        );
        tokio::pin!(second);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), &mut second)
                .await
                .is_err()
        );

        assert_eq!(first.await.unwrap(), CommandOutcome::Superseded);

        pilot.shutdown().await;
        // Second resolves on shutdown; it never reached the wire
        assert_eq!(second.await.unwrap(), CommandOutcome::Rejected);
    }

    #[tokio::test]
    async fn test_expired_command_never_transmitted() {
        // No listener until well after the deadline, so the command waits
        // out link reconnection and expires before any transmission
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = reserved.local_addr().unwrap();
        drop(reserved);

        let (tx, mut rx) = unbounded_channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let listener = TcpListener::bind(addr).await.unwrap();
            let mut received = spawn_device(listener);
            while let Some(line) = received.recv().await {
                let _ = tx.send(line);
            }
        });

        let mut pilot = builder(addr.port()).spawn().unwrap();
        pilot.record_context_update().await.unwrap();

        let outcome = pilot
            .submit_command(
                CommandCategory::HeadingChange,
                "$APHDG,055.0",
                deadline_in(50),
            )
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Expired);

        // The stale sentence never reaches the wire
        let nothing =
            tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(nothing.is_err());

        pilot.shutdown().await;
    }

    #[tokio::test]
    async fn test_ack_timeout_retries_then_rejects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut received = spawn_device(listener);

        let mut pilot = builder(port)
            .command_retry(no_jitter(2, 30))
            .ack_timeout(Duration::from_millis(100))
            .spawn()
            .unwrap();
        wait_connected(&pilot).await;
        pilot.record_context_update().await.unwrap();

        // Device never acknowledges: two attempts, then rejection
        let outcome = pilot
            .submit_command(CommandCategory::Engage, "$APENG", deadline_in(5_000))
            .await
            .unwrap();
        assert_eq!(outcome, CommandOutcome::Rejected);

        assert_eq!(received.recv().await.unwrap(), "$APENG");
        assert_eq!(received.recv().await.unwrap(), "$APENG");

        pilot.shutdown().await;
    }

    #[tokio::test]
    async fn test_safe_mode_denies_then_recovery_permits() {
        // Nothing listening: three connect failures push the tier to
        // Reduced (third failure) and the terminal Failed event to SafeMode
        init_tracing();
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = reserved.local_addr().unwrap().port();
        drop(reserved);

        let mut pilot = PilotLinkBuilder::new(ConnectionOptions::tcp(
            "127.0.0.1", dead_port,
        ))
        .link_retry(no_jitter(3, 30))
        .command_retry(no_jitter(2, 50))
        .ack_timeout(Duration::from_millis(300))
        .health_interval(Duration::from_millis(40))
        .degradation(DegradationThresholds {
            escalate_failures: 3,
            recovery_samples: 2,
        })
        .spawn()
        .unwrap();

        let mut tier = pilot.watch_tier();
        tier.wait_for(|t| *t == DegradationTier::SafeMode)
            .await
            .unwrap();

        pilot.record_context_update().await.unwrap();
        let outcome = pilot
            .submit_command(
                CommandCategory::HeadingChange,
                "$APHDG,200.0",
                deadline_in(1_000),
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CommandOutcome::Denied(crate::core::DenyReason::LinkUnhealthy)
        );

        // Point the pilot at a live device; healthy samples accumulate
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_port = listener.local_addr().unwrap().port();
        let mut received = spawn_device(listener);
        pilot
            .update_connection(ConnectionOptions::tcp("127.0.0.1", live_port))
            .await
            .unwrap();

        tier.wait_for(|t| *t == DegradationTier::Nominal)
            .await
            .unwrap();

        pilot.record_context_update().await.unwrap();
        let submit = pilot.submit_command(
            CommandCategory::HeadingChange,
            "$APHDG,200.0",
            deadline_in(2_000),
        );
        let pilot_ref = &pilot;
        let (outcome, line) = tokio::join!(submit, async {
            let line = received.recv().await.unwrap();
            pilot_ref
                .notify_ack(CommandCategory::HeadingChange)
                .await
                .unwrap();
            line
        });
        assert_eq!(line, "$APHDG,200.0");
        assert_eq!(outcome.unwrap(), CommandOutcome::Acked);

        pilot.shutdown().await;
    }

    #[tokio::test]
    async fn test_forced_disengage_at_worst_tier() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Device: connects, stays silent so the link degrades, and
        // records everything it receives.
        let (tx, mut received) = unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();
                tokio::spawn(async move {
                    let (read, _write) = stream.into_split();
                    let mut reader = BufReader::new(read);
                    loop {
                        let mut line = String::new();
                        if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                            return;
                        }
                        while line.ends_with('\n') || line.ends_with('\r') {
                            line.pop();
                        }
                        let _ = tx.send(line);
                    }
                });
            }
        });

        init_tracing();
        let mut pilot = PilotLinkBuilder::new(ConnectionOptions::tcp("127.0.0.1", port))
            .link_retry(no_jitter(50, 20))
            .timing(LinkTiming {
                connect_timeout: Duration::from_secs(2),
                stale_after: Duration::from_millis(60),
                dead_interval: Duration::from_millis(150),
            })
            .ack_timeout(Duration::from_millis(200))
            .health_interval(Duration::from_secs(60))
            .degradation(DegradationThresholds {
                escalate_failures: 1,
                recovery_samples: 100,
            })
            .disengage_payload("$APDIS,FORCED")
            .spawn()
            .unwrap();

        let mut tier = pilot.watch_tier();
        tier.wait_for(|t| *t == DegradationTier::Disengaged)
            .await
            .unwrap();

        // The forced disengage goes out over the degraded-but-up link
        let line = tokio::time::timeout(Duration::from_secs(2), received.recv())
            .await
            .expect("forced disengage transmitted")
            .unwrap();
        assert_eq!(line, "$APDIS,FORCED");

        pilot.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_connection_tears_down_old_link_first() {
        let listener_a = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port_a = listener_a.local_addr().unwrap().port();
        let listener_b = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port_b = listener_b.local_addr().unwrap().port();

        // Device A reports when its connection is closed
        let (a_closed_tx, a_closed_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (stream, _) = listener_a.accept().await.unwrap();
            let (read, _write) = stream.into_split();
            let mut reader = BufReader::new(read);
            let mut line = String::new();
            // EOF means the pilot released the socket
            let n = reader.read_line(&mut line).await.unwrap_or(0);
            assert_eq!(n, 0);
            let _ = a_closed_tx.send(Instant::now());
        });

        // Device B reports when it accepts
        let (b_accept_tx, b_accept_rx) = oneshot::channel();
        tokio::spawn(async move {
            let (_stream, _) = listener_b.accept().await.unwrap();
            let _ = b_accept_tx.send(Instant::now());
            std::future::pending::<()>().await;
        });

        let mut pilot = builder(port_a).spawn().unwrap();
        wait_connected(&pilot).await;

        pilot
            .update_connection(ConnectionOptions::tcp("127.0.0.1", port_b))
            .await
            .unwrap();
        wait_connected(&pilot).await;

        let closed_at = a_closed_rx.await.unwrap();
        let accepted_at = b_accept_rx.await.unwrap();
        assert!(
            closed_at <= accepted_at,
            "old link must be released before the new one connects"
        );

        pilot.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_connection_rejects_invalid_options() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _received = spawn_device(listener);

        let mut pilot = builder(port).spawn().unwrap();
        wait_connected(&pilot).await;

        let err = pilot
            .update_connection(ConnectionOptions::tcp("", 0))
            .await
            .unwrap_err();
        assert!(matches!(err, PilotError::Config(_)));
        // The original link is untouched by the failed replacement
        assert_eq!(pilot.link_state(), LinkState::Connected);

        pilot.shutdown().await;
    }
}
