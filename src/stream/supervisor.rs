//! Stream supervisor
//!
//! Decides when a [`TranscodeSession`] exists:
//!
//! ```text
//!            first subscriber            first frame
//!   Idle ───────────────────▶ Starting ──────────────▶ Streaming
//!    ▲                          │  ▲                      │
//!    │ last subscriber leaves   │  │ timer fires          │ exit / overflow
//!    │ (from any state)         │  │                      │ (subscribers > 0)
//!    │                          ▼  │                      ▼
//!    └───────────────────────── Restarting ◀──────────────┘
//!                             (spawn failure, crash)
//! ```
//!
//! All transitions happen under one mutex, together with the matching change
//! to the subscriber set, so no other thread ever sees a session without
//! subscribers or a subscriber count that disagrees with the state. The restart
//! backoff is a spawned timer task, never a blocking sleep, and is cancelled
//! the moment the last subscriber leaves.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::broadcaster::{Broadcaster, SubscriberId, Subscription};
use super::session::{ExitReason, SessionEvent, SessionId, TranscodeSession, Transcoder};
use crate::config::SupervisorConfig;
use crate::error::SupervisorError;

/// Supervisor lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SupervisorState {
    /// No subscribers, no session
    Idle,
    /// Session spawned, waiting for the first frame
    Starting,
    /// Session running, frames flowing
    Streaming,
    /// Session gone while subscribers remain; restart timer armed
    Restarting,
    /// Shut down for good
    Stopped,
}

/// Snapshot for the status endpoints
#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub state: SupervisorState,
    /// A transcoder process currently exists
    pub active: bool,
    pub clients: usize,
    pub session_id: Option<SessionId>,
    pub session_uptime_secs: Option<u64>,
    pub restarts: u64,
    pub frames_broadcast: u64,
    pub frames_dropped: u64,
    pub last_error: Option<String>,
}

/// Result of an operator restart request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
    /// Session stopped, new one started after the pause
    Restarted,
    /// Session stopped; nobody is watching, so nothing was started
    NoSubscribers,
    /// The relay is shutting down
    Stopped,
}

struct Control {
    state: SupervisorState,
    session: Option<TranscodeSession>,
    restart_timer: Option<JoinHandle<()>>,
    /// Bumped on every arm/cancel so a timer that already woke up can tell
    /// it was superseded
    timer_generation: u64,
    next_session_id: SessionId,
    restarts: u64,
    last_error: Option<String>,
}

struct Shared {
    config: SupervisorConfig,
    read_chunk_size: usize,
    transcoder: Arc<dyn Transcoder>,
    broadcaster: Broadcaster,
    control: Mutex<Control>,
    events_tx: mpsc::Sender<SessionEvent>,
}

/// Owner of the session lifecycle and the subscriber set
#[derive(Clone)]
pub struct StreamSupervisor {
    shared: Arc<Shared>,
}

impl StreamSupervisor {
    /// Create the supervisor and its event pump.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: SupervisorConfig,
        transcoder: Arc<dyn Transcoder>,
        read_chunk_size: usize,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_depth.max(1));
        let shared = Arc::new(Shared {
            broadcaster: Broadcaster::new(config.subscriber_queue_depth),
            config,
            read_chunk_size,
            transcoder,
            control: Mutex::new(Control {
                state: SupervisorState::Idle,
                session: None,
                restart_timer: None,
                timer_generation: 0,
                next_session_id: 1,
                restarts: 0,
                last_error: None,
            }),
            events_tx,
        });

        tokio::spawn(run_event_pump(Arc::downgrade(&shared), events_rx));

        Self { shared }
    }

    /// Register a new viewer. The first one starts the transcoder.
    pub fn subscribe(&self) -> Result<Subscription, SupervisorError> {
        let mut control = self.shared.control.lock();
        if control.state == SupervisorState::Stopped {
            return Err(SupervisorError::ShuttingDown);
        }

        let subscription = self.shared.broadcaster.subscribe();
        let clients = self.shared.broadcaster.len();
        tracing::info!(subscriber = %subscription.id(), clients, "Viewer connected");

        if control.state == SupervisorState::Idle {
            self.shared.start_session(&mut control);
        }
        Ok(subscription)
    }

    /// Remove a viewer. The last one stops the transcoder.
    pub fn unsubscribe(&self, id: &SubscriberId) {
        let mut control = self.shared.control.lock();
        if !self.shared.broadcaster.unsubscribe(id) {
            return;
        }

        let clients = self.shared.broadcaster.len();
        tracing::info!(subscriber = %id, clients, "Viewer disconnected");

        if clients == 0 {
            self.shared.go_idle(&mut control);
        }
    }

    /// Stop the current session, pause, then start a fresh one if anyone is
    /// still watching.
    pub async fn restart(&self) -> RestartOutcome {
        let delay = self.shared.config.manual_restart_delay();
        let outcome = {
            let mut control = self.shared.control.lock();
            match control.state {
                SupervisorState::Stopped => RestartOutcome::Stopped,
                _ if self.shared.broadcaster.is_empty() => {
                    self.shared.go_idle(&mut control);
                    RestartOutcome::NoSubscribers
                }
                _ => {
                    tracing::info!("Restart requested");
                    self.shared.stop_session(&mut control);
                    self.shared.schedule_restart(&mut control, delay);
                    RestartOutcome::Restarted
                }
            }
        };

        if outcome == RestartOutcome::Restarted {
            tokio::time::sleep(delay).await;
        }
        outcome
    }

    /// Stop any session, cancel timers and disconnect every viewer.
    /// Later subscribe calls fail.
    pub fn shutdown(&self) {
        let mut control = self.shared.control.lock();
        if control.state == SupervisorState::Stopped {
            return;
        }

        self.shared.cancel_restart(&mut control);
        self.shared.stop_session(&mut control);
        control.state = SupervisorState::Stopped;

        let closed = self.shared.broadcaster.close_all();
        tracing::info!(closed, "Stream supervisor shut down");
    }

    pub fn state(&self) -> SupervisorState {
        self.shared.control.lock().state
    }

    pub fn client_count(&self) -> usize {
        self.shared.broadcaster.len()
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.shared.broadcaster
    }

    pub fn status(&self) -> StreamStatus {
        let control = self.shared.control.lock();
        let stats = self.shared.broadcaster.stats();
        StreamStatus {
            state: control.state,
            active: control.session.is_some(),
            clients: stats.subscribers,
            session_id: control.session.as_ref().map(|s| s.id()),
            session_uptime_secs: control.session.as_ref().map(|s| s.uptime().as_secs()),
            restarts: control.restarts,
            frames_broadcast: stats.frames_broadcast,
            frames_dropped: stats.frames_dropped,
            last_error: control.last_error.clone(),
        }
    }
}

impl Shared {
    /// Spawn a session unless one is already starting or running
    fn start_session(self: &Arc<Self>, control: &mut Control) {
        if control.session.is_some()
            || matches!(
                control.state,
                SupervisorState::Starting | SupervisorState::Streaming | SupervisorState::Stopped
            )
        {
            return;
        }

        let id = control.next_session_id;
        control.next_session_id += 1;

        match TranscodeSession::start(
            id,
            self.transcoder.as_ref(),
            self.events_tx.clone(),
            self.config.max_frame_buffer,
            self.read_chunk_size,
        ) {
            Ok(session) => {
                control.session = Some(session);
                control.state = SupervisorState::Starting;
            }
            Err(e) => {
                tracing::error!(session = id, error = %e, "Failed to start transcoder");
                control.last_error = Some(e.to_string());
                let delay = self.config.restart_delay();
                self.schedule_restart(control, delay);
            }
        }
    }

    fn stop_session(&self, control: &mut Control) {
        if let Some(mut session) = control.session.take() {
            session.stop();
        }
    }

    /// Arm the single restart timer, replacing any pending one
    fn schedule_restart(self: &Arc<Self>, control: &mut Control, delay: Duration) {
        self.cancel_restart(control);
        control.state = SupervisorState::Restarting;

        let generation = control.timer_generation;
        let shared = Arc::downgrade(self);
        control.restart_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                shared.on_restart_timer(generation);
            }
        }));

        tracing::info!(delay_ms = delay.as_millis() as u64, "Transcoder restart scheduled");
    }

    fn cancel_restart(&self, control: &mut Control) {
        control.timer_generation += 1;
        if let Some(timer) = control.restart_timer.take() {
            timer.abort();
        }
    }

    fn on_restart_timer(self: &Arc<Self>, generation: u64) {
        let mut control = self.control.lock();
        if generation != control.timer_generation || control.state != SupervisorState::Restarting {
            return;
        }
        control.restart_timer = None;

        if self.broadcaster.is_empty() {
            control.state = SupervisorState::Idle;
            return;
        }

        control.restarts += 1;
        control.state = SupervisorState::Idle;
        self.start_session(&mut control);
    }

    /// Stop everything; used when the subscriber count reaches zero
    fn go_idle(&self, control: &mut Control) {
        if control.state == SupervisorState::Stopped {
            return;
        }
        self.cancel_restart(control);
        self.stop_session(control);
        if control.state != SupervisorState::Idle {
            tracing::info!("No viewers left, transcoder stopped");
        }
        control.state = SupervisorState::Idle;
    }

    fn is_current(control: &Control, session: SessionId) -> bool {
        control.session.as_ref().map(|s| s.id()) == Some(session)
    }

    fn handle_event(self: &Arc<Self>, event: SessionEvent) {
        let mut control = self.control.lock();

        // Output from a session that has since been stopped or replaced
        if !Self::is_current(&control, event.session()) {
            tracing::trace!(session = event.session(), "Ignoring stale session event");
            return;
        }

        match event {
            SessionEvent::Frames { frames, .. } => {
                if control.state == SupervisorState::Starting {
                    control.state = SupervisorState::Streaming;
                    control.last_error = None;
                    tracing::info!(clients = self.broadcaster.len(), "Streaming");
                }
                if let Some(session) = control.session.as_mut() {
                    session.mark_running();
                }

                let mut removed = 0;
                for frame in &frames {
                    removed += self.broadcaster.broadcast(frame).removed.len();
                }
                if removed > 0 && self.broadcaster.is_empty() {
                    self.go_idle(&mut control);
                }
            }
            SessionEvent::Exited { session, reason } => {
                self.stop_session(&mut control);
                control.last_error = Some(reason.to_string());

                if self.broadcaster.is_empty() {
                    control.state = SupervisorState::Idle;
                    return;
                }

                match &reason {
                    ExitReason::BufferOverflow { .. } => {
                        tracing::error!(session, %reason, "Transcode session failed")
                    }
                    _ => tracing::warn!(session, %reason, "Transcoder exited unexpectedly"),
                }
                let delay = self.config.restart_delay();
                self.schedule_restart(&mut control, delay);
            }
        }
    }
}

/// Drain session events until the supervisor is dropped
async fn run_event_pump(shared: Weak<Shared>, mut events: mpsc::Receiver<SessionEvent>) {
    while let Some(event) = events.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.handle_event(event);
    }
    tracing::debug!("Supervisor event pump finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::session::testing::{jpeg, FakeTranscoder};
    use futures_util::FutureExt;
    use tokio::io::AsyncWriteExt;
    use tokio::time::{sleep, timeout, Instant};

    fn supervisor(
        transcoder: &Arc<FakeTranscoder>,
        config: SupervisorConfig,
    ) -> StreamSupervisor {
        StreamSupervisor::new(config, transcoder.clone(), 4096)
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig::default()
            .with_restart_delay(Duration::from_millis(30))
            .with_manual_restart_delay(Duration::from_millis(10))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_subscribe_unsubscribe_before_frames() {
        let transcoder = Arc::new(FakeTranscoder::default());
        let sup = supervisor(&transcoder, fast_config());
        assert_eq!(sup.state(), SupervisorState::Idle);

        let sub = sup.subscribe().unwrap();
        assert_eq!(sup.state(), SupervisorState::Starting);
        assert_eq!(transcoder.spawn_count(), 1);

        sup.unsubscribe(&sub.id());
        assert_eq!(sup.state(), SupervisorState::Idle);
        assert!(transcoder.was_killed(0));
        assert!(!sup.status().active);
    }

    #[tokio::test]
    async fn test_second_subscriber_reuses_session() {
        let transcoder = Arc::new(FakeTranscoder::default());
        let sup = supervisor(&transcoder, fast_config());

        let a = sup.subscribe().unwrap();
        let b = sup.subscribe().unwrap();
        assert_eq!(transcoder.spawn_count(), 1);
        assert_eq!(sup.client_count(), 2);

        sup.unsubscribe(&a.id());
        assert_eq!(sup.state(), SupervisorState::Starting);
        assert!(!transcoder.was_killed(0));

        sup.unsubscribe(&b.id());
        assert_eq!(sup.state(), SupervisorState::Idle);
        assert!(transcoder.was_killed(0));
    }

    #[tokio::test]
    async fn test_end_to_end_frames() {
        let transcoder = Arc::new(FakeTranscoder::default());
        let sup = supervisor(&transcoder, fast_config());

        let mut sub = sup.subscribe().unwrap();
        assert_eq!(sup.state(), SupervisorState::Starting);

        let frames = [jpeg(b"alpha"), jpeg(b"bravo-bravo"), jpeg(b"charlie")];
        let stream = frames.concat();
        let mut pipe = transcoder.take_pipe(0);
        for chunk in [&stream[..4], &stream[4..10], &stream[10..20], &stream[20..]] {
            pipe.write_all(chunk).await.unwrap();
            pipe.flush().await.unwrap();
        }

        for expected in &frames {
            let frame = timeout(Duration::from_secs(2), sub.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame.as_ref(), &expected[..]);
        }
        assert_eq!(sup.state(), SupervisorState::Streaming);

        sup.unsubscribe(&sub.id());
        assert_eq!(sup.state(), SupervisorState::Idle);
        assert!(transcoder.was_killed(0));
    }

    #[tokio::test]
    async fn test_crash_restarts_with_backoff() {
        let transcoder = Arc::new(FakeTranscoder::default());
        let sup = supervisor(&transcoder, fast_config());
        let _sub = sup.subscribe().unwrap();

        drop(transcoder.take_pipe(0)); // transcoder dies

        wait_until(|| transcoder.spawn_count() == 2).await;
        let status = sup.status();
        assert_eq!(status.state, SupervisorState::Starting);
        assert_eq!(status.restarts, 1);
        assert!(status.active);
    }

    #[tokio::test]
    async fn test_restart_cancelled_when_last_subscriber_leaves() {
        let transcoder = Arc::new(FakeTranscoder::default());
        let config = fast_config().with_restart_delay(Duration::from_millis(150));
        let sup = supervisor(&transcoder, config);
        let sub = sup.subscribe().unwrap();

        drop(transcoder.take_pipe(0));
        wait_until(|| sup.state() == SupervisorState::Restarting).await;

        sup.unsubscribe(&sub.id());
        assert_eq!(sup.state(), SupervisorState::Idle);

        sleep(Duration::from_millis(300)).await;
        assert_eq!(transcoder.spawn_count(), 1);
        assert_eq!(sup.state(), SupervisorState::Idle);
    }

    #[tokio::test]
    async fn test_spawn_failure_retries() {
        let transcoder = Arc::new(FakeTranscoder::default());
        transcoder
            .fail_spawn
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let sup = supervisor(&transcoder, fast_config());

        let _sub = sup.subscribe().unwrap();
        assert_eq!(sup.state(), SupervisorState::Restarting);
        assert!(sup.status().last_error.is_some());

        transcoder
            .fail_spawn
            .store(false, std::sync::atomic::Ordering::SeqCst);
        wait_until(|| transcoder.spawn_count() == 1).await;
        assert_eq!(sup.state(), SupervisorState::Starting);
    }

    #[tokio::test]
    async fn test_stale_output_is_ignored() {
        let transcoder = Arc::new(FakeTranscoder::default());
        let sup = supervisor(&transcoder, fast_config());

        let mut sub = sup.subscribe().unwrap();
        let mut old_pipe = transcoder.take_pipe(0);

        assert_eq!(sup.restart().await, RestartOutcome::Restarted);
        wait_until(|| transcoder.spawn_count() == 2).await;

        // The killed session's reader is gone; writes may fail or be ignored
        let _ = old_pipe.write_all(&jpeg(b"stale")).await;

        let mut new_pipe = transcoder.take_pipe(1);
        new_pipe.write_all(&jpeg(b"fresh")).await.unwrap();

        let frame = timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.as_ref(), &jpeg(b"fresh")[..]);
    }

    #[tokio::test]
    async fn test_restart_without_subscribers() {
        let transcoder = Arc::new(FakeTranscoder::default());
        let sup = supervisor(&transcoder, fast_config());

        assert_eq!(sup.restart().await, RestartOutcome::NoSubscribers);
        assert_eq!(transcoder.spawn_count(), 0);
        assert_eq!(sup.state(), SupervisorState::Idle);
    }

    #[tokio::test]
    async fn test_failed_viewer_removed_during_broadcast() {
        let transcoder = Arc::new(FakeTranscoder::default());
        let sup = supervisor(&transcoder, fast_config());

        let mut healthy = sup.subscribe().unwrap();
        let broken = sup.subscribe().unwrap();
        let broken_id = broken.id();
        drop(broken);

        let mut pipe = transcoder.take_pipe(0);
        pipe.write_all(&jpeg(b"frame")).await.unwrap();

        let frame = timeout(Duration::from_secs(2), healthy.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.as_ref(), &jpeg(b"frame")[..]);
        assert!(!sup.broadcaster().contains(&broken_id));
        assert_eq!(sup.client_count(), 1);
        assert_eq!(sup.state(), SupervisorState::Streaming);
    }

    #[tokio::test]
    async fn test_viewer_joining_during_backoff_shares_one_respawn() {
        let transcoder = Arc::new(FakeTranscoder::default());
        let config = fast_config().with_restart_delay(Duration::from_millis(150));
        let sup = supervisor(&transcoder, config);
        let first = sup.subscribe().unwrap();

        drop(transcoder.take_pipe(0));
        wait_until(|| sup.state() == SupervisorState::Restarting).await;

        let second = sup.subscribe().unwrap();
        assert_eq!(sup.state(), SupervisorState::Restarting);
        assert_eq!(transcoder.spawn_count(), 1);

        // Operator restart whose response is abandoned after the timer is re-armed
        assert!(sup.restart().now_or_never().is_none());
        sup.unsubscribe(&first.id());
        assert_eq!(sup.state(), SupervisorState::Restarting);

        wait_until(|| transcoder.spawn_count() == 2).await;
        sleep(Duration::from_millis(300)).await;
        assert_eq!(transcoder.spawn_count(), 2);
        assert_eq!(sup.state(), SupervisorState::Starting);
        assert_eq!(sup.status().restarts, 1);

        sup.unsubscribe(&second.id());
        assert_eq!(sup.state(), SupervisorState::Idle);
        assert!(transcoder.was_killed(1));
    }

    #[tokio::test]
    async fn test_overflow_restarts_session() {
        let transcoder = Arc::new(FakeTranscoder::default());
        let sup = supervisor(&transcoder, fast_config().with_max_frame_buffer(64));
        let _sub = sup.subscribe().unwrap();

        let mut pipe = transcoder.take_pipe(0);
        let mut unterminated = crate::stream::frame::START_MARKER.to_vec();
        unterminated.extend_from_slice(&[0x42; 256]);
        pipe.write_all(&unterminated).await.unwrap();

        wait_until(|| transcoder.spawn_count() == 2).await;
        assert!(transcoder.was_killed(0));
        let status = sup.status();
        assert_eq!(status.restarts, 1);
        assert!(status.last_error.unwrap().contains("overflow"));
    }

    #[tokio::test]
    async fn test_slow_viewer_drops_frames_but_stays() {
        let transcoder = Arc::new(FakeTranscoder::default());
        let sup = supervisor(&transcoder, fast_config().with_subscriber_queue_depth(1));
        let mut sub = sup.subscribe().unwrap();

        let mut pipe = transcoder.take_pipe(0);
        let burst = [jpeg(b"one"), jpeg(b"two"), jpeg(b"three")].concat();
        pipe.write_all(&burst).await.unwrap();

        wait_until(|| sup.status().frames_dropped == 2).await;
        let frame = timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.as_ref(), &jpeg(b"one")[..]);
        assert_eq!(sup.client_count(), 1);
        assert_eq!(sup.state(), SupervisorState::Streaming);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let transcoder = Arc::new(FakeTranscoder::default());
        let sup = supervisor(&transcoder, fast_config());
        let mut sub = sup.subscribe().unwrap();

        sup.shutdown();

        assert_eq!(sup.state(), SupervisorState::Stopped);
        assert!(transcoder.was_killed(0));
        assert!(sub.recv().await.is_none());
        assert!(matches!(sup.subscribe(), Err(SupervisorError::ShuttingDown)));
    }
}
