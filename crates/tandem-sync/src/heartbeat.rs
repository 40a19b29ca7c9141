//! # Heartbeat Manager
//!
//! Liveness timer bound to one connection.
//!
//! ## Timing
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Heartbeat Timing (defaults)                         │
//! │                                                                         │
//! │  interval = 30s, timeout = 60s                                          │
//! │                                                                         │
//! │  check period = max(interval / 2, 5s) = 15s                            │
//! │                                                                         │
//! │  before first heartbeat:   fire if silent >= interval + timeout (90s)  │
//! │  after first heartbeat:    fire if silent >= timeout (60s)             │
//! │                                                                         │
//! │  t=0    15   30   45   60   75   90                                    │
//! │  start  ·    ·    ·    ·    ·    TIMEOUT (fires once, checker stops)   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Output goes through a channel: [`HeartbeatEvent::Reply`] carries an ack
//! to write to the socket, [`HeartbeatEvent::Timeout`] tells the owner to
//! disconnect.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use tandem_core::protocol::message_types;
use tandem_core::MessageEnvelope;

/// Minimum period between liveness checks.
pub const MIN_CHECK_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Off for peers that never send `__system_heartbeat`.
    pub enabled: bool,
    pub interval: Duration,
    pub timeout: Duration,
    /// Answer heartbeats with an ack carrying the same payload.
    pub auto_response: bool,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            enabled: true,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(60),
            auto_response: true,
        }
    }
}

impl HeartbeatConfig {
    pub fn check_period(&self) -> Duration {
        (self.interval / 2).max(MIN_CHECK_PERIOD)
    }

    /// First-heartbeat grace period.
    pub fn grace_period(&self) -> Duration {
        self.interval + self.timeout
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatEvent {
    /// Envelope to write to the socket.
    Reply(MessageEnvelope),
    /// No heartbeat within the allowed window.
    Timeout { elapsed: Duration },
}

#[derive(Debug)]
struct Liveness {
    last_seen: Instant,
    seen_first: bool,
}

pub struct HeartbeatManager {
    config: HeartbeatConfig,
    local_id: String,
    liveness: Arc<Mutex<Liveness>>,
    events: mpsc::UnboundedSender<HeartbeatEvent>,
    checker: Option<JoinHandle<()>>,
}

impl HeartbeatManager {
    pub fn new(
        config: HeartbeatConfig,
        local_id: impl Into<String>,
    ) -> (Self, mpsc::UnboundedReceiver<HeartbeatEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let manager = HeartbeatManager {
            config,
            local_id: local_id.into(),
            liveness: Arc::new(Mutex::new(Liveness {
                last_seen: Instant::now(),
                seen_first: false,
            })),
            events,
            checker: None,
        };
        (manager, events_rx)
    }

    /// Starts (or restarts) the liveness checker. Disabled configs only
    /// answer heartbeats and never time out.
    pub fn start(&mut self) {
        self.stop();
        {
            let mut liveness = self.liveness.lock().unwrap_or_else(|p| p.into_inner());
            liveness.last_seen = Instant::now();
            liveness.seen_first = false;
        }
        if !self.config.enabled {
            debug!("Heartbeat checker disabled");
            return;
        }

        let config = self.config.clone();
        let liveness = self.liveness.clone();
        let events = self.events.clone();
        self.checker = Some(tokio::spawn(async move {
            let period = config.check_period();
            loop {
                tokio::time::sleep(period).await;
                let (elapsed, threshold) = {
                    let liveness = liveness.lock().unwrap_or_else(|p| p.into_inner());
                    let threshold = if liveness.seen_first {
                        config.timeout
                    } else {
                        config.grace_period()
                    };
                    (liveness.last_seen.elapsed(), threshold)
                };
                if elapsed >= threshold {
                    warn!(
                        elapsed_ms = elapsed.as_millis() as u64,
                        threshold_ms = threshold.as_millis() as u64,
                        "Heartbeat timeout"
                    );
                    let _ = events.send(HeartbeatEvent::Timeout { elapsed });
                    break;
                }
            }
        }));
        debug!(period = ?self.config.check_period(), "Heartbeat checker started");
    }

    pub fn stop(&mut self) {
        if let Some(checker) = self.checker.take() {
            checker.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.checker.as_ref().is_some_and(|c| !c.is_finished())
    }

    /// Records liveness from a heartbeat or heartbeat ack.
    pub fn handle_heartbeat(&self, message: &MessageEnvelope) {
        {
            let mut liveness = self.liveness.lock().unwrap_or_else(|p| p.into_inner());
            liveness.last_seen = Instant::now();
            liveness.seen_first = true;
        }

        if self.config.auto_response && message.message_type == message_types::HEARTBEAT {
            let ack = MessageEnvelope::heartbeat_ack(self.local_id.clone(), message);
            let _ = self.events.send(HeartbeatEvent::Reply(ack));
        }
    }
}

impl Drop for HeartbeatManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn heartbeat() -> MessageEnvelope {
        MessageEnvelope::new("relay", message_types::HEARTBEAT, json!({ "timestamp": 1 }))
    }

    #[test]
    fn test_check_period_floor() {
        let config = HeartbeatConfig {
            enabled: true,
            interval: Duration::from_secs(4),
            timeout: Duration::from_secs(10),
            auto_response: true,
        };
        assert_eq!(config.check_period(), MIN_CHECK_PERIOD);
        assert_eq!(HeartbeatConfig::default().check_period(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once_after_grace_period() {
        let (mut hb, mut events) = HeartbeatManager::new(HeartbeatConfig::default(), "dev-1");
        let started = Instant::now();
        hb.start();

        match events.recv().await {
            Some(HeartbeatEvent::Timeout { elapsed }) => {
                assert!(elapsed >= Duration::from_secs(90));
                assert_eq!(started.elapsed(), Duration::from_secs(90));
            }
            other => panic!("expected timeout, got {:?}", other),
        }

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(events.try_recv().is_err());
        assert!(!hb.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_keep_link_alive() {
        let (mut hb, mut events) = HeartbeatManager::new(HeartbeatConfig::default(), "dev-1");
        hb.start();

        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(30)).await;
            hb.handle_heartbeat(&heartbeat());
        }
        let mut replies = 0;
        while let Ok(event) = events.try_recv() {
            assert!(matches!(event, HeartbeatEvent::Reply(_)));
            replies += 1;
        }
        assert_eq!(replies, 6);
        assert!(hb.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_normal_threshold_after_first_heartbeat() {
        let (mut hb, mut events) = HeartbeatManager::new(HeartbeatConfig::default(), "dev-1");
        hb.start();
        hb.handle_heartbeat(&heartbeat());
        let last = Instant::now();

        loop {
            match events.recv().await {
                Some(HeartbeatEvent::Timeout { .. }) => break,
                Some(HeartbeatEvent::Reply(_)) => continue,
                None => panic!("channel closed"),
            }
        }
        assert_eq!(last.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_checker_never_times_out() {
        let config = HeartbeatConfig {
            enabled: false,
            ..HeartbeatConfig::default()
        };
        let (mut hb, mut events) = HeartbeatManager::new(config, "dev-1");
        hb.start();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert!(events.try_recv().is_err());
        assert!(!hb.is_running());
    }

    #[tokio::test]
    async fn test_ack_echoes_payload() {
        let config = HeartbeatConfig::default();
        let (hb, mut events) = HeartbeatManager::new(config, "dev-1");
        let beat = heartbeat();
        hb.handle_heartbeat(&beat);

        match events.try_recv() {
            Ok(HeartbeatEvent::Reply(ack)) => {
                assert_eq!(ack.message_type, message_types::HEARTBEAT_ACK);
                assert_eq!(ack.data, beat.data);
                assert_eq!(ack.from, "dev-1");
            }
            other => panic!("expected reply, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ack_is_not_answered() {
        let (hb, mut events) = HeartbeatManager::new(HeartbeatConfig::default(), "dev-1");
        let ack = MessageEnvelope::heartbeat_ack("relay", &heartbeat());
        hb.handle_heartbeat(&ack);
        assert!(events.try_recv().is_err());
    }
}
