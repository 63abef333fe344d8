//! ---
//! vfab_section: "11-simulation-test-harness"
//! vfab_subsection: "module"
//! vfab_type: "source"
//! vfab_scope: "code"
//! vfab_description: "Simulated plant controllers and signal bridging."
//! vfab_version: "v0.0.0-prealpha"
//! vfab_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use v_fab_msg::{ErrorEvent, ErrorSignal, ProductionSignal, QueueSignal, TelemetrySample};
use v_fab_net::{PublishedEvent, QueueTransport};

/// Aggregation settings for the event-to-signal bridge.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Window over which production quality and error counts accumulate.
    pub window: Duration,
    pub production_queue: String,
    pub error_queue: String,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            production_queue: v_fab_msg::PRODUCTION_QUEUE.to_owned(),
            error_queue: v_fab_msg::ERROR_QUEUE.to_owned(),
        }
    }
}

#[derive(Default)]
struct DeviceWindow {
    last_good: Option<i64>,
    last_bad: Option<i64>,
    window_good: i64,
    window_bad: i64,
    errors: VecDeque<(Instant, i64)>,
}

/// Stand-in for the external stream-analytics stage: folds the per-device
/// event stream into windowed production-quality and error-count signals on
/// the queue transport.
pub struct SignalBridge {
    queues: Arc<dyn QueueTransport>,
    settings: BridgeSettings,
    windows: HashMap<String, DeviceWindow>,
}

impl SignalBridge {
    /// Create a bridge publishing into `queues`.
    pub fn new(queues: Arc<dyn QueueTransport>, settings: BridgeSettings) -> Self {
        Self {
            queues,
            settings,
            windows: HashMap::new(),
        }
    }

    /// Run the bridge until the shutdown signal fires.
    pub fn spawn(
        mut self,
        mut events: broadcast::Receiver<PublishedEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut window_tick = tokio::time::interval(self.settings.window);
            window_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!("signal bridge shutdown");
                        break;
                    }
                    event = events.recv() => match event {
                        Ok(event) => self.on_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "signal bridge lagged behind the event feed");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("event feed closed; signal bridge exiting");
                            break;
                        }
                    },
                    _ = window_tick.tick() => self.flush_production_windows().await,
                }
            }
        })
    }

    async fn on_event(&mut self, event: PublishedEvent) {
        if let Ok(error) = serde_json::from_value::<ErrorEvent>(event.payload.clone()) {
            self.on_error_event(&event.device_id, &error).await;
            return;
        }
        if let Ok(sample) = serde_json::from_value::<TelemetrySample>(event.payload.clone()) {
            self.on_telemetry_event(&event.device_id, &sample);
            return;
        }
        debug!(device = %event.device_id, "event payload matches no known schema");
    }

    fn on_telemetry_event(&mut self, device_id: &str, sample: &TelemetrySample) {
        let window = self.windows.entry(device_id.to_owned()).or_default();
        if let Some(last) = window.last_good {
            let delta = sample.good_count - last;
            if delta >= 0 {
                window.window_good += delta;
            }
        }
        if let Some(last) = window.last_bad {
            let delta = sample.bad_count - last;
            if delta >= 0 {
                window.window_bad += delta;
            }
        }
        window.last_good = Some(sample.good_count);
        window.last_bad = Some(sample.bad_count);
    }

    async fn on_error_event(&mut self, device_id: &str, error: &ErrorEvent) {
        let horizon = self.settings.window;
        let occurred = error.device_error.len() as i64;
        let total = {
            let window = self.windows.entry(device_id.to_owned()).or_default();
            let now = Instant::now();
            window.errors.push_back((now, occurred));
            while let Some((at, _)) = window.errors.front() {
                if now.duration_since(*at) > horizon {
                    window.errors.pop_front();
                } else {
                    break;
                }
            }
            window.errors.iter().map(|(_, count)| count).sum()
        };

        let signal = QueueSignal::Error(ErrorSignal {
            device_id: device_id.to_owned(),
            error_count: total,
        });
        self.dispatch(signal).await;
    }

    async fn flush_production_windows(&mut self) {
        let mut signals = Vec::new();
        for (device_id, window) in &mut self.windows {
            let produced = window.window_good + window.window_bad;
            if produced == 0 {
                continue;
            }
            let percent = window.window_good as f32 / produced as f32 * 100.0;
            signals.push(QueueSignal::Production(ProductionSignal {
                device_id: device_id.clone(),
                percent_good_production: percent,
            }));
            window.window_good = 0;
            window.window_bad = 0;
        }
        for signal in signals {
            self.dispatch(signal).await;
        }
    }

    async fn dispatch(&self, signal: QueueSignal) {
        let queue = match &signal {
            QueueSignal::Production(_) => self.settings.production_queue.as_str(),
            QueueSignal::Error(_) => self.settings.error_queue.as_str(),
        };
        let body = match signal.encode() {
            Ok(body) => body,
            Err(err) => {
                warn!(error = %err, "failed to encode queue signal");
                return;
            }
        };
        if let Err(err) = self.queues.send(queue, body).await {
            warn!(queue, error = %err, "failed to enqueue signal");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use v_fab_net::InMemoryQueue;

    fn short_window_settings() -> BridgeSettings {
        BridgeSettings {
            window: Duration::from_millis(50),
            ..BridgeSettings::default()
        }
    }

    async fn next_signal(queues: &InMemoryQueue, queue: &str) -> QueueSignal {
        let message = tokio::time::timeout(Duration::from_secs(2), queues.receive(queue))
            .await
            .expect("signal within deadline")
            .expect("receive");
        queues.ack(&message).await.expect("ack");
        QueueSignal::decode(queue, &message.body).expect("decode")
    }

    #[tokio::test]
    async fn telemetry_deltas_become_a_production_signal() {
        let queues = Arc::new(InMemoryQueue::new());
        let (feed, events) = broadcast::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);
        let bridge = SignalBridge::new(queues.clone(), short_window_settings());
        let task = bridge.spawn(events, shutdown_tx.subscribe());

        // two samples: 80 good, 20 bad produced between them
        feed.send(PublishedEvent {
            device_id: "press-1".into(),
            payload: json!({
                "ProductionStatus": 1, "WorkorderId": "wo-1",
                "GoodCount": 100, "BadCount": 10, "Temperature": 60.0
            }),
            published_at: chrono::Utc::now(),
        })
        .expect("feed");
        feed.send(PublishedEvent {
            device_id: "press-1".into(),
            payload: json!({
                "ProductionStatus": 1, "WorkorderId": "wo-1",
                "GoodCount": 180, "BadCount": 30, "Temperature": 60.0
            }),
            published_at: chrono::Utc::now(),
        })
        .expect("feed");

        let signal = next_signal(&queues, v_fab_msg::PRODUCTION_QUEUE).await;
        match signal {
            QueueSignal::Production(inner) => {
                assert_eq!(inner.device_id, "press-1");
                assert!((inner.percent_good_production - 80.0).abs() < 0.01);
            }
            other => panic!("unexpected signal {other:?}"),
        }

        let _ = shutdown_tx.send(());
        task.await.expect("bridge task");
    }

    #[tokio::test]
    async fn error_events_accumulate_within_the_window() {
        let queues = Arc::new(InMemoryQueue::new());
        let (feed, events) = broadcast::channel(16);
        let (shutdown_tx, _) = broadcast::channel(1);
        let settings = BridgeSettings {
            window: Duration::from_secs(60),
            ..BridgeSettings::default()
        };
        let bridge = SignalBridge::new(queues.clone(), settings);
        let task = bridge.spawn(events, shutdown_tx.subscribe());

        feed.send(PublishedEvent {
            device_id: "press-1".into(),
            payload: json!({ "DeviceError": ["PowerFailure"], "newErrors": 1 }),
            published_at: chrono::Utc::now(),
        })
        .expect("feed");
        feed.send(PublishedEvent {
            device_id: "press-1".into(),
            payload: json!({
                "DeviceError": ["SensorFailure", "Unknown"], "newErrors": 3
            }),
            published_at: chrono::Utc::now(),
        })
        .expect("feed");

        let first = next_signal(&queues, v_fab_msg::ERROR_QUEUE).await;
        match first {
            QueueSignal::Error(inner) => assert_eq!(inner.error_count, 1),
            other => panic!("unexpected signal {other:?}"),
        }
        let second = next_signal(&queues, v_fab_msg::ERROR_QUEUE).await;
        match second {
            QueueSignal::Error(inner) => assert_eq!(inner.error_count, 3),
            other => panic!("unexpected signal {other:?}"),
        }

        let _ = shutdown_tx.send(());
        task.await.expect("bridge task");
    }
}
