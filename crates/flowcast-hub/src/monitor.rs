use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::hub::SseHub;

/// Spawn the heartbeat loop. The loop holds only a weak reference, so it
/// never keeps a dropped hub alive.
pub(crate) fn spawn_heartbeat(hub: &Arc<SseHub>) -> JoinHandle<()> {
    let period = hub.config().heartbeat_interval;
    spawn_periodic(hub, period, "heartbeat", |hub| {
        hub.heartbeat_tick();
    })
}

/// Spawn the health-check loop that reclaims idle connections.
pub(crate) fn spawn_health_check(hub: &Arc<SseHub>) -> JoinHandle<()> {
    let period = hub.config().health_check_interval;
    spawn_periodic(hub, period, "health-check", |hub| {
        let reclaimed = hub.check_health();
        if reclaimed > 0 {
            info!(reclaimed, active = hub.active_connections(), "health check");
        }
    })
}

fn spawn_periodic<F>(hub: &Arc<SseHub>, period: Duration, name: &'static str, tick: F) -> JoinHandle<()>
where
    F: Fn(&SseHub) + Send + 'static,
{
    let weak: Weak<SseHub> = Arc::downgrade(hub);
    let token: CancellationToken = hub.shutdown_token();

    tokio::spawn(async move {
        // First tick one period from now, not immediately.
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(hub) = weak.upgrade() else { break };
                    tick(&hub);
                }
            }
        }
        debug!(task = name, "hub loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use flowcast_core::event_types;

    use super::*;
    use crate::connection::ClientInfo;
    use crate::hub::HubConfig;

    fn config() -> HubConfig {
        HubConfig {
            heartbeat_interval: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(2),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_loop_delivers_to_subscribers() {
        let hub = SseHub::start(config());
        let (id, mut rx) = hub.connect(ClientInfo::anonymous()).unwrap();
        hub.subscribe(&id, [event_types::HEARTBEAT]).unwrap();
        let _connected = rx.recv().await.unwrap();

        let frame = tokio::time::timeout(Duration::from_millis(1500), rx.recv())
            .await
            .expect("heartbeat within one interval")
            .unwrap();
        assert_eq!(frame.event, "heartbeat");
        assert!(frame.data.contains("\"connections\":1"));
        hub.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn health_loop_reclaims_silent_connection() {
        let hub = SseHub::start(config());
        let (_silent, mut rx_silent) = hub.connect(ClientInfo::anonymous()).unwrap();
        let (listening, _rx_listening) = hub.connect(ClientInfo::anonymous()).unwrap();
        hub.subscribe(&listening, [event_types::HEARTBEAT]).unwrap();

        tokio::time::sleep(Duration::from_millis(4500)).await;

        assert_eq!(hub.active_connections(), 1);
        assert!(hub.subscriptions(&listening).is_ok());
        // Connected frame, then the channel is closed.
        assert!(rx_silent.recv().await.is_some());
        assert!(rx_silent.recv().await.is_none());
        hub.destroy();
    }

    #[tokio::test(start_paused = true)]
    async fn destroy_stops_loops() {
        let hub = SseHub::start(config());
        let (id, mut rx) = hub.connect(ClientInfo::anonymous()).unwrap();
        hub.subscribe(&id, [event_types::HEARTBEAT]).unwrap();
        hub.destroy();

        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut frames = Vec::new();
        while let Some(frame) = rx.recv().await {
            frames.push(frame);
        }
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|f| f.event != "heartbeat"));
        assert_eq!(hub.stats().messages_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn loop_exits_when_hub_is_dropped() {
        let hub = SseHub::start(config());
        let handle = spawn_heartbeat(&hub);
        drop(hub);
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("loop stops after drop")
            .unwrap();
    }
}
