//! The world clock: advances age and time of day every tick, broadcasts
//! time updates, runs the keepalive sweep and flags ticks that blow their
//! budget. Time of day can freeze while nobody is logged in; age never
//! stops.

use anvil::protocol::packet::{FieldValue, Packet};
use anvil::protocol::registry::ids;
use anvil::protocol::{Direction, ProtocolState};
use ember::logging;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::server::ServerInner;

/// Time updates go out every this many ticks.
const TIME_BROADCAST_TICKS: u64 = 20;

pub(crate) fn spawn(inner: Arc<ServerInner>) -> JoinHandle<()> {
    thread::Builder::new()
        .name("world-clock".to_owned())
        .spawn(move || clock_loop(&inner))
        .expect("failed to spawn clock thread")
}

/// Allowed tick duration before it is flagged.
fn tick_budget(tick_length_ms: u64, threshold_percent: u32) -> Duration {
    Duration::from_micros(tick_length_ms * 1000 * (100 + u64::from(threshold_percent)) / 100)
}

fn clock_loop(inner: &Arc<ServerInner>) {
    let tick_length = Duration::from_millis(inner.config.tick_length.max(1));
    let budget = tick_budget(inner.config.tick_length.max(1), inner.config.tick_threshold);
    let keepalive_interval = Duration::from_millis(inner.config.keepalive_interval.max(1));

    let mut tick: u64 = 0;
    let mut last_keepalive = Instant::now();

    while inner.is_running() {
        let started = Instant::now();
        tick += 1;

        inner.world_age.fetch_add(1, Ordering::Relaxed);

        let online = inner.auth_count.load(Ordering::Acquire);
        if !(inner.config.offline_freeze && online == 0) {
            inner.time_of_day.fetch_add(1, Ordering::Relaxed);
        }

        if tick % TIME_BROADCAST_TICKS == 0 && online > 0 {
            broadcast_time(inner);
        }

        if last_keepalive.elapsed() >= keepalive_interval {
            last_keepalive = Instant::now();
            keepalive_sweep(inner);
        }

        let elapsed = started.elapsed();
        if elapsed > budget {
            logging::warn!(inner.log, "tick over budget";
                           "tick" => tick,
                           "elapsed_us" => elapsed.as_micros() as u64,
                           "budget_us" => budget.as_micros() as u64);
        }

        thread::sleep(tick_length.saturating_sub(elapsed));
    }
}

fn broadcast_time(inner: &Arc<ServerInner>) {
    let packet = Packet::new(
        ProtocolState::Authenticated,
        Direction::Clientbound,
        ids::play::TIME_UPDATE,
        vec![
            FieldValue::U64(inner.world_age.load(Ordering::Relaxed)),
            FieldValue::U64(inner.time_of_day.load(Ordering::Relaxed)),
        ],
    );

    for client in inner.authenticated_clients() {
        drop(client.send(&packet));
    }
}

/// Disconnects peers past the idle limit and probes the rest.
fn keepalive_sweep(inner: &Arc<ServerInner>) {
    let idle_timeout = inner.config.idle_timeout;

    for client in inner.authenticated_clients() {
        if idle_timeout > 0 && client.idle_ms() > idle_timeout {
            client.disconnect(Some("timed out"));
            continue;
        }

        let token = inner.keepalive_token.fetch_add(1, Ordering::Relaxed);
        client.begin_keepalive(token);

        let probe = Packet::new(
            ProtocolState::Authenticated,
            Direction::Clientbound,
            ids::play::KEEP_ALIVE,
            vec![FieldValue::U64(token)],
        );
        drop(client.send(&probe));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_budget() {
        // 50 ms at 10% over budget: 55 ms.
        assert_eq!(tick_budget(50, 10), Duration::from_micros(55_000));
        assert_eq!(tick_budget(50, 0), Duration::from_millis(50));
        assert_eq!(tick_budget(1, 100), Duration::from_millis(2));
    }
}
