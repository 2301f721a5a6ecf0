//! One-second heartbeat. The event loop does all timer-driven work (pings,
//! flood refills, link retries) off these ticks, so nothing else in the
//! daemon keeps its own clock.

use crate::daemon::Event;

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

pub(crate) fn spawn(snd_ev: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if snd_ev.send(Event::Tick).await.is_err() {
                // Event loop is gone; so are we.
                return;
            }
        }
    });
}
