//! Turns process signals into events: SIGHUP rereads the satellite config
//! tables, SIGUSR1 restarts the daemon in place.

use crate::daemon::Event;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;

pub(crate) fn spawn(snd_ev: mpsc::Sender<Event>) {
    tokio::spawn(async move {
        let mut hup = match signal(SignalKind::hangup()) {
            Err(err) => {
                warn!("can't install SIGHUP handler: {}", err);
                return;
            }
            Ok(sig) => sig,
        };
        let mut usr1 = match signal(SignalKind::user_defined1()) {
            Err(err) => {
                warn!("can't install SIGUSR1 handler: {}", err);
                return;
            }
            Ok(sig) => sig,
        };
        loop {
            tokio::select! {
                _ = hup.recv() => {
                    if snd_ev.send(Event::Rehash).await.is_err() {
                        return;
                    }
                }
                _ = usr1.recv() => {
                    if snd_ev.send(Event::Restart).await.is_err() {
                        return;
                    }
                }
            }
        }
    });
}
