//! Listener setup, the accept loops, and outbound peer dialing.

use crate::config::Peer;
use crate::conn::{self, Stream};
use crate::daemon::Event;
use crate::state::ConnId;

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{rustls, TlsAcceptor, TlsConnector};

/// Connection-id allocator shared by the accept loops and dial tasks; the
/// only lock in the daemon outside the event loop.
#[derive(Clone)]
pub(crate) struct IdCounter(Arc<Mutex<ConnId>>);

impl IdCounter {
    pub(crate) fn new() -> IdCounter {
        IdCounter(Arc::new(Mutex::new(0)))
    }

    pub(crate) fn next(&self) -> ConnId {
        let mut next = self.0.lock().unwrap();
        let id = *next;
        *next += 1;
        id
    }
}

/// Builds the TLS acceptor for the TLS listen port from the configured
/// certificate and key files.
pub(crate) fn tls_acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor, String> {
    let cert_reader = File::open(cert_file)
        .map_err(|err| format!("can't open {:?}: {}", cert_file, err))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_reader))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| format!("can't parse {:?}: {}", cert_file, err))?;
    if certs.is_empty() {
        return Err(format!("{:?} contains no certificates", cert_file));
    }

    let key_reader =
        File::open(key_file).map_err(|err| format!("can't open {:?}: {}", key_file, err))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_reader))
        .map_err(|err| format!("can't parse {:?}: {}", key_file, err))?
        .ok_or_else(|| format!("{:?} contains no private key", key_file))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| format!("bad certificate/key pair: {}", err))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn tls_connector() -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        let _ = roots.add(cert);
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Accepts connections on one listener until shutdown. With an acceptor the
/// TLS handshake runs in its own task so a stalled handshake can't block
/// the loop.
pub(crate) async fn accept_task(
    listener: TcpListener,
    tls: Option<TlsAcceptor>,
    ids: IdCounter,
    dead_time: Duration,
    snd_ev: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                return;
            }
            res = listener.accept() => {
                let (sock, addr) = match res {
                    Err(err) => {
                        warn!("accept failed: {}", err);
                        continue;
                    }
                    Ok(accepted) => accepted,
                };
                let id = ids.next();
                debug!("conn {}: accepted from {}", id, addr);
                match tls.clone() {
                    None => {
                        let handle = conn::spawn(
                            id,
                            Stream::Tcp(sock.into()),
                            addr,
                            dead_time,
                            snd_ev.clone(),
                            shutdown.clone(),
                        );
                        if snd_ev.send(Event::Accepted(handle)).await.is_err() {
                            return;
                        }
                    }
                    Some(acceptor) => {
                        let snd_ev = snd_ev.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            match timeout(dead_time, acceptor.accept(sock)).await {
                                Ok(Ok(tls_sock)) => {
                                    let handle = conn::spawn(
                                        id,
                                        Stream::TlsServer(tls_sock.into()),
                                        addr,
                                        dead_time,
                                        snd_ev.clone(),
                                        shutdown,
                                    );
                                    let _ = snd_ev.send(Event::Accepted(handle)).await;
                                }
                                Ok(Err(err)) => {
                                    debug!("conn {}: tls handshake failed: {}", id, err);
                                }
                                Err(_) => {
                                    debug!("conn {}: tls handshake timed out", id);
                                }
                            }
                        });
                    }
                }
            }
        }
    }
}

/// Dials one configured peer. Reports back to the event loop either as a
/// `Dialed` connection ready for the link handshake or as a `DialFailed`.
pub(crate) async fn dial_task(
    peer: Peer,
    ids: IdCounter,
    dead_time: Duration,
    snd_ev: mpsc::Sender<Event>,
    shutdown: watch::Receiver<bool>,
) {
    let target = format!("{}:{}", peer.host, peer.port);
    let sock = match timeout(dead_time, TcpStream::connect(&target)).await {
        Err(_) => {
            let _ = snd_ev
                .send(Event::DialFailed {
                    peer: peer.name,
                    reason: format!("connection to {} timed out", target),
                })
                .await;
            return;
        }
        Ok(Err(err)) => {
            let _ = snd_ev
                .send(Event::DialFailed {
                    peer: peer.name,
                    reason: format!("can't connect to {}: {}", target, err),
                })
                .await;
            return;
        }
        Ok(Ok(sock)) => sock,
    };

    let addr = match sock.peer_addr() {
        Err(err) => {
            let _ = snd_ev
                .send(Event::DialFailed {
                    peer: peer.name,
                    reason: format!("can't read peer address: {}", err),
                })
                .await;
            return;
        }
        Ok(addr) => addr,
    };

    let stream = if peer.tls {
        let server_name = match ServerName::try_from(peer.host.clone()) {
            Err(err) => {
                let _ = snd_ev
                    .send(Event::DialFailed {
                        peer: peer.name,
                        reason: format!("bad tls server name {}: {}", peer.host, err),
                    })
                    .await;
                return;
            }
            Ok(name) => name,
        };
        match timeout(dead_time, tls_connector().connect(server_name, sock)).await {
            Err(_) => {
                let _ = snd_ev
                    .send(Event::DialFailed {
                        peer: peer.name,
                        reason: format!("tls handshake with {} timed out", target),
                    })
                    .await;
                return;
            }
            Ok(Err(err)) => {
                let _ = snd_ev
                    .send(Event::DialFailed {
                        peer: peer.name,
                        reason: format!("tls handshake with {} failed: {}", target, err),
                    })
                    .await;
                return;
            }
            Ok(Ok(tls_sock)) => Stream::TlsClient(tls_sock.into()),
        }
    } else {
        Stream::Tcp(sock.into())
    };

    let id = ids.next();
    debug!("conn {}: dialed {} ({})", id, peer.name, target);
    let handle = conn::spawn(id, stream, addr, dead_time, snd_ev.clone(), shutdown);
    let _ = snd_ev
        .send(Event::Dialed {
            handle,
            peer: peer.name,
        })
        .await;
}
