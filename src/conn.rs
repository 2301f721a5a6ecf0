//! One connection: the socket, its bounded outbound queue, and the reader
//! and writer tasks that shuttle framed lines between it and the event
//! loop. The tasks exit on I/O error, deadline expiry, shutdown, or when
//! the event loop hangs the connection up.

use crate::daemon::Event;
use crate::state::ConnId;

use libshrike_wire as wire;

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch, Notify};
use tokio::time::timeout;

/// Outbound queue capacity. The event loop never blocks on a send; a full
/// queue flags the connection for a "SendQ exceeded" kill instead.
pub(crate) const SEND_QUEUE_LEN: usize = 32_768;

pub(crate) enum Stream {
    Tcp(Box<TcpStream>),
    // Server and client TLS streams are distinct types in tokio-rustls; we
    // accept with the former and dial peers with the latter.
    TlsServer(Box<tokio_rustls::server::TlsStream<TcpStream>>),
    TlsClient(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl Stream {
    pub(crate) fn is_tls(&self) -> bool {
        !matches!(self, Stream::Tcp(_))
    }
}

/// The event loop's handle to one connection.
pub(crate) struct ConnHandle {
    pub(crate) id: ConnId,
    pub(crate) addr: SocketAddr,
    pub(crate) tls: bool,
    pub(crate) started: Instant,
    pub(crate) sendq_exceeded: bool,
    snd: mpsc::Sender<String>,
    quit: Arc<Notify>,
}

impl ConnHandle {
    /// Non-blocking enqueue of one encoded line.
    pub(crate) fn send(&mut self, line: String) {
        match self.snd.try_send(line) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.sendq_exceeded = true;
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Stops the reader task. The writer stops once the handle is dropped
    /// and the queued lines have been written out.
    pub(crate) fn hang_up(&self) {
        self.quit.notify_one();
    }
}

/// Spawns the reader and writer tasks for an established stream and returns
/// the handle the event loop keeps.
pub(crate) fn spawn(
    id: ConnId,
    stream: Stream,
    addr: SocketAddr,
    dead_time: Duration,
    snd_ev: mpsc::Sender<Event>,
    shutdown: watch::Receiver<bool>,
) -> ConnHandle {
    let tls = stream.is_tls();
    let (snd_line, rcv_line) = mpsc::channel::<String>(SEND_QUEUE_LEN);
    let quit = Arc::new(Notify::new());
    let (read_half, write_half) = tokio::io::split(stream);
    tokio::spawn(reader_task(
        id,
        read_half,
        dead_time,
        snd_ev.clone(),
        shutdown,
        quit.clone(),
    ));
    tokio::spawn(writer_task(id, write_half, rcv_line, dead_time, snd_ev, quit.clone()));
    ConnHandle {
        id,
        addr,
        tls,
        started: Instant::now(),
        sendq_exceeded: false,
        snd: snd_line,
        quit,
    }
}

async fn reader_task(
    id: ConnId,
    mut read_half: tokio::io::ReadHalf<Stream>,
    dead_time: Duration,
    snd_ev: mpsc::Sender<Event>,
    mut shutdown: watch::Receiver<bool>,
    quit: Arc<Notify>,
) {
    let mut read_buf: [u8; 1024] = [0; 1024];
    let mut parse_buf: Vec<u8> = Vec::with_capacity(1024);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                return;
            }
            _ = quit.notified() => {
                return;
            }
            res = timeout(dead_time, read_half.read(&mut read_buf)) => {
                match res {
                    Err(_) => {
                        let reason = format!("Ping timeout: {} seconds", dead_time.as_secs());
                        let _ = snd_ev.send(Event::Dead { cid: id, reason }).await;
                        return;
                    }
                    Ok(Err(err)) => {
                        debug!("conn {}: read error: {}", id, err);
                        let reason = format!("Read error: {}", err);
                        let _ = snd_ev.send(Event::Dead { cid: id, reason }).await;
                        return;
                    }
                    Ok(Ok(0)) => {
                        let reason = "Connection closed".to_owned();
                        let _ = snd_ev.send(Event::Dead { cid: id, reason }).await;
                        return;
                    }
                    Ok(Ok(bytes)) => {
                        parse_buf.extend_from_slice(&read_buf[..bytes]);
                        while let Some(res) = wire::parse_msg(&mut parse_buf) {
                            match res {
                                Ok(msg) => {
                                    // Delivery in arrival order; this send
                                    // is the per-connection backpressure.
                                    if snd_ev.send(Event::Message { cid: id, msg }).await.is_err() {
                                        return;
                                    }
                                }
                                Err(err) => {
                                    let _ = snd_ev.send(Event::Dead { cid: id, reason: err }).await;
                                    return;
                                }
                            }
                        }
                        // Whatever is left has no line terminator yet; a
                        // peer streaming more than a line's worth of bytes
                        // without one is violating the protocol.
                        if parse_buf.len() > wire::MAX_LINE_LEN {
                            let reason = format!("Line exceeds {} bytes", wire::MAX_LINE_LEN);
                            let _ = snd_ev.send(Event::Dead { cid: id, reason }).await;
                            return;
                        }
                    }
                }
            }
        }
    }
}

async fn writer_task(
    id: ConnId,
    mut write_half: tokio::io::WriteHalf<Stream>,
    mut rcv_line: mpsc::Receiver<String>,
    dead_time: Duration,
    snd_ev: mpsc::Sender<Event>,
    quit: Arc<Notify>,
) {
    while let Some(line) = rcv_line.recv().await {
        match timeout(dead_time, write_half.write_all(line.as_bytes())).await {
            Err(_) => {
                let reason = "Write timeout".to_owned();
                let _ = snd_ev.send(Event::Dead { cid: id, reason }).await;
                break;
            }
            Ok(Err(err)) => {
                debug!("conn {}: write error: {}", id, err);
                let reason = format!("Write error: {}", err);
                let _ = snd_ev.send(Event::Dead { cid: id, reason }).await;
                break;
            }
            Ok(Ok(())) => {}
        }
    }
    let _ = write_half.shutdown().await;
    quit.notify_one();
}

//
// Boilerplate
//

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &mut ReadBuf,
    ) -> Poll<Result<(), std::io::Error>> {
        match *self {
            Stream::Tcp(ref mut stream) => Pin::new(stream).poll_read(cx, buf),
            Stream::TlsServer(ref mut stream) => Pin::new(stream).poll_read(cx, buf),
            Stream::TlsClient(ref mut stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match *self {
            Stream::Tcp(ref mut stream) => Pin::new(stream).poll_write(cx, buf),
            Stream::TlsServer(ref mut stream) => Pin::new(stream).poll_write(cx, buf),
            Stream::TlsClient(ref mut stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<(), std::io::Error>> {
        match *self {
            Stream::Tcp(ref mut stream) => Pin::new(stream).poll_flush(cx),
            Stream::TlsServer(ref mut stream) => Pin::new(stream).poll_flush(cx),
            Stream::TlsClient(ref mut stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context,
    ) -> Poll<Result<(), std::io::Error>> {
        match *self {
            Stream::Tcp(ref mut stream) => Pin::new(stream).poll_shutdown(cx),
            Stream::TlsServer(ref mut stream) => Pin::new(stream).poll_shutdown(cx),
            Stream::TlsClient(ref mut stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
