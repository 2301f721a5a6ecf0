//! The single-writer event loop. Connection I/O tasks, the timekeeper and
//! the signal task all feed one queue; the loop task owns the network state
//! and is the only task that reads or writes it. Side effects go out as
//! non-blocking sends on per-connection outbound queues.

use crate::client;
use crate::config::{self, Config, Tables};
use crate::conn::ConnHandle;
use crate::listen::{self, IdCounter};
use crate::s2s;
use crate::signals;
use crate::state::{ConnId, ConnKind, State};
use crate::ticker;
use crate::utils::now_ts;

use libshrike_common::{Sid, Uid};
use libshrike_wire::Msg;

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio_rustls::TlsAcceptor;

pub(crate) const SERVER_VERSION: &str = concat!("shrike-", env!("CARGO_PKG_VERSION"));

/// Everything the event loop consumes.
pub(crate) enum Event {
    /// A listener accepted a connection.
    Accepted(ConnHandle),
    /// An outbound dial to a configured peer succeeded.
    Dialed { handle: ConnHandle, peer: String },
    DialFailed { peer: String, reason: String },
    /// A framed message arrived on a connection.
    Message { cid: ConnId, msg: Msg },
    /// A connection died or violated the protocol.
    Dead { cid: ConnId, reason: String },
    Tick,
    Rehash,
    Restart,
}

/// What the process should do once the loop returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitAction {
    Quit,
    Restart,
    Fatal,
}

/// Where a KILL is sent on the wire.
pub(crate) enum KillScope {
    AllPeers,
    ExceptPeer(ConnId),
}

pub(crate) struct Daemon {
    pub(crate) config: Config,
    pub(crate) tables: Tables,
    pub(crate) state: State,
    pub(crate) conns: HashMap<ConnId, ConnHandle>,
    pub(crate) snd_ev: mpsc::Sender<Event>,
    pub(crate) ids: IdCounter,
    shutdown_tx: watch::Sender<bool>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
    pub(crate) boot_ts: u64,
    /// Last outbound attempt per configured peer.
    link_attempts: HashMap<String, Instant>,
    /// Peers with a dial or link handshake in flight.
    pub(crate) dialing: HashSet<String>,
    pub(crate) exit: Option<ExitAction>,
}

pub(crate) async fn run(
    config: Config,
    tables: Tables,
    sid: Sid,
    listener: TcpListener,
    tls: Option<(TcpListener, TlsAcceptor)>,
) -> ExitAction {
    let (snd_ev, mut rcv_ev) = mpsc::channel::<Event>(1024);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ids = IdCounter::new();

    tokio::spawn(listen::accept_task(
        listener,
        None,
        ids.clone(),
        config.dead_time(),
        snd_ev.clone(),
        shutdown_rx.clone(),
    ));
    if let Some((tls_listener, acceptor)) = tls {
        tokio::spawn(listen::accept_task(
            tls_listener,
            Some(acceptor),
            ids.clone(),
            config.dead_time(),
            snd_ev.clone(),
            shutdown_rx.clone(),
        ));
    }
    ticker::spawn(snd_ev.clone());
    signals::spawn(snd_ev.clone());

    info!(
        "{} ({}) up as {} [{}]",
        SERVER_VERSION, sid, config.server_name, config.listen_port
    );

    let mut daemon = Daemon {
        state: State::new(sid),
        config,
        tables,
        conns: HashMap::new(),
        snd_ev,
        ids,
        shutdown_tx,
        shutdown_rx,
        boot_ts: now_ts(),
        link_attempts: HashMap::new(),
        dialing: HashSet::new(),
        exit: None,
    };

    while let Some(ev) = rcv_ev.recv().await {
        daemon.handle_event(ev);
        if let Some(action) = daemon.exit {
            info!("event loop exiting: {:?}", action);
            return action;
        }
    }

    // Every sender is gone; nothing more can happen.
    ExitAction::Quit
}

impl Daemon {
    fn handle_event(&mut self, ev: Event) {
        match ev {
            Event::Accepted(handle) => self.on_accepted(handle),
            Event::Dialed { handle, peer } => self.on_dialed(handle, peer),
            Event::DialFailed { peer, reason } => self.on_dial_failed(peer, reason),
            Event::Message { cid, msg } => self.on_message(cid, msg),
            Event::Dead { cid, reason } => self.on_dead(cid, reason),
            Event::Tick => self.on_tick(),
            Event::Rehash => self.rehash(),
            Event::Restart => self.begin_shutdown(ExitAction::Restart),
        }
    }

    fn on_accepted(&mut self, handle: ConnHandle) {
        debug!("conn {}: new connection from {}", handle.id, handle.addr);
        self.state.new_conn(handle.id);
        self.conns.insert(handle.id, handle);
    }

    fn on_dialed(&mut self, handle: ConnHandle, peer: String) {
        let cid = handle.id;
        self.state.new_conn(cid);
        self.conns.insert(cid, handle);
        if let Some(pre) = self.state.pre.get_mut(&cid) {
            pre.outbound = Some(peer);
        }
        // We initiated, so we speak first.
        s2s::send_link_intro(self, cid);
    }

    fn on_dial_failed(&mut self, peer: String, reason: String) {
        self.dialing.remove(&peer);
        warn!("link to {} failed: {}", peer, reason);
        self.oper_notice(&format!("Connection to {} failed: {}", peer, reason));
    }

    fn on_message(&mut self, cid: ConnId, msg: Msg) {
        let kind = match self.state.conn_kind(cid) {
            None => return,
            Some(kind) => kind,
        };
        match kind {
            ConnKind::Pre => client::handle_prereg_message(self, cid, msg),
            ConnKind::User(uid) => {
                let admit = match self.state.local_users.get_mut(&cid) {
                    None => return,
                    Some(lu) => {
                        lu.last_activity = Instant::now();
                        lu.ping_sent = false;
                        lu.flood.admit(msg)
                    }
                };
                match admit {
                    crate::flood::Admit::Process(msg) => {
                        client::handle_message(self, cid, uid, msg)
                    }
                    crate::flood::Admit::Queued => {}
                    crate::flood::Admit::Excess => self.drop_conn(cid, "Excess flood"),
                }
            }
            ConnKind::Server(_) => {
                if let Some(ls) = self.state.local_servers.get_mut(&cid) {
                    ls.last_activity = Instant::now();
                    ls.ping_sent = false;
                }
                s2s::handle_message(self, cid, msg);
            }
        }
    }

    fn on_dead(&mut self, cid: ConnId, reason: String) {
        if self.conns.contains_key(&cid) {
            self.drop_conn(cid, &reason);
        }
    }

    fn on_tick(&mut self) {
        let now = Instant::now();
        let ping_time = self.config.ping_time();
        let dead_time = self.config.dead_time();

        // Pre-registrations that outstay the ping-time never register.
        let stale: Vec<ConnId> = self
            .conns
            .values()
            .filter(|h| {
                self.state.pre.contains_key(&h.id)
                    && now.duration_since(h.started) > ping_time
            })
            .map(|h| h.id)
            .collect();
        for cid in stale {
            self.drop_conn(cid, "Registration timeout");
        }

        // Overflowed outbound queues.
        let overrun: Vec<ConnId> = self
            .conns
            .values()
            .filter(|h| h.sendq_exceeded)
            .map(|h| h.id)
            .collect();
        for cid in overrun {
            self.drop_conn(cid, "SendQ exceeded");
        }

        // Ping idle users, kill dead ones.
        let mut to_ping: Vec<ConnId> = Vec::new();
        let mut to_kill: Vec<ConnId> = Vec::new();
        for (cid, lu) in &self.state.local_users {
            let idle = now.duration_since(lu.last_activity);
            if idle > dead_time {
                to_kill.push(*cid);
            } else if idle > ping_time && !lu.ping_sent {
                to_ping.push(*cid);
            }
        }
        for cid in to_ping {
            if let Some(lu) = self.state.local_users.get_mut(&cid) {
                lu.ping_sent = true;
            }
            let line = Msg::new(None, "PING", vec![self.config.server_name.clone()]).to_line();
            self.send_line(cid, line);
        }
        for cid in to_kill {
            self.drop_conn(cid, &format!("Ping timeout: {} seconds", dead_time.as_secs()));
        }

        // Same for peer links.
        let mut to_ping: Vec<ConnId> = Vec::new();
        let mut to_kill: Vec<ConnId> = Vec::new();
        for (cid, ls) in &self.state.local_servers {
            let idle = now.duration_since(ls.last_activity);
            if idle > dead_time {
                to_kill.push(*cid);
            } else if idle > ping_time && !ls.ping_sent {
                to_ping.push(*cid);
            }
        }
        for cid in to_ping {
            if let Some(ls) = self.state.local_servers.get_mut(&cid) {
                ls.ping_sent = true;
            }
            let line = Msg::new(None, "PING", vec![self.state.sid.to_string()]).to_line();
            self.send_line(cid, line);
        }
        for cid in to_kill {
            self.drop_conn(cid, &format!("Ping timeout: {} seconds", dead_time.as_secs()));
        }

        // Flood credit refill and queue drain.
        let drained: Vec<(ConnId, Uid, Vec<Msg>)> = self
            .state
            .local_users
            .iter_mut()
            .map(|(cid, lu)| (*cid, lu.uid.clone(), lu.flood.tick()))
            .filter(|(_, _, msgs)| !msgs.is_empty())
            .collect();
        for (cid, uid, msgs) in drained {
            for msg in msgs {
                // The user may have been dropped by an earlier queued
                // message (QUIT, kill); the rest of the queue dies with it.
                if !self.state.local_users.contains_key(&cid) {
                    break;
                }
                client::handle_message(self, cid, uid.clone(), msg);
            }
        }

        // One outbound link attempt per tick.
        self.try_connect_peer();
    }

    fn try_connect_peer(&mut self) {
        if self.exit.is_some() {
            return;
        }
        let gap = self.config.connect_attempt_time();
        let peer = self.tables.peers.iter().find(|p| {
            !self.dialing.contains(&p.name)
                && self.state.server_by_name(&p.name).is_none()
                && self
                    .link_attempts
                    .get(&p.name)
                    .map(|last| last.elapsed() >= gap)
                    .unwrap_or(true)
        });
        let peer = match peer {
            None => return,
            Some(peer) => peer.clone(),
        };
        self.start_dial(peer);
    }

    /// Spawns a dial task toward a configured peer.
    pub(crate) fn start_dial(&mut self, peer: config::Peer) {
        debug!("dialing {} at {}:{}", peer.name, peer.host, peer.port);
        self.link_attempts.insert(peer.name.clone(), Instant::now());
        self.dialing.insert(peer.name.clone());
        tokio::spawn(listen::dial_task(
            peer,
            self.ids.clone(),
            self.config.dead_time(),
            self.snd_ev.clone(),
            self.shutdown_rx.clone(),
        ));
    }

    pub(crate) fn rehash(&mut self) {
        match config::load_tables(&self.config) {
            Err(err) => {
                warn!("rehash failed: {}", err);
                let text = format!("Rehash failed: {}", err);
                self.oper_notice(&text);
            }
            Ok(tables) => {
                info!("rehashed configuration tables");
                self.tables = tables;
                self.oper_notice("Rehashing server configuration");
            }
        }
    }

    pub(crate) fn begin_shutdown(&mut self, action: ExitAction) {
        if self.exit.is_some() {
            return;
        }
        info!("shutting down ({:?})", action);
        let cids: Vec<ConnId> = self.conns.keys().copied().collect();
        let line = Msg::new(None, "ERROR", vec!["Server shutting down".to_owned()]).to_line();
        for cid in cids {
            if let Some(mut handle) = self.conns.remove(&cid) {
                handle.send(line.clone());
                handle.hang_up();
            }
        }
        let _ = self.shutdown_tx.send(true);
        self.exit = Some(action);
    }

    //
    // Outbound helpers. Everything the daemon says goes through these.
    //

    pub(crate) fn send_line(&mut self, cid: ConnId, line: String) {
        if let Some(handle) = self.conns.get_mut(&cid) {
            handle.send(line);
        }
    }

    pub(crate) fn send_msg(&mut self, cid: ConnId, msg: &Msg) {
        self.send_line(cid, msg.to_line());
    }

    /// One numeric reply to a local connection. `target` is the recipient's
    /// nick, or "*" before registration.
    pub(crate) fn numeric(&mut self, cid: ConnId, target: &str, num: &str, params: &[&str]) {
        let params = params.iter().map(|p| (*p).to_owned()).collect();
        self.numeric_owned(cid, target, num, params);
    }

    pub(crate) fn numeric_owned(&mut self, cid: ConnId, target: &str, num: &str, params: Vec<String>) {
        let mut ps: Vec<String> = Vec::with_capacity(params.len() + 1);
        ps.push(target.to_owned());
        ps.extend(params);
        let msg = Msg::new(Some(self.config.server_name.clone()), num, ps);
        self.send_line(cid, msg.to_line());
    }

    /// Sends a message to every directly linked peer, except the one it
    /// came from.
    pub(crate) fn propagate(&mut self, except: Option<ConnId>, msg: &Msg) {
        let line = msg.to_line();
        let cids: Vec<ConnId> = self
            .state
            .local_servers
            .keys()
            .copied()
            .filter(|cid| Some(*cid) != except)
            .collect();
        for cid in cids {
            self.send_line(cid, line.clone());
        }
    }

    /// Local members of a channel, by connection.
    pub(crate) fn local_members(&self, canon: &str) -> Vec<(ConnId, Uid)> {
        let mut out = Vec::new();
        if let Some(chan) = self.state.channels.get(canon) {
            for uid in &chan.members {
                if let Some(user) = self.state.users.get(uid) {
                    if let Some(cid) = user.conn_id {
                        out.push((cid, uid.clone()));
                    }
                }
            }
        }
        out
    }

    /// Peer links that have at least one remote member of the channel; a
    /// channel message goes to each of these exactly once.
    pub(crate) fn peers_for_channel(&self, canon: &str, except: Option<ConnId>) -> Vec<ConnId> {
        let mut set: HashSet<ConnId> = HashSet::new();
        if let Some(chan) = self.state.channels.get(canon) {
            for uid in &chan.members {
                if let Some(user) = self.state.users.get(uid) {
                    if let Some(via) = user.via {
                        set.insert(via);
                    }
                }
            }
        }
        if let Some(except) = except {
            set.remove(&except);
        }
        set.into_iter().collect()
    }

    /// Server notice to every local operator.
    pub(crate) fn oper_notice(&mut self, text: &str) {
        let targets: Vec<(ConnId, String)> = self
            .state
            .opers
            .iter()
            .filter_map(|uid| {
                let user = self.state.users.get(uid)?;
                user.conn_id.map(|cid| (cid, user.nick.clone()))
            })
            .collect();
        for (cid, nick) in targets {
            let text = format!("*** Notice -- {}", text);
            self.numeric_notice(cid, &nick, &text);
        }
    }

    /// Local connect/disconnect notices, gated on user mode +C.
    pub(crate) fn conn_notice(&mut self, text: &str) {
        let targets: Vec<(ConnId, String)> = self
            .state
            .opers
            .iter()
            .filter_map(|uid| {
                let user = self.state.users.get(uid)?;
                if !user.modes.conn_notices {
                    return None;
                }
                user.conn_id.map(|cid| (cid, user.nick.clone()))
            })
            .collect();
        for (cid, nick) in targets {
            let text = format!("*** Notice -- {}", text);
            self.numeric_notice(cid, &nick, &text);
        }
    }

    fn numeric_notice(&mut self, cid: ConnId, nick: &str, text: &str) {
        let msg = Msg::new(
            Some(self.config.server_name.clone()),
            "NOTICE",
            vec![nick.to_owned(), text.to_owned()],
        );
        self.send_line(cid, msg.to_line());
    }

    /// Removes a user from the network: QUIT lines to local users sharing a
    /// channel (once each), optional QUIT propagation to peers, state
    /// cleanup, and connection teardown when the user is local. KILL paths
    /// pass `propagate: false` since the KILL itself already went out.
    pub(crate) fn remove_user_announce(
        &mut self,
        uid: &Uid,
        quit_reason: &str,
        propagate: bool,
        except: Option<ConnId>,
    ) {
        let (prefix, chans, local_cid, identity) = match self.state.users.get(uid) {
            None => return,
            Some(user) => (
                user.prefix(),
                user.chans.clone(),
                user.conn_id,
                format!("{} ({}@{})", user.nick, user.username, user.host),
            ),
        };

        let mut seen: HashSet<ConnId> = HashSet::new();
        for canon in &chans {
            for (mcid, _) in self.local_members(canon) {
                if Some(mcid) != local_cid {
                    seen.insert(mcid);
                }
            }
        }
        let quit_line = Msg::new(Some(prefix), "QUIT", vec![quit_reason.to_owned()]).to_line();
        for mcid in seen {
            self.send_line(mcid, quit_line.clone());
        }

        if propagate {
            let msg = Msg::new(Some(uid.to_string()), "QUIT", vec![quit_reason.to_owned()]);
            self.propagate(except, &msg);
        }

        self.state.remove_user(uid, &self.config.server_name);

        if let Some(cid) = local_cid {
            if let Some(mut handle) = self.conns.remove(&cid) {
                let line = Msg::new(
                    None,
                    "ERROR",
                    vec![format!("Closing link: {}", quit_reason)],
                )
                .to_line();
                handle.send(line);
                handle.hang_up();
            }
            self.conn_notice(&format!("Client exiting: {}", identity));
        }
    }

    /// Issues a KILL on the wire and cleans the victim up. Cleanup never
    /// produces a QUIT toward peers; local users sharing a channel still
    /// see one.
    pub(crate) fn kill_user(&mut self, actor: &str, uid: &Uid, reason: &str, scope: KillScope) {
        let kill = Msg::new(
            Some(actor.to_owned()),
            "KILL",
            vec![uid.to_string(), reason.to_owned()],
        );
        match scope {
            KillScope::AllPeers => self.propagate(None, &kill),
            KillScope::ExceptPeer(cid) => self.propagate(Some(cid), &kill),
        }

        let (nick, local_cid) = match self.state.users.get(uid) {
            None => return,
            Some(user) => (user.nick.clone(), user.conn_id),
        };
        if let Some(cid) = local_cid {
            let line = Msg::new(
                Some(actor.to_owned()),
                "KILL",
                vec![nick, reason.to_owned()],
            )
            .to_line();
            self.send_line(cid, line);
        }
        self.remove_user_announce(uid, &format!("Killed ({})", reason), false, None);
    }

    /// Tears one connection down, whatever it currently is.
    pub(crate) fn drop_conn(&mut self, cid: ConnId, reason: &str) {
        match self.state.conn_kind(cid) {
            None => {
                self.remove_handle(cid, reason);
            }
            Some(ConnKind::Pre) => {
                if let Some(pre) = self.state.pre.remove(&cid) {
                    if let Some(peer) = pre.outbound {
                        self.dialing.remove(&peer);
                        self.oper_notice(&format!("Link handshake with {} failed: {}", peer, reason));
                    }
                }
                self.remove_handle(cid, reason);
            }
            Some(ConnKind::User(uid)) => {
                self.remove_user_announce(&uid, reason, true, None);
            }
            Some(ConnKind::Server(sid)) => {
                s2s::link_lost(self, cid, sid, reason);
            }
        }
    }

    /// Sends a final ERROR and forgets the handle.
    pub(crate) fn remove_handle(&mut self, cid: ConnId, reason: &str) {
        if let Some(mut handle) = self.conns.remove(&cid) {
            let line = Msg::new(None, "ERROR", vec![format!("Closing link: {}", reason)]).to_line();
            handle.send(line);
            handle.hang_up();
        }
    }
}
