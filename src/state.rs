//! The authoritative in-memory network state: users, servers, channels,
//! nicks, operators, K-lines. Entities reference each other by identifier
//! (UID, SID, canonical name, connection id) and are resolved on demand;
//! only the event loop reads or writes any of this.

use crate::flood::Flood;
use crate::kline::Kline;
use crate::utils::now_ts;

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

use libshrike_common::{canonicalize, ChanModes, Sid, Uid, UidGen, UserModes};

pub(crate) type ConnId = u64;

/// What a connection currently is. Promotion moves the record between
/// tables; the kind is derived from table membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnKind {
    Pre,
    User(Uid),
    Server(Sid),
}

/// Inputs collected from a connection that has not registered yet, for
/// either the client handshake (NICK/USER) or the server one
/// (PASS/CAPAB/SERVER/SVINFO).
#[derive(Debug, Default)]
pub(crate) struct PreReg {
    pub(crate) nick: Option<String>,
    /// (username, realname) from USER.
    pub(crate) user: Option<(String, String)>,
    /// (link secret, peer SID) from PASS.
    pub(crate) pass: Option<(String, Sid)>,
    pub(crate) capabs: Option<HashSet<String>>,
    /// (peer name, description) from SERVER.
    pub(crate) server: Option<(String, String)>,
    /// Set when we dialed this connection out to a configured peer.
    pub(crate) outbound: Option<String>,
    /// Our PASS/CAPAB/SERVER/SVINFO block has been sent.
    pub(crate) sent_intro: bool,
}

/// A user anywhere on the network.
#[derive(Debug)]
pub(crate) struct User {
    pub(crate) uid: Uid,
    /// Display nick; `canonicalize(nick)` is its key in the nick index.
    pub(crate) nick: String,
    pub(crate) username: String,
    pub(crate) host: String,
    pub(crate) ip: String,
    pub(crate) realname: String,
    pub(crate) modes: UserModes,
    pub(crate) nick_ts: u64,
    /// Canonical names of joined channels.
    pub(crate) chans: HashSet<String>,
    pub(crate) away: Option<String>,
    /// Connection id when the user is attached to this server.
    pub(crate) conn_id: Option<ConnId>,
    /// Direct peer link a remote user is reachable through.
    pub(crate) via: Option<ConnId>,
}

impl User {
    pub(crate) fn is_local(&self) -> bool {
        self.conn_id.is_some()
    }

    /// `nick!user@host`, the client-facing message source.
    pub(crate) fn prefix(&self) -> String {
        format!("{}!{}@{}", self.nick, self.username, self.host)
    }

    /// `user@host`, the identity the collision rules compare.
    pub(crate) fn userhost(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// Bookkeeping for a user attached to this server.
#[derive(Debug)]
pub(crate) struct LocalUser {
    pub(crate) uid: Uid,
    pub(crate) flood: Flood,
    pub(crate) last_activity: Instant,
    /// Last PRIVMSG/NOTICE, for the WHOIS idle reply.
    pub(crate) last_message: Instant,
    pub(crate) ping_sent: bool,
    pub(crate) registered_at: u64,
}

/// A server elsewhere on the network.
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) sid: Sid,
    pub(crate) name: String,
    pub(crate) description: String,
    pub(crate) hopcount: u32,
    /// Set for directly linked peers.
    pub(crate) conn_id: Option<ConnId>,
    /// Direct peer link this server is reachable through.
    pub(crate) via: ConnId,
    /// SID of the server that introduced it; `None` for direct peers.
    pub(crate) upstream: Option<Sid>,
}

/// Link-level bookkeeping for a directly connected peer.
#[derive(Debug)]
pub(crate) struct LocalServer {
    pub(crate) sid: Sid,
    pub(crate) capabs: HashSet<String>,
    /// Cleared when the end-of-burst PONG arrives.
    pub(crate) bursting: bool,
    pub(crate) last_activity: Instant,
    pub(crate) ping_sent: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Topic {
    pub(crate) text: String,
    /// `nick!user@host` of the setter.
    pub(crate) set_by: String,
    pub(crate) set_at: u64,
}

#[derive(Debug)]
pub(crate) struct Channel {
    /// Display name; keyed in the channel table by its canonical form.
    pub(crate) name: String,
    pub(crate) ts: u64,
    pub(crate) modes: ChanModes,
    pub(crate) topic: Option<Topic>,
    pub(crate) members: HashSet<Uid>,
    pub(crate) ops: HashSet<Uid>,
}

/// WHOWAS history entry. Bounded, in-memory only.
#[derive(Debug, Clone)]
pub(crate) struct Whowas {
    pub(crate) nick: String,
    pub(crate) username: String,
    pub(crate) host: String,
    pub(crate) realname: String,
    pub(crate) server: String,
}

const WHOWAS_HISTORY: usize = 1024;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum JoinOutcome {
    /// Channel created; the joiner got ops. Carries the channel TS.
    Created(u64),
    /// Joined an existing channel.
    Joined,
    /// Already a member; nothing changed.
    AlreadyIn,
}

pub(crate) struct State {
    pub(crate) sid: Sid,
    pub(crate) uid_gen: UidGen,
    pub(crate) pre: HashMap<ConnId, PreReg>,
    pub(crate) local_users: HashMap<ConnId, LocalUser>,
    pub(crate) local_servers: HashMap<ConnId, LocalServer>,
    pub(crate) users: HashMap<Uid, User>,
    pub(crate) servers: HashMap<Sid, Server>,
    /// Canonical nick -> UID.
    pub(crate) nicks: HashMap<String, Uid>,
    /// Canonical name -> channel.
    pub(crate) channels: HashMap<String, Channel>,
    pub(crate) opers: HashSet<Uid>,
    pub(crate) klines: Vec<Kline>,
    pub(crate) whowas: VecDeque<Whowas>,
}

impl State {
    pub(crate) fn new(sid: Sid) -> State {
        State {
            uid_gen: UidGen::new(sid.clone()),
            sid,
            pre: HashMap::new(),
            local_users: HashMap::new(),
            local_servers: HashMap::new(),
            users: HashMap::new(),
            servers: HashMap::new(),
            nicks: HashMap::new(),
            channels: HashMap::new(),
            opers: HashSet::new(),
            klines: Vec::new(),
            whowas: VecDeque::new(),
        }
    }

    pub(crate) fn conn_kind(&self, cid: ConnId) -> Option<ConnKind> {
        if self.pre.contains_key(&cid) {
            return Some(ConnKind::Pre);
        }
        if let Some(lu) = self.local_users.get(&cid) {
            return Some(ConnKind::User(lu.uid.clone()));
        }
        if let Some(ls) = self.local_servers.get(&cid) {
            return Some(ConnKind::Server(ls.sid.clone()));
        }
        None
    }

    pub(crate) fn new_conn(&mut self, cid: ConnId) {
        self.pre.insert(cid, PreReg::default());
    }

    /// Registration: the connection stops being pre-registered and becomes a
    /// local user. Fails only when the UID space is exhausted.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn promote_user(
        &mut self,
        cid: ConnId,
        nick: &str,
        username: &str,
        realname: &str,
        host: &str,
        ip: &str,
        flood_exempt: bool,
    ) -> Option<Uid> {
        let uid = self.uid_gen.next_uid()?;
        self.pre.remove(&cid);
        let now = Instant::now();
        self.local_users.insert(
            cid,
            LocalUser {
                uid: uid.clone(),
                flood: Flood::new(flood_exempt),
                last_activity: now,
                last_message: now,
                ping_sent: false,
                registered_at: now_ts(),
            },
        );
        self.users.insert(
            uid.clone(),
            User {
                uid: uid.clone(),
                nick: nick.to_owned(),
                username: username.to_owned(),
                host: host.to_owned(),
                ip: ip.to_owned(),
                realname: realname.to_owned(),
                modes: UserModes {
                    invisible: true,
                    ..UserModes::default()
                },
                nick_ts: now_ts(),
                chans: HashSet::new(),
                away: None,
                conn_id: Some(cid),
                via: None,
            },
        );
        self.nicks.insert(canonicalize(nick), uid.clone());
        Some(uid)
    }

    /// Link registration: the connection becomes a directly linked peer.
    pub(crate) fn promote_server(
        &mut self,
        cid: ConnId,
        sid: Sid,
        name: &str,
        description: &str,
        capabs: HashSet<String>,
    ) {
        self.pre.remove(&cid);
        self.local_servers.insert(
            cid,
            LocalServer {
                sid: sid.clone(),
                capabs,
                bursting: true,
                last_activity: Instant::now(),
                ping_sent: false,
            },
        );
        self.servers.insert(
            sid.clone(),
            Server {
                sid,
                name: name.to_owned(),
                description: description.to_owned(),
                hopcount: 1,
                conn_id: Some(cid),
                via: cid,
                upstream: None,
            },
        );
    }

    pub(crate) fn add_remote_server(
        &mut self,
        sid: Sid,
        name: &str,
        description: &str,
        hopcount: u32,
        via: ConnId,
        upstream: Sid,
    ) {
        self.servers.insert(
            sid.clone(),
            Server {
                sid,
                name: name.to_owned(),
                description: description.to_owned(),
                hopcount,
                conn_id: None,
                via,
                upstream: Some(upstream),
            },
        );
    }

    pub(crate) fn add_remote_user(&mut self, user: User) {
        debug_assert!(user.conn_id.is_none() && user.via.is_some());
        self.nicks.insert(canonicalize(&user.nick), user.uid.clone());
        if user.modes.oper {
            self.opers.insert(user.uid.clone());
        }
        self.users.insert(user.uid.clone(), user);
    }

    pub(crate) fn user_by_nick(&self, nick: &str) -> Option<&User> {
        let uid = self.nicks.get(&canonicalize(nick))?;
        self.users.get(uid)
    }

    pub(crate) fn server_by_name(&self, name: &str) -> Option<&Server> {
        self.servers.values().find(|s| s.name == name)
    }

    /// The display name of the server a user sits on.
    pub(crate) fn server_name_of(&self, user: &User, own_name: &str) -> String {
        if user.is_local() {
            return own_name.to_owned();
        }
        match Sid::new(user.uid.sid_str()).and_then(|sid| self.servers.get(&sid)) {
            Some(server) => server.name.clone(),
            None => own_name.to_owned(),
        }
    }

    /// Removes a user everywhere: nick index, channels (empty ones are
    /// destroyed), operator registry, local bookkeeping. Records the WHOWAS
    /// entry. Returns the removed user.
    pub(crate) fn remove_user(&mut self, uid: &Uid, own_server_name: &str) -> Option<User> {
        let user = self.users.remove(uid)?;
        self.nicks.remove(&canonicalize(&user.nick));
        self.opers.remove(uid);
        if let Some(cid) = user.conn_id {
            self.local_users.remove(&cid);
        }
        for canon in &user.chans {
            let emptied = match self.channels.get_mut(canon) {
                None => false,
                Some(chan) => {
                    chan.members.remove(uid);
                    chan.ops.remove(uid);
                    chan.members.is_empty()
                }
            };
            if emptied {
                self.channels.remove(canon);
            }
        }
        let server = self.server_name_of(&user, own_server_name);
        self.record_whowas(&user, server);
        Some(user)
    }

    fn record_whowas(&mut self, user: &User, server: String) {
        if self.whowas.len() == WHOWAS_HISTORY {
            self.whowas.pop_front();
        }
        self.whowas.push_back(Whowas {
            nick: user.nick.clone(),
            username: user.username.clone(),
            host: user.host.clone(),
            realname: user.realname.clone(),
            server,
        });
    }

    /// Changes a user's nick, updating the nick index atomically and
    /// stamping the new nick TS. The caller has already checked the target
    /// nick is free (or is this user's own, for a case change).
    pub(crate) fn rename_user(&mut self, uid: &Uid, new_nick: &str, ts: u64, own_server_name: &str) {
        let entry = match self.users.get(uid) {
            None => return,
            Some(user) => Whowas {
                nick: user.nick.clone(),
                username: user.username.clone(),
                host: user.host.clone(),
                realname: user.realname.clone(),
                server: self.server_name_of(user, own_server_name),
            },
        };
        if self.whowas.len() == WHOWAS_HISTORY {
            self.whowas.pop_front();
        }
        self.whowas.push_back(entry);
        if let Some(user) = self.users.get_mut(uid) {
            self.nicks.remove(&canonicalize(&user.nick));
            user.nick = new_nick.to_owned();
            user.nick_ts = ts;
            self.nicks.insert(canonicalize(new_nick), uid.clone());
        }
    }

    /// Adds a user to a channel, creating it with default modes (and ops for
    /// the creator) on first join.
    pub(crate) fn join_channel(&mut self, uid: &Uid, display_name: &str, ts: u64) -> JoinOutcome {
        let canon = canonicalize(display_name);
        let outcome = match self.channels.get_mut(&canon) {
            Some(chan) => {
                if !chan.members.insert(uid.clone()) {
                    return JoinOutcome::AlreadyIn;
                }
                JoinOutcome::Joined
            }
            None => {
                let mut members = HashSet::new();
                members.insert(uid.clone());
                let mut ops = HashSet::new();
                ops.insert(uid.clone());
                self.channels.insert(
                    canon.clone(),
                    Channel {
                        name: display_name.to_owned(),
                        ts,
                        modes: ChanModes::defaults(),
                        topic: None,
                        members,
                        ops,
                    },
                );
                JoinOutcome::Created(ts)
            }
        };
        if let Some(user) = self.users.get_mut(uid) {
            user.chans.insert(canon);
        }
        outcome
    }

    /// Removes a user from a channel, destroying it when the last member
    /// leaves. Returns false when the user was not a member.
    pub(crate) fn part_channel(&mut self, uid: &Uid, canon: &str) -> bool {
        let emptied = match self.channels.get_mut(canon) {
            None => return false,
            Some(chan) => {
                if !chan.members.remove(uid) {
                    return false;
                }
                chan.ops.remove(uid);
                chan.members.is_empty()
            }
        };
        if emptied {
            self.channels.remove(canon);
        }
        if let Some(user) = self.users.get_mut(uid) {
            user.chans.remove(canon);
        }
        true
    }

    pub(crate) fn set_oper(&mut self, uid: &Uid) {
        if let Some(user) = self.users.get_mut(uid) {
            user.modes.oper = true;
            self.opers.insert(uid.clone());
        }
    }

    pub(crate) fn clear_oper(&mut self, uid: &Uid) {
        if let Some(user) = self.users.get_mut(uid) {
            user.modes.oper = false;
        }
        self.opers.remove(uid);
    }

    /// Adds a K-line; duplicates of an existing mask pair are dropped.
    pub(crate) fn add_kline(&mut self, kline: Kline) -> bool {
        if self
            .klines
            .iter()
            .any(|k| k.same_masks(&kline.user_mask, &kline.host_mask))
        {
            return false;
        }
        self.klines.push(kline);
        true
    }

    /// Removes a K-line by mask pair; removing a missing one is a no-op.
    pub(crate) fn remove_kline(&mut self, user_mask: &str, host_mask: &str) -> bool {
        let before = self.klines.len();
        self.klines.retain(|k| !k.same_masks(user_mask, host_mask));
        self.klines.len() != before
    }

    /// Checks the cross-table invariants. Called from tests after every
    /// mutation sequence.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        for (canon, uid) in &self.nicks {
            let user = self.users.get(uid).expect("nick index points to a user");
            assert_eq!(&canonicalize(&user.nick), canon);
        }
        for (canon, chan) in &self.channels {
            assert!(!chan.members.is_empty(), "empty channel {} exists", canon);
            assert_eq!(&canonicalize(&chan.name), canon);
            for uid in &chan.members {
                let user = self.users.get(uid).expect("member exists");
                assert!(user.chans.contains(canon));
            }
            for uid in &chan.ops {
                assert!(chan.members.contains(uid), "op is a member");
            }
        }
        for user in self.users.values() {
            assert_eq!(self.nicks.get(&canonicalize(&user.nick)), Some(&user.uid));
            for canon in &user.chans {
                let chan = self.channels.get(canon).expect("joined channel exists");
                assert!(chan.members.contains(&user.uid));
            }
            assert_eq!(user.modes.oper, self.opers.contains(&user.uid));
            assert_eq!(user.uid.as_str().len(), 9);
            if user.is_local() {
                assert_eq!(user.uid.sid_str(), self.sid.as_str());
            }
        }
        for uid in &self.opers {
            assert!(self.users.contains_key(uid));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_state() -> State {
        State::new(Sid::new("0SH").unwrap())
    }

    fn add_user(state: &mut State, cid: ConnId, nick: &str) -> Uid {
        state.new_conn(cid);
        let uid = state
            .promote_user(cid, nick, "user", "Real Name", "host.example", "10.0.0.1", false)
            .unwrap();
        state.check_invariants();
        uid
    }

    #[test]
    fn test_promote_user() {
        let mut state = new_state();
        let uid = add_user(&mut state, 1, "Bob");
        assert_eq!(uid.sid_str(), "0SH");
        assert_eq!(state.conn_kind(1), Some(ConnKind::User(uid.clone())));
        assert!(state.pre.is_empty());
        assert_eq!(state.user_by_nick("BOB").unwrap().uid, uid);
        assert!(state.users[&uid].modes.invisible);
    }

    #[test]
    fn test_join_part_lifecycle() {
        let mut state = new_state();
        let bob = add_user(&mut state, 1, "bob");
        let eve = add_user(&mut state, 2, "eve");

        assert_eq!(state.join_channel(&bob, "#Test", 1000), JoinOutcome::Created(1000));
        state.check_invariants();
        assert_eq!(state.join_channel(&bob, "#test", 1001), JoinOutcome::AlreadyIn);
        assert_eq!(state.join_channel(&eve, "#TEST", 1002), JoinOutcome::Joined);
        state.check_invariants();

        let chan = &state.channels["#test"];
        assert_eq!(chan.name, "#Test");
        assert_eq!(chan.ts, 1000);
        assert!(chan.ops.contains(&bob));
        assert!(!chan.ops.contains(&eve));

        assert!(state.part_channel(&bob, "#test"));
        state.check_invariants();
        assert!(!state.part_channel(&bob, "#test"));
        assert!(state.channels.contains_key("#test"));
        assert!(state.part_channel(&eve, "#test"));
        assert!(!state.channels.contains_key("#test"));
        state.check_invariants();
    }

    #[test]
    fn test_rename_updates_index() {
        let mut state = new_state();
        let bob = add_user(&mut state, 1, "bob");
        state.rename_user(&bob, "carol", 2000, "irc.example.com");
        state.check_invariants();
        assert!(state.user_by_nick("bob").is_none());
        assert_eq!(state.user_by_nick("CAROL").unwrap().uid, bob);
        assert_eq!(state.users[&bob].nick_ts, 2000);
        // The old nick went into WHOWAS.
        assert_eq!(state.whowas.back().unwrap().nick, "bob");
    }

    #[test]
    fn test_remove_user_cleans_everything() {
        let mut state = new_state();
        let bob = add_user(&mut state, 1, "bob");
        let eve = add_user(&mut state, 2, "eve");
        state.join_channel(&bob, "#a", 1);
        state.join_channel(&bob, "#b", 2);
        state.join_channel(&eve, "#b", 3);
        state.set_oper(&bob);
        state.check_invariants();

        let removed = state.remove_user(&bob, "irc.example.com").unwrap();
        assert_eq!(removed.nick, "bob");
        state.check_invariants();
        assert!(state.user_by_nick("bob").is_none());
        assert!(!state.channels.contains_key("#a"));
        assert!(state.channels.contains_key("#b"));
        assert!(state.opers.is_empty());
        assert!(state.local_users.is_empty() || !state.local_users.contains_key(&1));
    }

    #[test]
    fn test_oper_registry() {
        let mut state = new_state();
        let bob = add_user(&mut state, 1, "bob");
        state.set_oper(&bob);
        state.check_invariants();
        assert!(state.users[&bob].modes.oper);
        state.clear_oper(&bob);
        state.check_invariants();
        assert!(!state.users[&bob].modes.oper);
    }

    #[test]
    fn test_kline_idempotence() {
        let mut state = new_state();
        assert!(state.add_kline(Kline::new("*", "*.bad", "x").unwrap()));
        assert!(!state.add_kline(Kline::new("*", "*.bad", "y").unwrap()));
        assert_eq!(state.klines.len(), 1);
        assert!(state.remove_kline("*", "*.bad"));
        assert!(!state.remove_kline("*", "*.bad"));
        assert!(state.klines.is_empty());
    }

    #[test]
    fn test_remote_entities() {
        let mut state = new_state();
        state.new_conn(7);
        state.promote_server(7, Sid::new("1AB").unwrap(), "hub.example.com", "hub", HashSet::new());
        assert_eq!(
            state.conn_kind(7),
            Some(ConnKind::Server(Sid::new("1AB").unwrap()))
        );
        state.add_remote_server(
            Sid::new("2CD").unwrap(),
            "leaf.example.com",
            "leaf",
            2,
            7,
            Sid::new("1AB").unwrap(),
        );

        let uid = Uid::new("2CDAAAAAA").unwrap();
        state.add_remote_user(User {
            uid: uid.clone(),
            nick: "remote".to_owned(),
            username: "r".to_owned(),
            host: "far.example".to_owned(),
            ip: "10.1.1.1".to_owned(),
            realname: "Remote".to_owned(),
            modes: UserModes::parse("+i"),
            nick_ts: 500,
            chans: HashSet::new(),
            away: None,
            conn_id: None,
            via: Some(7),
        });
        state.check_invariants();
        assert!(state.user_by_nick("remote").is_some());
        assert_eq!(state.server_by_name("leaf.example.com").unwrap().hopcount, 2);
    }
}
