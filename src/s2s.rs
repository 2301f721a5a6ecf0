//! The TS6 server-to-server protocol: the link handshake (both roles),
//! burst generation, state replication from peers, nick-collision
//! arbitration, and SJOIN timestamp merging. Identifiers on the wire are
//! SIDs and UIDs; display names only appear when a message is rewritten
//! for delivery to a local client.

use crate::daemon::{Daemon, KillScope};
use crate::numeric::*;
use crate::state::{Channel, ConnId, Topic, User};
use crate::utils::{now_ts, sanitize_text};

use libshrike_common::{canonicalize, ChanModes, Sid, Uid, UserModes};
use libshrike_wire::Msg;

use std::collections::HashSet;

/// Largest clock difference accepted in SVINFO, in seconds.
const MAX_CLOCK_SKEW: u64 = 60;

/// Capabilities we require from a peer and advertise ourselves.
const REQUIRED_CAPABS: [&str; 2] = ["QS", "ENCAP"];

//
// Handshake (pre-registration side)
//

pub(crate) fn prereg_pass(d: &mut Daemon, cid: ConnId, params: &[String]) {
    if params.len() == 4 && params[1] == "TS" && params[2] == "6" {
        let sid = match Sid::new(&params[3]) {
            None => {
                d.drop_conn(cid, "Invalid SID in PASS");
                return;
            }
            Some(sid) => sid,
        };
        if let Some(pre) = d.state.pre.get_mut(&cid) {
            pre.pass = Some((params[0].clone(), sid));
        }
    }
    // Anything else is a client password; we don't use those.
}

pub(crate) fn prereg_capab(d: &mut Daemon, cid: ConnId, params: &[String]) {
    let capabs: HashSet<String> = params
        .iter()
        .flat_map(|p| p.split_whitespace())
        .map(str::to_owned)
        .collect();
    if let Some(pre) = d.state.pre.get_mut(&cid) {
        pre.capabs = Some(capabs);
    }
}

pub(crate) fn prereg_server(d: &mut Daemon, cid: ConnId, params: &[String]) {
    if params.len() < 3 {
        d.drop_conn(cid, "SERVER needs <name> <hopcount> <description>");
        return;
    }
    let name = params[0].clone();
    let description = params[2].clone();

    let (secret, sid) = match d.state.pre.get(&cid).and_then(|pre| pre.pass.clone()) {
        None => {
            d.drop_conn(cid, "PASS must precede SERVER");
            return;
        }
        Some(pass) => pass,
    };
    let capabs = d
        .state
        .pre
        .get(&cid)
        .and_then(|pre| pre.capabs.clone())
        .unwrap_or_default();
    if !REQUIRED_CAPABS.iter().all(|c| capabs.contains(*c)) {
        d.drop_conn(cid, "Missing required capabilities QS and ENCAP");
        return;
    }
    if params[1] != "1" {
        d.drop_conn(cid, "Bad hopcount in SERVER");
        return;
    }
    if let Some(outbound) = d.state.pre.get(&cid).and_then(|pre| pre.outbound.clone()) {
        if outbound != name {
            d.drop_conn(cid, "Peer introduced itself under an unexpected name");
            return;
        }
    }
    let peer = match d.tables.peer(&name) {
        None => {
            d.drop_conn(cid, "Server not configured");
            return;
        }
        Some(peer) => peer.clone(),
    };
    if peer.password != secret {
        d.drop_conn(cid, "Bad link password");
        return;
    }
    if d.state.servers.contains_key(&sid) || d.state.server_by_name(&name).is_some() {
        d.drop_conn(cid, "Server already linked");
        return;
    }
    if sid == d.state.sid {
        d.drop_conn(cid, "Peer uses our SID");
        return;
    }

    if let Some(pre) = d.state.pre.get_mut(&cid) {
        pre.server = Some((name, description));
    }
    // Passive role: we answer in kind, SVINFO last.
    send_link_intro(d, cid);
}

pub(crate) fn prereg_svinfo(d: &mut Daemon, cid: ConnId, params: &[String]) {
    if params.len() < 4 {
        d.drop_conn(cid, "SVINFO needs four parameters");
        return;
    }
    if d.state.pre.get(&cid).map(|pre| pre.server.is_none()).unwrap_or(true) {
        d.drop_conn(cid, "SVINFO before SERVER");
        return;
    }
    if params[0] != "6" {
        d.drop_conn(cid, "Unsupported TS version");
        return;
    }
    let epoch: u64 = match params[3].parse() {
        Err(_) => {
            d.drop_conn(cid, "Bad time in SVINFO");
            return;
        }
        Ok(epoch) => epoch,
    };
    let now = now_ts();
    if now.abs_diff(epoch) > MAX_CLOCK_SKEW {
        d.drop_conn(cid, "Excessive clock skew");
        return;
    }

    let pre = match d.state.pre.get(&cid) {
        None => return,
        Some(pre) => pre,
    };
    let (name, description) = match pre.server.clone() {
        None => return,
        Some(server) => server,
    };
    let sid = match pre.pass.clone() {
        None => return,
        Some((_, sid)) => sid,
    };
    let capabs = pre.capabs.clone().unwrap_or_default();
    let outbound = pre.outbound.clone();

    if let Some(peer) = outbound {
        d.dialing.remove(&peer);
    }
    d.state.promote_server(cid, sid.clone(), &name, &description, capabs);
    info!("conn {}: linked with {} [{}]", cid, name, sid);
    d.oper_notice(&format!("Link with {}[{}] established", name, sid));
    send_burst(d, cid);
}

/// Our half of the handshake: PASS, CAPAB, SERVER, SVINFO.
pub(crate) fn send_link_intro(d: &mut Daemon, cid: ConnId) {
    let already_sent = match d.state.pre.get_mut(&cid) {
        None => return,
        Some(pre) => {
            let sent = pre.sent_intro;
            pre.sent_intro = true;
            sent
        }
    };
    if already_sent {
        return;
    }

    let peer_name = match d.state.pre.get(&cid).and_then(|pre| {
        pre.outbound
            .clone()
            .or_else(|| pre.server.as_ref().map(|(name, _)| name.clone()))
    }) {
        None => return,
        Some(name) => name,
    };
    let password = match d.tables.peer(&peer_name) {
        None => {
            d.drop_conn(cid, "Server not configured");
            return;
        }
        Some(peer) => peer.password.clone(),
    };

    let sid = d.state.sid.to_string();
    let lines = vec![
        Msg::new(
            None,
            "PASS",
            vec![password, "TS".to_owned(), "6".to_owned(), sid],
        )
        .to_line(),
        Msg::new(None, "CAPAB", vec![REQUIRED_CAPABS.join(" ")]).to_line(),
        Msg::new(
            None,
            "SERVER",
            vec![
                d.config.server_name.clone(),
                "1".to_owned(),
                d.config.server_info.clone(),
            ],
        )
        .to_line(),
        Msg::new(
            None,
            "SVINFO",
            vec![
                "6".to_owned(),
                "6".to_owned(),
                "0".to_owned(),
                now_ts().to_string(),
            ],
        )
        .to_line(),
    ];
    for line in lines {
        d.send_line(cid, line);
    }
}

/// Everything we know, replayed to a fresh link: servers, users, channels,
/// then the PING whose PONG marks the end of our peer's burst.
fn send_burst(d: &mut Daemon, cid: ConnId) {
    let my_sid = d.state.sid.to_string();
    let mut lines: Vec<String> = Vec::new();

    for server in d.state.servers.values() {
        if server.conn_id == Some(cid) {
            continue;
        }
        let pfx = server
            .upstream
            .as_ref()
            .map(|u| u.to_string())
            .unwrap_or_else(|| my_sid.clone());
        lines.push(
            Msg::new(
                Some(pfx),
                "SID",
                vec![
                    server.name.clone(),
                    (server.hopcount + 1).to_string(),
                    server.sid.to_string(),
                    server.description.clone(),
                ],
            )
            .to_line(),
        );
    }

    let uids: Vec<Uid> = d.state.users.keys().cloned().collect();
    for uid in uids {
        if let Some(msg) = d.uid_intro_msg(&uid) {
            lines.push(msg.to_line());
        }
        if let Some(away) = d.state.users.get(&uid).and_then(|u| u.away.clone()) {
            lines.push(Msg::new(Some(uid.to_string()), "AWAY", vec![away]).to_line());
        }
    }

    for chan in d.state.channels.values() {
        let mut member_toks: Vec<String> = chan
            .members
            .iter()
            .map(|m| {
                if chan.ops.contains(m) {
                    format!("@{}", m)
                } else {
                    m.to_string()
                }
            })
            .collect();
        member_toks.sort();
        // Member lists longer than a line are split into repeated SJOINs.
        for chunk in member_toks.chunks(12) {
            lines.push(
                Msg::new(
                    Some(my_sid.clone()),
                    "SJOIN",
                    vec![
                        chan.ts.to_string(),
                        chan.name.clone(),
                        chan.modes.to_string(),
                        chunk.join(" "),
                    ],
                )
                .to_line(),
            );
        }
    }

    lines.push(Msg::new(None, "PING", vec![my_sid]).to_line());
    for line in lines {
        d.send_line(cid, line);
    }
}

//
// Registered link traffic
//

pub(crate) fn handle_message(d: &mut Daemon, cid: ConnId, msg: Msg) {
    let cmd = msg.cmd.to_ascii_uppercase();
    if let Some(num) = as_numeric(&cmd) {
        route_numeric(d, cid, num, &msg);
        return;
    }
    match cmd.as_str() {
        "PING" => {
            let param = msg
                .params
                .last()
                .cloned()
                .unwrap_or_else(|| d.config.server_name.clone());
            let reply = Msg::new(
                Some(d.state.sid.to_string()),
                "PONG",
                vec![d.config.server_name.clone(), param],
            );
            d.send_msg(cid, &reply);
        }
        "PONG" => {
            let finished = match d.state.local_servers.get_mut(&cid) {
                None => false,
                Some(ls) => {
                    let was = ls.bursting;
                    ls.bursting = false;
                    was
                }
            };
            if finished {
                let name = peer_name(d, cid);
                debug!("conn {}: end of burst from {}", cid, name);
                d.oper_notice(&format!("End of burst from {}", name));
            }
        }
        "ERROR" => {
            let reason = msg
                .params
                .first()
                .cloned()
                .unwrap_or_else(|| "unknown".to_owned());
            d.drop_conn(cid, &format!("ERROR from peer: {}", reason));
        }
        "SID" => s2s_sid(d, cid, &msg),
        "UID" => s2s_uid(d, cid, &msg),
        "SJOIN" => s2s_sjoin(d, cid, &msg),
        "JOIN" => s2s_join(d, cid, &msg),
        "PART" => s2s_part(d, cid, &msg),
        "NICK" => s2s_nick(d, cid, &msg),
        "QUIT" => s2s_quit(d, cid, &msg),
        "KILL" => s2s_kill(d, cid, &msg),
        "TMODE" => s2s_tmode(d, cid, &msg),
        "TOPIC" => s2s_topic(d, cid, &msg),
        "MODE" => s2s_mode(d, cid, &msg),
        "AWAY" => s2s_away(d, cid, &msg),
        "PRIVMSG" => s2s_privmsg(d, cid, &msg, "PRIVMSG"),
        "NOTICE" => s2s_privmsg(d, cid, &msg, "NOTICE"),
        "INVITE" => s2s_invite(d, cid, &msg),
        "WHOIS" => s2s_whois(d, cid, &msg),
        "WALLOPS" => s2s_wallops(d, cid, &msg),
        "ENCAP" => s2s_encap(d, cid, &msg),
        "SQUIT" => s2s_squit(d, cid, &msg),
        "SVINFO" | "CAPAB" | "PASS" | "SERVER" => {}
        _ => {
            debug!("conn {}: unhandled server command {}", cid, cmd);
        }
    }
}

fn as_numeric(cmd: &str) -> Option<&str> {
    if cmd.len() == 3 && cmd.bytes().all(|b| b.is_ascii_digit()) {
        Some(cmd)
    } else {
        None
    }
}

fn peer_name(d: &Daemon, cid: ConnId) -> String {
    d.state
        .servers
        .values()
        .find(|s| s.conn_id == Some(cid))
        .map(|s| s.name.clone())
        .unwrap_or_else(|| format!("conn {}", cid))
}

fn peer_bursting(d: &Daemon, cid: ConnId) -> bool {
    d.state
        .local_servers
        .get(&cid)
        .map(|ls| ls.bursting)
        .unwrap_or(false)
}

fn source_user(d: &Daemon, msg: &Msg) -> Option<Uid> {
    let uid = Uid::new(msg.pfx.as_deref()?)?;
    if d.state.users.contains_key(&uid) {
        Some(uid)
    } else {
        None
    }
}

/// Display form of a wire source, for lines rewritten toward local clients.
fn source_display(d: &Daemon, msg: &Msg) -> String {
    if let Some(pfx) = msg.pfx.as_deref() {
        if let Some(uid) = Uid::new(pfx) {
            if let Some(user) = d.state.users.get(&uid) {
                return user.prefix();
            }
        }
        if let Some(sid) = Sid::new(pfx) {
            if let Some(server) = d.state.servers.get(&sid) {
                return server.name.clone();
            }
        }
    }
    d.config.server_name.clone()
}

//
// State replication
//

fn s2s_sid(d: &mut Daemon, cid: ConnId, msg: &Msg) {
    let introducer = match msg.pfx.as_deref().and_then(Sid::new) {
        None => {
            d.drop_conn(cid, "SID without a server prefix");
            return;
        }
        Some(sid) => sid,
    };
    if msg.params.len() < 4 {
        d.drop_conn(cid, "SID needs four parameters");
        return;
    }
    let name = msg.params[0].clone();
    let hopcount: u32 = msg.params[1].parse().unwrap_or(1);
    let sid = match Sid::new(&msg.params[2]) {
        None => {
            d.drop_conn(cid, "Invalid SID introduced");
            return;
        }
        Some(sid) => sid,
    };
    let description = msg.params[3].clone();

    if sid == d.state.sid
        || d.state.servers.contains_key(&sid)
        || d.state.server_by_name(&name).is_some()
    {
        d.drop_conn(cid, "Duplicate server introduced");
        return;
    }

    d.state
        .add_remote_server(sid.clone(), &name, &description, hopcount, cid, introducer.clone());
    if !peer_bursting(d, cid) {
        d.oper_notice(&format!("Server {}[{}] joined the network", name, sid));
    }

    let forward = Msg::new(
        Some(introducer.to_string()),
        "SID",
        vec![name, (hopcount + 1).to_string(), sid.to_string(), description],
    );
    d.propagate(Some(cid), &forward);
}

/// The two-user outcome of a nick collision, per the TS rules.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Collision {
    /// The incumbent dies; the newcomer is accepted.
    KillExisting,
    /// The newcomer dies; the incumbent stays.
    KillIncoming,
    KillBoth,
}

fn arbitrate(incoming_ts: u64, existing_ts: u64, same_userhost: bool) -> Collision {
    if incoming_ts == existing_ts {
        Collision::KillBoth
    } else if incoming_ts < existing_ts {
        if same_userhost {
            Collision::KillIncoming
        } else {
            Collision::KillExisting
        }
    } else if same_userhost {
        Collision::KillExisting
    } else {
        Collision::KillIncoming
    }
}

fn s2s_uid(d: &mut Daemon, cid: ConnId, msg: &Msg) {
    let owner = match msg.pfx.as_deref().and_then(Sid::new) {
        None => {
            d.drop_conn(cid, "UID without a server prefix");
            return;
        }
        Some(sid) => sid,
    };
    if msg.params.len() < 9 {
        d.drop_conn(cid, "UID needs nine parameters");
        return;
    }
    let nick = msg.params[0].clone();
    let nick_ts: u64 = match msg.params[2].parse() {
        Err(_) => {
            d.drop_conn(cid, "Bad TS in UID");
            return;
        }
        Ok(ts) => ts,
    };
    let modes = UserModes::parse(&msg.params[3]);
    let username = msg.params[4].clone();
    let host = msg.params[5].clone();
    let ip = msg.params[6].clone();
    let uid = match Uid::new(&msg.params[7]) {
        None => {
            d.drop_conn(cid, "Invalid UID introduced");
            return;
        }
        Some(uid) => uid,
    };
    let realname = msg.params[8].clone();

    if uid.sid_str() != owner.as_str() {
        d.drop_conn(cid, "UID does not match its server prefix");
        return;
    }
    if d.state.users.contains_key(&uid) {
        d.drop_conn(cid, "Duplicate UID introduced");
        return;
    }

    // Nick collision arbitration.
    if let Some(existing_uid) = d.state.nicks.get(&canonicalize(&nick)).cloned() {
        let (existing_ts, existing_userhost) = match d.state.users.get(&existing_uid) {
            None => (0, String::new()),
            Some(user) => (user.nick_ts, user.userhost()),
        };
        let same = existing_userhost == format!("{}@{}", username, host);
        let verdict = arbitrate(nick_ts, existing_ts, same);
        let my_sid = d.state.sid.to_string();
        let reason = format!("{} (Nick collision)", d.config.server_name);
        if !peer_bursting(d, cid) {
            d.oper_notice(&format!("Nick collision on {}", nick));
        }
        match verdict {
            Collision::KillExisting => {
                d.kill_user(&my_sid, &existing_uid, &reason, KillScope::AllPeers);
            }
            Collision::KillIncoming => {
                // The newcomer only exists on the announcing side.
                let kill = Msg::new(Some(my_sid), "KILL", vec![uid.to_string(), reason]);
                d.send_msg(cid, &kill);
                return;
            }
            Collision::KillBoth => {
                d.kill_user(&my_sid, &existing_uid, &reason, KillScope::AllPeers);
                let kill = Msg::new(Some(my_sid), "KILL", vec![uid.to_string(), reason]);
                d.send_msg(cid, &kill);
                return;
            }
        }
    }

    d.state.add_remote_user(User {
        uid,
        nick,
        username,
        host,
        ip,
        realname,
        modes,
        nick_ts,
        chans: HashSet::new(),
        away: None,
        conn_id: None,
        via: Some(cid),
    });
    d.propagate(Some(cid), msg);
}

fn s2s_nick(d: &mut Daemon, cid: ConnId, msg: &Msg) {
    let uid = match source_user(d, msg) {
        None => return,
        Some(uid) => uid,
    };
    let new_nick = match msg.params.first() {
        None => return,
        Some(nick) => nick.clone(),
    };
    let ts: u64 = msg
        .params
        .get(1)
        .and_then(|p| p.parse().ok())
        .unwrap_or_else(now_ts);

    if let Some(existing_uid) = d.state.nicks.get(&canonicalize(&new_nick)).cloned() {
        if existing_uid != uid {
            let (existing_ts, existing_userhost) = match d.state.users.get(&existing_uid) {
                None => (0, String::new()),
                Some(user) => (user.nick_ts, user.userhost()),
            };
            let same = d
                .state
                .users
                .get(&uid)
                .map(|u| u.userhost() == existing_userhost)
                .unwrap_or(false);
            let my_sid = d.state.sid.to_string();
            let reason = format!("{} (Nick collision)", d.config.server_name);
            if !peer_bursting(d, cid) {
                d.oper_notice(&format!("Nick collision on {}", new_nick));
            }
            match arbitrate(ts, existing_ts, same) {
                Collision::KillExisting => {
                    d.kill_user(&my_sid, &existing_uid, &reason, KillScope::AllPeers);
                }
                Collision::KillIncoming => {
                    // A rename collided; the renaming user is killed
                    // network-wide.
                    d.kill_user(&my_sid, &uid, &reason, KillScope::AllPeers);
                    return;
                }
                Collision::KillBoth => {
                    d.kill_user(&my_sid, &existing_uid, &reason, KillScope::AllPeers);
                    d.kill_user(&my_sid, &uid, &reason, KillScope::AllPeers);
                    return;
                }
            }
        }
    }

    let (old_prefix, chans) = match d.state.users.get(&uid) {
        None => return,
        Some(user) => (user.prefix(), user.chans.clone()),
    };
    let server_name = d.config.server_name.clone();
    d.state.rename_user(&uid, &new_nick, ts, &server_name);

    let mut seen: HashSet<ConnId> = HashSet::new();
    for canon in &chans {
        for (mcid, _) in d.local_members(canon) {
            seen.insert(mcid);
        }
    }
    let line = Msg::new(Some(old_prefix), "NICK", vec![new_nick]).to_line();
    for mcid in seen {
        d.send_line(mcid, line.clone());
    }

    d.propagate(Some(cid), msg);
}

/// Applies an incoming channel TS against ours. On a lower incoming TS our
/// modes and op grants are cleared, with MODE notifications to local
/// members; on a higher one the incoming modes and ops are discarded.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum TsMerge {
    IncomingWins,
    Equal,
    OursWins,
}

fn merge_channel_ts(d: &mut Daemon, canon: &str, incoming_ts: u64, incoming_modes: ChanModes) -> TsMerge {
    let (ours_ts, display) = match d.state.channels.get(canon) {
        None => return TsMerge::Equal,
        Some(chan) => (chan.ts, chan.name.clone()),
    };
    if incoming_ts > ours_ts {
        return TsMerge::OursWins;
    }
    if incoming_ts == ours_ts {
        // Merge both sides' modes.
        if let Some(chan) = d.state.channels.get_mut(canon) {
            chan.modes.no_external |= incoming_modes.no_external;
            chan.modes.secret |= incoming_modes.secret;
        }
        return TsMerge::Equal;
    }

    // Incoming wins: every local grant and mode goes away.
    let (deposed, old_modes) = match d.state.channels.get_mut(canon) {
        None => return TsMerge::Equal,
        Some(chan) => {
            let deposed: Vec<Uid> = chan.ops.drain().collect();
            let old_modes = chan.modes;
            chan.ts = incoming_ts;
            chan.modes = incoming_modes;
            (deposed, old_modes)
        }
    };

    let mut mode_diff = String::new();
    let mut removed = String::new();
    let mut added = String::new();
    if old_modes.no_external && !incoming_modes.no_external {
        removed.push('n');
    }
    if old_modes.secret && !incoming_modes.secret {
        removed.push('s');
    }
    if incoming_modes.no_external && !old_modes.no_external {
        added.push('n');
    }
    if incoming_modes.secret && !old_modes.secret {
        added.push('s');
    }
    if !removed.is_empty() {
        mode_diff.push('-');
        mode_diff.push_str(&removed);
    }
    if !added.is_empty() {
        mode_diff.push('+');
        mode_diff.push_str(&added);
    }

    let server_name = d.config.server_name.clone();
    let members = d.local_members(canon);
    if !mode_diff.is_empty() {
        let line = Msg::new(
            Some(server_name.clone()),
            "MODE",
            vec![display.clone(), mode_diff],
        )
        .to_line();
        for (mcid, _) in &members {
            d.send_line(*mcid, line.clone());
        }
    }
    for uid in deposed {
        let nick = match d.state.users.get(&uid) {
            None => continue,
            Some(user) => user.nick.clone(),
        };
        let line = Msg::new(
            Some(server_name.clone()),
            "MODE",
            vec![display.clone(), "-o".to_owned(), nick],
        )
        .to_line();
        for (mcid, _) in &members {
            d.send_line(*mcid, line.clone());
        }
    }
    TsMerge::IncomingWins
}

fn s2s_sjoin(d: &mut Daemon, cid: ConnId, msg: &Msg) {
    if msg.params.len() < 4 {
        d.drop_conn(cid, "SJOIN needs four parameters");
        return;
    }
    let incoming_ts: u64 = match msg.params[0].parse() {
        Err(_) => {
            d.drop_conn(cid, "Bad TS in SJOIN");
            return;
        }
        Ok(ts) => ts,
    };
    let display = msg.params[1].clone();
    let canon = canonicalize(&display);
    let incoming_modes = ChanModes::parse(&msg.params[2]);

    let mut arrivals: Vec<(Uid, bool)> = Vec::new();
    for tok in msg.params[3].split_whitespace() {
        let (op, uid_str) = match tok.strip_prefix('@') {
            Some(rest) => (true, rest),
            None => (false, tok),
        };
        if let Some(uid) = Uid::new(uid_str) {
            if d.state.users.contains_key(&uid) {
                arrivals.push((uid, op));
            }
        }
    }

    let merge = if d.state.channels.contains_key(&canon) {
        merge_channel_ts(d, &canon, incoming_ts, incoming_modes)
    } else {
        d.state.channels.insert(
            canon.clone(),
            Channel {
                name: display.clone(),
                ts: incoming_ts,
                modes: incoming_modes,
                topic: None,
                members: HashSet::new(),
                ops: HashSet::new(),
            },
        );
        TsMerge::Equal
    };
    let ops_count = match merge {
        // A losing side's op grants are discarded.
        TsMerge::OursWins => false,
        TsMerge::Equal | TsMerge::IncomingWins => true,
    };

    let mut joined: Vec<Uid> = Vec::new();
    for (uid, op) in arrivals {
        let newly = match d.state.channels.get_mut(&canon) {
            None => break,
            Some(chan) => {
                let newly = chan.members.insert(uid.clone());
                if ops_count && op {
                    chan.ops.insert(uid.clone());
                }
                newly
            }
        };
        if newly {
            if let Some(user) = d.state.users.get_mut(&uid) {
                user.chans.insert(canon.clone());
            }
            joined.push(uid);
        }
    }

    // Local members watch the arrivals come in.
    let members = d.local_members(&canon);
    for uid in joined {
        let prefix = match d.state.users.get(&uid) {
            None => continue,
            Some(user) => user.prefix(),
        };
        let line = Msg::new(Some(prefix), "JOIN", vec![display.clone()]).to_line();
        for (mcid, muid) in &members {
            if muid != &uid {
                d.send_line(*mcid, line.clone());
            }
        }
    }

    d.propagate(Some(cid), msg);
}

fn s2s_join(d: &mut Daemon, cid: ConnId, msg: &Msg) {
    let uid = match source_user(d, msg) {
        None => return,
        Some(uid) => uid,
    };
    // Either `JOIN <ts> <chan> +` or the bare `JOIN <chan>`.
    let (ts, display) = if msg.params.len() >= 2 {
        match msg.params[0].parse::<u64>() {
            Ok(ts) => (ts, msg.params[1].clone()),
            Err(_) => (now_ts(), msg.params[0].clone()),
        }
    } else {
        match msg.params.first() {
            None => return,
            Some(chan) => (now_ts(), chan.clone()),
        }
    };
    let canon = canonicalize(&display);

    if d.state.channels.contains_key(&canon) {
        merge_channel_ts(d, &canon, ts, ChanModes::none());
    } else {
        d.state.channels.insert(
            canon.clone(),
            Channel {
                name: display.clone(),
                ts,
                modes: ChanModes::defaults(),
                topic: None,
                members: HashSet::new(),
                ops: HashSet::new(),
            },
        );
    }

    let newly = match d.state.channels.get_mut(&canon) {
        None => return,
        Some(chan) => chan.members.insert(uid.clone()),
    };
    if !newly {
        return;
    }
    if let Some(user) = d.state.users.get_mut(&uid) {
        user.chans.insert(canon.clone());
    }

    let prefix = match d.state.users.get(&uid) {
        None => return,
        Some(user) => user.prefix(),
    };
    let line = Msg::new(Some(prefix), "JOIN", vec![display]).to_line();
    for (mcid, muid) in d.local_members(&canon) {
        if muid != uid {
            d.send_line(mcid, line.clone());
        }
    }

    d.propagate(Some(cid), msg);
}

fn s2s_part(d: &mut Daemon, cid: ConnId, msg: &Msg) {
    let uid = match source_user(d, msg) {
        None => return,
        Some(uid) => uid,
    };
    let display = match msg.params.first() {
        None => return,
        Some(chan) => chan.clone(),
    };
    let canon = canonicalize(&display);
    let reason = msg.params.get(1).cloned();

    let is_member = d
        .state
        .users
        .get(&uid)
        .map(|u| u.chans.contains(&canon))
        .unwrap_or(false);
    if !is_member {
        return;
    }

    let prefix = d.state.users[&uid].prefix();
    let mut params = vec![display];
    if let Some(reason) = reason {
        params.push(reason);
    }
    let line = Msg::new(Some(prefix), "PART", params).to_line();
    for (mcid, muid) in d.local_members(&canon) {
        if muid != uid {
            d.send_line(mcid, line.clone());
        }
    }

    d.state.part_channel(&uid, &canon);
    d.propagate(Some(cid), msg);
}

fn s2s_quit(d: &mut Daemon, cid: ConnId, msg: &Msg) {
    let uid = match source_user(d, msg) {
        None => return,
        Some(uid) => uid,
    };
    let reason = msg
        .params
        .first()
        .cloned()
        .unwrap_or_else(|| "Client quit".to_owned());
    d.remove_user_announce(&uid, &reason, true, Some(cid));
}

fn s2s_kill(d: &mut Daemon, cid: ConnId, msg: &Msg) {
    let actor = msg.pfx.clone().unwrap_or_else(|| d.state.sid.to_string());
    let target = match msg.params.first().and_then(|p| Uid::new(p)) {
        None => return,
        Some(uid) => uid,
    };
    let reason = msg
        .params
        .get(1)
        .cloned()
        .unwrap_or_else(|| "Killed".to_owned());
    if !d.state.users.contains_key(&target) {
        return;
    }
    if !peer_bursting(d, cid) {
        let nick = d.nick_of(&target);
        d.oper_notice(&format!("Received KILL for {}: {}", nick, reason));
    }
    d.kill_user(&actor, &target, &reason, KillScope::ExceptPeer(cid));
}

fn s2s_tmode(d: &mut Daemon, cid: ConnId, msg: &Msg) {
    if msg.params.len() < 3 {
        return;
    }
    let incoming_ts: u64 = match msg.params[0].parse() {
        Err(_) => return,
        Ok(ts) => ts,
    };
    let canon = canonicalize(&msg.params[1]);
    let (display, ours_ts) = match d.state.channels.get(&canon) {
        None => return,
        Some(chan) => (chan.name.clone(), chan.ts),
    };
    // Mode changes stamped newer than the channel lose.
    if incoming_ts > ours_ts {
        return;
    }

    let mut adding = true;
    let mut arg_idx = 3;
    let mut applied_modes = String::new();
    let mut applied_sign = ' ';
    let mut applied_nicks: Vec<String> = Vec::new();
    for c in msg.params[2].chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            'o' => {
                let arg = match msg.params.get(arg_idx) {
                    None => continue,
                    Some(arg) => arg.clone(),
                };
                arg_idx += 1;
                let target = match Uid::new(&arg) {
                    None => continue,
                    Some(uid) => uid,
                };
                let (changed, nick) = match d.state.channels.get_mut(&canon) {
                    None => return,
                    Some(chan) => {
                        if !chan.members.contains(&target) {
                            continue;
                        }
                        let changed = if adding {
                            chan.ops.insert(target.clone())
                        } else {
                            chan.ops.remove(&target)
                        };
                        (changed, d.state.users.get(&target).map(|u| u.nick.clone()))
                    }
                };
                if !changed {
                    continue;
                }
                let nick = match nick {
                    None => continue,
                    Some(nick) => nick,
                };
                let sign = if adding { '+' } else { '-' };
                if applied_sign != sign {
                    applied_modes.push(sign);
                    applied_sign = sign;
                }
                applied_modes.push('o');
                applied_nicks.push(nick);
            }
            'n' | 's' => {
                if let Some(chan) = d.state.channels.get_mut(&canon) {
                    let flag = match c {
                        'n' => &mut chan.modes.no_external,
                        _ => &mut chan.modes.secret,
                    };
                    if *flag != adding {
                        *flag = adding;
                        let sign = if adding { '+' } else { '-' };
                        if applied_sign != sign {
                            applied_modes.push(sign);
                            applied_sign = sign;
                        }
                        applied_modes.push(c);
                    }
                }
            }
            _ => {}
        }
    }

    if applied_modes.is_empty() {
        return;
    }

    let source = source_display(d, msg);
    let mut local_params = vec![display, applied_modes];
    local_params.extend(applied_nicks);
    let line = Msg::new(Some(source), "MODE", local_params).to_line();
    for (mcid, _) in d.local_members(&canon) {
        d.send_line(mcid, line.clone());
    }

    d.propagate(Some(cid), msg);
}

fn s2s_topic(d: &mut Daemon, cid: ConnId, msg: &Msg) {
    let uid = match source_user(d, msg) {
        None => return,
        Some(uid) => uid,
    };
    if msg.params.len() < 2 {
        return;
    }
    let canon = canonicalize(&msg.params[0]);
    let display = match d.state.channels.get(&canon) {
        None => return,
        Some(chan) => chan.name.clone(),
    };
    let text = sanitize_text(&msg.params[1], 300);
    let prefix = d.state.users[&uid].prefix();

    if let Some(chan) = d.state.channels.get_mut(&canon) {
        chan.topic = if text.is_empty() {
            None
        } else {
            Some(Topic {
                text: text.clone(),
                set_by: prefix.clone(),
                set_at: now_ts(),
            })
        };
    }

    let line = Msg::new(Some(prefix), "TOPIC", vec![display, text]).to_line();
    for (mcid, muid) in d.local_members(&canon) {
        if muid != uid {
            d.send_line(mcid, line.clone());
        }
    }
    d.propagate(Some(cid), msg);
}

fn s2s_mode(d: &mut Daemon, cid: ConnId, msg: &Msg) {
    let uid = match source_user(d, msg) {
        None => return,
        Some(uid) => uid,
    };
    let changes = match msg.params.get(1) {
        None => return,
        Some(changes) => changes.clone(),
    };
    let mut adding = true;
    for c in changes.chars() {
        match c {
            '+' => adding = true,
            '-' => adding = false,
            'o' => {
                if adding {
                    d.state.set_oper(&uid);
                } else {
                    d.state.clear_oper(&uid);
                }
            }
            'C' => {
                if let Some(user) = d.state.users.get_mut(&uid) {
                    user.modes.conn_notices = adding;
                }
            }
            _ => {}
        }
    }
    d.propagate(Some(cid), msg);
}

fn s2s_away(d: &mut Daemon, cid: ConnId, msg: &Msg) {
    let uid = match source_user(d, msg) {
        None => return,
        Some(uid) => uid,
    };
    let away = msg.params.first().cloned().filter(|r| !r.is_empty());
    if let Some(user) = d.state.users.get_mut(&uid) {
        user.away = away;
    }
    d.propagate(Some(cid), msg);
}

fn s2s_privmsg(d: &mut Daemon, cid: ConnId, msg: &Msg, cmd: &str) {
    let uid = match source_user(d, msg) {
        None => return,
        Some(uid) => uid,
    };
    let target = match msg.params.first() {
        None => return,
        Some(target) => target.clone(),
    };
    let text = match msg.params.get(1) {
        None => return,
        Some(text) => text.clone(),
    };

    if target.starts_with('#') {
        let canon = canonicalize(&target);
        let display = match d.state.channels.get(&canon) {
            None => return,
            Some(chan) => chan.name.clone(),
        };
        let prefix = d.state.users[&uid].prefix();
        let line = Msg::new(Some(prefix), cmd, vec![display, text]).to_line();
        for (mcid, muid) in d.local_members(&canon) {
            if muid != uid {
                d.send_line(mcid, line.clone());
            }
        }
        let peers = d.peers_for_channel(&canon, Some(cid));
        let wire_line = msg.to_line();
        for pcid in peers {
            d.send_line(pcid, wire_line.clone());
        }
        return;
    }

    let target_uid = match Uid::new(&target) {
        None => return,
        Some(uid) => uid,
    };
    let (t_nick, t_conn, t_via) = match d.state.users.get(&target_uid) {
        None => return,
        Some(user) => (user.nick.clone(), user.conn_id, user.via),
    };
    if let Some(tcid) = t_conn {
        let prefix = d.state.users[&uid].prefix();
        let line = Msg::new(Some(prefix), cmd, vec![t_nick, text]).to_line();
        d.send_line(tcid, line);
    } else if let Some(via) = t_via {
        if via != cid {
            d.send_msg(via, msg);
        }
    }
}

fn s2s_invite(d: &mut Daemon, cid: ConnId, msg: &Msg) {
    let uid = match source_user(d, msg) {
        None => return,
        Some(uid) => uid,
    };
    if msg.params.len() < 2 {
        return;
    }
    let target_uid = match Uid::new(&msg.params[0]) {
        None => return,
        Some(uid) => uid,
    };
    let chan = msg.params[1].clone();
    let (t_nick, t_conn, t_via) = match d.state.users.get(&target_uid) {
        None => return,
        Some(user) => (user.nick.clone(), user.conn_id, user.via),
    };
    if let Some(tcid) = t_conn {
        let prefix = d.state.users[&uid].prefix();
        let line = Msg::new(Some(prefix), "INVITE", vec![t_nick, chan]).to_line();
        d.send_line(tcid, line);
    } else if let Some(via) = t_via {
        if via != cid {
            d.send_msg(via, msg);
        }
    }
}

fn s2s_whois(d: &mut Daemon, cid: ConnId, msg: &Msg) {
    let requester = match msg.pfx.as_deref().and_then(Uid::new) {
        None => return,
        Some(uid) => uid,
    };
    let target = match msg.params.first().and_then(|p| Uid::new(p)) {
        None => return,
        Some(uid) => uid,
    };
    let (local, via) = match d.state.users.get(&target) {
        None => return,
        Some(user) => (user.is_local(), user.via),
    };
    if local {
        // Answer on behalf of this server; numerics route back by UID.
        let rows = whois_numerics(d, &requester, &target);
        let my_sid = d.state.sid.to_string();
        for (num, params) in rows {
            let mut ps = vec![requester.to_string()];
            ps.extend(params);
            let reply = Msg::new(Some(my_sid.clone()), num, ps);
            d.send_msg(cid, &reply);
        }
    } else if let Some(via) = via {
        if via != cid {
            d.send_msg(via, msg);
        }
    }
}

/// The WHOIS reply rows for a target, minus the leading recipient
/// parameter. Shared by the local and the routed reply paths.
pub(crate) fn whois_numerics(
    d: &Daemon,
    requester: &Uid,
    target: &Uid,
) -> Vec<(&'static str, Vec<String>)> {
    let user = match d.state.users.get(target) {
        None => return Vec::new(),
        Some(user) => user,
    };
    let mut rows: Vec<(&'static str, Vec<String>)> = Vec::new();
    rows.push((
        RPL_WHOISUSER,
        vec![
            user.nick.clone(),
            user.username.clone(),
            user.host.clone(),
            "*".to_owned(),
            user.realname.clone(),
        ],
    ));

    let (requester_chans, requester_oper) = match d.state.users.get(requester) {
        None => (HashSet::new(), false),
        Some(r) => (r.chans.clone(), d.state.opers.contains(requester)),
    };
    let mut shown: Vec<String> = user
        .chans
        .iter()
        .filter(|canon| requester_oper || requester_chans.contains(*canon))
        .filter_map(|canon| {
            let chan = d.state.channels.get(canon)?;
            if chan.ops.contains(target) {
                Some(format!("@{}", chan.name))
            } else {
                Some(chan.name.clone())
            }
        })
        .collect();
    shown.sort();
    if !shown.is_empty() {
        rows.push((RPL_WHOISCHANNELS, vec![user.nick.clone(), shown.join(" ")]));
    }

    let server_name = d.state.server_name_of(user, &d.config.server_name);
    let server_info = if user.is_local() {
        d.config.server_info.clone()
    } else {
        Sid::new(user.uid.sid_str())
            .and_then(|sid| d.state.servers.get(&sid))
            .map(|s| s.description.clone())
            .unwrap_or_default()
    };
    rows.push((
        RPL_WHOISSERVER,
        vec![user.nick.clone(), server_name, server_info],
    ));

    if user.modes.oper {
        rows.push((
            RPL_WHOISOPERATOR,
            vec![user.nick.clone(), "is an IRC operator".to_owned()],
        ));
    }
    if let Some(away) = &user.away {
        rows.push((RPL_AWAY, vec![user.nick.clone(), away.clone()]));
    }
    if let Some(tcid) = user.conn_id {
        if let Some(lu) = d.state.local_users.get(&tcid) {
            rows.push((
                RPL_WHOISIDLE,
                vec![
                    user.nick.clone(),
                    lu.last_message.elapsed().as_secs().to_string(),
                    lu.registered_at.to_string(),
                    "seconds idle, signon time".to_owned(),
                ],
            ));
        }
    }
    rows.push((
        RPL_ENDOFWHOIS,
        vec![user.nick.clone(), "End of /WHOIS list".to_owned()],
    ));
    rows
}

fn s2s_wallops(d: &mut Daemon, cid: ConnId, msg: &Msg) {
    let text = match msg.params.first() {
        None => return,
        Some(text) => text.clone(),
    };
    let prefix = source_display(d, msg);
    d.deliver_wallops(&prefix, &text);
    d.propagate(Some(cid), msg);
}

fn s2s_encap(d: &mut Daemon, cid: ConnId, msg: &Msg) {
    if msg.params.len() < 2 {
        return;
    }
    let subcmd = msg.params[1].to_ascii_uppercase();
    let by = source_display(d, msg);
    match subcmd.as_str() {
        "KLINE" => {
            // `ENCAP * KLINE <duration> <user> <host> :<reason>`, with the
            // duration optional.
            let has_duration = msg
                .params
                .get(2)
                .map(|p| p.chars().all(|c| c.is_ascii_digit()))
                .unwrap_or(false);
            let base = if has_duration { 3 } else { 2 };
            if msg.params.len() < base + 2 {
                return;
            }
            let user_mask = msg.params[base].clone();
            let host_mask = msg.params[base + 1].clone();
            let reason = msg
                .params
                .get(base + 2)
                .cloned()
                .unwrap_or_else(|| "K-lined".to_owned());
            d.apply_kline(&user_mask, &host_mask, &reason, &by);
            d.propagate(Some(cid), msg);
        }
        "UNKLINE" => {
            if msg.params.len() < 4 {
                return;
            }
            let user_mask = msg.params[2].clone();
            let host_mask = msg.params[3].clone();
            if d.state.remove_kline(&user_mask, &host_mask) {
                d.oper_notice(&format!(
                    "{} removed K-Line for [{}@{}]",
                    by, user_mask, host_mask
                ));
            }
            d.propagate(Some(cid), msg);
        }
        _ => {
            // Unknown encapsulated commands still flow through the network.
            d.propagate(Some(cid), msg);
        }
    }
}

fn s2s_squit(d: &mut Daemon, cid: ConnId, msg: &Msg) {
    let target = match msg.params.first() {
        None => return,
        Some(target) => target.clone(),
    };
    let reason = msg
        .params
        .get(1)
        .cloned()
        .unwrap_or_else(|| "SQUIT".to_owned());

    // Resolve by SID first, then by name.
    let server = match Sid::new(&target) {
        Some(sid) => {
            if sid == d.state.sid {
                // Us: the peer is closing its side of this link.
                d.drop_conn(cid, &reason);
                return;
            }
            d.state.servers.get(&sid).map(|s| (s.sid.clone(), s.conn_id, s.via))
        }
        None => {
            if target == d.config.server_name {
                d.drop_conn(cid, &reason);
                return;
            }
            d.state
                .server_by_name(&target)
                .map(|s| (s.sid.clone(), s.conn_id, s.via))
        }
    };
    let (sid, conn_id, via) = match server {
        None => return,
        Some(server) => server,
    };

    match conn_id {
        Some(link_cid) => {
            // One of our own links; tear it down.
            d.drop_conn(link_cid, &reason);
        }
        None if via == cid => {
            // The side the server sits on is dropping it.
            remove_server_subtree(d, &sid);
            let forward = Msg::new(
                Some(d.state.sid.to_string()),
                "SQUIT",
                vec![sid.to_string(), reason],
            );
            d.propagate(Some(cid), &forward);
        }
        None => {
            // Route the request toward the server's side.
            if via != cid {
                d.send_msg(via, msg);
            }
        }
    }
}

/// A directly linked peer is gone: remove every server and user behind it,
/// with netsplit QUITs to local members, and tell the rest of the network.
pub(crate) fn link_lost(d: &mut Daemon, cid: ConnId, sid: Sid, reason: &str) {
    let name = peer_name(d, cid);
    warn!("conn {}: link to {} lost: {}", cid, name, reason);
    d.oper_notice(&format!("Link to {} lost: {}", name, reason));

    remove_server_subtree(d, &sid);
    d.state.local_servers.remove(&cid);

    let squit = Msg::new(
        Some(d.state.sid.to_string()),
        "SQUIT",
        vec![sid.to_string(), reason.to_owned()],
    );
    d.propagate(Some(cid), &squit);

    d.remove_handle(cid, reason);
}

/// Removes a server and everything behind it. Local users sharing channels
/// with the departed see netsplit QUITs; peers learn from the SQUIT the
/// caller sends, so the QUITs are not propagated.
fn remove_server_subtree(d: &mut Daemon, root: &Sid) {
    let snapshot: Vec<(Sid, Option<Sid>)> = d
        .state
        .servers
        .values()
        .map(|s| (s.sid.clone(), s.upstream.clone()))
        .collect();
    let lost = collect_subtree(&snapshot, root);

    let near = d
        .state
        .servers
        .get(root)
        .and_then(|s| s.upstream.as_ref())
        .and_then(|up| d.state.servers.get(up))
        .map(|s| s.name.clone())
        .unwrap_or_else(|| d.config.server_name.clone());
    let far = d
        .state
        .servers
        .get(root)
        .map(|s| s.name.clone())
        .unwrap_or_else(|| root.to_string());
    let split_reason = format!("{} {}", near, far);

    let lost_sids: HashSet<&str> = lost.iter().map(|s| s.as_str()).collect();
    let lost_users: Vec<Uid> = d
        .state
        .users
        .values()
        .filter(|u| lost_sids.contains(u.uid.sid_str()))
        .map(|u| u.uid.clone())
        .collect();
    for uid in lost_users {
        d.remove_user_announce(&uid, &split_reason, false, None);
    }
    for sid in lost {
        if let Some(server) = d.state.servers.remove(&sid) {
            if let Some(link_cid) = server.conn_id {
                d.state.local_servers.remove(&link_cid);
            }
        }
    }
}

/// The SIDs of `root` and every server introduced beneath it.
fn collect_subtree(servers: &[(Sid, Option<Sid>)], root: &Sid) -> Vec<Sid> {
    let mut out = vec![root.clone()];
    let mut idx = 0;
    while idx < out.len() {
        let parent = out[idx].clone();
        for (sid, upstream) in servers {
            if upstream.as_ref() == Some(&parent) && !out.contains(sid) {
                out.push(sid.clone());
            }
        }
        idx += 1;
    }
    out
}

/// Numerics travelling between servers address their recipient by UID in
/// the first parameter; the final hop rewrites them for the client.
fn route_numeric(d: &mut Daemon, cid: ConnId, num: &str, msg: &Msg) {
    let target = match msg.params.first().and_then(|p| Uid::new(p)) {
        None => return,
        Some(uid) => uid,
    };
    let (nick, conn, via) = match d.state.users.get(&target) {
        None => return,
        Some(user) => (user.nick.clone(), user.conn_id, user.via),
    };
    if let Some(tcid) = conn {
        let origin = msg
            .pfx
            .as_deref()
            .and_then(Sid::new)
            .and_then(|sid| d.state.servers.get(&sid))
            .map(|s| s.name.clone())
            .unwrap_or_else(|| d.config.server_name.clone());
        let mut params = vec![nick];
        params.extend(msg.params.iter().skip(1).cloned());
        let rewritten = Msg::new(Some(origin), num, params);
        d.send_line(tcid, rewritten.to_line());
    } else if let Some(via) = via {
        if via != cid {
            d.send_msg(via, msg);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arbitration_matrix() {
        // Lower incoming TS, different user@host: the incumbent dies.
        assert_eq!(arbitrate(900, 1000, false), Collision::KillExisting);
        // Lower incoming TS, same user@host: the newcomer dies.
        assert_eq!(arbitrate(900, 1000, true), Collision::KillIncoming);
        // Equal TS: both die.
        assert_eq!(arbitrate(1000, 1000, true), Collision::KillBoth);
        assert_eq!(arbitrate(1000, 1000, false), Collision::KillBoth);
        // Higher incoming TS, same user@host: the incumbent dies.
        assert_eq!(arbitrate(1100, 1000, true), Collision::KillExisting);
        // Higher incoming TS, different user@host: the newcomer dies.
        assert_eq!(arbitrate(1100, 1000, false), Collision::KillIncoming);
    }

    #[test]
    fn test_collect_subtree() {
        let a = Sid::new("1AA").unwrap();
        let b = Sid::new("2BB").unwrap();
        let c = Sid::new("3CC").unwrap();
        let o = Sid::new("4DD").unwrap();
        let servers = vec![
            (a.clone(), None),
            (b.clone(), Some(a.clone())),
            (c.clone(), Some(b.clone())),
            (o.clone(), None),
        ];
        let lost = collect_subtree(&servers, &a);
        assert_eq!(lost, vec![a.clone(), b.clone(), c]);
        let lost = collect_subtree(&servers, &b);
        assert_eq!(lost.len(), 2);
        let lost = collect_subtree(&servers, &o);
        assert_eq!(lost, vec![o]);
    }

    #[test]
    fn test_as_numeric() {
        assert_eq!(as_numeric("311"), Some("311"));
        assert_eq!(as_numeric("001"), Some("001"));
        assert_eq!(as_numeric("NICK"), None);
        assert_eq!(as_numeric("31"), None);
        assert_eq!(as_numeric("31A"), None);
    }
}
