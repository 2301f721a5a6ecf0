//! The client protocol: registration gating and the end-user command
//! surface. Server-link handshake commands arriving on unregistered
//! connections are handed to the s2s module.

use crate::daemon::{Daemon, ExitAction, KillScope, SERVER_VERSION};
use crate::kline::Kline;
use crate::numeric::*;
use crate::s2s;
use crate::state::{ConnId, JoinOutcome, Topic};
use crate::utils::{format_ts, now_ts, sanitize_text};

use libshrike_common::{canonicalize, valid_channel, valid_nick, Uid};
use libshrike_wire::Msg;

use std::collections::HashSet;
use std::time::Instant;

/// Channel membership (+o/-o) changes applied per MODE command.
const MAX_CHANOP_CHANGES: usize = 4;

/// Usernames are capped at this many bytes.
const MAX_USERNAME_LEN: usize = 10;

/// Topic length cap, in bytes.
const MAX_TOPIC_LEN: usize = 300;

/// Most WHOWAS entries shown for one nick.
const MAX_WHOWAS_REPLIES: usize = 8;

pub(crate) fn handle_prereg_message(d: &mut Daemon, cid: ConnId, msg: Msg) {
    if msg.pfx.is_some() {
        d.drop_conn(cid, "Prefix on a client command");
        return;
    }
    let cmd = msg.cmd.to_ascii_uppercase();
    match cmd.as_str() {
        "NICK" => d.prereg_nick(cid, &msg.params),
        "USER" => d.prereg_user(cid, &msg.params),
        "CAP" => {} // capability negotiation is not offered
        "QUIT" => d.drop_conn(cid, "Client quit"),
        "PASS" => s2s::prereg_pass(d, cid, &msg.params),
        "CAPAB" => s2s::prereg_capab(d, cid, &msg.params),
        "SERVER" => s2s::prereg_server(d, cid, &msg.params),
        "SVINFO" => s2s::prereg_svinfo(d, cid, &msg.params),
        "ERROR" => d.drop_conn(cid, "Peer reported an error"),
        _ => d.numeric(cid, "*", ERR_NOTREGISTERED, &["You have not registered"]),
    }
}

pub(crate) fn handle_message(d: &mut Daemon, cid: ConnId, uid: Uid, msg: Msg) {
    if msg.pfx.is_some() {
        d.drop_conn(cid, "Prefix on a client command");
        return;
    }
    if !d.state.users.contains_key(&uid) {
        return;
    }
    let cmd = msg.cmd.to_ascii_uppercase();
    let params = msg.params;
    match cmd.as_str() {
        "PING" => d.cmd_ping(cid, &params),
        "PONG" => {} // activity bookkeeping already happened
        "NICK" => d.cmd_nick(cid, &uid, &params),
        "USER" => {
            let nick = d.nick_of(&uid);
            d.numeric(cid, &nick, ERR_ALREADYREGISTRED, &["You may not reregister"]);
        }
        "QUIT" => {
            let reason = params.first().cloned().unwrap_or_else(|| "Client quit".to_owned());
            d.drop_conn(cid, &sanitize_text(&reason, MAX_TOPIC_LEN));
        }
        "JOIN" => d.cmd_join(cid, &uid, &params),
        "PART" => d.cmd_part(cid, &uid, &params),
        "PRIVMSG" => d.cmd_privmsg(cid, &uid, &params, false),
        "NOTICE" => d.cmd_privmsg(cid, &uid, &params, true),
        "TOPIC" => d.cmd_topic(cid, &uid, &params),
        "MODE" => d.cmd_mode(cid, &uid, &params),
        "NAMES" => d.cmd_names(cid, &uid, &params),
        "WHOIS" => d.cmd_whois(cid, &uid, &params),
        "WHO" => d.cmd_who(cid, &uid, &params),
        "OPER" => d.cmd_oper(cid, &uid, &params),
        "KILL" => d.cmd_kill(cid, &uid, &params),
        "KLINE" => d.cmd_kline(cid, &uid, &params),
        "UNKLINE" => d.cmd_unkline(cid, &uid, &params),
        "CONNECT" => d.cmd_connect(cid, &uid, &params),
        "SQUIT" => d.cmd_squit(cid, &uid, &params),
        "LUSERS" => {
            let nick = d.nick_of(&uid);
            d.lusers_reply(cid, &nick);
        }
        "MOTD" => {
            let nick = d.nick_of(&uid);
            d.motd_reply(cid, &nick);
        }
        "LINKS" => d.cmd_links(cid, &uid),
        "MAP" => d.cmd_map(cid, &uid),
        "VERSION" => d.cmd_version(cid, &uid),
        "TIME" => d.cmd_time(cid, &uid),
        "ADMIN" => d.cmd_admin(cid, &uid),
        "STATS" => d.cmd_stats(cid, &uid, &params),
        "WHOWAS" => d.cmd_whowas(cid, &uid, &params),
        "AWAY" => d.cmd_away(cid, &uid, &params),
        "INVITE" => d.cmd_invite(cid, &uid, &params),
        "OPME" => d.cmd_opme(cid, &uid, &params),
        "WALLOPS" => d.cmd_wallops(cid, &uid, &params),
        "REHASH" => d.cmd_rehash(cid, &uid),
        "DIE" => d.cmd_die(cid, &uid),
        "RESTART" => d.cmd_restart(cid, &uid),
        "CAP" => {}
        _ => {
            let nick = d.nick_of(&uid);
            d.numeric(cid, &nick, ERR_UNKNOWNCOMMAND, &[&cmd, "Unknown command"]);
        }
    }
}

impl Daemon {
    pub(crate) fn nick_of(&self, uid: &Uid) -> String {
        match self.state.users.get(uid) {
            Some(user) => user.nick.clone(),
            None => "*".to_owned(),
        }
    }

    fn is_oper(&self, uid: &Uid) -> bool {
        self.state.opers.contains(uid)
    }

    //
    // Registration
    //

    fn prereg_nick(&mut self, cid: ConnId, params: &[String]) {
        let nick = match params.first() {
            None => {
                self.numeric(cid, "*", ERR_NONICKNAMEGIVEN, &["No nickname given"]);
                return;
            }
            Some(nick) => nick.clone(),
        };
        if !valid_nick(&nick, self.config.max_nick_length) {
            self.numeric(cid, "*", ERR_ERRONEUSNICKNAME, &[&nick, "Erroneous nickname"]);
            return;
        }
        if self.state.nicks.contains_key(&canonicalize(&nick)) {
            self.numeric(
                cid,
                "*",
                ERR_NICKNAMEINUSE,
                &[&nick, "Nickname is already in use"],
            );
            return;
        }
        if let Some(pre) = self.state.pre.get_mut(&cid) {
            pre.nick = Some(nick);
        }
        self.try_register_user(cid);
    }

    fn prereg_user(&mut self, cid: ConnId, params: &[String]) {
        if params.len() < 4 {
            self.numeric(cid, "*", ERR_NEEDMOREPARAMS, &["USER", "Not enough parameters"]);
            return;
        }
        let mut username: String = params[0]
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-' || *c == '.')
            .collect();
        username.truncate(MAX_USERNAME_LEN);
        if username.is_empty() {
            self.numeric(cid, "*", ERR_NEEDMOREPARAMS, &["USER", "Not enough parameters"]);
            return;
        }
        let realname = sanitize_text(&params[3], 50);
        if let Some(pre) = self.state.pre.get_mut(&cid) {
            pre.user = Some((username, realname));
        }
        self.try_register_user(cid);
    }

    fn try_register_user(&mut self, cid: ConnId) {
        let (nick, username, realname) = match self.state.pre.get(&cid) {
            Some(pre) => match (&pre.nick, &pre.user) {
                (Some(nick), Some((username, realname))) => {
                    (nick.clone(), username.clone(), realname.clone())
                }
                _ => return,
            },
            None => return,
        };

        let (ip, tls) = match self.conns.get(&cid) {
            None => return,
            Some(handle) => (handle.addr.ip().to_string(), handle.tls),
        };

        // The visible hostname is the IP unless a user override spoofs it;
        // the override also decides flood exemption.
        let (host, flood_exempt) = match self.tables.override_for(&username, &ip) {
            Some(user_override) => (
                user_override.spoof.clone().unwrap_or_else(|| ip.clone()),
                user_override.flood_exempt,
            ),
            None => (ip.clone(), false),
        };

        if let Some(reason) = self
            .state
            .klines
            .iter()
            .find(|k| k.matches(&username, &host))
            .map(|k| k.reason.clone())
        {
            self.numeric(
                cid,
                "*",
                ERR_YOUREBANNEDCREEP,
                &[&format!("You are banned from this server: {}", reason)],
            );
            self.drop_conn(cid, &format!("Connection closed: {}", reason));
            return;
        }

        let uid = match self
            .state
            .promote_user(cid, &nick, &username, &realname, &host, &ip, flood_exempt)
        {
            Some(uid) => uid,
            None => {
                // The UID space is spent; nothing sane left to do.
                error!("UID space exhausted");
                self.begin_shutdown(ExitAction::Fatal);
                return;
            }
        };

        info!("conn {}: registered {} ({})", cid, nick, uid);

        let network_prefix = format!("{}!{}@{}", nick, username, host);
        self.numeric(
            cid,
            &nick,
            RPL_WELCOME,
            &[&format!(
                "Welcome to the Internet Relay Chat Network {}",
                network_prefix
            )],
        );
        let host_line = format!(
            "Your host is {}, running version {}",
            self.config.server_name, SERVER_VERSION
        );
        self.numeric(cid, &nick, RPL_YOURHOST, &[&host_line]);
        let created = format!("This server was created {}", format_ts(self.boot_ts));
        self.numeric(cid, &nick, RPL_CREATED, &[&created]);
        let server_name = self.config.server_name.clone();
        self.numeric(
            cid,
            &nick,
            RPL_MYINFO,
            &[&server_name, SERVER_VERSION, "ioC", "ns"],
        );
        self.lusers_reply(cid, &nick);
        self.motd_reply(cid, &nick);

        // +i is set at registration and never toggled afterwards.
        let mode_line = Msg::new(
            Some(network_prefix),
            "MODE",
            vec![nick.clone(), "+i".to_owned()],
        )
        .to_line();
        self.send_line(cid, mode_line);

        // Introduce the new user to every peer.
        let intro = self.uid_intro_msg(&uid);
        if let Some(intro) = intro {
            self.propagate(None, &intro);
        }

        let secure = if tls { " (TLS)" } else { "" };
        self.conn_notice(&format!(
            "Client connecting: {} ({}@{}) [{}]{}",
            nick, username, host, ip, secure
        ));
    }

    /// The `UID` introduction for one user, as sent to peers.
    pub(crate) fn uid_intro_msg(&self, uid: &Uid) -> Option<Msg> {
        let user = self.state.users.get(uid)?;
        let hops = match user.via {
            None => 1,
            Some(_) => {
                let sid = libshrike_common::Sid::new(user.uid.sid_str())?;
                self.state.servers.get(&sid).map(|s| s.hopcount + 1).unwrap_or(2)
            }
        };
        Some(Msg::new(
            Some(user.uid.sid_str().to_owned()),
            "UID",
            vec![
                user.nick.clone(),
                hops.to_string(),
                user.nick_ts.to_string(),
                user.modes.to_string(),
                user.username.clone(),
                user.host.clone(),
                user.ip.clone(),
                user.uid.to_string(),
                user.realname.clone(),
            ],
        ))
    }

    pub(crate) fn lusers_reply(&mut self, cid: ConnId, nick: &str) {
        let users = self.state.users.len();
        let invisible = self
            .state
            .users
            .values()
            .filter(|u| u.modes.invisible)
            .count();
        let servers = self.state.servers.len() + 1;
        let opers = self.state.opers.len();
        let channels = self.state.channels.len();
        let local_users = self.state.local_users.len();
        let local_servers = self.state.local_servers.len();

        let line = format!(
            "There are {} users and {} invisible on {} servers",
            users - invisible,
            invisible,
            servers
        );
        self.numeric(cid, nick, RPL_LUSERCLIENT, &[&line]);
        self.numeric(
            cid,
            nick,
            RPL_LUSEROP,
            &[&opers.to_string(), "operator(s) online"],
        );
        self.numeric(
            cid,
            nick,
            RPL_LUSERCHANNELS,
            &[&channels.to_string(), "channels formed"],
        );
        let line = format!("I have {} clients and {} servers", local_users, local_servers);
        self.numeric(cid, nick, RPL_LUSERME, &[&line]);
        let line = format!("Current local users: {}", local_users);
        self.numeric(cid, nick, RPL_LOCALUSERS, &[&line]);
        let line = format!("Current global users: {}", users);
        self.numeric(cid, nick, RPL_GLOBALUSERS, &[&line]);
    }

    pub(crate) fn motd_reply(&mut self, cid: ConnId, nick: &str) {
        match self.tables.motd.clone() {
            None => {
                self.numeric(cid, nick, ERR_NOMOTD, &["MOTD File is missing"]);
            }
            Some(lines) => {
                let start = format!("- {} Message of the day - ", self.config.server_name);
                self.numeric(cid, nick, RPL_MOTDSTART, &[&start]);
                for line in &lines {
                    self.numeric(cid, nick, RPL_MOTD, &[&format!("- {}", line)]);
                }
                self.numeric(cid, nick, RPL_ENDOFMOTD, &["End of /MOTD command"]);
            }
        }
    }

    //
    // Registered commands
    //

    fn cmd_ping(&mut self, cid: ConnId, params: &[String]) {
        let server_name = self.config.server_name.clone();
        let mut reply_params = vec![server_name.clone()];
        if let Some(param) = params.first() {
            reply_params.push(param.clone());
        }
        let msg = Msg::new(Some(server_name), "PONG", reply_params);
        self.send_line(cid, msg.to_line());
    }

    fn cmd_nick(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        let nick = self.nick_of(uid);
        let new_nick = match params.first() {
            None => {
                self.numeric(cid, &nick, ERR_NONICKNAMEGIVEN, &["No nickname given"]);
                return;
            }
            Some(new_nick) => new_nick.clone(),
        };
        if !valid_nick(&new_nick, self.config.max_nick_length) {
            self.numeric(
                cid,
                &nick,
                ERR_ERRONEUSNICKNAME,
                &[&new_nick, "Erroneous nickname"],
            );
            return;
        }
        if let Some(owner) = self.state.nicks.get(&canonicalize(&new_nick)) {
            if owner != uid {
                self.numeric(
                    cid,
                    &nick,
                    ERR_NICKNAMEINUSE,
                    &[&new_nick, "Nickname is already in use"],
                );
                return;
            }
            if self.state.users[uid].nick == new_nick {
                // Changing to the current nick changes nothing.
                return;
            }
        }

        let (old_prefix, chans) = match self.state.users.get(uid) {
            None => return,
            Some(user) => (user.prefix(), user.chans.clone()),
        };
        let ts = now_ts();
        let server_name = self.config.server_name.clone();
        self.state.rename_user(uid, &new_nick, ts, &server_name);

        // Everyone sharing a channel hears about it once, under the old
        // prefix; so does the user.
        let mut seen: HashSet<ConnId> = HashSet::new();
        seen.insert(cid);
        for canon in &chans {
            for (mcid, _) in self.local_members(canon) {
                seen.insert(mcid);
            }
        }
        let line = Msg::new(Some(old_prefix), "NICK", vec![new_nick.clone()]).to_line();
        for mcid in seen {
            self.send_line(mcid, line.clone());
        }

        let msg = Msg::new(
            Some(uid.to_string()),
            "NICK",
            vec![new_nick, ts.to_string()],
        );
        self.propagate(None, &msg);
    }

    fn cmd_join(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        let nick = self.nick_of(uid);
        let targets = match params.first() {
            None => {
                self.numeric(cid, &nick, ERR_NEEDMOREPARAMS, &["JOIN", "Not enough parameters"]);
                return;
            }
            Some(targets) => targets.clone(),
        };

        if targets == "0" {
            let chans: Vec<String> = match self.state.users.get(uid) {
                None => return,
                Some(user) => user.chans.iter().cloned().collect(),
            };
            for canon in chans {
                self.do_part(cid, uid, &canon, None);
            }
            return;
        }

        for name in targets.split(',') {
            if !valid_channel(name) {
                self.numeric(cid, &nick, ERR_NOSUCHCHANNEL, &[name, "No such channel"]);
                continue;
            }
            self.do_join(cid, uid, name);
        }
    }

    fn do_join(&mut self, cid: ConnId, uid: &Uid, name: &str) {
        let canon = canonicalize(name);
        let prefix = match self.state.users.get(uid) {
            None => return,
            Some(user) => user.prefix(),
        };
        let nick = self.nick_of(uid);
        let ts = now_ts();

        match self.state.join_channel(uid, name, ts) {
            JoinOutcome::AlreadyIn => {}
            JoinOutcome::Created(ts) => {
                let display = self.state.channels[&canon].name.clone();
                let join_line = Msg::new(Some(prefix), "JOIN", vec![display.clone()]).to_line();
                self.send_line(cid, join_line);
                let mode_line = Msg::new(
                    Some(self.config.server_name.clone()),
                    "MODE",
                    vec![display.clone(), "+ns".to_owned()],
                )
                .to_line();
                self.send_line(cid, mode_line);
                self.names_reply(cid, &nick, &canon);

                let msg = Msg::new(
                    Some(self.state.sid.to_string()),
                    "SJOIN",
                    vec![
                        ts.to_string(),
                        display,
                        "+ns".to_owned(),
                        format!("@{}", uid),
                    ],
                );
                self.propagate(None, &msg);
            }
            JoinOutcome::Joined => {
                let (display, chan_ts, topic) = {
                    let chan = &self.state.channels[&canon];
                    (chan.name.clone(), chan.ts, chan.topic.clone())
                };
                let join_line = Msg::new(Some(prefix), "JOIN", vec![display.clone()]).to_line();
                for (mcid, _) in self.local_members(&canon) {
                    self.send_line(mcid, join_line.clone());
                }
                if let Some(topic) = topic {
                    self.numeric(cid, &nick, RPL_TOPIC, &[&display, &topic.text]);
                    self.numeric(
                        cid,
                        &nick,
                        RPL_TOPICWHOTIME,
                        &[&display, &topic.set_by, &topic.set_at.to_string()],
                    );
                }
                self.names_reply(cid, &nick, &canon);

                let msg = Msg::new(
                    Some(uid.to_string()),
                    "JOIN",
                    vec![chan_ts.to_string(), display, "+".to_owned()],
                );
                self.propagate(None, &msg);
            }
        }
    }

    /// The 353/366 pair for one channel.
    pub(crate) fn names_reply(&mut self, cid: ConnId, nick: &str, canon: &str) {
        let (display, secret, names) = match self.state.channels.get(canon) {
            None => return,
            Some(chan) => {
                let mut names: Vec<String> = chan
                    .members
                    .iter()
                    .filter_map(|m| {
                        let user = self.state.users.get(m)?;
                        if chan.ops.contains(m) {
                            Some(format!("@{}", user.nick))
                        } else {
                            Some(user.nick.clone())
                        }
                    })
                    .collect();
                names.sort();
                (chan.name.clone(), chan.modes.secret, names)
            }
        };
        let symbol = if secret { "@" } else { "=" };

        // Long member lists are split across several 353s.
        let mut chunk = String::new();
        for name in names {
            if !chunk.is_empty() && chunk.len() + name.len() > 400 {
                self.numeric(cid, nick, RPL_NAMREPLY, &[symbol, &display, &chunk]);
                chunk.clear();
            }
            if !chunk.is_empty() {
                chunk.push(' ');
            }
            chunk.push_str(&name);
        }
        if !chunk.is_empty() {
            self.numeric(cid, nick, RPL_NAMREPLY, &[symbol, &display, &chunk]);
        }
        self.numeric(cid, nick, RPL_ENDOFNAMES, &[&display, "End of /NAMES list"]);
    }

    fn cmd_part(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        let nick = self.nick_of(uid);
        let targets = match params.first() {
            None => {
                self.numeric(cid, &nick, ERR_NEEDMOREPARAMS, &["PART", "Not enough parameters"]);
                return;
            }
            Some(targets) => targets.clone(),
        };
        let reason = params.get(1).map(|r| sanitize_text(r, MAX_TOPIC_LEN));

        for name in targets.split(',') {
            let canon = canonicalize(name);
            if !self.state.channels.contains_key(&canon) {
                self.numeric(cid, &nick, ERR_NOSUCHCHANNEL, &[name, "No such channel"]);
                continue;
            }
            if !self.state.users.get(uid).map(|u| u.chans.contains(&canon)).unwrap_or(false) {
                self.numeric(cid, &nick, ERR_NOTONCHANNEL, &[name, "You're not on that channel"]);
                continue;
            }
            self.do_part(cid, uid, &canon, reason.as_deref());
        }
    }

    fn do_part(&mut self, _cid: ConnId, uid: &Uid, canon: &str, reason: Option<&str>) {
        let prefix = match self.state.users.get(uid) {
            None => return,
            Some(user) => user.prefix(),
        };
        let display = match self.state.channels.get(canon) {
            None => return,
            Some(chan) => chan.name.clone(),
        };

        let mut params = vec![display.clone()];
        if let Some(reason) = reason {
            params.push(reason.to_owned());
        }
        let line = Msg::new(Some(prefix), "PART", params.clone()).to_line();
        for (mcid, _) in self.local_members(canon) {
            self.send_line(mcid, line.clone());
        }

        self.state.part_channel(uid, canon);

        let msg = Msg::new(Some(uid.to_string()), "PART", params);
        self.propagate(None, &msg);
    }

    fn cmd_privmsg(&mut self, cid: ConnId, uid: &Uid, params: &[String], notice: bool) {
        let nick = self.nick_of(uid);
        let cmd = if notice { "NOTICE" } else { "PRIVMSG" };
        let target = match params.first() {
            None => {
                self.numeric(cid, &nick, ERR_NORECIPIENT, &[&format!("No recipient given ({})", cmd)]);
                return;
            }
            Some(target) => target.clone(),
        };
        let text = match params.get(1) {
            None => {
                self.numeric(cid, &nick, ERR_NOTEXTTOSEND, &["No text to send"]);
                return;
            }
            Some(text) => text.clone(),
        };

        if let Some(lu) = self.state.local_users.get_mut(&cid) {
            lu.last_message = Instant::now();
        }

        if target.starts_with('#') {
            self.channel_message(cid, uid, &target, &text, cmd);
        } else {
            self.user_message(cid, uid, &target, &text, cmd, notice);
        }
    }

    fn channel_message(&mut self, cid: ConnId, uid: &Uid, target: &str, text: &str, cmd: &str) {
        let nick = self.nick_of(uid);
        let canon = canonicalize(target);
        let display = match self.state.channels.get(&canon) {
            None => {
                self.numeric(cid, &nick, ERR_NOSUCHCHANNEL, &[target, "No such channel"]);
                return;
            }
            Some(chan) => chan.name.clone(),
        };
        let is_member = self
            .state
            .users
            .get(uid)
            .map(|u| u.chans.contains(&canon))
            .unwrap_or(false);
        if !is_member {
            self.numeric(
                cid,
                &nick,
                ERR_CANNOTSENDTOCHAN,
                &[&display, "Cannot send to channel"],
            );
            return;
        }

        let prefix = self.state.users[uid].prefix();
        let line = Msg::new(
            Some(prefix),
            cmd,
            vec![display.clone(), text.to_owned()],
        )
        .to_line();
        for (mcid, muid) in self.local_members(&canon) {
            if &muid != uid {
                self.send_line(mcid, line.clone());
            }
        }

        // One copy per peer with remote members, not one per member.
        let msg = Msg::new(
            Some(uid.to_string()),
            cmd,
            vec![display, text.to_owned()],
        );
        let wire_line = msg.to_line();
        for pcid in self.peers_for_channel(&canon, None) {
            self.send_line(pcid, wire_line.clone());
        }
    }

    fn user_message(
        &mut self,
        cid: ConnId,
        uid: &Uid,
        target: &str,
        text: &str,
        cmd: &str,
        notice: bool,
    ) {
        let nick = self.nick_of(uid);
        let (target_uid, target_nick, target_conn, target_via, away) =
            match self.state.user_by_nick(target) {
                None => {
                    self.numeric(cid, &nick, ERR_NOSUCHNICK, &[target, "No such nick/channel"]);
                    return;
                }
                Some(user) => (
                    user.uid.clone(),
                    user.nick.clone(),
                    user.conn_id,
                    user.via,
                    user.away.clone(),
                ),
            };

        if let Some(tcid) = target_conn {
            let prefix = self.state.users[uid].prefix();
            let line = Msg::new(
                Some(prefix),
                cmd,
                vec![target_nick.clone(), text.to_owned()],
            )
            .to_line();
            self.send_line(tcid, line);
        } else if let Some(via) = target_via {
            let msg = Msg::new(
                Some(uid.to_string()),
                cmd,
                vec![target_uid.to_string(), text.to_owned()],
            );
            self.send_msg(via, &msg);
        }

        if !notice {
            if let Some(away) = away {
                self.numeric(cid, &nick, RPL_AWAY, &[&target_nick, &away]);
            }
        }
    }

    fn cmd_topic(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        let nick = self.nick_of(uid);
        let target = match params.first() {
            None => {
                self.numeric(cid, &nick, ERR_NEEDMOREPARAMS, &["TOPIC", "Not enough parameters"]);
                return;
            }
            Some(target) => target.clone(),
        };
        let canon = canonicalize(&target);
        let display = match self.state.channels.get(&canon) {
            None => {
                self.numeric(cid, &nick, ERR_NOSUCHCHANNEL, &[&target, "No such channel"]);
                return;
            }
            Some(chan) => chan.name.clone(),
        };
        let is_member = self
            .state
            .users
            .get(uid)
            .map(|u| u.chans.contains(&canon))
            .unwrap_or(false);
        if !is_member {
            self.numeric(cid, &nick, ERR_NOTONCHANNEL, &[&display, "You're not on that channel"]);
            return;
        }

        match params.get(1) {
            None => {
                let topic = self.state.channels[&canon].topic.clone();
                match topic {
                    None => {
                        self.numeric(cid, &nick, RPL_NOTOPIC, &[&display, "No topic is set"]);
                    }
                    Some(topic) => {
                        self.numeric(cid, &nick, RPL_TOPIC, &[&display, &topic.text]);
                        self.numeric(
                            cid,
                            &nick,
                            RPL_TOPICWHOTIME,
                            &[&display, &topic.set_by, &topic.set_at.to_string()],
                        );
                    }
                }
            }
            Some(text) => {
                let text = sanitize_text(text, MAX_TOPIC_LEN);
                let prefix = self.state.users[uid].prefix();
                let topic = if text.is_empty() {
                    None
                } else {
                    Some(Topic {
                        text: text.clone(),
                        set_by: prefix.clone(),
                        set_at: now_ts(),
                    })
                };
                if let Some(chan) = self.state.channels.get_mut(&canon) {
                    chan.topic = topic;
                }
                let line = Msg::new(
                    Some(prefix),
                    "TOPIC",
                    vec![display.clone(), text.clone()],
                )
                .to_line();
                for (mcid, _) in self.local_members(&canon) {
                    self.send_line(mcid, line.clone());
                }
                let msg = Msg::new(Some(uid.to_string()), "TOPIC", vec![display, text]);
                self.propagate(None, &msg);
            }
        }
    }

    fn cmd_mode(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        let nick = self.nick_of(uid);
        let target = match params.first() {
            None => {
                self.numeric(cid, &nick, ERR_NEEDMOREPARAMS, &["MODE", "Not enough parameters"]);
                return;
            }
            Some(target) => target.clone(),
        };
        if target.starts_with('#') {
            self.channel_mode(cid, uid, &target, &params[1..]);
        } else {
            self.user_mode(cid, uid, &target, &params[1..]);
        }
    }

    fn user_mode(&mut self, cid: ConnId, uid: &Uid, target: &str, args: &[String]) {
        let nick = self.nick_of(uid);
        if canonicalize(target) != canonicalize(&nick) {
            self.numeric(
                cid,
                &nick,
                ERR_USERSDONTMATCH,
                &["Can't change mode for other users"],
            );
            return;
        }
        if args.is_empty() {
            let modes = self.state.users[uid].modes.to_string();
            self.numeric(cid, &nick, RPL_UMODEIS, &[&modes]);
            return;
        }

        let mut adding = true;
        let mut applied = String::new();
        let mut applied_sign = ' ';
        let push = |sign: char, c: char, applied: &mut String, applied_sign: &mut char| {
            if *applied_sign != sign {
                applied.push(sign);
                *applied_sign = sign;
            }
            applied.push(c);
        };

        for c in args[0].chars() {
            match c {
                '+' => adding = true,
                '-' => adding = false,
                // +i never changes after registration; the request is
                // accepted and ignored.
                'i' => {}
                'o' => {
                    // Operator status only ever comes from OPER; dropping
                    // it this way is allowed.
                    if !adding && self.is_oper(uid) {
                        self.state.clear_oper(uid);
                        push('-', 'o', &mut applied, &mut applied_sign);
                    }
                }
                'C' => {
                    if !self.is_oper(uid) {
                        self.numeric(
                            cid,
                            &nick,
                            ERR_NOPRIVILEGES,
                            &["Permission Denied- You're not an IRC operator"],
                        );
                        continue;
                    }
                    if let Some(user) = self.state.users.get_mut(uid) {
                        if user.modes.conn_notices != adding {
                            user.modes.conn_notices = adding;
                            push(if adding { '+' } else { '-' }, 'C', &mut applied, &mut applied_sign);
                        }
                    }
                }
                _ => {
                    self.numeric(
                        cid,
                        &nick,
                        ERR_UMODEUNKNOWNFLAG,
                        &["Unknown MODE flag"],
                    );
                }
            }
        }

        if !applied.is_empty() {
            let prefix = self.state.users[uid].prefix();
            let line = Msg::new(
                Some(prefix),
                "MODE",
                vec![nick.clone(), applied.clone()],
            )
            .to_line();
            self.send_line(cid, line);
            let msg = Msg::new(
                Some(uid.to_string()),
                "MODE",
                vec![uid.to_string(), applied],
            );
            self.propagate(None, &msg);
        }
    }

    fn channel_mode(&mut self, cid: ConnId, uid: &Uid, target: &str, args: &[String]) {
        let nick = self.nick_of(uid);
        let canon = canonicalize(target);
        let (display, chan_ts, modes) = match self.state.channels.get(&canon) {
            None => {
                self.numeric(cid, &nick, ERR_NOSUCHCHANNEL, &[target, "No such channel"]);
                return;
            }
            Some(chan) => (chan.name.clone(), chan.ts, chan.modes),
        };

        if args.is_empty() {
            self.numeric(
                cid,
                &nick,
                RPL_CHANNELMODEIS,
                &[&display, &modes.to_string()],
            );
            self.numeric(
                cid,
                &nick,
                RPL_CREATIONTIME,
                &[&display, &chan_ts.to_string()],
            );
            return;
        }

        let mode_str = args[0].clone();
        if mode_str == "b" || mode_str == "+b" {
            // No ban lists; the query form still answers.
            self.numeric(cid, &nick, RPL_ENDOFBANLIST, &[&display, "End of channel ban list"]);
            return;
        }

        let is_member = self
            .state
            .users
            .get(uid)
            .map(|u| u.chans.contains(&canon))
            .unwrap_or(false);
        if !is_member {
            self.numeric(cid, &nick, ERR_NOTONCHANNEL, &[&display, "You're not on that channel"]);
            return;
        }
        let is_chanop = self.state.channels[&canon].ops.contains(uid);
        if !is_chanop {
            self.numeric(
                cid,
                &nick,
                ERR_CHANOPRIVSNEEDED,
                &[&display, "You're not channel operator"],
            );
            return;
        }

        // Only membership modes change; everything else is fixed at +ns.
        let mut adding = true;
        let mut arg_idx = 1;
        let mut changes: Vec<(bool, Uid, String)> = Vec::new();
        for c in mode_str.chars() {
            match c {
                '+' => adding = true,
                '-' => adding = false,
                'o' => {
                    let arg = match args.get(arg_idx) {
                        None => continue,
                        Some(arg) => arg.clone(),
                    };
                    arg_idx += 1;
                    if changes.len() >= MAX_CHANOP_CHANGES {
                        continue;
                    }
                    let target_user = match self.state.user_by_nick(&arg) {
                        None => {
                            self.numeric(cid, &nick, ERR_NOSUCHNICK, &[&arg, "No such nick/channel"]);
                            continue;
                        }
                        Some(user) => (user.uid.clone(), user.nick.clone()),
                    };
                    let member = self.state.channels[&canon].members.contains(&target_user.0);
                    if !member {
                        self.numeric(
                            cid,
                            &nick,
                            ERR_USERNOTINCHANNEL,
                            &[&target_user.1, &display, "They aren't on that channel"],
                        );
                        continue;
                    }
                    changes.push((adding, target_user.0, target_user.1));
                }
                _ => {
                    self.numeric(
                        cid,
                        &nick,
                        ERR_UNKNOWNMODE,
                        &[&c.to_string(), "is unknown mode char to me"],
                    );
                }
            }
        }

        if changes.is_empty() {
            return;
        }

        let mut applied_modes = String::new();
        let mut applied_sign = ' ';
        let mut applied_nicks: Vec<String> = Vec::new();
        let mut applied_uids: Vec<String> = Vec::new();
        for (add, target_uid, target_nick) in changes {
            let chan = match self.state.channels.get_mut(&canon) {
                None => return,
                Some(chan) => chan,
            };
            let changed = if add {
                chan.ops.insert(target_uid.clone())
            } else {
                chan.ops.remove(&target_uid)
            };
            if !changed {
                continue;
            }
            let sign = if add { '+' } else { '-' };
            if applied_sign != sign {
                applied_modes.push(sign);
                applied_sign = sign;
            }
            applied_modes.push('o');
            applied_nicks.push(target_nick);
            applied_uids.push(target_uid.to_string());
        }

        if applied_modes.is_empty() {
            return;
        }

        let prefix = self.state.users[uid].prefix();
        let mut local_params = vec![display.clone(), applied_modes.clone()];
        local_params.extend(applied_nicks);
        let line = Msg::new(Some(prefix), "MODE", local_params).to_line();
        for (mcid, _) in self.local_members(&canon) {
            self.send_line(mcid, line.clone());
        }

        let mut wire_params = vec![chan_ts.to_string(), display, applied_modes];
        wire_params.extend(applied_uids);
        let msg = Msg::new(Some(uid.to_string()), "TMODE", wire_params);
        self.propagate(None, &msg);
    }

    fn cmd_names(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        let nick = self.nick_of(uid);
        let target = match params.first() {
            None => {
                self.numeric(cid, &nick, ERR_NEEDMOREPARAMS, &["NAMES", "Not enough parameters"]);
                return;
            }
            Some(target) => target.clone(),
        };
        let canon = canonicalize(&target);
        if self.state.channels.contains_key(&canon) {
            self.names_reply(cid, &nick, &canon);
        } else {
            self.numeric(cid, &nick, RPL_ENDOFNAMES, &[&target, "End of /NAMES list"]);
        }
    }

    fn cmd_whois(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        let nick = self.nick_of(uid);
        let target = match params.first() {
            None => {
                self.numeric(cid, &nick, ERR_NONICKNAMEGIVEN, &["No nickname given"]);
                return;
            }
            Some(target) => target.clone(),
        };
        let (target_uid, local) = match self.state.user_by_nick(&target) {
            None => {
                self.numeric(cid, &nick, ERR_NOSUCHNICK, &[&target, "No such nick/channel"]);
                self.numeric(cid, &nick, RPL_ENDOFWHOIS, &[&target, "End of /WHOIS list"]);
                return;
            }
            Some(user) => (user.uid.clone(), user.is_local()),
        };

        if local {
            let rows = s2s::whois_numerics(self, uid, &target_uid);
            for (num, params) in rows {
                self.numeric_owned(cid, &nick, num, params);
            }
        } else if let Some(via) = self.state.users[&target_uid].via {
            // The owning server answers; numerics route back by UID.
            let target_nick = self.state.users[&target_uid].nick.clone();
            let msg = Msg::new(
                Some(uid.to_string()),
                "WHOIS",
                vec![target_uid.to_string(), target_nick],
            );
            self.send_msg(via, &msg);
        }
    }

    fn cmd_who(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        let nick = self.nick_of(uid);
        let mask = match params.first() {
            None => {
                self.numeric(cid, &nick, ERR_NEEDMOREPARAMS, &["WHO", "Not enough parameters"]);
                return;
            }
            Some(mask) => mask.clone(),
        };

        if mask == "!*" {
            if !self.is_oper(uid) {
                self.numeric(
                    cid,
                    &nick,
                    ERR_NOPRIVILEGES,
                    &["Permission Denied- You're not an IRC operator"],
                );
                return;
            }
            self.oper_notice(&format!("OPERSPY WHO !* by {}", nick));
            let uids: Vec<Uid> = self.state.users.keys().cloned().collect();
            for target in uids {
                self.who_line(cid, &nick, "*", &target, None);
            }
            self.numeric(cid, &nick, RPL_ENDOFWHO, &[&mask, "End of /WHO list"]);
            return;
        }

        let canon = canonicalize(&mask);
        if let Some(chan) = self.state.channels.get(&canon) {
            let display = chan.name.clone();
            let members: Vec<Uid> = chan.members.iter().cloned().collect();
            let ops: HashSet<Uid> = chan.ops.clone();
            for member in members {
                let chanop = ops.contains(&member);
                self.who_line(cid, &nick, &display, &member, Some(chanop));
            }
        }
        self.numeric(cid, &nick, RPL_ENDOFWHO, &[&mask, "End of /WHO list"]);
    }

    fn who_line(
        &mut self,
        cid: ConnId,
        nick: &str,
        chan_display: &str,
        target: &Uid,
        chanop: Option<bool>,
    ) {
        let (t_nick, t_user, t_host, t_real, away, oper) = match self.state.users.get(target) {
            None => return,
            Some(user) => (
                user.nick.clone(),
                user.username.clone(),
                user.host.clone(),
                user.realname.clone(),
                user.away.is_some(),
                user.modes.oper,
            ),
        };
        let server_name = self.config.server_name.clone();
        let t_server = match self.state.users.get(target) {
            Some(user) => self.state.server_name_of(user, &server_name),
            None => server_name.clone(),
        };
        let hops = match self.state.users.get(target) {
            Some(user) if !user.is_local() => libshrike_common::Sid::new(user.uid.sid_str())
                .and_then(|sid| self.state.servers.get(&sid))
                .map(|s| s.hopcount)
                .unwrap_or(1),
            _ => 0,
        };
        let mut flags = if away { "G".to_owned() } else { "H".to_owned() };
        if oper {
            flags.push('*');
        }
        if chanop == Some(true) {
            flags.push('@');
        }
        let trailing = format!("{} {}", hops, t_real);
        self.numeric(
            cid,
            nick,
            RPL_WHOREPLY,
            &[chan_display, &t_user, &t_host, &t_server, &t_nick, &flags, &trailing],
        );
    }

    fn cmd_oper(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        let nick = self.nick_of(uid);
        if params.len() < 2 {
            self.numeric(cid, &nick, ERR_NEEDMOREPARAMS, &["OPER", "Not enough parameters"]);
            return;
        }
        let ok = self
            .tables
            .opers
            .get(&params[0])
            .map(|password| password == &params[1])
            .unwrap_or(false);
        if !ok {
            self.numeric(cid, &nick, ERR_PASSWDMISMATCH, &["Password incorrect"]);
            return;
        }
        if self.is_oper(uid) {
            return;
        }
        self.state.set_oper(uid);
        self.numeric(cid, &nick, RPL_YOUREOPER, &["You are now an IRC operator"]);
        let prefix = self.state.users[uid].prefix();
        let line = Msg::new(Some(prefix), "MODE", vec![nick.clone(), "+o".to_owned()]).to_line();
        self.send_line(cid, line);
        self.oper_notice(&format!("{} has become an operator", nick));
        let msg = Msg::new(
            Some(uid.to_string()),
            "MODE",
            vec![uid.to_string(), "+o".to_owned()],
        );
        self.propagate(None, &msg);
    }

    fn require_oper(&mut self, cid: ConnId, uid: &Uid) -> bool {
        if self.is_oper(uid) {
            return true;
        }
        let nick = self.nick_of(uid);
        self.numeric(
            cid,
            &nick,
            ERR_NOPRIVILEGES,
            &["Permission Denied- You're not an IRC operator"],
        );
        false
    }

    fn cmd_kill(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        if !self.require_oper(cid, uid) {
            return;
        }
        let nick = self.nick_of(uid);
        if params.len() < 2 {
            self.numeric(cid, &nick, ERR_NEEDMOREPARAMS, &["KILL", "Not enough parameters"]);
            return;
        }
        let target_uid = match self.state.user_by_nick(&params[0]) {
            None => {
                self.numeric(cid, &nick, ERR_NOSUCHNICK, &[&params[0], "No such nick/channel"]);
                return;
            }
            Some(user) => user.uid.clone(),
        };
        let reason = format!("{} ({})", nick, sanitize_text(&params[1], MAX_TOPIC_LEN));
        self.oper_notice(&format!("{} issued KILL for {}", nick, params[0]));
        self.kill_user(&uid.to_string(), &target_uid, &reason, KillScope::AllPeers);
    }

    fn cmd_kline(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        if !self.require_oper(cid, uid) {
            return;
        }
        let nick = self.nick_of(uid);
        if params.is_empty() {
            self.numeric(cid, &nick, ERR_NEEDMOREPARAMS, &["KLINE", "Not enough parameters"]);
            return;
        }
        let (user_mask, host_mask) = match split_mask(&params[0]) {
            None => {
                self.numeric(cid, &nick, ERR_NEEDMOREPARAMS, &["KLINE", "Mask must be user@host"]);
                return;
            }
            Some(masks) => masks,
        };
        let reason = params
            .get(1)
            .map(|r| sanitize_text(r, MAX_TOPIC_LEN))
            .unwrap_or_else(|| "K-lined".to_owned());

        self.apply_kline(&user_mask, &host_mask, &reason, &nick);

        let msg = Msg::new(
            Some(uid.to_string()),
            "ENCAP",
            vec![
                "*".to_owned(),
                "KLINE".to_owned(),
                "0".to_owned(),
                user_mask,
                host_mask,
                reason,
            ],
        );
        self.propagate(None, &msg);
    }

    /// Installs a K-line and disconnects every matching local user.
    pub(crate) fn apply_kline(&mut self, user_mask: &str, host_mask: &str, reason: &str, by: &str) {
        let kline = match Kline::new(user_mask, host_mask, reason) {
            Err(err) => {
                debug!("bad K-line mask {}@{}: {}", user_mask, host_mask, err);
                return;
            }
            Ok(kline) => kline,
        };

        let victims: Vec<Uid> = self
            .state
            .local_users
            .values()
            .filter_map(|lu| {
                let user = self.state.users.get(&lu.uid)?;
                if kline.matches(&user.username, &user.host) {
                    Some(lu.uid.clone())
                } else {
                    None
                }
            })
            .collect();

        if self.state.add_kline(kline) {
            self.oper_notice(&format!(
                "{} added K-Line for [{}@{}]: {}",
                by, user_mask, host_mask, reason
            ));
        }

        for victim in victims {
            let quit_reason = format!("Connection closed: {}", reason);
            if let Some(vcid) = self.state.users.get(&victim).and_then(|u| u.conn_id) {
                self.drop_conn(vcid, &quit_reason);
            }
        }
    }

    fn cmd_unkline(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        if !self.require_oper(cid, uid) {
            return;
        }
        let nick = self.nick_of(uid);
        if params.is_empty() {
            self.numeric(cid, &nick, ERR_NEEDMOREPARAMS, &["UNKLINE", "Not enough parameters"]);
            return;
        }
        let (user_mask, host_mask) = match split_mask(&params[0]) {
            None => {
                self.numeric(cid, &nick, ERR_NEEDMOREPARAMS, &["UNKLINE", "Mask must be user@host"]);
                return;
            }
            Some(masks) => masks,
        };

        if self.state.remove_kline(&user_mask, &host_mask) {
            self.oper_notice(&format!(
                "{} removed K-Line for [{}@{}]",
                nick, user_mask, host_mask
            ));
        }

        let msg = Msg::new(
            Some(uid.to_string()),
            "ENCAP",
            vec!["*".to_owned(), "UNKLINE".to_owned(), user_mask, host_mask],
        );
        self.propagate(None, &msg);
    }

    fn cmd_connect(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        if !self.require_oper(cid, uid) {
            return;
        }
        let nick = self.nick_of(uid);
        let name = match params.first() {
            None => {
                self.numeric(cid, &nick, ERR_NEEDMOREPARAMS, &["CONNECT", "Not enough parameters"]);
                return;
            }
            Some(name) => name.clone(),
        };
        let peer = match self.tables.peer(&name) {
            None => {
                self.numeric(cid, &nick, ERR_NOSUCHSERVER, &[&name, "No such server"]);
                return;
            }
            Some(peer) => peer.clone(),
        };
        if self.state.server_by_name(&name).is_some() || self.dialing.contains(&name) {
            self.oper_notice(&format!("{} is already linked", name));
            return;
        }
        self.oper_notice(&format!("{} initiating link to {}", nick, name));
        self.start_dial(peer);
    }

    fn cmd_squit(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        if !self.require_oper(cid, uid) {
            return;
        }
        let nick = self.nick_of(uid);
        let name = match params.first() {
            None => {
                self.numeric(cid, &nick, ERR_NEEDMOREPARAMS, &["SQUIT", "Not enough parameters"]);
                return;
            }
            Some(name) => name.clone(),
        };
        let reason = params
            .get(1)
            .map(|r| sanitize_text(r, MAX_TOPIC_LEN))
            .unwrap_or_else(|| format!("SQUIT by {}", nick));
        let (sid, conn_id, via) = match self.state.server_by_name(&name) {
            None => {
                self.numeric(cid, &nick, ERR_NOSUCHSERVER, &[&name, "No such server"]);
                return;
            }
            Some(server) => (server.sid.clone(), server.conn_id, server.via),
        };
        match conn_id {
            Some(link_cid) => {
                self.oper_notice(&format!("{} issued SQUIT for {}", nick, name));
                self.drop_conn(link_cid, &reason);
            }
            None => {
                // Remote server; ask its side of the network to drop it.
                let msg = Msg::new(
                    Some(uid.to_string()),
                    "SQUIT",
                    vec![sid.to_string(), reason],
                );
                self.send_msg(via, &msg);
            }
        }
    }

    fn cmd_links(&mut self, cid: ConnId, uid: &Uid) {
        let nick = self.nick_of(uid);
        let own = (
            self.config.server_name.clone(),
            0u32,
            self.config.server_info.clone(),
        );
        let mut entries: Vec<(String, u32, String)> = vec![own];
        for server in self.state.servers.values() {
            entries.push((server.name.clone(), server.hopcount, server.description.clone()));
        }
        entries.sort_by(|a, b| a.1.cmp(&b.1));
        for (name, hops, info) in entries {
            let trailing = format!("{} {}", hops, info);
            self.numeric(cid, &nick, RPL_LINKS, &[&name, &name, &trailing]);
        }
        self.numeric(cid, &nick, RPL_ENDOFLINKS, &["*", "End of /LINKS list"]);
    }

    fn cmd_map(&mut self, cid: ConnId, uid: &Uid) {
        let nick = self.nick_of(uid);
        let line = format!("{} [{}]", self.config.server_name, self.state.sid);
        self.numeric(cid, &nick, RPL_MAP, &[&line]);

        let snapshot: Vec<(String, String, Option<String>)> = self
            .state
            .servers
            .values()
            .map(|s| {
                (
                    s.sid.to_string(),
                    s.name.clone(),
                    s.upstream.as_ref().map(|u| u.to_string()),
                )
            })
            .collect();
        let mut lines: Vec<String> = Vec::new();
        map_subtree(&snapshot, None, 1, &mut lines);
        for line in lines {
            self.numeric(cid, &nick, RPL_MAP, &[&line]);
        }
        self.numeric(cid, &nick, RPL_MAPEND, &["End of /MAP"]);
    }

    fn cmd_version(&mut self, cid: ConnId, uid: &Uid) {
        let nick = self.nick_of(uid);
        let server_name = self.config.server_name.clone();
        let server_info = self.config.server_info.clone();
        self.numeric(
            cid,
            &nick,
            RPL_VERSION,
            &[&format!("{}.", SERVER_VERSION), &server_name, &server_info],
        );
    }

    fn cmd_time(&mut self, cid: ConnId, uid: &Uid) {
        let nick = self.nick_of(uid);
        let server_name = self.config.server_name.clone();
        self.numeric(cid, &nick, RPL_TIME, &[&server_name, &format_ts(now_ts())]);
    }

    fn cmd_admin(&mut self, cid: ConnId, uid: &Uid) {
        let nick = self.nick_of(uid);
        let server_name = self.config.server_name.clone();
        let server_info = self.config.server_info.clone();
        let admin_email = self.config.admin_email.clone();
        self.numeric(
            cid,
            &nick,
            RPL_ADMINME,
            &[&server_name, "Administrative info"],
        );
        self.numeric(cid, &nick, RPL_ADMINLOC1, &[&server_info]);
        self.numeric(cid, &nick, RPL_ADMINEMAIL, &[&admin_email]);
    }

    fn cmd_stats(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        if !self.require_oper(cid, uid) {
            return;
        }
        let nick = self.nick_of(uid);
        let letter = params
            .first()
            .and_then(|p| p.chars().next())
            .unwrap_or('*')
            .to_ascii_uppercase();
        if letter == 'K' {
            let klines: Vec<(String, String, String)> = self
                .state
                .klines
                .iter()
                .map(|k| (k.host_mask.clone(), k.user_mask.clone(), k.reason.clone()))
                .collect();
            for (host_mask, user_mask, reason) in klines {
                self.numeric(
                    cid,
                    &nick,
                    RPL_STATSKLINE,
                    &["K", &host_mask, "*", &user_mask, &reason],
                );
            }
        }
        self.numeric(
            cid,
            &nick,
            RPL_ENDOFSTATS,
            &[&letter.to_string(), "End of /STATS report"],
        );
    }

    fn cmd_whowas(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        let nick = self.nick_of(uid);
        let target = match params.first() {
            None => {
                self.numeric(cid, &nick, ERR_NONICKNAMEGIVEN, &["No nickname given"]);
                return;
            }
            Some(target) => target.clone(),
        };
        let canon = canonicalize(&target);
        let matches: Vec<(String, String, String, String)> = self
            .state
            .whowas
            .iter()
            .rev()
            .filter(|w| canonicalize(&w.nick) == canon)
            .take(MAX_WHOWAS_REPLIES)
            .map(|w| (w.nick.clone(), w.username.clone(), w.host.clone(), w.realname.clone()))
            .collect();
        if matches.is_empty() {
            self.numeric(cid, &nick, ERR_WASNOSUCHNICK, &[&target, "There was no such nickname"]);
        } else {
            for (w_nick, w_user, w_host, w_real) in matches {
                self.numeric(
                    cid,
                    &nick,
                    RPL_WHOWASUSER,
                    &[&w_nick, &w_user, &w_host, "*", &w_real],
                );
            }
        }
        self.numeric(cid, &nick, RPL_ENDOFWHOWAS, &[&target, "End of WHOWAS"]);
    }

    fn cmd_away(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        let nick = self.nick_of(uid);
        let reason = params
            .first()
            .map(|r| sanitize_text(r, MAX_TOPIC_LEN))
            .filter(|r| !r.is_empty());
        let wire: Msg;
        match reason {
            None => {
                if let Some(user) = self.state.users.get_mut(uid) {
                    user.away = None;
                }
                self.numeric(cid, &nick, RPL_UNAWAY, &["You are no longer marked as being away"]);
                wire = Msg::new(Some(uid.to_string()), "AWAY", vec![]);
            }
            Some(reason) => {
                if let Some(user) = self.state.users.get_mut(uid) {
                    user.away = Some(reason.clone());
                }
                self.numeric(cid, &nick, RPL_NOWAWAY, &["You have been marked as being away"]);
                wire = Msg::new(Some(uid.to_string()), "AWAY", vec![reason]);
            }
        }
        self.propagate(None, &wire);
    }

    fn cmd_invite(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        let nick = self.nick_of(uid);
        if params.len() < 2 {
            self.numeric(cid, &nick, ERR_NEEDMOREPARAMS, &["INVITE", "Not enough parameters"]);
            return;
        }
        let (target_uid, target_nick, target_conn, target_via) =
            match self.state.user_by_nick(&params[0]) {
                None => {
                    self.numeric(cid, &nick, ERR_NOSUCHNICK, &[&params[0], "No such nick/channel"]);
                    return;
                }
                Some(user) => (user.uid.clone(), user.nick.clone(), user.conn_id, user.via),
            };
        let canon = canonicalize(&params[1]);
        let display = match self.state.channels.get(&canon) {
            None => {
                self.numeric(cid, &nick, ERR_NOSUCHCHANNEL, &[&params[1], "No such channel"]);
                return;
            }
            Some(chan) => chan.name.clone(),
        };
        let inviter_member = self
            .state
            .users
            .get(uid)
            .map(|u| u.chans.contains(&canon))
            .unwrap_or(false);
        if !inviter_member {
            self.numeric(cid, &nick, ERR_NOTONCHANNEL, &[&display, "You're not on that channel"]);
            return;
        }
        if self.state.channels[&canon].members.contains(&target_uid) {
            self.numeric(
                cid,
                &nick,
                ERR_USERONCHANNEL,
                &[&target_nick, &display, "is already on channel"],
            );
            return;
        }

        self.numeric(cid, &nick, RPL_INVITING, &[&target_nick, &display]);
        if let Some(tcid) = target_conn {
            let prefix = self.state.users[uid].prefix();
            let line = Msg::new(
                Some(prefix),
                "INVITE",
                vec![target_nick, display],
            )
            .to_line();
            self.send_line(tcid, line);
        } else if let Some(via) = target_via {
            let msg = Msg::new(
                Some(uid.to_string()),
                "INVITE",
                vec![target_uid.to_string(), display],
            );
            self.send_msg(via, &msg);
        }
    }

    fn cmd_opme(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        if !self.require_oper(cid, uid) {
            return;
        }
        let nick = self.nick_of(uid);
        let target = match params.first() {
            None => {
                self.numeric(cid, &nick, ERR_NEEDMOREPARAMS, &["OPME", "Not enough parameters"]);
                return;
            }
            Some(target) => target.clone(),
        };
        let canon = canonicalize(&target);
        let (display, chan_ts) = match self.state.channels.get(&canon) {
            None => {
                self.numeric(cid, &nick, ERR_NOSUCHCHANNEL, &[&target, "No such channel"]);
                return;
            }
            Some(chan) => (chan.name.clone(), chan.ts),
        };
        let is_member = self
            .state
            .users
            .get(uid)
            .map(|u| u.chans.contains(&canon))
            .unwrap_or(false);
        if !is_member {
            self.numeric(cid, &nick, ERR_NOTONCHANNEL, &[&display, "You're not on that channel"]);
            return;
        }
        let granted = match self.state.channels.get_mut(&canon) {
            None => return,
            Some(chan) => chan.ops.insert(uid.clone()),
        };
        if !granted {
            return;
        }
        self.oper_notice(&format!("{} used OPME on {}", nick, display));

        let server_name = self.config.server_name.clone();
        let line = Msg::new(
            Some(server_name),
            "MODE",
            vec![display.clone(), "+o".to_owned(), nick],
        )
        .to_line();
        for (mcid, _) in self.local_members(&canon) {
            self.send_line(mcid, line.clone());
        }
        let msg = Msg::new(
            Some(self.state.sid.to_string()),
            "TMODE",
            vec![
                chan_ts.to_string(),
                display,
                "+o".to_owned(),
                uid.to_string(),
            ],
        );
        self.propagate(None, &msg);
    }

    fn cmd_wallops(&mut self, cid: ConnId, uid: &Uid, params: &[String]) {
        if !self.require_oper(cid, uid) {
            return;
        }
        let nick = self.nick_of(uid);
        let text = match params.first() {
            None => {
                self.numeric(cid, &nick, ERR_NEEDMOREPARAMS, &["WALLOPS", "Not enough parameters"]);
                return;
            }
            Some(text) => sanitize_text(text, MAX_TOPIC_LEN),
        };
        let prefix = self.state.users[uid].prefix();
        self.deliver_wallops(&prefix, &text);
        let msg = Msg::new(Some(uid.to_string()), "WALLOPS", vec![text]);
        self.propagate(None, &msg);
    }

    /// WALLOPS delivery to local operators.
    pub(crate) fn deliver_wallops(&mut self, prefix: &str, text: &str) {
        let line = Msg::new(
            Some(prefix.to_owned()),
            "WALLOPS",
            vec![text.to_owned()],
        )
        .to_line();
        let targets: Vec<ConnId> = self
            .state
            .opers
            .iter()
            .filter_map(|o| self.state.users.get(o)?.conn_id)
            .collect();
        for tcid in targets {
            self.send_line(tcid, line.clone());
        }
    }

    fn cmd_rehash(&mut self, cid: ConnId, uid: &Uid) {
        if !self.require_oper(cid, uid) {
            return;
        }
        let nick = self.nick_of(uid);
        let path = self.config.opers_config.display().to_string();
        self.numeric(cid, &nick, RPL_REHASHING, &[&path, "Rehashing"]);
        self.rehash();
    }

    fn cmd_die(&mut self, cid: ConnId, uid: &Uid) {
        if !self.require_oper(cid, uid) {
            return;
        }
        let nick = self.nick_of(uid);
        warn!("DIE issued by {}", nick);
        self.begin_shutdown(ExitAction::Quit);
    }

    fn cmd_restart(&mut self, cid: ConnId, uid: &Uid) {
        if !self.require_oper(cid, uid) {
            return;
        }
        let nick = self.nick_of(uid);
        warn!("RESTART issued by {}", nick);
        self.begin_shutdown(ExitAction::Restart);
    }
}

/// Splits a `user@host` ban mask.
fn split_mask(mask: &str) -> Option<(String, String)> {
    let at = mask.find('@')?;
    let (user, host) = (&mask[..at], &mask[at + 1..]);
    if user.is_empty() || host.is_empty() {
        return None;
    }
    Some((user.to_owned(), host.to_owned()))
}

/// Indented MAP lines for the servers below `upstream`.
fn map_subtree(
    servers: &[(String, String, Option<String>)],
    upstream: Option<&str>,
    depth: usize,
    out: &mut Vec<String>,
) {
    for (sid, name, up) in servers {
        if up.as_deref() != upstream {
            continue;
        }
        out.push(format!("{}{} [{}]", "  ".repeat(depth), name, sid));
        map_subtree(servers, Some(sid.as_str()), depth + 1, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_mask() {
        assert_eq!(
            split_mask("*@*.badnet.example"),
            Some(("*".to_owned(), "*.badnet.example".to_owned()))
        );
        assert_eq!(split_mask("bob@"), None);
        assert_eq!(split_mask("@host"), None);
        assert_eq!(split_mask("nosep"), None);
    }

    #[test]
    fn test_map_subtree() {
        let servers = vec![
            ("1AA".to_owned(), "hub".to_owned(), None),
            ("2BB".to_owned(), "leaf".to_owned(), Some("1AA".to_owned())),
            ("3CC".to_owned(), "other".to_owned(), None),
        ];
        let mut out = Vec::new();
        map_subtree(&servers, None, 1, &mut out);
        assert_eq!(out.len(), 3);
        assert_eq!(out[0], "  hub [1AA]");
        assert_eq!(out[1], "    leaf [2BB]");
        assert_eq!(out[2], "  other [3CC]");
    }
}
