//! Configuration: one YAML file for the daemon itself plus three satellite
//! tables (operators, peer servers, user overrides) in `name = value` line
//! formats. The tables and the MOTD are reread on rehash; the main file is
//! only read at startup.

use serde::Deserialize;

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use libshrike_common::valid_sid;

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub(crate) struct Config {
    /// Address to bind listeners on.
    pub(crate) listen_host: String,

    /// Plain-TCP client/server port.
    pub(crate) listen_port: u16,

    /// TLS port. Requires `certificate-file` and `key-file`.
    #[serde(default)]
    pub(crate) listen_port_tls: Option<u16>,

    #[serde(default)]
    pub(crate) certificate_file: Option<PathBuf>,

    #[serde(default)]
    pub(crate) key_file: Option<PathBuf>,

    /// Our name on the network, e.g. `irc.example.com`.
    pub(crate) server_name: String,

    /// One-line description shown in LINKS/WHOIS.
    pub(crate) server_info: String,

    /// Path to the MOTD file. A missing file means "no MOTD".
    pub(crate) motd: PathBuf,

    pub(crate) max_nick_length: usize,

    /// Idle seconds before we ping a client or peer.
    pub(crate) ping_time: u64,

    /// Idle seconds before we give up on one.
    pub(crate) dead_time: u64,

    /// Seconds between outbound link attempts to the same peer.
    pub(crate) connect_attempt_time: u64,

    /// Our TS6 server id, `[0-9][0-9A-Z]{2}`.
    pub(crate) ts6_sid: String,

    pub(crate) admin_email: String,

    pub(crate) opers_config: PathBuf,
    pub(crate) servers_config: PathBuf,
    pub(crate) users_config: PathBuf,
}

impl Config {
    pub(crate) fn ping_time(&self) -> Duration {
        Duration::from_secs(self.ping_time)
    }

    pub(crate) fn dead_time(&self) -> Duration {
        Duration::from_secs(self.dead_time)
    }

    pub(crate) fn connect_attempt_time(&self) -> Duration {
        Duration::from_secs(self.connect_attempt_time)
    }

    /// Returns error descriptions; empty means the config is usable.
    pub(crate) fn validate(&self) -> Vec<String> {
        let mut errors = vec![];

        if self.server_name.is_empty() {
            errors.push("server-name can't be empty".to_owned());
        }

        if !valid_sid(&self.ts6_sid) {
            errors.push(format!(
                "ts6-sid '{}' is not of the form [0-9][0-9A-Z][0-9A-Z]",
                self.ts6_sid
            ));
        }

        if self.max_nick_length == 0 || self.max_nick_length > 31 {
            errors.push("max-nick-length must be between 1 and 31".to_owned());
        }

        if self.ping_time == 0 || self.dead_time <= self.ping_time {
            errors.push("dead-time must be greater than ping-time, both non-zero".to_owned());
        }

        if self.connect_attempt_time == 0 {
            errors.push("connect-attempt-time must be non-zero".to_owned());
        }

        if self.listen_port_tls.is_some()
            && (self.certificate_file.is_none() || self.key_file.is_none())
        {
            errors.push(
                "listen-port-tls requires both certificate-file and key-file".to_owned(),
            );
        }

        errors
    }
}

#[derive(Debug)]
pub(crate) enum ConfigError {
    Io(std::io::Error),
    Yaml(serde_yaml::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "{}", err),
            ConfigError::Yaml(err) => write!(f, "{}", err),
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(err: std::io::Error) -> ConfigError {
        ConfigError::Io(err)
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> ConfigError {
        ConfigError::Yaml(err)
    }
}

pub(crate) fn parse_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path)?;
    let config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

/// One line of the peer servers file: `name = host,port,password,tls-flag`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Peer {
    pub(crate) name: String,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) password: String,
    pub(crate) tls: bool,
}

/// One line of the user overrides file:
/// `tag = user-mask,host-mask,flood-exempt-flag,spoof-hostname`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct UserOverride {
    pub(crate) tag: String,
    pub(crate) user_mask: String,
    pub(crate) host_mask: String,
    pub(crate) flood_exempt: bool,
    pub(crate) spoof: Option<String>,
}

impl UserOverride {
    pub(crate) fn matches(&self, username: &str, hostname: &str) -> bool {
        crate::kline::mask_match(&self.user_mask, username)
            && crate::kline::mask_match(&self.host_mask, hostname)
    }
}

/// The reloadable half of the configuration.
#[derive(Clone, Debug, Default)]
pub(crate) struct Tables {
    pub(crate) opers: HashMap<String, String>,
    pub(crate) peers: Vec<Peer>,
    pub(crate) overrides: Vec<UserOverride>,
    pub(crate) motd: Option<Vec<String>>,
}

impl Tables {
    pub(crate) fn peer(&self, name: &str) -> Option<&Peer> {
        self.peers.iter().find(|p| p.name == name)
    }

    pub(crate) fn override_for(&self, username: &str, hostname: &str) -> Option<&UserOverride> {
        self.overrides.iter().find(|o| o.matches(username, hostname))
    }
}

pub(crate) fn load_tables(config: &Config) -> Result<Tables, String> {
    let opers_text = fs::read_to_string(&config.opers_config)
        .map_err(|err| format!("can't read {:?}: {}", config.opers_config, err))?;
    let servers_text = fs::read_to_string(&config.servers_config)
        .map_err(|err| format!("can't read {:?}: {}", config.servers_config, err))?;
    let users_text = fs::read_to_string(&config.users_config)
        .map_err(|err| format!("can't read {:?}: {}", config.users_config, err))?;

    let motd = fs::read_to_string(&config.motd)
        .ok()
        .map(|text| text.lines().map(str::to_owned).collect());

    Ok(Tables {
        opers: parse_opers(&opers_text)?,
        peers: parse_peers(&servers_text)?,
        overrides: parse_user_overrides(&users_text)?,
        motd,
    })
}

// Lines are `name = rest`; '#' starts a comment, blank lines are skipped.
fn table_lines(text: &str) -> impl Iterator<Item = (usize, &str, &str)> {
    text.lines().enumerate().filter_map(|(idx, line)| {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let eq = line.find('=')?;
        Some((idx + 1, line[..eq].trim_end(), line[eq + 1..].trim_start()))
    })
}

fn parse_flag(s: &str) -> Option<bool> {
    match s {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub(crate) fn parse_opers(text: &str) -> Result<HashMap<String, String>, String> {
    let mut opers = HashMap::new();
    for (line_no, name, password) in table_lines(text) {
        if name.is_empty() || password.is_empty() {
            return Err(format!("opers line {}: empty name or password", line_no));
        }
        opers.insert(name.to_owned(), password.to_owned());
    }
    Ok(opers)
}

pub(crate) fn parse_peers(text: &str) -> Result<Vec<Peer>, String> {
    let mut peers: Vec<Peer> = Vec::new();
    for (line_no, name, rest) in table_lines(text) {
        let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            return Err(format!(
                "servers line {}: expected host,port,password,tls-flag",
                line_no
            ));
        }
        let port: u16 = fields[1]
            .parse()
            .map_err(|_| format!("servers line {}: bad port '{}'", line_no, fields[1]))?;
        let tls = parse_flag(fields[3])
            .ok_or_else(|| format!("servers line {}: bad tls flag '{}'", line_no, fields[3]))?;
        if peers.iter().any(|p| p.name == name) {
            return Err(format!("servers line {}: duplicate peer '{}'", line_no, name));
        }
        peers.push(Peer {
            name: name.to_owned(),
            host: fields[0].to_owned(),
            port,
            password: fields[2].to_owned(),
            tls,
        });
    }
    Ok(peers)
}

pub(crate) fn parse_user_overrides(text: &str) -> Result<Vec<UserOverride>, String> {
    let mut overrides = Vec::new();
    for (line_no, tag, rest) in table_lines(text) {
        let fields: Vec<&str> = rest.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            return Err(format!(
                "users line {}: expected user-mask,host-mask,flood-exempt-flag,spoof-hostname",
                line_no
            ));
        }
        let flood_exempt = parse_flag(fields[2])
            .ok_or_else(|| format!("users line {}: bad flood-exempt flag '{}'", line_no, fields[2]))?;
        let spoof = if fields[3].is_empty() {
            None
        } else {
            Some(fields[3].to_owned())
        };
        overrides.push(UserOverride {
            tag: tag.to_owned(),
            user_mask: fields[0].to_owned(),
            host_mask: fields[1].to_owned(),
            flood_exempt,
            spoof,
        });
    }
    Ok(overrides)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        "\
listen-host: 0.0.0.0
listen-port: 6667
server-name: irc.example.com
server-info: test server
motd: motd.txt
max-nick-length: 9
ping-time: 30
dead-time: 240
connect-attempt-time: 60
ts6-sid: \"0SH\"
admin-email: admin@example.com
opers-config: opers.conf
servers-config: servers.conf
users-config: users.conf
"
    }

    #[test]
    fn test_parse_config() {
        let config: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        assert_eq!(config.listen_port, 6667);
        assert_eq!(config.ts6_sid, "0SH");
        assert_eq!(config.listen_port_tls, None);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_validate() {
        let mut config: Config = serde_yaml::from_str(sample_yaml()).unwrap();
        config.ts6_sid = "XXX".to_owned();
        config.dead_time = 10;
        config.listen_port_tls = Some(6697);
        let errors = config.validate();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_parse_opers() {
        let opers = parse_opers(
            "# operators\n\nalice = sekrit\nbob = hunter2\n",
        )
        .unwrap();
        assert_eq!(opers.len(), 2);
        assert_eq!(opers["alice"], "sekrit");
        assert!(parse_opers("alice =\n").is_err());
    }

    #[test]
    fn test_parse_peers() {
        let peers =
            parse_peers("hub = hub.example.com,6667,linkpass,0\ntlshub = h2,6697,pw,1\n").unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(
            peers[0],
            Peer {
                name: "hub".to_owned(),
                host: "hub.example.com".to_owned(),
                port: 6667,
                password: "linkpass".to_owned(),
                tls: false,
            }
        );
        assert!(peers[1].tls);
        assert!(parse_peers("x = host,notaport,pw,0\n").is_err());
        assert!(parse_peers("x = host,6667,pw\n").is_err());
        assert!(parse_peers("x = a,1,b,0\nx = a,1,b,0\n").is_err());
    }

    #[test]
    fn test_parse_user_overrides() {
        let overrides =
            parse_user_overrides("svc = bot*,10.0.0.?,1,services.example.com\nplain = *,*,0,\n")
                .unwrap();
        assert_eq!(overrides.len(), 2);
        assert!(overrides[0].flood_exempt);
        assert_eq!(overrides[0].spoof.as_deref(), Some("services.example.com"));
        assert_eq!(overrides[1].spoof, None);
        assert!(overrides[0].matches("bot1", "10.0.0.5"));
        assert!(!overrides[0].matches("alice", "10.0.0.5"));
    }
}
