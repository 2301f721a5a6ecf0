//! Common protocol vocabulary shared by the shrike crates: canonical
//! (case-folded) name handling, server and user identifiers, and mode sets.

use std::fmt;

// Used to normalize nicks and channel names. Rules are:
//
// - ASCII uppercase letters are mapped to their lowercase versions
// - '[', ']', '\\' are mapped to '{', '}', '|', following the byte pairing
//   of RFC 1459 casemapping. The '~'/'^' pair is not applied.
// - Everything else is left unchanged.
fn to_lower(c: char) -> char {
    match c {
        '[' => '{',
        ']' => '}',
        '\\' => '|',
        _ => c.to_ascii_lowercase(),
    }
}

/// Comparison form of a nick or channel name. Index keys are produced by
/// this; display forms keep the original casing.
pub fn canonicalize(name: &str) -> String {
    name.chars().map(to_lower).collect()
}

/// A nick is ASCII letters, digits and underscores, does not start with a
/// digit, and is at most `max_len` bytes.
pub fn valid_nick(nick: &str, max_len: usize) -> bool {
    if nick.is_empty() || nick.len() > max_len {
        return false;
    }
    let first = nick.as_bytes()[0];
    if first.is_ascii_digit() {
        return false;
    }
    nick.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Channel names start with '#' followed by 1 to 49 bytes of letters,
/// digits, underscores and dashes.
pub fn valid_channel(name: &str) -> bool {
    let rest = match name.strip_prefix('#') {
        None => return false,
        Some(rest) => rest,
    };
    !rest.is_empty()
        && rest.len() <= 49
        && rest
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// SID shape: `[0-9][0-9A-Z]{2}`.
pub fn valid_sid(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() == 3
        && bytes[0].is_ascii_digit()
        && bytes[1..]
            .iter()
            .all(|b| b.is_ascii_digit() || b.is_ascii_uppercase())
}

/// Three-character server identifier, unique within the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Sid(String);

impl Sid {
    pub fn new(s: &str) -> Option<Sid> {
        if valid_sid(s) {
            Some(Sid(s.to_owned()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Nine-character user identifier: the originating server's SID followed by
/// a six-character local id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uid(String);

impl Uid {
    pub fn new(s: &str) -> Option<Uid> {
        let bytes = s.as_bytes();
        if bytes.len() != 9 || !valid_sid(&s[..3]) {
            return None;
        }
        if !bytes[3].is_ascii_uppercase() {
            return None;
        }
        if !bytes[4..]
            .iter()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit())
        {
            return None;
        }
        Some(Uid(s.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The SID of the server the user is attached to.
    pub fn sid_str(&self) -> &str {
        &self.0[..3]
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Number of distinct local ids one server can issue: 26 * 36^5.
pub const MAX_LOCAL_IDS: u64 = 26 * 36 * 36 * 36 * 36 * 36;

const UID_DIGITS: &[u8; 36] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

// Base-36 rendering of a local id over the digit set A-Z0-9. The first
// character only ranges over 'A'..='Z' because ids stop at MAX_LOCAL_IDS.
fn local_id(mut id: u64) -> String {
    debug_assert!(id < MAX_LOCAL_IDS);
    let mut out = [0u8; 6];
    for slot in out.iter_mut().rev() {
        *slot = UID_DIGITS[(id % 36) as usize];
        id /= 36;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Allocates UIDs for users attached to this server. Ids are never reused
/// within a process lifetime; running out is fatal for the daemon.
#[derive(Debug)]
pub struct UidGen {
    sid: Sid,
    next: u64,
}

impl UidGen {
    pub fn new(sid: Sid) -> UidGen {
        UidGen { sid, next: 0 }
    }

    /// Next UID, or `None` once the local id space is exhausted.
    pub fn next_uid(&mut self) -> Option<Uid> {
        if self.next >= MAX_LOCAL_IDS {
            return None;
        }
        let id = self.next;
        self.next += 1;
        Some(Uid(format!("{}{}", self.sid.as_str(), local_id(id))))
    }
}

/// Per-user mode flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserModes {
    /// `+i`, set at registration and never toggled afterwards.
    pub invisible: bool,
    /// `+o`, granted by OPER.
    pub oper: bool,
    /// `+C`, operators receive local connect/disconnect notices.
    pub conn_notices: bool,
}

impl UserModes {
    /// Reads a burst-style mode string ("+io"). Unknown flags are ignored.
    pub fn parse(s: &str) -> UserModes {
        let mut modes = UserModes::default();
        for c in s.chars() {
            match c {
                'i' => modes.invisible = true,
                'o' => modes.oper = true,
                'C' => modes.conn_notices = true,
                _ => {}
            }
        }
        modes
    }
}

impl fmt::Display for UserModes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("+")?;
        if self.invisible {
            f.write_str("i")?;
        }
        if self.oper {
            f.write_str("o")?;
        }
        if self.conn_notices {
            f.write_str("C")?;
        }
        Ok(())
    }
}

/// Per-channel mode flags. New channels start `+ns`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChanModes {
    /// `+n`, no messages from outside the channel.
    pub no_external: bool,
    /// `+s`, secret.
    pub secret: bool,
}

impl ChanModes {
    pub fn defaults() -> ChanModes {
        ChanModes {
            no_external: true,
            secret: true,
        }
    }

    pub fn none() -> ChanModes {
        ChanModes {
            no_external: false,
            secret: false,
        }
    }

    /// Reads an SJOIN-style mode string ("+ns"). Unknown flags are ignored.
    pub fn parse(s: &str) -> ChanModes {
        let mut modes = ChanModes::none();
        for c in s.chars() {
            match c {
                'n' => modes.no_external = true,
                's' => modes.secret = true,
                _ => {}
            }
        }
        modes
    }
}

impl fmt::Display for ChanModes {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("+")?;
        if self.no_external {
            f.write_str("n")?;
        }
        if self.secret {
            f.write_str("s")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize("ABC"), "abc");
        assert_eq!(canonicalize("a12"), "a12");
        assert_eq!(canonicalize("[]\\~"), "{}|~");
        assert_eq!(canonicalize("#Chan"), "#chan");
    }

    #[test]
    fn test_valid_nick() {
        assert!(valid_nick("bob", 9));
        assert!(valid_nick("bob_1", 9));
        assert!(valid_nick("_bob", 9));
        assert!(!valid_nick("", 9));
        assert!(!valid_nick("1bob", 9));
        assert!(!valid_nick("bob!", 9));
        assert!(!valid_nick("toolongnick", 9));
        assert!(!valid_nick("bob cat", 9));
    }

    #[test]
    fn test_valid_channel() {
        assert!(valid_channel("#test"));
        assert!(valid_channel("#a-b_c9"));
        assert!(!valid_channel("test"));
        assert!(!valid_channel("#"));
        assert!(!valid_channel("#with space"));
        assert!(!valid_channel(&format!("#{}", "x".repeat(50))));
    }

    #[test]
    fn test_valid_sid() {
        assert!(valid_sid("000"));
        assert!(valid_sid("1AB"));
        assert!(!valid_sid("A00"));
        assert!(!valid_sid("00"));
        assert!(!valid_sid("0ab"));
    }

    #[test]
    fn test_uid_validation() {
        assert!(Uid::new("000AAAAAA").is_some());
        assert!(Uid::new("1ABZ9X0Y2").is_some());
        assert!(Uid::new("000AAAAA").is_none());
        assert!(Uid::new("A00AAAAAA").is_none());
        assert!(Uid::new("0000AAAAA").is_none());
        assert_eq!(Uid::new("000AAAAAB").unwrap().sid_str(), "000");
    }

    #[test]
    fn test_uid_sequence() {
        let sid = Sid::new("000").unwrap();
        let mut gen = UidGen::new(sid);
        assert_eq!(gen.next_uid().unwrap().as_str(), "000AAAAAA");
        for _ in 1..25 {
            gen.next_uid().unwrap();
        }
        assert_eq!(gen.next_uid().unwrap().as_str(), "000AAAAAZ");
        assert_eq!(gen.next_uid().unwrap().as_str(), "000AAAAA0");
        for _ in 27..35 {
            gen.next_uid().unwrap();
        }
        assert_eq!(gen.next_uid().unwrap().as_str(), "000AAAAA9");
        assert_eq!(gen.next_uid().unwrap().as_str(), "000AAAABA");
    }

    #[test]
    fn test_uid_exhaustion() {
        let sid = Sid::new("000").unwrap();
        let mut gen = UidGen::new(sid);
        gen.next = MAX_LOCAL_IDS - 1;
        assert_eq!(gen.next_uid().unwrap().as_str(), "000Z99999");
        assert_eq!(gen.next_uid(), None);
        assert_eq!(gen.next_uid(), None);
    }

    #[test]
    fn test_user_modes() {
        let mut modes = UserModes::default();
        modes.invisible = true;
        assert_eq!(modes.to_string(), "+i");
        modes.oper = true;
        modes.conn_notices = true;
        assert_eq!(modes.to_string(), "+ioC");
        assert_eq!(UserModes::parse("+ioC"), modes);
        assert_eq!(UserModes::parse("+ixw").invisible, true);
        assert_eq!(UserModes::parse("+ixw").oper, false);
    }

    #[test]
    fn test_chan_modes() {
        assert_eq!(ChanModes::defaults().to_string(), "+ns");
        assert_eq!(ChanModes::parse("+ns"), ChanModes::defaults());
        assert_eq!(ChanModes::parse("+n").secret, false);
    }
}
