//! IRC wire protocol message parsing and generation.
//!
//! A message is an optional `:`-prefixed source, a command token, and up to
//! fifteen parameters, the last of which may be a `:`-prefixed trailing
//! parameter. Encoded lines never exceed 512 bytes including the CRLF.

use std::str;

/// Maximum encoded length of one message, including the trailing CRLF.
pub const MAX_LINE_LEN: usize = 512;

/// Maximum number of parameters in one message.
pub const MAX_PARAMS: usize = 15;

/// An IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub pfx: Option<String>,
    pub cmd: String,
    pub params: Vec<String>,
}

impl Msg {
    pub fn new(pfx: Option<String>, cmd: &str, params: Vec<String>) -> Msg {
        debug_assert!(params.len() <= MAX_PARAMS);
        Msg {
            pfx,
            cmd: cmd.to_owned(),
            params,
        }
    }

    /// Encode for the wire, "\r\n" included. The final parameter gets a
    /// leading ':' when it is empty, contains a space, or itself starts
    /// with ':'. Lines that would exceed `MAX_LINE_LEN` are truncated in
    /// the final parameter rather than refused.
    pub fn to_line(&self) -> String {
        let mut out = String::with_capacity(64);
        if let Some(ref pfx) = self.pfx {
            out.push(':');
            out.push_str(pfx);
            out.push(' ');
        }
        out.push_str(&self.cmd);
        let last_idx = self.params.len().wrapping_sub(1);
        for (idx, param) in self.params.iter().enumerate() {
            out.push(' ');
            if idx == last_idx
                && (param.is_empty() || param.contains(' ') || param.starts_with(':'))
            {
                out.push(':');
            }
            out.push_str(param);
        }
        if out.len() > MAX_LINE_LEN - 2 {
            let mut cut = MAX_LINE_LEN - 2;
            while !out.is_char_boundary(cut) {
                cut -= 1;
            }
            out.truncate(cut);
        }
        out.push_str("\r\n");
        out
    }
}

/// Try to read one message off `buf`. When a complete line is present it is
/// dropped from the buffer whether or not it parses; `None` means no
/// complete line has arrived yet.
pub fn parse_msg(buf: &mut Vec<u8>) -> Option<Result<Msg, String>> {
    let lf_idx = buf.iter().position(|b| *b == b'\n')?;
    // Tolerate both LF and CRLF termination.
    let line_end = if lf_idx > 0 && buf[lf_idx - 1] == b'\r' {
        lf_idx - 1
    } else {
        lf_idx
    };
    let ret = parse_line(&buf[..line_end], lf_idx + 1);
    buf.drain(..lf_idx + 1);
    Some(ret)
}

fn parse_line(line: &[u8], wire_len: usize) -> Result<Msg, String> {
    if wire_len > MAX_LINE_LEN {
        return Err(format!("Line exceeds {} bytes", MAX_LINE_LEN));
    }

    let mut slice = match str::from_utf8(line) {
        Ok(s) => s,
        Err(_) => return Err("Invalid bytes in message".to_owned()),
    };

    let pfx = if let Some(rest) = slice.strip_prefix(':') {
        match rest.find(' ') {
            None => return Err("Prefix without a command".to_owned()),
            Some(ws_idx) => {
                let pfx = rest[..ws_idx].to_owned();
                slice = rest[ws_idx + 1..].trim_start_matches(' ');
                Some(pfx)
            }
        }
    } else {
        None
    };

    let (cmd, rest) = match slice.find(' ') {
        None => (slice, ""),
        Some(ws_idx) => (&slice[..ws_idx], slice[ws_idx + 1..].trim_start_matches(' ')),
    };
    if cmd.is_empty() {
        return Err("Empty command".to_owned());
    }

    Ok(Msg {
        pfx,
        cmd: cmd.to_owned(),
        params: parse_params(rest),
    })
}

fn parse_params(chrs: &str) -> Vec<String> {
    let mut ret: Vec<String> = Vec::new();
    let mut slice = chrs;
    loop {
        if slice.is_empty() {
            return ret;
        }
        if let Some(trailing) = slice.strip_prefix(':') {
            ret.push(trailing.to_owned());
            return ret;
        }
        // The fifteenth parameter swallows the rest of the line.
        if ret.len() == MAX_PARAMS - 1 {
            ret.push(slice.to_owned());
            return ret;
        }
        match slice.find(' ') {
            None => {
                ret.push(slice.to_owned());
                return ret;
            }
            Some(ws_idx) => {
                ret.push(slice[..ws_idx].to_owned());
                slice = slice[ws_idx + 1..].trim_start_matches(' ');
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn parse_one(s: &str) -> Result<Msg, String> {
        let mut buf = s.as_bytes().to_vec();
        let ret = parse_msg(&mut buf).unwrap();
        assert_eq!(buf.len(), 0);
        ret
    }

    #[test]
    fn test_parse_simple() {
        let msg = parse_one("NICK bob\r\n").unwrap();
        assert_eq!(msg.pfx, None);
        assert_eq!(msg.cmd, "NICK");
        assert_eq!(msg.params, vec!["bob"]);
    }

    #[test]
    fn test_parse_prefix_and_trailing() {
        let msg = parse_one(":bob!u@host PRIVMSG #chan :a b c\r\n").unwrap();
        assert_eq!(msg.pfx.as_deref(), Some("bob!u@host"));
        assert_eq!(msg.cmd, "PRIVMSG");
        assert_eq!(msg.params, vec!["#chan", "a b c"]);
    }

    #[test]
    fn test_parse_empty_trailing() {
        let msg = parse_one("TOPIC #chan :\r\n").unwrap();
        assert_eq!(msg.params, vec!["#chan", ""]);
    }

    #[test]
    fn test_parse_lf_only() {
        let msg = parse_one("PING :x\n").unwrap();
        assert_eq!(msg.cmd, "PING");
        assert_eq!(msg.params, vec!["x"]);
    }

    #[test]
    fn test_parse_incomplete() {
        let mut buf = b"PART #chan".to_vec();
        assert_eq!(parse_msg(&mut buf), None);
        assert_eq!(buf.len(), 10);
        buf.extend_from_slice(b"\r\nJOIN");
        let msg = parse_msg(&mut buf).unwrap().unwrap();
        assert_eq!(msg.cmd, "PART");
        assert_eq!(buf, b"JOIN");
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_one("\r\n").is_err());
        assert!(parse_one(":prefixonly\r\n").is_err());
        let mut long = Vec::new();
        write!(&mut long, "PRIVMSG #chan :{}\r\n", "x".repeat(600)).unwrap();
        let mut buf = long.clone();
        assert!(parse_msg(&mut buf).unwrap().is_err());
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_param_fold_at_fifteen() {
        let line = format!("CMD {}\r\n", "a ".repeat(20).trim_end());
        let msg = parse_one(&line).unwrap();
        assert_eq!(msg.params.len(), MAX_PARAMS);
        assert_eq!(msg.params[MAX_PARAMS - 1], "a a a a a a");
    }

    #[test]
    fn test_encode_trailing_rules() {
        let msg = Msg::new(None, "PRIVMSG", vec!["#c".to_owned(), "hi there".to_owned()]);
        assert_eq!(msg.to_line(), "PRIVMSG #c :hi there\r\n");

        let msg = Msg::new(None, "TOPIC", vec!["#c".to_owned(), String::new()]);
        assert_eq!(msg.to_line(), "TOPIC #c :\r\n");

        let msg = Msg::new(None, "PRIVMSG", vec!["#c".to_owned(), ":)".to_owned()]);
        assert_eq!(msg.to_line(), "PRIVMSG #c ::)\r\n");

        let msg = Msg::new(None, "NICK", vec!["bob".to_owned()]);
        assert_eq!(msg.to_line(), "NICK bob\r\n");

        let msg = Msg::new(Some("srv".to_owned()), "PONG", vec!["srv".to_owned()]);
        assert_eq!(msg.to_line(), ":srv PONG srv\r\n");
    }

    #[test]
    fn test_encode_truncates_long_lines() {
        let msg = Msg::new(
            Some("bob!u@host".to_owned()),
            "PRIVMSG",
            vec!["#chan".to_owned(), "y".repeat(600)],
        );
        let line = msg.to_line();
        assert_eq!(line.len(), MAX_LINE_LEN);
        assert!(line.ends_with("yy\r\n"));
    }

    #[test]
    fn test_round_trip() {
        let cases: Vec<Msg> = vec![
            Msg::new(None, "NICK", vec!["bob".to_owned()]),
            Msg::new(
                Some("000AAAAAB".to_owned()),
                "PRIVMSG",
                vec!["#chan".to_owned(), "hello world".to_owned()],
            ),
            Msg::new(
                Some("000".to_owned()),
                "SJOIN",
                vec![
                    "1600000000".to_owned(),
                    "#chan".to_owned(),
                    "+ns".to_owned(),
                    "@000AAAAAA 000AAAAAB".to_owned(),
                ],
            ),
            Msg::new(None, "AWAY", vec![String::new()]),
        ];
        for msg in cases {
            let mut buf = msg.to_line().into_bytes();
            let parsed = parse_msg(&mut buf).unwrap().unwrap();
            assert_eq!(parsed, msg);
            assert_eq!(buf.len(), 0);
        }
    }
}
