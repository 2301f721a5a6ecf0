//! Administrative bans. A K-line is a `(user-mask, host-mask)` pair with
//! `*` and `?` wildcards; a user is banned when both masks match.

use regex::Regex;

#[derive(Debug)]
pub(crate) struct Kline {
    pub(crate) user_mask: String,
    pub(crate) host_mask: String,
    pub(crate) reason: String,
    user_re: Regex,
    host_re: Regex,
}

impl Kline {
    pub(crate) fn new(user_mask: &str, host_mask: &str, reason: &str) -> Result<Kline, regex::Error> {
        Ok(Kline {
            user_mask: user_mask.to_owned(),
            host_mask: host_mask.to_owned(),
            reason: reason.to_owned(),
            user_re: mask_to_regex(user_mask)?,
            host_re: mask_to_regex(host_mask)?,
        })
    }

    pub(crate) fn matches(&self, username: &str, hostname: &str) -> bool {
        self.user_re.is_match(username) && self.host_re.is_match(hostname)
    }

    /// K-lines are identified by their mask pair.
    pub(crate) fn same_masks(&self, user_mask: &str, host_mask: &str) -> bool {
        self.user_mask == user_mask && self.host_mask == host_mask
    }
}

/// Compiles a wildcard mask into an anchored regex: metacharacters are
/// quoted first, then the quoted `\*` and `\?` become `.*` and `.`.
fn mask_to_regex(mask: &str) -> Result<Regex, regex::Error> {
    let quoted = regex::escape(mask);
    let pattern = quoted.replace("\\*", ".*").replace("\\?", ".");
    Regex::new(&format!("^{}$", pattern))
}

/// One-off wildcard match, used for the user-override table.
pub(crate) fn mask_match(mask: &str, s: &str) -> bool {
    match mask_to_regex(mask) {
        Ok(re) => re.is_match(s),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcards() {
        let kl = Kline::new("*", "*.badnet.example", "spam").unwrap();
        assert!(kl.matches("bob", "host1.badnet.example"));
        assert!(kl.matches("anyone", "a.b.badnet.example"));
        assert!(!kl.matches("bob", "badnet.example"));
        assert!(!kl.matches("bob", "host1.goodnet.example"));
    }

    #[test]
    fn test_question_mark() {
        let kl = Kline::new("bob?", "*", "no").unwrap();
        assert!(kl.matches("bob1", "x"));
        assert!(kl.matches("bobb", "x"));
        assert!(!kl.matches("bob", "x"));
        assert!(!kl.matches("bob12", "x"));
    }

    #[test]
    fn test_metacharacters_are_literal() {
        // The dots in a hostname mask must not act as regex dots.
        let kl = Kline::new("*", "a.b", "x").unwrap();
        assert!(kl.matches("u", "a.b"));
        assert!(!kl.matches("u", "aXb"));
    }

    #[test]
    fn test_both_masks_must_match() {
        let kl = Kline::new("evil*", "*.example", "x").unwrap();
        assert!(kl.matches("evilbob", "h.example"));
        assert!(!kl.matches("bob", "h.example"));
        assert!(!kl.matches("evilbob", "h.other"));
    }

    #[test]
    fn test_mask_match() {
        assert!(mask_match("*", "anything"));
        assert!(mask_match("10.0.?.1", "10.0.5.1"));
        assert!(!mask_match("10.0.?.1", "10.0.55.1"));
    }
}
