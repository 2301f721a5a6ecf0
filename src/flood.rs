//! Per-user message-credit accounting. Each local user starts with a full
//! credit counter; handling a message costs one credit, and the counter
//! refills by one on every timer tick. Users out of credits have their
//! messages queued; overrunning the queue disconnects them.

use std::collections::VecDeque;

use libshrike_wire::Msg;

pub(crate) const MAX_CREDITS: u32 = 10;
pub(crate) const MAX_QUEUED: usize = 50;

/// What to do with one incoming message.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admit {
    /// Handle it now.
    Process(Msg),
    /// Stashed for a later tick.
    Queued,
    /// The user overran the queue and must be dropped.
    Excess,
}

#[derive(Debug)]
pub(crate) struct Flood {
    credits: u32,
    queue: VecDeque<Msg>,
    exempt: bool,
}

impl Flood {
    pub(crate) fn new(exempt: bool) -> Flood {
        Flood {
            credits: MAX_CREDITS,
            queue: VecDeque::new(),
            exempt,
        }
    }

    pub(crate) fn admit(&mut self, msg: Msg) -> Admit {
        if self.exempt {
            return Admit::Process(msg);
        }
        if self.credits > 0 {
            self.credits -= 1;
            return Admit::Process(msg);
        }
        if self.queue.len() >= MAX_QUEUED {
            return Admit::Excess;
        }
        self.queue.push_back(msg);
        Admit::Queued
    }

    /// One-second refill: add a credit up to the cap, then hand back queued
    /// messages in order for as long as credits remain. Exempt users still
    /// drain whatever was queued before they became exempt.
    pub(crate) fn tick(&mut self) -> Vec<Msg> {
        if self.credits < MAX_CREDITS {
            self.credits += 1;
        }
        let mut ready = Vec::new();
        loop {
            if self.queue.is_empty() {
                break;
            }
            if !self.exempt {
                if self.credits == 0 {
                    break;
                }
                self.credits -= 1;
            }
            if let Some(msg) = self.queue.pop_front() {
                ready.push(msg);
            }
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: usize) -> Msg {
        Msg::new(None, "PRIVMSG", vec!["#c".to_owned(), n.to_string()])
    }

    #[test]
    fn test_credits_then_queue_then_excess() {
        let mut flood = Flood::new(false);
        for n in 1..=10 {
            assert!(matches!(flood.admit(msg(n)), Admit::Process(_)));
        }
        for n in 11..=60 {
            assert_eq!(flood.admit(msg(n)), Admit::Queued);
        }
        assert_eq!(flood.admit(msg(61)), Admit::Excess);
    }

    #[test]
    fn test_tick_refills_and_drains_in_order() {
        let mut flood = Flood::new(false);
        for n in 1..=13 {
            flood.admit(msg(n));
        }
        // One credit per tick, one queued message drained per credit.
        let drained = flood.tick();
        assert_eq!(drained, vec![msg(11)]);
        let drained = flood.tick();
        assert_eq!(drained, vec![msg(12)]);
        let drained = flood.tick();
        assert_eq!(drained, vec![msg(13)]);
        assert!(flood.tick().is_empty());
    }

    #[test]
    fn test_refill_caps_at_max() {
        let mut flood = Flood::new(false);
        for _ in 0..20 {
            assert!(flood.tick().is_empty());
        }
        for n in 1..=10 {
            assert!(matches!(flood.admit(msg(n)), Admit::Process(_)));
        }
        assert_eq!(flood.admit(msg(11)), Admit::Queued);
    }

    #[test]
    fn test_exempt_bypasses_accounting() {
        let mut flood = Flood::new(true);
        for n in 1..=100 {
            assert!(matches!(flood.admit(msg(n)), Admit::Process(_)));
        }
    }

    #[test]
    fn test_exempt_still_drains_existing_queue() {
        let mut flood = Flood::new(false);
        for n in 1..=15 {
            flood.admit(msg(n));
        }
        flood.exempt = true;
        let drained = flood.tick();
        assert_eq!(drained.len(), 5);
        assert_eq!(drained[0], msg(11));
        assert_eq!(drained[4], msg(15));
    }
}
