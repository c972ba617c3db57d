use std::collections::VecDeque;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConsoleLine {
    #[serde(rename = "atMs")]
    pub at_ms: u64,
    pub text: String,
}

/// Bounded ring of human-readable status lines shown on the status page.
#[derive(Debug, Clone)]
pub struct ConsoleLog {
    lines: VecDeque<ConsoleLine>,
    capacity: usize,
    debug: bool,
}

impl ConsoleLog {
    pub const DEFAULT_CAPACITY: usize = 64;

    pub fn new(capacity: usize, debug: bool) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            debug,
        }
    }

    pub fn set_debug(&mut self, debug: bool) {
        self.debug = debug;
    }

    pub fn push(&mut self, at_ms: u64, text: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(ConsoleLine {
            at_ms,
            text: text.into(),
        });
    }

    /// Recorded only while debug output is enabled.
    pub fn debug(&mut self, at_ms: u64, text: impl Into<String>) {
        if self.debug {
            self.push(at_ms, text);
        }
    }

    pub fn lines(&self) -> Vec<ConsoleLine> {
        self.lines.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

impl Default for ConsoleLog {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_most_recent_lines() {
        let mut console = ConsoleLog::new(2, false);
        console.push(1, "one");
        console.push(2, "two");
        console.push(3, "three");

        let texts: Vec<String> = console.lines().into_iter().map(|line| line.text).collect();
        assert_eq!(texts, vec!["two", "three"]);
    }

    #[test]
    fn debug_lines_follow_flag() {
        let mut console = ConsoleLog::default();
        console.debug(1, "hidden");
        assert!(console.is_empty());

        console.set_debug(true);
        console.debug(2, "shown");
        assert_eq!(console.len(), 1);
    }
}
