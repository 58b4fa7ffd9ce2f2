//! Kernel log transcript captured during the boot probe.

use std::sync::LazyLock;

use regex::Regex;

static PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[[^\]]*\] firmadyne: ").expect("static regex")
});

/// Remove the `[<timestamp>] firmadyne: ` prefix (repeatedly) and any
/// trailing carriage return.
pub fn strip_line(line: &str) -> &str {
    let mut line = line.trim_end_matches('\r');
    while let Some(m) = PREFIX.find(line) {
        line = &line[m.end()..];
    }
    line
}

/// Ordered, read-only kernel log lines.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    lines: Vec<String>,
}

impl Transcript {
    pub fn from_text(text: &str) -> Self {
        Self {
            lines: text.split('\n').map(|l| strip_line(l).to_string()).collect(),
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.iter().all(|l| l.is_empty())
    }
}
