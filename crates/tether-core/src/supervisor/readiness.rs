//! Line assembly and readiness-marker matching for child output.
//!
//! Output arrives in arbitrary chunks; [`LineBuffer`] reassembles complete
//! lines so a marker split across chunk boundaries is still seen whole.
//! [`ReadinessMatcher`] is a regex, not a literal, because upstream binaries
//! do not promise a stable output format across versions.

use regex::Regex;

/// Accumulates raw output bytes and yields complete lines.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed.
    ///
    /// Lines are split on `\n`; a trailing `\r` is dropped and invalid
    /// UTF-8 is replaced rather than rejected.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }

    /// Flush a final unterminated line, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Result of a readiness match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Readiness {
    /// Endpoint captured from the line, if the pattern has a capture group.
    pub endpoint: Option<String>,
}

/// Recognises the line announcing that a child is ready.
///
/// The endpoint is taken from a capture group named `endpoint`, or from the
/// first capture group if there is no named one.
#[derive(Debug, Clone)]
pub struct ReadinessMatcher {
    pattern: Regex,
}

impl ReadinessMatcher {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn as_str(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn check(&self, line: &str) -> Option<Readiness> {
        let caps = self.pattern.captures(line)?;
        let endpoint = caps
            .name("endpoint")
            .or_else(|| caps.get(1))
            .map(|m| m.as_str().to_string());
        Some(Readiness { endpoint })
    }
}

/// Patterns scanned for in a child's output during launch.
#[derive(Debug, Clone)]
pub struct OutputPatterns {
    pub ready: ReadinessMatcher,
    /// Lines that mean the child could not bind its assigned port.
    pub port_in_use: Option<Regex>,
}

impl OutputPatterns {
    pub fn new(ready: ReadinessMatcher) -> Self {
        Self {
            ready,
            port_in_use: None,
        }
    }

    pub fn with_port_in_use(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.port_in_use = Some(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn is_port_in_use(&self, line: &str) -> bool {
        self.port_in_use
            .as_ref()
            .is_some_and(|re| re.is_match(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &str = "# lair-keystore connection_url # unix:///tmp/ks/socket?k=AbC #";

    fn keystore_matcher() -> ReadinessMatcher {
        ReadinessMatcher::new(r"#\s*lair-keystore connection_url\s*#\s*(?P<endpoint>\S+)\s*#")
            .unwrap()
    }

    #[test]
    fn push_splits_complete_lines_and_keeps_partial() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"one\ntw"), vec!["one".to_string()]);
        assert_eq!(buf.push(b"o\r\nthree"), vec!["two".to_string()]);
        assert_eq!(buf.finish(), Some("three".to_string()));
        assert_eq!(buf.finish(), None);
    }

    #[test]
    fn push_handles_empty_lines() {
        let mut buf = LineBuffer::new();
        assert_eq!(buf.push(b"\n\nx\n"), vec!["", "", "x"]);
    }

    #[test]
    fn marker_detected_at_every_split_offset() {
        let stream = format!("starting up\nnoise line\n{MARKER}\nlater line\n");
        let bytes = stream.as_bytes();
        let matcher = keystore_matcher();

        for split in 0..=bytes.len() {
            let mut buf = LineBuffer::new();
            let mut lines = buf.push(&bytes[..split]);
            lines.extend(buf.push(&bytes[split..]));

            let hits: Vec<_> = lines.iter().filter_map(|l| matcher.check(l)).collect();
            assert_eq!(hits.len(), 1, "split at {split}");
            assert_eq!(
                hits[0].endpoint.as_deref(),
                Some("unix:///tmp/ks/socket?k=AbC"),
                "split at {split}"
            );
        }
    }

    #[test]
    fn marker_detected_when_fed_byte_by_byte() {
        let matcher = keystore_matcher();
        let mut buf = LineBuffer::new();
        let mut found = None;
        for b in format!("x\n{MARKER}\n").as_bytes() {
            for line in buf.push(std::slice::from_ref(b)) {
                if let Some(r) = matcher.check(&line) {
                    found = r.endpoint;
                }
            }
        }
        assert_eq!(found.as_deref(), Some("unix:///tmp/ks/socket?k=AbC"));
    }

    #[test]
    fn matcher_without_group_has_no_endpoint() {
        let matcher = ReadinessMatcher::new(r"(?i)conductor ready").unwrap();
        assert_eq!(
            matcher.check("[INFO] Conductor ready."),
            Some(Readiness { endpoint: None })
        );
        assert!(matcher.check("Conductor starting").is_none());
    }

    #[test]
    fn matcher_uses_first_group_when_unnamed() {
        let matcher = ReadinessMatcher::new(r"listening on (ws://\S+)").unwrap();
        let r = matcher.check("INFO listening on ws://127.0.0.1:4444 now").unwrap();
        assert_eq!(r.endpoint.as_deref(), Some("ws://127.0.0.1:4444"));
    }

    #[test]
    fn port_in_use_pattern() {
        let patterns = OutputPatterns::new(keystore_matcher())
            .with_port_in_use(r"(?i)address already in use")
            .unwrap();
        assert!(patterns.is_port_in_use("Error: Address already in use (os error 98)"));
        assert!(!patterns.is_port_in_use("all good"));
        assert!(!OutputPatterns::new(keystore_matcher()).is_port_in_use("address already in use"));
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(ReadinessMatcher::new("(unclosed").is_err());
    }
}
