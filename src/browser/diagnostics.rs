//! Diagnostics scanner — parses the child's diagnostic stream for the
//! ready/license/transport-upgrade signals.
//!
//! Accumulates into a bounded sliding-window buffer so a token split across
//! two reads (e.g. `"REA"` then `"DY\n"`) is still recognized. Matching is
//! line-based and boundary-aware: `READY` must be the entire trimmed line,
//! so it never fires from the longer token `MULTI_IPC_READY`.

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

static MULTI_IPC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^MULTI_IPC_READY\s+(\S+)$").unwrap());
static LICENSE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(LICENSE REQUIRED|License validation failed|license to run)").unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticsEvent {
    Ready,
    LicenseError { detail: Option<String> },
    TransportUpgrade { socket_path: String },
}

/// Incremental line scanner over an arbitrarily-chunked byte stream.
pub struct DiagnosticsScanner {
    window: Vec<u8>,
    max_window: usize,
}

impl DiagnosticsScanner {
    pub fn new(max_window: usize) -> Self {
        Self {
            window: Vec::new(),
            max_window,
        }
    }

    /// Feed a chunk of bytes and return any complete-line events recognized
    /// so far. An unterminated trailing line is retained for the next feed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DiagnosticsEvent> {
        self.window.extend_from_slice(chunk);
        let mut events = Vec::new();
        loop {
            let Some(pos) = self.window.iter().position(|&b| b == b'\n') else {
                break;
            };
            let line_bytes: Vec<u8> = self.window.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(event) = classify_line(line) {
                events.push(event);
            }
        }
        // Cap the window so a line that never terminates cannot grow
        // unbounded; the remainder is simply discarded from the front.
        if self.window.len() > self.max_window {
            let excess = self.window.len() - self.max_window;
            self.window.drain(..excess);
        }
        events
    }
}

/// Boundary-aware classification of one complete line (no trailing newline).
pub fn classify_line(line: &str) -> Option<DiagnosticsEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed == "READY" {
        return Some(DiagnosticsEvent::Ready);
    }
    if let Some(caps) = MULTI_IPC_RE.captures(trimmed) {
        let path = caps.get(1).unwrap().as_str().to_string();
        return Some(DiagnosticsEvent::TransportUpgrade { socket_path: path });
    }
    if LICENSE_RE.is_match(trimmed) {
        return Some(DiagnosticsEvent::LicenseError {
            detail: Some(trimmed.to_string()),
        });
    }
    None
}

/// Drain `reader` into a `DiagnosticsScanner`, forwarding each recognized
/// event on `tx`. Returns when the stream hits EOF or an I/O error.
pub async fn run_scanner<R: AsyncRead + Unpin>(
    mut reader: R,
    max_window: usize,
    tx: mpsc::UnboundedSender<DiagnosticsEvent>,
) {
    let mut scanner = DiagnosticsScanner::new(max_window);
    let mut buf = [0u8; 4096];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("diagnostics stream closed");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(err = %e, "diagnostics stream read error");
                break;
            }
        };
        for event in scanner.feed(&buf[..n]) {
            if tx.send(event).is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_standalone_ready() {
        let mut s = DiagnosticsScanner::new(16 * 1024);
        let events = s.feed(b"READY\n");
        assert_eq!(events, vec![DiagnosticsEvent::Ready]);
    }

    #[test]
    fn does_not_fire_ready_from_multi_ipc_ready_substring() {
        let mut s = DiagnosticsScanner::new(16 * 1024);
        let events = s.feed(b"MULTI_IPC_READY /tmp/a.sock\n");
        assert_eq!(
            events,
            vec![DiagnosticsEvent::TransportUpgrade {
                socket_path: "/tmp/a.sock".to_string()
            }]
        );
    }

    #[test]
    fn recognizes_license_marker_anywhere_in_line() {
        let mut s = DiagnosticsScanner::new(16 * 1024);
        let events = s.feed(b"fatal: License validation failed for key XYZ\n");
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], DiagnosticsEvent::LicenseError { .. }));
    }

    #[test]
    fn split_token_across_two_feeds_is_still_recognized() {
        let mut s = DiagnosticsScanner::new(16 * 1024);
        assert!(s.feed(b"REA").is_empty());
        let events = s.feed(b"DY\n");
        assert_eq!(events, vec![DiagnosticsEvent::Ready]);
    }

    #[test]
    fn interleaved_lines_both_recognized_regardless_of_order() {
        let mut s = DiagnosticsScanner::new(16 * 1024);
        let events = s.feed(b"MULTI_IPC_READY /tmp/x.sock\nREADY\n");
        assert_eq!(events.len(), 2);
        assert!(events.contains(&DiagnosticsEvent::Ready));
        assert!(events.contains(&DiagnosticsEvent::TransportUpgrade {
            socket_path: "/tmp/x.sock".to_string()
        }));
    }

    #[test]
    fn window_is_bounded_for_a_line_that_never_terminates() {
        let mut s = DiagnosticsScanner::new(64);
        let junk = vec![b'x'; 1000];
        let events = s.feed(&junk);
        assert!(events.is_empty());
        assert!(s.window.len() <= 64);
    }
}

#[cfg(test)]
mod boundary_safety_proptests {
    use super::*;
    use proptest::prelude::*;

    /// Fed any interleaving of `MULTI_IPC_READY /tmp/a.sock\n` and
    /// `READY\n` split across an arbitrary chunk boundary, the scanner
    /// recognizes both lines and never produces a spurious `Ready` event
    /// from the substring inside `MULTI_IPC_READY`.
    proptest! {
        #[test]
        fn boundary_safe_regardless_of_split_point(split in 0usize..64) {
            let full = b"MULTI_IPC_READY /tmp/a.sock\nREADY\n";
            let split = split.min(full.len());
            let mut scanner = DiagnosticsScanner::new(16 * 1024);
            let mut events = scanner.feed(&full[..split]);
            events.extend(scanner.feed(&full[split..]));

            let ready_count = events.iter().filter(|e| matches!(e, DiagnosticsEvent::Ready)).count();
            let upgrade_count = events
                .iter()
                .filter(|e| matches!(e, DiagnosticsEvent::TransportUpgrade { .. }))
                .count();
            prop_assert_eq!(ready_count, 1);
            prop_assert_eq!(upgrade_count, 1);
        }

        #[test]
        fn ready_only_fires_on_exact_line_match(prefix in "[A-Z_ ]{0,20}") {
            // Any line that embeds READY as a substring but isn't exactly
            // "READY" must not be classified as Ready.
            let mut line = prefix.clone();
            line.push_str("READY");
            if line == "READY" {
                return Ok(());
            }
            let event = classify_line(&line);
            prop_assert!(!matches!(event, Some(DiagnosticsEvent::Ready)));
        }
    }
}
