//! Line-oriented classification of child server output.
//!
//! An ordered table of (predicate, constructor) pairs is evaluated top to
//! bottom; the first matching rule wins. Lines no rule recognizes are
//! forwarded verbatim as `Informational`.

use std::sync::OnceLock;

use quarry_process::LogEventKind;
use regex::Regex;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    sync::mpsc,
};

type Predicate = fn(&str) -> bool;
type Construct = fn(&str) -> Option<LogEventKind>;

const RULES: &[(Predicate, Construct)] = &[
    (is_started, |_| Some(LogEventKind::ServerStarted)),
    (is_stopping, |_| Some(LogEventKind::ServerStopping)),
    (is_eula_blocked, |_| Some(LogEventKind::EulaBlocked)),
    (is_gamerule, parse_gamerule),
    (is_player_count, parse_player_count),
];

/// Classify one decoded line. Never fails; unrecognized input becomes
/// `Informational`.
pub fn classify(line: &str) -> LogEventKind {
    for (pred, build) in RULES {
        if pred(line)
            && let Some(kind) = build(line)
        {
            return kind;
        }
    }
    LogEventKind::Informational {
        raw: line.to_string(),
    }
}

fn is_started(line: &str) -> bool {
    // e.g. [12:00:00 INFO]: Done (9.82s)! For help, type "help"
    line.contains("Done (") && line.contains(")! For help")
}

fn is_stopping(line: &str) -> bool {
    line.contains("Stopping server") || line.contains("Stopping the server")
}

fn is_eula_blocked(line: &str) -> bool {
    line.contains("You need to agree to the EULA in order to run the server")
}

fn gamerule_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[\d{2}:\d{2}:\d{2} [A-Z]+\]: Gamerule (\w+) is currently set to: (\w+)")
            .expect("gamerule regex")
    })
}

fn is_gamerule(line: &str) -> bool {
    line.contains("Gamerule ") && line.contains(" is currently set to: ")
}

fn parse_gamerule(line: &str) -> Option<LogEventKind> {
    let caps = gamerule_re().captures(line)?;
    Some(LogEventKind::GameRuleValue {
        name: caps[1].to_string(),
        value: caps[2].to_string(),
    })
}

fn player_count_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"There are (\d+) of a max(?: of)? (\d+) players online:?\s*(.*)$")
            .expect("player count regex")
    })
}

fn is_player_count(line: &str) -> bool {
    line.contains("There are ") && line.contains("players online")
}

fn spawn_area_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Preparing spawn area: (\d+)%").expect("spawn area regex"))
}

fn level_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"Preparing level "([^"]+)""#).expect("level regex"))
}

fn plugin_count_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Loading (\d+) plugins").expect("plugin count regex"))
}

/// Progress hint for lines that stay `Informational` in the event stream:
/// spawn-area preparation percentage, level preparation, plugin load
/// counters. The supervisor mirrors the hint into the entry's status
/// message until the ready marker clears it.
pub fn startup_progress(line: &str) -> Option<String> {
    if let Some(c) = spawn_area_re().captures(line) {
        return Some(format!("preparing spawn area: {}%", &c[1]));
    }
    if let Some(c) = level_re().captures(line) {
        return Some(format!("preparing level {}", &c[1]));
    }
    if let Some(c) = plugin_count_re().captures(line) {
        return Some(format!("loading {} plugins", &c[1]));
    }
    None
}

fn parse_player_count(line: &str) -> Option<LogEventKind> {
    let caps = player_count_re().captures(line)?;
    let online: u32 = caps[1].parse().ok()?;
    let max: u32 = caps[2].parse().ok()?;
    let names: Vec<String> = caps[3]
        .split(',')
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .collect();
    Some(LogEventKind::PlayerCount { online, max, names })
}

/// Decode one raw line from the child's stream.
///
/// The child generally writes in its own platform encoding; valid UTF-8 is
/// taken as-is and anything else falls back to a lossy universal decode so a
/// single bad line can never kill the scan loop. Returns the decoded text
/// and whether the fallback was used.
pub(crate) fn decode_line(bytes: &[u8]) -> (String, bool) {
    let trimmed = trim_line_ending(bytes);
    match std::str::from_utf8(trimmed) {
        Ok(s) => (s.to_string(), false),
        Err(_) => (String::from_utf8_lossy(trimmed).into_owned(), true),
    }
}

fn trim_line_ending(bytes: &[u8]) -> &[u8] {
    let mut end = bytes.len();
    while end > 0 && (bytes[end - 1] == b'\n' || bytes[end - 1] == b'\r') {
        end -= 1;
    }
    &bytes[..end]
}

/// Pump raw line bytes from one child stream into `tx`.
///
/// EOF ends the task silently (it usually means the child exited). An I/O
/// error ends the task for this stream only and is reported once.
pub(crate) fn spawn_byte_reader<R>(stream: R, tx: mpsc::UnboundedSender<Vec<u8>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        loop {
            let mut buf = Vec::new();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(buf).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(error = %err, "child output stream failed; ending scan");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_gamerule_report() {
        let kind = classify("[12:00:00 INFO]: Gamerule doDaylightCycle is currently set to: false");
        assert_eq!(
            kind,
            LogEventKind::GameRuleValue {
                name: "doDaylightCycle".to_string(),
                value: "false".to_string(),
            }
        );
    }

    #[test]
    fn classifies_integer_gamerule_value() {
        let kind = classify("[09:15:42 INFO]: Gamerule randomTickSpeed is currently set to: 3");
        assert_eq!(
            kind,
            LogEventKind::GameRuleValue {
                name: "randomTickSpeed".to_string(),
                value: "3".to_string(),
            }
        );
    }

    #[test]
    fn classifies_started_marker() {
        let kind = classify("[12:00:00 INFO]: Done (9.82s)! For help, type \"help\"");
        assert_eq!(kind, LogEventKind::ServerStarted);
    }

    #[test]
    fn classifies_stopping_marker() {
        let kind = classify("[12:00:00 INFO]: Stopping server");
        assert_eq!(kind, LogEventKind::ServerStopping);
    }

    #[test]
    fn classifies_eula_block() {
        let kind = classify(
            "[12:00:00 INFO]: You need to agree to the EULA in order to run the server. \
             Go to eula.txt for more info.",
        );
        assert_eq!(kind, LogEventKind::EulaBlocked);
    }

    #[test]
    fn classifies_player_count_with_names() {
        let kind = classify("There are 2 of a max of 20 players online: alice, bob");
        assert_eq!(
            kind,
            LogEventKind::PlayerCount {
                online: 2,
                max: 20,
                names: vec!["alice".to_string(), "bob".to_string()],
            }
        );
    }

    #[test]
    fn classifies_empty_player_list() {
        let kind = classify("[12:00:00 INFO]: There are 0 of a max of 20 players online:");
        assert_eq!(
            kind,
            LogEventKind::PlayerCount {
                online: 0,
                max: 20,
                names: vec![],
            }
        );
    }

    #[test]
    fn startup_progress_hints_are_extracted() {
        assert_eq!(
            startup_progress("[12:00:00 INFO]: Preparing spawn area: 42%"),
            Some("preparing spawn area: 42%".to_string())
        );
        assert_eq!(
            startup_progress("[12:00:00 INFO]: Preparing level \"world\""),
            Some("preparing level world".to_string())
        );
        assert_eq!(
            startup_progress("[12:00:00 INFO]: Loading 14 plugins"),
            Some("loading 14 plugins".to_string())
        );
        assert_eq!(startup_progress("[12:00:00 INFO]: plain chatter"), None);
    }

    #[test]
    fn progress_lines_stay_informational_in_the_event_stream() {
        // Progress is a status hint, not a typed event.
        let kind = classify("[12:00:00 INFO]: Preparing spawn area: 42%");
        assert!(matches!(kind, LogEventKind::Informational { .. }));
        let kind = classify("[12:00:00 INFO]: Loading 14 plugins");
        assert!(matches!(kind, LogEventKind::Informational { .. }));
    }

    #[test]
    fn unmatched_lines_are_informational() {
        let kind = classify("[12:00:00 INFO]: Preparing spawn area: 42%");
        assert_eq!(
            kind,
            LogEventKind::Informational {
                raw: "[12:00:00 INFO]: Preparing spawn area: 42%".to_string(),
            }
        );
    }

    #[test]
    fn first_match_wins_over_later_rules() {
        // A pathological line matching both the started and stopping
        // predicates must resolve to the earlier table entry.
        let kind = classify("Done (1s)! For help while Stopping server");
        assert_eq!(kind, LogEventKind::ServerStarted);
    }

    #[test]
    fn decode_strips_line_endings() {
        let (line, lossy) = decode_line(b"hello world\r\n");
        assert_eq!(line, "hello world");
        assert!(!lossy);
    }

    #[test]
    fn decode_recovers_from_invalid_utf8() {
        let (line, lossy) = decode_line(&[0xff, 0xfe, b'o', b'k', b'\n']);
        assert!(lossy);
        assert!(line.ends_with("ok"));
    }
}
