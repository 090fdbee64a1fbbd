//! Section routing for the flat bugreport text.
//!
//! Dumpstate delimits subsections with banner lines such as
//! `------ SYSTEM LOG (logcat -v threadtime ...) ------`. Only the logcat
//! buffers are forwarded to the line parser; everything else feeds the
//! device scanner. A raw logcat capture with no banners at all is treated
//! as one logcat stream.

use once_cell::sync::Lazy;
use regex::Regex;

static SECTION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^-{4,}\s+(?P<name>[^(]+?)\s*(?:\(.*\))?\s*-{4,}\s*$").unwrap());

const LOGCAT_BUFFERS: &[&str] = &["SYSTEM", "MAIN", "EVENT", "RADIO", "CRASH", "KERNEL"];

/// Extract the section name from a banner line, if this is one.
pub fn section_name(line: &str) -> Option<&str> {
    if !line.starts_with("--") {
        return None;
    }
    SECTION_RE
        .captures(line)
        .and_then(|c| c.name("name"))
        .map(|m| m.as_str().trim())
}

/// Does this section name denote a logcat buffer?
pub fn is_logcat_section(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    upper.contains("LOG") && LOGCAT_BUFFERS.iter().any(|b| upper.contains(b))
}

/// Where a line belongs in the forwarding scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Before the first banner: feed both the device scanner and the line
    /// parser. Makes bare logcat captures (no banners at all) ingestible.
    Unsectioned,
    /// Feed the line parser.
    Logcat,
    /// Feed the device scanner.
    Preamble,
    /// A banner line; consumed by the tracker itself.
    Banner,
}

/// State machine over the line stream.
///
/// Before the first banner the stream is unsectioned: lines go to both the
/// preamble scanner and (if they parse) the logcat parser, which is what
/// makes bare logcat dumps work. After the first banner, gating is strict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Head,
    InLogcat,
    InOther,
}

pub struct SectionTracker {
    state: State,
    logcat_sections_seen: usize,
}

impl SectionTracker {
    pub fn new() -> Self {
        Self {
            state: State::Head,
            logcat_sections_seen: 0,
        }
    }

    /// Route one line, updating section state on banners.
    pub fn route(&mut self, line: &str) -> Route {
        if let Some(name) = section_name(line) {
            if is_logcat_section(name) {
                self.state = State::InLogcat;
                self.logcat_sections_seen += 1;
            } else {
                self.state = State::InOther;
            }
            return Route::Banner;
        }
        match self.state {
            State::Head => Route::Unsectioned,
            State::InLogcat => Route::Logcat,
            State::InOther => Route::Preamble,
        }
    }

    /// In the headless case the whole stream counted as logcat.
    pub fn saw_explicit_sections(&self) -> bool {
        self.state != State::Head
    }

    pub fn logcat_sections_seen(&self) -> usize {
        self.logcat_sections_seen
    }
}

impl Default for SectionTracker {
    fn default() -> Self {
        Self::new()
    }
}
