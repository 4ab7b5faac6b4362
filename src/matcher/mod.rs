//! Log-line matching and field extraction.
//!
//! Matching is driven by one declarative combined-log-format pattern with
//! named capture groups; [`LogPatternFields`] holds the per-field regex
//! fragments and lets a matcher variant tighten individual fields (method,
//! path, status, user-agent) without restating the whole pattern.
//!
//! A line that fails the structural pattern is silently skipped - it is
//! some other kind of request, or not a log line at all. A line that
//! matches structurally but cannot be converted into a typed record is
//! reported and skipped; one bad line never aborts a run.

use std::collections::HashMap;
use std::io;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use thiserror::Error;
use tracing::warn;

use crate::models::{CountmeItem, LogRecord, MirrorItem, UNIQUE_IP_SYS_AGE};
use crate::weeks::{parse_log_time, TimeParseError};

/// An HTTP header token, per RFC 7230: printable ASCII minus separators.
const HTTP_TOKEN_PATTERN: &str = r"[\w\#$%^!&'*+.`|~-]+";

/// User-agent signature of libdnf and rpm-ostree clients:
/// `product[/version] (os_name os_version; os_variant; os_canon.os_arch)`.
///
/// `os_name` may contain spaces and non-ASCII text; the version and variant
/// segments are lowercase-alnum-ish tokens bounded by semicolons.
pub const COUNTME_USER_AGENT_PATTERN: &str = r"(?P<product>(?:libdnf|rpm-ostree)(?:/(?P<product_version>\S+))?)\s+\((?P<os_name>.*)\s(?P<os_version>[0-9a-z._-]*?);\s(?P<os_variant>[0-9a-z._-]*);\s(?P<os_canon>[\w./]+)\.(?P<os_arch>\w+)\)";

/// Whether the request target's query string must be present for a line to
/// match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryPresence {
    Optional,
    Required,
}

/// Per-field regex fragments for the combined log format. `compile` stitches
/// them into a full anchored line pattern with named capture groups.
#[derive(Debug, Clone)]
pub struct LogPatternFields {
    pub host: &'static str,
    pub identity: &'static str,
    pub user: &'static str,
    pub time: &'static str,
    pub method: &'static str,
    pub path: &'static str,
    pub query: &'static str,
    pub query_presence: QueryPresence,
    pub protocol: &'static str,
    pub status: &'static str,
    pub nbytes: &'static str,
    pub referrer: &'static str,
    pub user_agent: &'static str,
}

impl Default for LogPatternFields {
    fn default() -> Self {
        Self {
            host: r"\S+",
            identity: r"\S+",
            user: r"\S+",
            time: r".+?",
            method: HTTP_TOKEN_PATTERN,
            path: r"[^\s\?]+",
            query: r"\S*",
            query_presence: QueryPresence::Optional,
            protocol: r"HTTP/\d\.\d",
            status: r"\d+",
            nbytes: r"\d+|-",
            referrer: r#"[^"]+"#,
            user_agent: r".+?",
        }
    }
}

impl LogPatternFields {
    /// Compile the full line pattern. Panics only on an invalid field
    /// fragment, which is a programming error caught by the pattern tests.
    pub fn compile(&self) -> Regex {
        let query = match self.query_presence {
            QueryPresence::Optional => format!(r"(?:\?(?P<query>{}))?", self.query),
            QueryPresence::Required => format!(r"\?(?P<query>{})", self.query),
        };
        let pattern = format!(
            r#"^(?P<host>{host})\s(?P<identity>{identity})\s(?P<user>{user})\s\[(?P<time>{time})\]\s"(?P<method>{method})\s(?P<path>{path}){query}\s(?P<protocol>{protocol})"\s(?P<status>{status})\s(?P<nbytes>{nbytes})\s"(?P<referrer>{referrer})"\s"(?P<user_agent>{user_agent})"\s*$"#,
            host = self.host,
            identity = self.identity,
            user = self.user,
            time = self.time,
            method = self.method,
            path = self.path,
            query = query,
            protocol = self.protocol,
            status = self.status,
            nbytes = self.nbytes,
            referrer = self.referrer,
            user_agent = self.user_agent,
        );
        Regex::new(&pattern).expect("invalid log pattern fragment")
    }
}

/// Matches any well-formed combined-log-format line.
pub static LOG_RE: LazyLock<Regex> = LazyLock::new(|| LogPatternFields::default().compile());

/// Matches all mirrorlist/metalink hits, regardless of client or status.
static MIRRORS_LOG_RE: LazyLock<Regex> = LazyLock::new(|| {
    LogPatternFields {
        path: r"/metalink|/mirrorlist",
        ..LogPatternFields::default()
    }
    .compile()
});

/// Matches countme-relevant lines: GET/HEAD on /metalink or /mirrorlist with
/// a query string, status 200 or 302, and a libdnf/rpm-ostree user-agent.
static COUNTME_LOG_RE: LazyLock<Regex> = LazyLock::new(|| {
    LogPatternFields {
        method: "GET|HEAD",
        path: r"/metalink|/mirrorlist",
        query_presence: QueryPresence::Required,
        status: "200|302",
        user_agent: COUNTME_USER_AGENT_PATTERN,
        ..LogPatternFields::default()
    }
    .compile()
});

/// The user-agent signature on its own, for callers that already hold the
/// header value.
pub static COUNTME_USER_AGENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(COUNTME_USER_AGENT_PATTERN).expect("invalid user-agent pattern"));

/// Parse a query string the way the mirrorlist request router does:
/// form-urlencoded, last value wins for repeated keys.
pub fn parse_query(query: &str) -> HashMap<String, String> {
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

fn cap<'t>(caps: &Captures<'t>, name: &str) -> &'t str {
    caps.name(name).map_or("", |m| m.as_str())
}

/// A structurally matched line whose fields could not be converted into a
/// typed record.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error(transparent)]
    Time(#[from] TimeParseError),
    #[error("unparseable countme value {0:?}")]
    SysAge(String),
}

/// Which matcher variant to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Countme,
    Mirrors,
}

/// A typed record extracted from one log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Countme(CountmeItem),
    Mirror(MirrorItem),
}

/// Classifies lines against the pattern selected by its [`MatchMode`] and
/// extracts typed records.
#[derive(Debug, Clone, Copy)]
pub struct LogMatcher {
    mode: MatchMode,
}

impl LogMatcher {
    pub fn new(mode: MatchMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> MatchMode {
        self.mode
    }

    /// Try to extract a typed record from one line.
    ///
    /// Returns `None` when the line does not match the structural pattern,
    /// `Some(Err(..))` when it matches but a field fails conversion.
    pub fn try_extract(&self, line: &str) -> Option<Result<LogEvent, MatchError>> {
        match self.mode {
            MatchMode::Countme => {
                let caps = COUNTME_LOG_RE.captures(line)?;
                Some(make_countme_item(&caps).map(LogEvent::Countme))
            }
            MatchMode::Mirrors => {
                let caps = MIRRORS_LOG_RE.captures(line)?;
                Some(make_mirror_item(&caps).map(LogEvent::Mirror))
            }
        }
    }

    /// Wrap a line source into a lazy stream of typed records. Conversion
    /// failures are reported via `tracing` and skipped; I/O errors from the
    /// underlying source are yielded to the caller.
    pub fn match_lines<I>(self, lines: I) -> MatchedLines<I>
    where
        I: Iterator<Item = io::Result<String>>,
    {
        MatchedLines {
            matcher: self,
            lines,
        }
    }
}

fn make_countme_item(caps: &Captures<'_>) -> Result<CountmeItem, MatchError> {
    let timestamp = parse_log_time(cap(caps, "time"))?;
    let query = parse_query(cap(caps, "query"));
    let sys_age = match query.get("countme") {
        Some(value) => value
            .parse::<i64>()
            .map_err(|_| MatchError::SysAge(value.clone()))?,
        None => UNIQUE_IP_SYS_AGE,
    };
    Ok(CountmeItem {
        timestamp,
        host: cap(caps, "host").to_string(),
        os_name: cap(caps, "os_name").to_string(),
        os_version: cap(caps, "os_version").to_string(),
        os_variant: cap(caps, "os_variant").to_string(),
        os_arch: cap(caps, "os_arch").to_string(),
        sys_age,
        repo_tag: query.get("repo").cloned(),
        repo_arch: query.get("arch").cloned(),
    })
}

fn make_mirror_item(caps: &Captures<'_>) -> Result<MirrorItem, MatchError> {
    let timestamp = parse_log_time(cap(caps, "time"))?;
    let query = parse_query(cap(caps, "query"));
    Ok(MirrorItem {
        timestamp,
        host: cap(caps, "host").to_string(),
        repo_tag: query.get("repo").cloned(),
        repo_arch: query.get("arch").cloned(),
    })
}

/// Parse a line as a generic combined-log-format record, without countme
/// classification.
pub fn parse_log_record(line: &str) -> Option<LogRecord> {
    let caps = LOG_RE.captures(line)?;
    let nbytes = match cap(&caps, "nbytes") {
        "-" => None,
        n => Some(n.parse().ok()?),
    };
    Some(LogRecord {
        host: cap(&caps, "host").to_string(),
        identity: cap(&caps, "identity").to_string(),
        user: cap(&caps, "user").to_string(),
        time: cap(&caps, "time").to_string(),
        method: cap(&caps, "method").to_string(),
        path: cap(&caps, "path").to_string(),
        query: caps.name("query").map(|m| m.as_str().to_string()),
        protocol: cap(&caps, "protocol").to_string(),
        status: cap(&caps, "status").parse().ok()?,
        nbytes,
        referrer: cap(&caps, "referrer").to_string(),
        user_agent: cap(&caps, "user_agent").to_string(),
    })
}

/// Lazy stream of typed records over a line source. Not restartable; tied to
/// the underlying reader.
pub struct MatchedLines<I> {
    matcher: LogMatcher,
    lines: I,
}

impl<I> Iterator for MatchedLines<I>
where
    I: Iterator<Item = io::Result<String>>,
{
    type Item = io::Result<LogEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        for line in self.lines.by_ref() {
            let line = match line {
                Ok(line) => line,
                Err(err) => return Some(Err(err)),
            };
            match self.matcher.try_extract(&line) {
                None => continue,
                Some(Ok(event)) => return Some(Ok(event)),
                Some(Err(err)) => {
                    warn!(error = %err, line = line.trim_end(), "ignoring malformed line");
                }
            }
        }
        None
    }
}
