use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use regex::Regex;

use crate::request::{Request, RequestSummary, RequestType, StatusKind};

/// Declarative filter over request records, shared by every storage backend.
///
/// Each field holds a list of patterns; a field matches when any of its patterns does and
/// a record matches when every non-empty field does. Fields that do not apply to a record's
/// type (`uri`, `controller` and `method` only describe HTTP requests) are ignored for it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Search {
    pub uri: Vec<String>,
    pub controller: Vec<String>,
    pub method: Vec<String>,
    pub status: Vec<String>,
    pub time: Vec<String>,
    pub received: Vec<String>,
    pub name: Vec<String>,
    pub types: Vec<String>,
    /// Stop a forward scan at the first entry that fails the filter.
    pub stop_on_first_mismatch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchField {
    Uri,
    Controller,
    Method,
    Status,
    Time,
    Received,
    Name,
    Type,
}

impl SearchField {
    pub const ALL: [SearchField; 8] = [
        SearchField::Uri,
        SearchField::Controller,
        SearchField::Method,
        SearchField::Status,
        SearchField::Time,
        SearchField::Received,
        SearchField::Name,
        SearchField::Type,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::Uri => "uri",
            Self::Controller => "controller",
            Self::Method => "method",
            Self::Status => "status",
            Self::Time => "time",
            Self::Received => "received",
            Self::Name => "name",
            Self::Type => "type",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|field| field.key() == key)
    }

    /// Request types this field constrains.
    pub fn applies_to(self, kind: RequestType) -> bool {
        match self {
            Self::Uri | Self::Controller | Self::Method => kind == RequestType::Request,
            Self::Status | Self::Time | Self::Received | Self::Name | Self::Type => true,
        }
    }
}

/// A single `status`/`time` pattern.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumberPattern {
    Less(f64),
    Greater(f64),
    /// Exclusive on both ends.
    Between(f64, f64),
    Equal(f64),
}

impl NumberPattern {
    pub fn parse(pattern: &str) -> Option<Self> {
        let pattern = pattern.trim();
        if let Some(rest) = pattern.strip_prefix('<') {
            return parse_number(rest).map(Self::Less);
        }
        if let Some(rest) = pattern.strip_prefix('>') {
            return parse_number(rest).map(Self::Greater);
        }
        if let Some(captures) = range_regex().captures(pattern) {
            let from = parse_number(&captures["from"])?;
            let to = parse_number(&captures["to"])?;
            return Some(Self::Between(from, to));
        }
        parse_number(pattern).map(Self::Equal)
    }

    pub fn matches(&self, value: f64) -> bool {
        match *self {
            Self::Less(limit) => value < limit,
            Self::Greater(limit) => value > limit,
            Self::Between(from, to) => value > from && value < to,
            Self::Equal(expected) => value == expected,
        }
    }
}

/// A single `received` pattern, resolved to epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DatePattern {
    Before(f64),
    After(f64),
}

impl DatePattern {
    pub fn parse(pattern: &str) -> Option<Self> {
        let pattern = pattern.trim();
        if let Some(rest) = pattern.strip_prefix('<') {
            return parse_datetime(rest).map(Self::Before);
        }
        if let Some(rest) = pattern.strip_prefix('>') {
            return parse_datetime(rest).map(Self::After);
        }
        None
    }

    pub fn matches(&self, epoch_secs: f64) -> bool {
        match *self {
            Self::Before(limit) => epoch_secs < limit,
            Self::After(limit) => epoch_secs > limit,
        }
    }
}

impl Search {
    /// Builds criteria from a flat key → patterns mapping; unknown keys are ignored.
    pub fn from_params<I, K, V>(params: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: IntoIterator,
        V::Item: Into<String>,
    {
        let mut search = Self::default();
        for (key, values) in params {
            let key = key.as_ref().trim_end_matches("[]");
            let Some(field) = SearchField::from_key(key) else {
                continue;
            };
            let patterns = search.patterns_mut(field);
            patterns.extend(
                values
                    .into_iter()
                    .map(Into::into)
                    .filter(|value: &String| !value.trim().is_empty()),
            );
        }
        search
    }

    /// Parses a query string such as `status[]=<400&method[]=get&name=users`.
    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let pairs = query.split('&').filter(|segment| !segment.is_empty()).map(|segment| {
            let (key, value) = segment.split_once('=').unwrap_or((segment, ""));
            (decode_form_component(key), vec![decode_form_component(value)])
        });
        Self::from_params(pairs)
    }

    /// Forward-scan criteria selecting entries received before `epoch_secs`.
    pub fn received_before(epoch_secs: f64) -> Self {
        Self {
            received: vec![format!("<{epoch_secs}")],
            stop_on_first_mismatch: true,
            ..Self::default()
        }
    }

    pub fn patterns(&self, field: SearchField) -> &[String] {
        match field {
            SearchField::Uri => &self.uri,
            SearchField::Controller => &self.controller,
            SearchField::Method => &self.method,
            SearchField::Status => &self.status,
            SearchField::Time => &self.time,
            SearchField::Received => &self.received,
            SearchField::Name => &self.name,
            SearchField::Type => &self.types,
        }
    }

    fn patterns_mut(&mut self, field: SearchField) -> &mut Vec<String> {
        match field {
            SearchField::Uri => &mut self.uri,
            SearchField::Controller => &mut self.controller,
            SearchField::Method => &mut self.method,
            SearchField::Status => &mut self.status,
            SearchField::Time => &mut self.time,
            SearchField::Received => &mut self.received,
            SearchField::Name => &mut self.name,
            SearchField::Type => &mut self.types,
        }
    }

    pub fn is_empty(&self) -> bool {
        SearchField::ALL
            .into_iter()
            .all(|field| self.patterns(field).is_empty())
    }

    /// The single substring term a name-only scan can evaluate, if the criteria reduce to one.
    pub fn name_term(&self) -> Option<&str> {
        match self.name.as_slice() {
            [term] => Some(term.as_str()),
            _ => None,
        }
    }

    /// True when [`Search::name_term`] alone decides every match.
    pub fn is_name_only(&self) -> bool {
        self.name_term().is_some()
            && SearchField::ALL
                .into_iter()
                .filter(|field| *field != SearchField::Name)
                .all(|field| self.patterns(field).is_empty())
    }

    pub fn matches_request(&self, request: &Request) -> bool {
        self.matches(&request.summary())
    }

    pub fn matches(&self, summary: &RequestSummary) -> bool {
        let kind = summary.kind;

        if !self.types.is_empty()
            && !self
                .types
                .iter()
                .any(|pattern| pattern.trim().eq_ignore_ascii_case(kind.as_str()))
        {
            return false;
        }

        if kind == RequestType::Request
            && !(matches_string(&self.uri, summary.name.as_deref())
                && matches_string(&self.controller, summary.controller.as_deref())
                && matches_exact(&self.method, summary.method.as_deref()))
        {
            return false;
        }

        let status_matches = match kind.fields().status_kind {
            StatusKind::Number => matches_number(
                &self.status,
                summary.status.as_deref().and_then(parse_number),
            ),
            StatusKind::Exact => matches_exact(&self.status, summary.status.as_deref()),
        };

        status_matches
            && matches_string(&self.name, summary.name.as_deref())
            && matches_number(&self.time, summary.duration)
            && matches_date(&self.received, summary.time)
    }
}

fn matches_string(patterns: &[String], value: Option<&str>) -> bool {
    if patterns.is_empty() {
        return true;
    }
    let Some(value) = value else {
        return false;
    };
    let value = value.to_ascii_lowercase();
    patterns
        .iter()
        .any(|pattern| value.contains(&pattern.to_ascii_lowercase()))
}

fn matches_exact(patterns: &[String], value: Option<&str>) -> bool {
    if patterns.is_empty() {
        return true;
    }
    let Some(value) = value else {
        return false;
    };
    patterns
        .iter()
        .any(|pattern| pattern.trim().eq_ignore_ascii_case(value))
}

fn matches_number(patterns: &[String], value: Option<f64>) -> bool {
    if patterns.is_empty() {
        return true;
    }
    let Some(value) = value else {
        return false;
    };
    patterns
        .iter()
        .filter_map(|pattern| NumberPattern::parse(pattern))
        .any(|pattern| pattern.matches(value))
}

fn matches_date(patterns: &[String], epoch_secs: f64) -> bool {
    if patterns.is_empty() {
        return true;
    }
    patterns
        .iter()
        .filter_map(|pattern| DatePattern::parse(pattern))
        .any(|pattern| pattern.matches(epoch_secs))
}

pub(crate) fn parse_number(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|number| number.is_finite())
}

/// Accepts epoch seconds, RFC 3339, `YYYY-MM-DD HH:MM:SS` and `YYYY-MM-DD` (UTC).
pub(crate) fn parse_datetime(value: &str) -> Option<f64> {
    let value = value.trim();
    if let Some(epoch) = parse_number(value) {
        return Some(epoch);
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        let micros = f64::from(parsed.timestamp_subsec_micros());
        return Some(parsed.timestamp() as f64 + micros / 1e6);
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed.and_utc().timestamp() as f64);
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|midnight| midnight.and_utc().timestamp() as f64)
}

fn range_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^(?P<from>-?\d+(?:\.\d+)?)\s*-\s*(?P<to>-?\d+(?:\.\d+)?)$")
            .expect("number range regex should compile")
    })
}

fn decode_form_component(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'+' => {
                decoded.push(b' ');
                index += 1;
            }
            b'%' if index + 2 < bytes.len() => {
                let high = hex_nibble(bytes[index + 1]);
                let low = hex_nibble(bytes[index + 2]);
                if let (Some(high), Some(low)) = (high, low) {
                    decoded.push((high << 4) | low);
                    index += 3;
                } else {
                    decoded.push(b'%');
                    index += 1;
                }
            }
            byte => {
                decoded.push(byte);
                index += 1;
            }
        }
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn hex_nibble(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
