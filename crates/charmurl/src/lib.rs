use lazy_static::lazy_static;
use regex::Regex;
use serde::{de::Error as SerdeError, Deserialize, Serialize};

// This crate holds the identifier model shared by every other crate of the
// repository: typed charm and bundle URLs, their parse grammar, and the
// projections (base form, promulgated form) under which cross-revision
// state is keyed.

lazy_static! {
    // Hyphen-separated hunks after the first must contain at least one
    // letter, so a trailing -<digits> hunk is always a revision and never
    // part of the name.
    static ref NAME_RE: Regex =
        Regex::new(r"^[a-z][a-z0-9]*(-[a-z0-9]*[a-z][a-z0-9]*)*$").unwrap();
    static ref SERIES_RE: Regex = Regex::new(r"^[a-z]+([a-z0-9]+)?$").unwrap();
    static ref USER_RE: Regex = Regex::new(r"^[a-z0-9][a-zA-Z0-9+.-]*$").unwrap();
}

/// The name of the development channel token accepted (and stripped) by the
/// URL grammar.
pub const DEVELOPMENT: &str = "development";

/// The pseudo-series carried by bundle URLs.
pub const BUNDLE_SERIES: &str = "bundle";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("charm or bundle URL has invalid schema: {0:?}")]
    InvalidSchema(String),
    #[error("charm or bundle URL has invalid user name: {0:?}")]
    InvalidUser(String),
    #[error("charm or bundle URL has invalid series: {0:?}")]
    InvalidSeries(String),
    #[error("charm or bundle URL has invalid name: {0:?}")]
    InvalidName(String),
    #[error("charm or bundle URL has invalid revision: {0:?}")]
    InvalidRevision(String),
    #[error("charm or bundle URL has invalid form: {0:?}")]
    InvalidForm(String),
}

/// CharmUrl identifies a charm or bundle, possibly partially: `user` may be
/// empty (the promulgated namespace), `series` may be empty (multi-series
/// charms and series-less queries), and `revision` may be -1 (unspecified).
/// The schema is always `cs`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CharmUrl {
    pub user: String,
    pub series: String,
    pub name: String,
    pub revision: i32,
}

/// The outcome of parsing a textual URL: the normalized URL plus the
/// development channel hint, which the grammar strips from the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Parsed {
    pub url: CharmUrl,
    pub development: bool,
}

pub fn valid_name(s: &str) -> bool {
    NAME_RE.is_match(s)
}

pub fn valid_series(s: &str) -> bool {
    SERIES_RE.is_match(s)
}

pub fn valid_user(s: &str) -> bool {
    USER_RE.is_match(s)
}

impl CharmUrl {
    /// Construct a URL from parts, validating each against the grammar.
    /// Empty user and series and revision -1 are permitted, as for parse.
    pub fn new(
        user: impl Into<String>,
        series: impl Into<String>,
        name: impl Into<String>,
        revision: i32,
    ) -> Result<CharmUrl, ParseError> {
        let (user, series, name) = (user.into(), series.into(), name.into());
        if !user.is_empty() && !valid_user(&user) {
            return Err(ParseError::InvalidUser(user));
        }
        if !series.is_empty() && !valid_series(&series) {
            return Err(ParseError::InvalidSeries(series));
        }
        if !valid_name(&name) {
            return Err(ParseError::InvalidName(name));
        }
        if revision < -1 {
            return Err(ParseError::InvalidRevision(revision.to_string()));
        }
        Ok(CharmUrl {
            user,
            series,
            name,
            revision,
        })
    }

    /// Parse the textual form
    /// `[cs:][~<user>/][development/][<series>/]<name>[-<revision>]`,
    /// returning the normalized URL and the stripped channel hint.
    pub fn parse(s: &str) -> Result<Parsed, ParseError> {
        let mut rest = s;
        if let Some((schema, tail)) = rest.split_once(':') {
            if schema != "cs" {
                return Err(ParseError::InvalidSchema(s.to_string()));
            }
            rest = tail;
        }

        let mut user = "";
        if let Some(tail) = rest.strip_prefix('~') {
            let (u, tail) = tail
                .split_once('/')
                .ok_or_else(|| ParseError::InvalidForm(s.to_string()))?;
            if !valid_user(u) {
                return Err(ParseError::InvalidUser(u.to_string()));
            }
            user = u;
            rest = tail;
        }

        let segments: Vec<&str> = rest.split('/').collect();
        let (development, series, last) = match segments.as_slice() {
            [name] => (false, "", *name),
            [first, name] if *first == DEVELOPMENT => (true, "", *name),
            [series, name] => (false, *series, *name),
            [channel, series, name] => {
                if *channel != DEVELOPMENT {
                    return Err(ParseError::InvalidForm(s.to_string()));
                }
                (true, *series, *name)
            }
            _ => return Err(ParseError::InvalidForm(s.to_string())),
        };
        if !series.is_empty() && !valid_series(series) {
            return Err(ParseError::InvalidSeries(series.to_string()));
        }

        let (name, revision) = split_revision(last);
        if !valid_name(name) {
            return Err(ParseError::InvalidName(last.to_string()));
        }

        Ok(Parsed {
            url: CharmUrl {
                user: user.to_string(),
                series: series.to_string(),
                name: name.to_string(),
                revision,
            },
            development,
        })
    }

    /// The base form: series and revision dropped. This is the key under
    /// which cross-revision state (ACLs, channel pointers, promulgation)
    /// is kept.
    pub fn base(&self) -> CharmUrl {
        CharmUrl {
            user: self.user.clone(),
            series: String::new(),
            name: self.name.clone(),
            revision: -1,
        }
    }

    pub fn with_revision(&self, revision: i32) -> CharmUrl {
        CharmUrl {
            revision,
            ..self.clone()
        }
    }

    pub fn with_series(&self, series: impl Into<String>) -> CharmUrl {
        CharmUrl {
            series: series.into(),
            ..self.clone()
        }
    }

    pub fn is_bundle(&self) -> bool {
        self.series == BUNDLE_SERIES
    }

    /// Whether `candidate` satisfies this URL treated as a pattern: empty
    /// user or series and revision -1 act as wildcards; set fields compare
    /// exactly (user case-sensitively).
    pub fn matches(&self, candidate: &CharmUrl) -> bool {
        if self.name != candidate.name {
            return false;
        }
        if !self.user.is_empty() && self.user != candidate.user {
            return false;
        }
        if !self.series.is_empty() && self.series != candidate.series {
            return false;
        }
        if self.revision != -1 && self.revision != candidate.revision {
            return false;
        }
        true
    }
}

// A trailing all-digit hunk is a revision suffix.
fn split_revision(s: &str) -> (&str, i32) {
    if let Some(idx) = s.rfind('-') {
        let tail = &s[idx + 1..];
        if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(rev) = tail.parse::<i32>() {
                return (&s[..idx], rev);
            }
        }
    }
    (s, -1)
}

impl std::fmt::Display for CharmUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cs:")?;
        if !self.user.is_empty() {
            write!(f, "~{}/", self.user)?;
        }
        if !self.series.is_empty() {
            write!(f, "{}/", self.series)?;
        }
        write!(f, "{}", self.name)?;
        if self.revision != -1 {
            write!(f, "-{}", self.revision)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for CharmUrl {
    type Err = ParseError;

    // The stored form: a development token is rejected here since
    // normalized URLs never carry one.
    fn from_str(s: &str) -> Result<CharmUrl, ParseError> {
        let parsed = CharmUrl::parse(s)?;
        if parsed.development {
            return Err(ParseError::InvalidForm(s.to_string()));
        }
        Ok(parsed.url)
    }
}

impl Serialize for CharmUrl {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CharmUrl {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

/// A fully resolved identifier: the owned URL plus its promulgated revision
/// (-1 when the entity is not promulgated). This is the canonical form
/// passed between components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedUrl {
    pub url: CharmUrl,
    pub promulgated_revision: i32,
}

impl ResolvedUrl {
    pub fn new(url: CharmUrl, promulgated_revision: i32) -> ResolvedUrl {
        ResolvedUrl {
            url,
            promulgated_revision,
        }
    }

    /// The promulgated form: user blanked, revision replaced by the
    /// promulgated revision. None when not promulgated.
    pub fn promulgated(&self) -> Option<CharmUrl> {
        if self.promulgated_revision < 0 {
            return None;
        }
        Some(CharmUrl {
            user: String::new(),
            series: self.url.series.clone(),
            name: self.url.name.clone(),
            revision: self.promulgated_revision,
        })
    }

    /// The form preferred when rendering to clients: promulgated when
    /// available, owned otherwise.
    pub fn preferred(&self) -> CharmUrl {
        self.promulgated().unwrap_or_else(|| self.url.clone())
    }
}

impl std::fmt::Display for ResolvedUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.url.fmt(f)
    }
}
