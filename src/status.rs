//! Status hints and the table that turns them into numeric codes.
//!
//! Handlers speak in hints (`OK`, `CREATED`, `BAD_INPUT`, …), not numbers.
//! A [`StatusTable`] maps hints to codes; anything it does not know is
//! answered with `501 Not Implemented` so an unmapped hint is loud, not silent.
//!
//! The empty hint means "let the verb decide":
//!
//! | Verb | Payload | Hint |
//! |---|---|---|
//! | `POST`, `PUT` | null | `NO_CONTENT` |
//! | `POST`, `PUT` | present | `CREATED` |
//! | `GET` | any | `OK` |
//! | `DELETE` | null | `NO_CONTENT` |
//! | `DELETE` | present | `OK` |
//! | other | any | stays empty |

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

use http::StatusCode;
use serde_json::Value;

use crate::method::Method;

/// A symbolic response status.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct StatusHint(Cow<'static, str>);

impl StatusHint {
    pub const EMPTY: Self = Self(Cow::Borrowed(""));
    pub const OK: Self = Self(Cow::Borrowed("OK"));
    pub const CREATED: Self = Self(Cow::Borrowed("CREATED"));
    pub const NO_CONTENT: Self = Self(Cow::Borrowed("NO_CONTENT"));
    pub const BAD_INPUT: Self = Self(Cow::Borrowed("BAD_INPUT"));
    pub const CONFLICT: Self = Self(Cow::Borrowed("CONFLICT"));
    pub const MOVED_PERMANENTLY: Self = Self(Cow::Borrowed("MOVED_PERMANENTLY"));
    pub const FOUND: Self = Self(Cow::Borrowed("FOUND"));
    pub const TEMPORARY_REDIRECT: Self = Self(Cow::Borrowed("TEMPORARY_REDIRECT"));
    pub const PERMANENT_REDIRECT: Self = Self(Cow::Borrowed("PERMANENT_REDIRECT"));

    /// An application-defined hint; map it with [`StatusTable::insert`].
    pub fn custom(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// The 3xx code for redirect hints; `None` for everything else.
    pub fn redirect_code(&self) -> Option<StatusCode> {
        match self.as_str() {
            "MOVED_PERMANENTLY"  => Some(StatusCode::MOVED_PERMANENTLY),
            "FOUND"              => Some(StatusCode::FOUND),
            "TEMPORARY_REDIRECT" => Some(StatusCode::TEMPORARY_REDIRECT),
            "PERMANENT_REDIRECT" => Some(StatusCode::PERMANENT_REDIRECT),
            _                    => None,
        }
    }

    /// Resolves the empty hint from the verb and payload; any other hint is
    /// returned unchanged.
    pub fn or_derive(self, method: Method, payload: &Value) -> Self {
        if !self.is_empty() {
            return self;
        }
        match (method, payload.is_null()) {
            (Method::Post | Method::Put, true)  => Self::NO_CONTENT,
            (Method::Post | Method::Put, false) => Self::CREATED,
            (Method::Get, _)                    => Self::OK,
            (Method::Delete, true)              => Self::NO_CONTENT,
            (Method::Delete, false)             => Self::OK,
            _                                   => self,
        }
    }
}

impl fmt::Display for StatusHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hint → code mapping. Override entries per responder.
#[derive(Clone, Debug)]
pub struct StatusTable {
    codes: HashMap<StatusHint, StatusCode>,
}

impl StatusTable {
    /// A table with no entries: every hint resolves to `501`.
    pub fn empty() -> Self {
        Self { codes: HashMap::new() }
    }

    pub fn insert(&mut self, hint: StatusHint, code: StatusCode) -> &mut Self {
        self.codes.insert(hint, code);
        self
    }

    pub fn code(&self, hint: &StatusHint) -> StatusCode {
        self.codes.get(hint).copied().unwrap_or(StatusCode::NOT_IMPLEMENTED)
    }
}

impl Default for StatusTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table
            .insert(StatusHint::OK, StatusCode::OK)
            .insert(StatusHint::CREATED, StatusCode::CREATED)
            .insert(StatusHint::BAD_INPUT, StatusCode::BAD_REQUEST)
            .insert(StatusHint::NO_CONTENT, StatusCode::NO_CONTENT)
            .insert(StatusHint::CONFLICT, StatusCode::CONFLICT);
        table
    }
}
