//! Conditional request headers: `If`, `If-Match` and `If-None-Match`.
//!
//! The `If` header is parsed into lists of conditions. Each list may be
//! tagged with the URI of the resource it applies to; untagged lists apply to
//! the request target. A list holds when all of its conditions hold, and the
//! header holds when at least one list holds.
//!
//! Every state token mentioned anywhere in the header also counts as a lock
//! token submitted by the client.

use crate::error::{DavError, DavResult};
use crate::store::EntityTag;
use std::collections::HashMap;

/// State token that never names a lock (`DAV:no-lock`).
pub const NO_LOCK: &str = "DAV:no-lock";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionKind {
    /// A lock token (or any other state token) in `<...>`.
    StateToken(String),
    /// An entity tag in `[...]`, kept in its quoted form.
    ETag(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub negated: bool,
    pub kind: ConditionKind,
}

/// One parenthesized list, with the resource tag it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfList {
    /// Raw tag URI, `None` for the request target.
    pub resource: Option<String>,
    pub conditions: Vec<Condition>,
}

/// State of a resource an `If` list is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct ResourceState {
    /// Current entity tag, `None` when the resource is unmapped.
    pub etag: Option<EntityTag>,
    /// Tokens of the locks covering the resource.
    pub lock_tokens: Vec<String>,
}

/// Parsed `If` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfHeader {
    pub lists: Vec<IfList>,
}

impl IfHeader {
    pub fn parse(raw: &str) -> DavResult<Self> {
        let mut scanner = Scanner::new(raw);
        let mut lists = Vec::new();
        let mut tagged: Option<bool> = None;
        let mut resource: Option<String> = None;
        let mut tag_pending = false;

        loop {
            scanner.skip_ws();
            match scanner.peek() {
                None => break,
                Some('<') => {
                    if tagged == Some(false) || tag_pending {
                        return Err(scanner.error("unexpected resource tag"));
                    }
                    tagged = Some(true);
                    resource = Some(scanner.delimited('<', '>')?.to_string());
                    tag_pending = true;
                }
                Some('(') => {
                    if tagged.is_none() {
                        tagged = Some(false);
                    }
                    let conditions = scanner.list()?;
                    lists.push(IfList {
                        resource: resource.clone(),
                        conditions,
                    });
                    tag_pending = false;
                }
                Some(_) => return Err(scanner.error("expected '(' or '<'")),
            }
        }
        if lists.is_empty() || tag_pending {
            return Err(scanner.error("no condition list"));
        }
        Ok(Self { lists })
    }

    /// Every state token in the header, in order of appearance.
    pub fn submitted_tokens(&self) -> Vec<String> {
        self.lists
            .iter()
            .flat_map(|list| &list.conditions)
            .filter_map(|c| match &c.kind {
                ConditionKind::StateToken(token) if token != NO_LOCK => Some(token.clone()),
                _ => None,
            })
            .collect()
    }

    /// Evaluate the header. `state_of` receives the raw tag URI of a list
    /// (`None` for the request target) and is called once per resource.
    pub fn evaluate<F>(&self, mut state_of: F) -> DavResult<bool>
    where
        F: FnMut(Option<&str>) -> DavResult<ResourceState>,
    {
        let mut states: HashMap<Option<&str>, ResourceState> = HashMap::new();
        for list in &self.lists {
            let key = list.resource.as_deref();
            if !states.contains_key(&key) {
                states.insert(key, state_of(key)?);
            }
            let state = &states[&key];
            if list.conditions.iter().all(|c| condition_holds(c, state)) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn condition_holds(condition: &Condition, state: &ResourceState) -> bool {
    let matched = match &condition.kind {
        ConditionKind::StateToken(token) => {
            token != NO_LOCK && state.lock_tokens.iter().any(|held| held == token)
        }
        ConditionKind::ETag(tag) => state.etag.as_ref().is_some_and(|etag| etag.matches(tag)),
    };
    matched != condition.negated
}

/// `If-Match`: true when the resource exists and one of the listed tags
/// (or `*`) matches.
pub fn if_match(header: &str, current: Option<&EntityTag>) -> bool {
    let Some(current) = current else {
        return false;
    };
    header
        .split(',')
        .map(str::trim)
        .any(|tag| tag == "*" || current.matches(tag))
}

/// `If-None-Match`: true when no listed tag matches (`*` matches any
/// existing resource).
pub fn if_none_match(header: &str, current: Option<&EntityTag>) -> bool {
    let Some(current) = current else {
        return true;
    };
    !header
        .split(',')
        .map(str::trim)
        .any(|tag| tag == "*" || current.matches(tag))
}

struct Scanner<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.input.len() - trimmed.len();
    }

    fn error(&self, what: &str) -> DavError {
        DavError::BadRequest(format!("malformed If header at {}: {what}", self.pos))
    }

    /// Text between `open` and `close`, consuming both.
    fn delimited(&mut self, open: char, close: char) -> DavResult<&'a str> {
        let rest = self.rest();
        let Some(body) = rest.strip_prefix(open) else {
            return Err(self.error("missing opening delimiter"));
        };
        let Some(end) = body.find(close) else {
            return Err(self.error("unterminated delimiter"));
        };
        self.pos += open.len_utf8() + end + close.len_utf8();
        Ok(&body[..end])
    }

    fn list(&mut self) -> DavResult<Vec<Condition>> {
        self.pos += 1;
        let mut conditions = Vec::new();
        loop {
            self.skip_ws();
            let negated = self
                .rest()
                .get(..3)
                .is_some_and(|word| word.eq_ignore_ascii_case("not"));
            if negated {
                self.pos += 3;
                self.skip_ws();
            }
            let kind = match self.peek() {
                Some(')') if !negated => {
                    self.pos += 1;
                    break;
                }
                Some('<') => ConditionKind::StateToken(self.delimited('<', '>')?.trim().to_string()),
                Some('[') => ConditionKind::ETag(self.delimited('[', ']')?.trim().to_string()),
                _ => return Err(self.error("expected a condition")),
            };
            conditions.push(Condition { negated, kind });
        }
        if conditions.is_empty() {
            return Err(self.error("empty list"));
        }
        Ok(conditions)
    }
}
