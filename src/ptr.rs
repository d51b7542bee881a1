//! JSON Pointers (RFC 6901) addressing nodes of a [`Schema`] tree.

use std::fmt;
use std::str::FromStr;

use crate::keyword::{Keyword, Slot};
use crate::schema::Schema;

/// An immutable sequence of unescaped pointer tokens.
///
/// Renders as `/` followed by the escaped tokens joined with `/`. The empty
/// pointer renders as `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ptr(Vec<String>);

impl Ptr {
    /// The empty pointer, addressing the document root.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tokens<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tokens.into_iter().map(Into::into).collect())
    }

    /// Parse a pointer, accepting an optional leading `#` and/or `/`.
    ///
    /// Never fails: the empty string and `#` both parse to the empty pointer.
    pub fn parse(s: &str) -> Self {
        let s = s.strip_prefix('#').unwrap_or(s);
        let s = s.strip_prefix('/').unwrap_or(s);
        if s.is_empty() {
            return Self::new();
        }
        Self(s.split('/').map(unescape).collect())
    }

    /// Append property names.
    pub fn prop<I, S>(&self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut tokens = self.0.clone();
        tokens.extend(names.into_iter().map(Into::into));
        Self(tokens)
    }

    /// Append array indices.
    pub fn item<I>(&self, indices: I) -> Self
    where
        I: IntoIterator<Item = usize>,
    {
        let mut tokens = self.0.clone();
        tokens.extend(indices.into_iter().map(|i| i.to_string()));
        Self(tokens)
    }

    /// Concatenate pointers.
    pub fn add<'a, I>(&self, others: I) -> Self
    where
        I: IntoIterator<Item = &'a Ptr>,
    {
        let mut tokens = self.0.clone();
        for other in others {
            tokens.extend(other.0.iter().cloned());
        }
        Self(tokens)
    }

    pub fn tokens(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn has_prefix(&self, prefix: &Ptr) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Split off `prefix`, returning the remainder if it matched.
    pub fn cut_prefix(&self, prefix: &Ptr) -> Option<Ptr> {
        self.0
            .strip_prefix(prefix.0.as_slice())
            .map(|rest| Ptr(rest.to_vec()))
    }

    /// Render as a URI fragment, e.g. `#/$defs/foo`.
    pub fn to_fragment(&self) -> String {
        if self.is_empty() {
            return "#".to_string();
        }
        format!("#{self}")
    }

    /// Walk the pointer from `root`, following only subschema keywords.
    ///
    /// The first element is always `(Ptr::new(), root)` and every further
    /// element is one step deeper. Resolution stops early, without error, at
    /// the first token that does not lead to a schema: an unknown keyword,
    /// a missing key, a bad index or an absent single-schema keyword.
    pub fn resolve<'a>(&self, root: &'a Schema) -> Vec<(Ptr, &'a Schema)> {
        let mut trail = vec![(Ptr::new(), root)];
        let mut current = root;
        let mut depth = 0;
        let mut tokens = self.0.iter();

        while let Some(token) = tokens.next() {
            let Some(keyword) = Keyword::parse(token) else {
                break;
            };
            let (next, consumed) = match current.slot(keyword) {
                Slot::Single(child) => match child {
                    Some(child) => (child, 1),
                    None => break,
                },
                Slot::Map(map) => match tokens.next().and_then(|key| map.get(key)) {
                    Some(child) => (child, 2),
                    None => break,
                },
                Slot::Array(items) => match tokens
                    .next()
                    .and_then(|index| index.parse::<usize>().ok())
                    .and_then(|index| items.get(index))
                {
                    Some(child) => (child, 2),
                    None => break,
                },
            };
            depth += consumed;
            current = next;
            trail.push((Ptr(self.0[..depth].to_vec()), current));
        }
        trail
    }
}

impl fmt::Display for Ptr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for token in &self.0 {
            write!(f, "/{}", escape(token))?;
        }
        Ok(())
    }
}

impl FromStr for Ptr {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn unescape(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}
