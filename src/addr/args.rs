//! Key/value option lists and argv splitting.

use std::str::FromStr;

use crate::error::{GensioError, Result};

/// The `key=value,flag,...` list inside a layer's parentheses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args {
    items: Vec<(String, Option<String>)>,
}

impl Args {
    pub fn parse(s: &str) -> Result<Self> {
        let mut items = Vec::new();
        for part in split_top_level(s, ',')? {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((k, v)) => {
                    let key = k.trim();
                    if key.is_empty() {
                        return Err(GensioError::config(format!("missing key in '{part}'")));
                    }
                    items.push((key.to_string(), Some(unquote(v.trim())?)));
                }
                None => items.push((part.to_string(), None)),
            }
        }
        Ok(Self { items })
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn push(&mut self, key: impl Into<String>, value: Option<String>) {
        self.items.push((key.into(), value));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.items.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    fn find(&self, key: &str) -> Option<&Option<String>> {
        self.items
            .iter()
            .rev()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v)
    }

    pub fn has(&self, key: &str) -> bool {
        self.find(key).is_some()
    }

    /// The value of `key=value`; a bare `key` has no value.
    pub fn value(&self, key: &str) -> Option<&str> {
        self.find(key).and_then(|v| v.as_deref())
    }

    /// A bare key reads as `true`.
    pub fn bool(&self, key: &str) -> Result<Option<bool>> {
        match self.find(key) {
            None => Ok(None),
            Some(None) => Ok(Some(true)),
            Some(Some(v)) => parse_bool(v)
                .map(Some)
                .ok_or_else(|| GensioError::config(format!("{key}: '{v}' is not a boolean"))),
        }
    }

    pub fn u32(&self, key: &str) -> Result<Option<u32>> {
        self.number(key)
    }

    pub fn usize(&self, key: &str) -> Result<Option<usize>> {
        self.number(key)
    }

    fn number<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.find(key) {
            None => Ok(None),
            Some(None) => Err(GensioError::config(format!("{key} needs a value"))),
            Some(Some(v)) => v
                .parse()
                .map(Some)
                .map_err(|_| GensioError::config(format!("{key}: '{v}' is not a valid number"))),
        }
    }

    /// Reject any key not in `known`.
    pub fn check_known(&self, layer: &str, known: &[&str]) -> Result<()> {
        for (k, _) in &self.items {
            if !known.iter().any(|n| n.eq_ignore_ascii_case(k)) {
                return Err(GensioError::config(format!("{layer}: unknown option '{k}'")));
            }
        }
        Ok(())
    }
}

pub(crate) fn parse_bool(v: &str) -> Option<bool> {
    match v.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

/// Split on `sep` outside quotes, parentheses and backslash escapes.
pub(crate) fn split_top_level(s: &str, sep: char) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                cur.push(c);
                match chars.next() {
                    Some(n) => cur.push(n),
                    None => return Err(GensioError::config("trailing backslash")),
                }
            }
            '"' | '\'' if quote.is_none() => {
                quote = Some(c);
                cur.push(c);
            }
            c if Some(c) == quote => {
                quote = None;
                cur.push(c);
            }
            '(' if quote.is_none() => {
                depth += 1;
                cur.push(c);
            }
            ')' if quote.is_none() => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| GensioError::config(format!("unbalanced ')' in '{s}'")))?;
                cur.push(c);
            }
            c if c == sep && quote.is_none() && depth == 0 => out.push(std::mem::take(&mut cur)),
            _ => cur.push(c),
        }
    }
    if quote.is_some() {
        return Err(GensioError::config(format!("unterminated quote in '{s}'")));
    }
    if depth != 0 {
        return Err(GensioError::config(format!("unbalanced '(' in '{s}'")));
    }
    out.push(cur);
    Ok(out)
}

/// Strip one level of quoting and resolve backslash escapes.
pub(crate) fn unquote(s: &str) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut quote: Option<char> = None;
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' if quote != Some('\'') => match chars.next() {
                Some(n) => out.push(n),
                None => return Err(GensioError::config("trailing backslash")),
            },
            '"' | '\'' if quote.is_none() => quote = Some(c),
            c if Some(c) == quote => quote = None,
            _ => out.push(c),
        }
    }
    if quote.is_some() {
        return Err(GensioError::config(format!("unterminated quote in '{s}'")));
    }
    Ok(out)
}

/// Split a command line into words, honouring quotes and escapes.
pub fn str_to_argv(s: &str) -> Result<Vec<String>> {
    let mut argv = Vec::new();
    let mut cur = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' if quote != Some('\'') => {
                in_word = true;
                match chars.next() {
                    Some(n) => cur.push(n),
                    None => return Err(GensioError::config("trailing backslash")),
                }
            }
            '"' | '\'' if quote.is_none() => {
                in_word = true;
                quote = Some(c);
            }
            c if Some(c) == quote => quote = None,
            c if c.is_whitespace() && quote.is_none() => {
                if in_word {
                    argv.push(std::mem::take(&mut cur));
                    in_word = false;
                }
            }
            _ => {
                in_word = true;
                cur.push(c);
            }
        }
    }
    if quote.is_some() {
        return Err(GensioError::config(format!("unterminated quote in '{s}'")));
    }
    if in_word {
        argv.push(cur);
    }
    Ok(argv)
}
