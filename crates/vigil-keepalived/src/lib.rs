//! Parser for keepalived-style configuration files.
//!
//! The format is a tree of named blocks with positional values:
//!
//! ```text
//! virtual_server 192.0.2.1 80 {
//!     protocol TCP
//!     real_server 10.0.0.1 8080 {
//!         weight 1
//!     }
//! }
//! ```
//!
//! Comments start with `#` or `!`, string values may be double-quoted with
//! backslash escapes, and `include <glob>` splices other files in place.
//! Parsing produces an untyped [`Item`] tree; binding it to typed
//! configuration structures is the caller's concern.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("unmatched quotation mark here: {0}")]
    UnmatchedQuote(String),

    #[error("unbalanced brace in config file {0}")]
    UnbalancedBrace(PathBuf),

    #[error("invalid include directive")]
    InvalidInclude,

    #[error("failed to expand include pattern {pattern}: {source}")]
    Include {
        pattern: String,
        source: Box<ParseError>,
    },

    #[error("invalid include pattern {0}")]
    IncludePattern(String),

    #[error(
        "unexpected character in parameter name {0}: expected only numbers, letters or underscore"
    )]
    InvalidName(String),

    #[error("parameter name cannot open a block: {0}")]
    NameOpensBlock(String),
}

/// One configuration item: a name, its inline values, and nested items when
/// the line opened a `{ ... }` block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    pub name: String,
    pub values: Vec<String>,
    pub children: Vec<Item>,
}

impl Item {
    /// The single inline value of this item, if it has exactly one.
    pub fn single(&self) -> Option<&str> {
        match self.values.as_slice() {
            [value] if self.children.is_empty() => Some(value),
            _ => None,
        }
    }

    /// First child with the given name.
    pub fn child(&self, name: &str) -> Option<&Item> {
        self.children.iter().find(|item| item.name == name)
    }

    /// All children with the given name.
    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Item> + 'a {
        self.children.iter().filter(move |item| item.name == name)
    }
}

/// Parses the file at `path` and returns the root item, whose children are
/// the file's top-level entries. `include` directives are expanded relative
/// to the including file's directory.
pub fn parse_file(path: &Path) -> Result<Item, ParseError> {
    let text = fs::read_to_string(path).map_err(|source| ParseError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));

    let mut lines = text.lines();
    let mut depth = 0i32;
    let children = parse_block(&mut lines, dir, &mut depth)?;
    if depth != 0 {
        return Err(ParseError::UnbalancedBrace(path.to_path_buf()));
    }

    Ok(Item {
        name: String::new(),
        values: Vec::new(),
        children,
    })
}

/// Parses items until the closing brace of the current block or the end of
/// input. `depth` tracks currently open braces across recursion.
fn parse_block<'a>(
    lines: &mut impl Iterator<Item = &'a str>,
    dir: &Path,
    depth: &mut i32,
) -> Result<Vec<Item>, ParseError> {
    let mut items = Vec::new();

    while let Some(line) = lines.next() {
        let mut tokens = split_line(line)?;
        if tokens.is_empty() {
            continue;
        }

        // Comments may start with both '#' and '!' per keepalived.conf.
        if tokens[0].starts_with('#') || tokens[0].starts_with('!') {
            continue;
        }

        if tokens[0] == "}" {
            *depth -= 1;
            return Ok(items);
        }

        if tokens[0] == "include" {
            if tokens.len() != 2 {
                return Err(ParseError::InvalidInclude);
            }
            items.extend(expand_include(dir, &tokens[1])?);
            continue;
        }

        if tokens[0].contains('{') {
            return Err(ParseError::NameOpensBlock(tokens[0].clone()));
        }
        if !is_valid_name(&tokens[0]) {
            return Err(ParseError::InvalidName(tokens[0].clone()));
        }

        let name = tokens.remove(0);
        let mut children = Vec::new();
        if tokens.last().is_some_and(|token| token == "{") {
            tokens.pop();
            *depth += 1;
            children = parse_block(lines, dir, depth)?;
        }

        items.push(Item {
            name,
            values: tokens,
            children,
        });
    }

    Ok(items)
}

/// Expands an `include <glob>` directive into the included files' items.
fn expand_include(dir: &Path, pattern: &str) -> Result<Vec<Item>, ParseError> {
    let full = dir.join(pattern);
    let full = full.to_str().ok_or_else(|| {
        ParseError::IncludePattern(full.to_string_lossy().into_owned())
    })?;

    let paths =
        glob::glob(full).map_err(|_| ParseError::IncludePattern(full.to_string()))?;

    let mut items = Vec::new();
    for path in paths.flatten() {
        let included = parse_file(&path).map_err(|source| ParseError::Include {
            pattern: full.to_string(),
            source: Box::new(source),
        })?;
        items.extend(included.children);
    }
    Ok(items)
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_special(c: char) -> bool {
    c == '#' || c == '{' || c == '}'
}

/// Splits one line into tokens. `#`, `{` and `}` are single-character
/// tokens, double-quoted strings keep their inner spaces (quotes stripped,
/// backslash escapes honored), everything else splits on whitespace.
fn split_line(line: &str) -> Result<Vec<String>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = line.chars().peekable();

    loop {
        // Skip the whitespace between tokens.
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        let Some(c) = chars.next() else {
            return Ok(tokens);
        };

        if is_special(c) {
            tokens.push(c.to_string());
            continue;
        }

        if c == '"' {
            let mut token = String::new();
            let mut escaped = false;
            let mut closed = false;
            for c in chars.by_ref() {
                if c == '"' && !escaped {
                    closed = true;
                    break;
                }
                escaped = c == '\\' && !escaped;
                token.push(c);
            }
            if !closed {
                return Err(ParseError::UnmatchedQuote(line.to_string()));
            }
            tokens.push(token);
            continue;
        }

        let mut token = c.to_string();
        while let Some(&next) = chars.peek() {
            if next.is_whitespace() || is_special(next) {
                break;
            }
            token.push(next);
            chars.next();
        }
        tokens.push(token);
    }
}
