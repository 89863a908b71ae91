//! Declarative configuration directives.
//!
//! Parses the line-oriented config text format into an ordered
//! directive list: one directive per line, `#`/`;` comments, and
//! `<tag>...</tag>` blocks for inline key material.

use thiserror::Error;

/// Errors raised while parsing or querying the option list.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OptionError {
    #[error("unterminated <{0}> block")]
    UnterminatedBlock(String),

    #[error("missing required option '{0}'")]
    MissingOption(String),

    #[error("option '{directive}': missing argument {index}")]
    MissingArgument { directive: String, index: usize },

    #[error("option '{directive}': argument {index} exceeds {max} bytes")]
    ArgumentTooLong {
        directive: String,
        index: usize,
        max: usize,
    },

    #[error("option '{directive}': {reason}")]
    BadValue { directive: String, reason: String },
}

/// A single parsed directive: name plus positional arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionItem {
    words: Vec<String>,
}

impl OptionItem {
    fn from_words(words: Vec<String>) -> Self {
        Self { words }
    }

    /// Directive name (first word).
    pub fn name(&self) -> &str {
        &self.words[0]
    }

    /// Number of words including the directive name.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Positional argument with a length bound; index 0 is the name.
    pub fn get(&self, index: usize, max_len: usize) -> Result<&str, OptionError> {
        let word = self
            .words
            .get(index)
            .ok_or_else(|| OptionError::MissingArgument {
                directive: self.name().to_string(),
                index,
            })?;
        if max_len != 0 && word.len() > max_len {
            return Err(OptionError::ArgumentTooLong {
                directive: self.name().to_string(),
                index,
                max: max_len,
            });
        }
        Ok(word)
    }

    /// Positional argument without erroring when absent.
    pub fn get_optional(&self, index: usize) -> Option<&str> {
        self.words.get(index).map(String::as_str)
    }
}

/// Ordered list of configuration directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OptionList {
    items: Vec<OptionItem>,
}

impl OptionList {
    /// Parse config text. `<tag>` blocks become a directive named `tag`
    /// whose single argument is the joined block body.
    pub fn parse(text: &str) -> Result<Self, OptionError> {
        let mut items = Vec::new();
        let mut lines = text.lines();
        while let Some(line) = lines.next() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(tag) = line
                .strip_prefix('<')
                .and_then(|l| l.strip_suffix('>'))
                .filter(|t| !t.starts_with('/'))
            {
                let close = format!("</{tag}>");
                let mut body = String::new();
                let mut closed = false;
                for inner in lines.by_ref() {
                    if inner.trim() == close {
                        closed = true;
                        break;
                    }
                    body.push_str(inner.trim());
                    body.push('\n');
                }
                if !closed {
                    return Err(OptionError::UnterminatedBlock(tag.to_string()));
                }
                items.push(OptionItem::from_words(vec![tag.to_string(), body]));
            } else {
                let words = split_words(line);
                if !words.is_empty() {
                    items.push(OptionItem::from_words(words));
                }
            }
        }
        Ok(Self { items })
    }

    /// First directive with the given name, if present.
    pub fn get(&self, name: &str) -> Option<&OptionItem> {
        self.items.iter().find(|item| item.name() == name)
    }

    /// First directive with the given name, erroring when absent.
    pub fn get_required(&self, name: &str) -> Result<&OptionItem, OptionError> {
        self.get(name)
            .ok_or_else(|| OptionError::MissingOption(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &OptionItem> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// Whitespace splitting with minimal double-quote support.
fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in line.chars() {
        match c {
            '"' => quoted = !quoted,
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}
