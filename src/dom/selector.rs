//! The CSS subset the extraction policies and the annotation pass rely on:
//! type, `*`, `#id`, `.class`, attribute tests (`[a]`, `[a="v"]`, `[a*="v"]`,
//! `[a^="v"]`, `[a$="v"]`), `:last-child`, descendant and `>` combinators,
//! and comma-separated selector lists.

use anyhow::{Result, anyhow, bail};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AttrOp {
    Exists,
    Equals(String),
    Contains(String),
    Prefix(String),
    Suffix(String),
}

impl AttrOp {
    pub(crate) fn test(&self, actual: &str) -> bool {
        match self {
            AttrOp::Exists => true,
            AttrOp::Equals(v) => actual == v,
            AttrOp::Contains(v) => !v.is_empty() && actual.contains(v.as_str()),
            AttrOp::Prefix(v) => !v.is_empty() && actual.starts_with(v.as_str()),
            AttrOp::Suffix(v) => !v.is_empty() && actual.ends_with(v.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AttrTest {
    pub(crate) name: String,
    pub(crate) op: AttrOp,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct Compound {
    pub(crate) tag: Option<String>,
    pub(crate) id: Option<String>,
    pub(crate) classes: Vec<String>,
    pub(crate) attrs: Vec<AttrTest>,
    pub(crate) last_child: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Combinator {
    Descendant,
    Child,
}

/// One comma-free selector. `combinators[i]` sits between
/// `compounds[i]` and `compounds[i + 1]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Complex {
    pub(crate) compounds: Vec<Compound>,
    pub(crate) combinators: Vec<Combinator>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    pub(crate) alternatives: Vec<Complex>,
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self> {
        let mut alternatives = Vec::new();
        for part in split_list(source)? {
            let mut p = Parser::new(part);
            alternatives.push(
                p.complex()
                    .map_err(|e| anyhow!("invalid selector '{source}': {e}"))?,
            );
        }
        Ok(Self {
            source: source.to_string(),
            alternatives,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Selector({:?})", self.source)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Split on top-level commas (outside brackets and quotes).
fn split_list(source: &str) -> Result<Vec<&str>> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (i, c) in source.char_indices() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(c),
            (None, '[') => depth += 1,
            (None, ']') => depth = depth.saturating_sub(1),
            (None, ',') if depth == 0 => {
                parts.push(source[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(source[start..].trim());
    if parts.iter().any(|p| p.is_empty()) {
        bail!("empty selector in list '{source}'");
    }
    Ok(parts)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn complex(&mut self) -> Result<Complex> {
        let mut compounds = Vec::new();
        let mut combinators = Vec::new();
        self.skip_ws();
        loop {
            compounds.push(self.compound()?);
            let had_ws = self.skip_ws();
            match self.peek() {
                None => break,
                Some('>') => {
                    self.pos += 1;
                    self.skip_ws();
                    combinators.push(Combinator::Child);
                }
                Some(_) if had_ws => combinators.push(Combinator::Descendant),
                Some(c) => bail!("unexpected '{c}' at {}", self.pos),
            }
        }
        Ok(Complex {
            compounds,
            combinators,
        })
    }

    fn compound(&mut self) -> Result<Compound> {
        let mut out = Compound::default();
        let mut any = false;

        match self.peek() {
            Some('*') => {
                self.pos += 1;
                any = true;
            }
            Some(c) if is_ident_char(c) => {
                out.tag = Some(self.ident()?.to_ascii_lowercase());
                any = true;
            }
            _ => {}
        }

        loop {
            match self.peek() {
                Some('.') => {
                    self.pos += 1;
                    out.classes.push(self.ident()?);
                }
                Some('#') => {
                    self.pos += 1;
                    out.id = Some(self.ident()?);
                }
                Some('[') => {
                    self.pos += 1;
                    out.attrs.push(self.attr()?);
                }
                Some(':') => {
                    self.pos += 1;
                    let pseudo = self.ident()?;
                    if pseudo != "last-child" {
                        bail!("unsupported pseudo-class ':{pseudo}'");
                    }
                    out.last_child = true;
                }
                _ => break,
            }
            any = true;
        }

        if !any {
            match self.peek() {
                Some(c) => bail!("unexpected '{c}' at {}", self.pos),
                None => bail!("unexpected end of selector"),
            }
        }
        Ok(out)
    }

    fn attr(&mut self) -> Result<AttrTest> {
        self.skip_ws();
        let name = self.ident()?.to_ascii_lowercase();
        self.skip_ws();
        let op = match self.bump() {
            Some(']') => {
                return Ok(AttrTest {
                    name,
                    op: AttrOp::Exists,
                });
            }
            Some('=') => '=',
            Some(c @ ('*' | '^' | '$')) => {
                if self.bump() != Some('=') {
                    bail!("expected '=' after '{c}'");
                }
                c
            }
            Some(c) => bail!("unexpected '{c}' in attribute test"),
            None => bail!("unterminated attribute test"),
        };
        self.skip_ws();
        let value = self.value()?;
        self.skip_ws();
        if self.bump() != Some(']') {
            bail!("expected ']' after attribute value");
        }
        let op = match op {
            '=' => AttrOp::Equals(value),
            '*' => AttrOp::Contains(value),
            '^' => AttrOp::Prefix(value),
            _ => AttrOp::Suffix(value),
        };
        Ok(AttrTest { name, op })
    }

    fn value(&mut self) -> Result<String> {
        match self.peek() {
            Some(q @ ('"' | '\'')) => {
                self.pos += 1;
                let mut out = String::new();
                loop {
                    match self.bump() {
                        Some(c) if c == q => return Ok(out),
                        Some(c) => out.push(c),
                        None => bail!("unterminated string"),
                    }
                }
            }
            _ => self.ident(),
        }
    }

    fn ident(&mut self) -> Result<String> {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        if start == self.pos {
            bail!("expected identifier at {start}");
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_compound_with_attributes() {
        let sel = Selector::parse(r#"div[role="button"][aria-label*='Send']"#).unwrap();
        let c = &sel.alternatives[0].compounds[0];
        assert_eq!(c.tag.as_deref(), Some("div"));
        assert_eq!(c.attrs.len(), 2);
        assert_eq!(c.attrs[1].op, AttrOp::Contains("Send".into()));
    }

    #[test]
    fn parses_combinators_and_lists() {
        let sel = Selector::parse(r#"[role="dialog"] > div:last-child, [name=to] [email]"#).unwrap();
        assert_eq!(sel.alternatives.len(), 2);
        assert_eq!(sel.alternatives[0].combinators, vec![Combinator::Child]);
        assert!(sel.alternatives[0].compounds[1].last_child);
        assert_eq!(sel.alternatives[1].combinators, vec![Combinator::Descendant]);
    }

    #[test]
    fn parses_class_chains() {
        let sel = Selector::parse(".T-I.J-J5-Ji.aoO").unwrap();
        assert_eq!(sel.alternatives[0].compounds[0].classes, vec!["T-I", "J-J5-Ji", "aoO"]);
    }

    #[test]
    fn accepts_non_ascii_values() {
        let sel = Selector::parse(r#"[aria-label*="À"]"#).unwrap();
        assert_eq!(
            sel.alternatives[0].compounds[0].attrs[0].op,
            AttrOp::Contains("À".into())
        );
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(Selector::parse("").is_err());
        assert!(Selector::parse("div[").is_err());
        assert!(Selector::parse("a,,b").is_err());
        assert!(Selector::parse("p:hover").is_err());
    }
}
