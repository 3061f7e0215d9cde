use consentgate_core::GateError;

use crate::{Document, NodeId};

/// A small CSS selector subset: type, `*`, `#id`, `.class`, attribute
/// selectors (`[a]`, `=`, `~=`, `^=`, `$=`, `*=`), descendant and child
/// combinators, and comma-separated lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    source: String,
    alternatives: Vec<Complex>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Complex {
    steps: Vec<Compound>,
    /// `combinators[i]` joins `steps[i]` and `steps[i + 1]`
    combinators: Vec<Combinator>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Compound {
    tag: Option<String>,
    id: Option<String>,
    classes: Vec<String>,
    attrs: Vec<AttrMatch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct AttrMatch {
    name: String,
    op: AttrOp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttrOp {
    Exists,
    Equals(String),
    Word(String),
    Prefix(String),
    Suffix(String),
    Contains(String),
}

impl Selector {
    pub fn parse(source: &str) -> Result<Self, GateError> {
        let alternatives = Parser::new(source).parse_list()?;
        Ok(Self { source: source.to_string(), alternatives })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, doc: &Document, node: NodeId) -> bool {
        doc.is_element(node)
            && self
                .alternatives
                .iter()
                .any(|complex| matches_at(doc, node, &complex.steps, &complex.combinators))
    }
}

fn matches_at(doc: &Document, node: NodeId, steps: &[Compound], combinators: &[Combinator]) -> bool {
    let Some((subject, rest)) = steps.split_last() else {
        return false;
    };
    if !subject.matches(doc, node) {
        return false;
    }
    let Some((combinator, rest_combinators)) = combinators.split_last() else {
        return true;
    };
    match combinator {
        Combinator::Child => doc
            .parent_element(node)
            .is_some_and(|parent| matches_at(doc, parent, rest, rest_combinators)),
        Combinator::Descendant => {
            let mut current = doc.parent_element(node);
            while let Some(ancestor) = current {
                if matches_at(doc, ancestor, rest, rest_combinators) {
                    return true;
                }
                current = doc.parent_element(ancestor);
            }
            false
        }
    }
}

impl Compound {
    fn is_empty(&self) -> bool {
        self.tag.is_none() && self.id.is_none() && self.classes.is_empty() && self.attrs.is_empty()
    }

    fn matches(&self, doc: &Document, node: NodeId) -> bool {
        if let Some(tag) = &self.tag {
            if tag != "*" && doc.tag(node) != Some(tag.as_str()) {
                return false;
            }
        }
        if let Some(id) = &self.id {
            if doc.attr(node, "id") != Some(id.as_str()) {
                return false;
            }
        }
        if !self.classes.iter().all(|class| doc.has_class(node, class)) {
            return false;
        }
        self.attrs.iter().all(|attr| {
            let Some(value) = doc.attr(node, &attr.name) else {
                return false;
            };
            match &attr.op {
                AttrOp::Exists => true,
                AttrOp::Equals(expected) => value == expected,
                AttrOp::Word(word) => value.split_whitespace().any(|w| w == word),
                AttrOp::Prefix(prefix) => !prefix.is_empty() && value.starts_with(prefix.as_str()),
                AttrOp::Suffix(suffix) => !suffix.is_empty() && value.ends_with(suffix.as_str()),
                AttrOp::Contains(needle) => !needle.is_empty() && value.contains(needle.as_str()),
            }
        })
    }
}

struct Parser<'a> {
    source: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self { source, chars: source.chars().collect(), pos: 0 }
    }

    fn error(&self, reason: impl Into<String>) -> GateError {
        GateError::invalid_selector(self.source, reason)
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_whitespace(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn expect(&mut self, expected: char) -> Result<(), GateError> {
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            Some(c) => Err(self.error(format!("expected '{}', found '{}'", expected, c))),
            None => Err(self.error(format!("expected '{}', found end of input", expected))),
        }
    }

    fn parse_list(&mut self) -> Result<Vec<Complex>, GateError> {
        let mut alternatives = Vec::new();
        loop {
            self.skip_whitespace();
            alternatives.push(self.parse_complex()?);
            self.skip_whitespace();
            match self.bump() {
                None => return Ok(alternatives),
                Some(',') => continue,
                Some(c) => return Err(self.error(format!("unexpected '{}'", c))),
            }
        }
    }

    fn parse_complex(&mut self) -> Result<Complex, GateError> {
        let mut steps = vec![self.parse_compound()?];
        let mut combinators = Vec::new();
        loop {
            let had_space = self.skip_whitespace();
            let combinator = match self.peek() {
                None | Some(',') => break,
                Some('>') => {
                    self.pos += 1;
                    self.skip_whitespace();
                    Combinator::Child
                }
                Some(_) if had_space => Combinator::Descendant,
                Some(c) => return Err(self.error(format!("unexpected '{}'", c))),
            };
            combinators.push(combinator);
            steps.push(self.parse_compound()?);
        }
        Ok(Complex { steps, combinators })
    }

    fn parse_compound(&mut self) -> Result<Compound, GateError> {
        let mut compound = Compound::default();
        if self.peek() == Some('*') {
            self.pos += 1;
            compound.tag = Some("*".to_string());
        } else if self.peek().is_some_and(is_ident_char) {
            compound.tag = Some(self.parse_ident()?.to_ascii_lowercase());
        }
        loop {
            match self.peek() {
                Some('#') => {
                    self.pos += 1;
                    compound.id = Some(self.parse_ident()?);
                }
                Some('.') => {
                    self.pos += 1;
                    compound.classes.push(self.parse_ident()?);
                }
                Some('[') => {
                    self.pos += 1;
                    compound.attrs.push(self.parse_attr()?);
                }
                _ => break,
            }
        }
        if compound.is_empty() {
            return Err(match self.peek() {
                Some(c) => self.error(format!("unexpected '{}'", c)),
                None => self.error("empty selector"),
            });
        }
        Ok(compound)
    }

    fn parse_ident(&mut self) -> Result<String, GateError> {
        let start = self.pos;
        while self.peek().is_some_and(is_ident_char) {
            self.pos += 1;
        }
        if start == self.pos {
            return Err(self.error("expected identifier"));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn parse_attr(&mut self) -> Result<AttrMatch, GateError> {
        self.skip_whitespace();
        let name = self.parse_ident()?.to_ascii_lowercase();
        self.skip_whitespace();
        let op = match self.bump() {
            Some(']') => return Ok(AttrMatch { name, op: AttrOp::Exists }),
            Some('=') => '=',
            Some(c @ ('~' | '^' | '$' | '*')) => {
                self.expect('=')?;
                c
            }
            Some(c) => return Err(self.error(format!("unexpected '{}' in attribute selector", c))),
            None => return Err(self.error("unterminated attribute selector")),
        };
        self.skip_whitespace();
        let value = self.parse_value()?;
        self.skip_whitespace();
        self.expect(']')?;
        let op = match op {
            '~' => AttrOp::Word(value),
            '^' => AttrOp::Prefix(value),
            '$' => AttrOp::Suffix(value),
            '*' => AttrOp::Contains(value),
            _ => AttrOp::Equals(value),
        };
        Ok(AttrMatch { name, op })
    }

    fn parse_value(&mut self) -> Result<String, GateError> {
        match self.peek() {
            Some(quote @ ('"' | '\'')) => {
                self.pos += 1;
                let start = self.pos;
                while self.peek().is_some_and(|c| c != quote) {
                    self.pos += 1;
                }
                let value: String = self.chars[start..self.pos].iter().collect();
                self.expect(quote)?;
                Ok(value)
            }
            _ => self.parse_ident(),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}
