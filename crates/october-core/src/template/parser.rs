//! Markup parser: splits source into text, `{{ }}` prints and `{% %}`
//! tags, then builds a node tree.

use super::policy::{KNOWN_FILTERS, SecurityPolicy};
use crate::CmsError;
use serde_json::Value;

// =============================================================================
// NODE TREE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// An expression inside `{{ }}` or a tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Var(String),
    /// `base.key` or `base[key]`
    Lookup(Box<Expr>, Box<Expr>),
    Map(Vec<(String, Expr)>),
    List(Vec<Expr>),
    Filter {
        name: String,
        input: Box<Expr>,
        args: Vec<Expr>,
    },
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CompareOp, Box<Expr>),
}

/// Named arguments of `partial`, `component` and `content` tags.
pub type TagArgs = Vec<(String, Expr)>;

/// One node of a parsed template.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    Print(Expr),
    Page,
    Partial { name: Expr, args: TagArgs },
    Component { alias: Expr, args: TagArgs },
    Content { name: Expr, args: TagArgs },
    If {
        cond: Expr,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
    For {
        key: Option<String>,
        value: String,
        iter: Expr,
        body: Vec<Node>,
        empty: Vec<Node>,
    },
}

// =============================================================================
// SEGMENTS
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum SegmentKind {
    Text,
    Print,
    Tag,
}

#[derive(Debug)]
struct Segment {
    kind: SegmentKind,
    body: String,
    line: usize,
    trim_before: bool,
    trim_after: bool,
}

fn line_at(source: &str, offset: usize) -> usize {
    source[..offset].matches('\n').count() + 1
}

/// Offset of `close` after `from`, skipping quoted strings.
fn find_close(source: &str, from: usize, close: &str) -> Option<usize> {
    let bytes = source.as_bytes();
    let mut quote: Option<u8> = None;
    let mut i = from;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some(_) if b == b'\\' => {
                i += 2;
                continue;
            }
            Some(q) if b == q => quote = None,
            Some(_) => {}
            None if b == b'"' || b == b'\'' => quote = Some(b),
            None if source[i..].starts_with(close) => return Some(i),
            None => {}
        }
        i += 1;
    }
    None
}

fn split_segments(source: &str) -> Result<Vec<Segment>, CmsError> {
    let mut segments = Vec::new();
    let mut pos = 0;

    while pos < source.len() {
        let next = ["{{", "{%", "{#"]
            .iter()
            .filter_map(|open| source[pos..].find(open).map(|at| (pos + at, *open)))
            .min_by_key(|(at, _)| *at);

        let Some((start, open)) = next else {
            segments.push(text_segment(&source[pos..], line_at(source, pos)));
            break;
        };
        if start > pos {
            segments.push(text_segment(&source[pos..start], line_at(source, pos)));
        }

        let close = match open {
            "{{" => "}}",
            "{%" => "%}",
            _ => "#}",
        };
        let line = line_at(source, start);
        let end = if open == "{#" {
            source[start + 2..].find(close).map(|at| start + 2 + at)
        } else {
            find_close(source, start + 2, close)
        }
        .ok_or_else(|| syntax(line, format!("unclosed '{}'", open)))?;

        let mut inner = &source[start + 2..end];
        let trim_before = inner.starts_with('-');
        if trim_before {
            inner = &inner[1..];
        }
        let trim_after = inner.ends_with('-');
        if trim_after {
            inner = &inner[..inner.len() - 1];
        }

        let kind = match open {
            "{{" => Some(SegmentKind::Print),
            "{%" => Some(SegmentKind::Tag),
            _ => None,
        };
        match kind {
            Some(kind) => segments.push(Segment {
                kind,
                body: inner.trim().to_string(),
                line,
                trim_before,
                trim_after,
            }),
            // Comments still honour whitespace control.
            None => segments.push(Segment {
                kind: SegmentKind::Text,
                body: String::new(),
                line,
                trim_before,
                trim_after,
            }),
        }
        pos = end + close.len();
    }

    apply_whitespace_control(&mut segments);
    Ok(segments)
}

fn text_segment(text: &str, line: usize) -> Segment {
    Segment {
        kind: SegmentKind::Text,
        body: text.to_string(),
        line,
        trim_before: false,
        trim_after: false,
    }
}

fn apply_whitespace_control(segments: &mut [Segment]) {
    for i in 0..segments.len() {
        if segments[i].trim_before && i > 0 {
            if let Some(prev) = segments.get_mut(i - 1) {
                if matches!(prev.kind, SegmentKind::Text) {
                    prev.body = prev.body.trim_end().to_string();
                }
            }
        }
        if segments[i].trim_after {
            if let Some(next) = segments.get_mut(i + 1) {
                if matches!(next.kind, SegmentKind::Text) {
                    next.body = next.body.trim_start().to_string();
                }
            }
        }
    }
}

fn syntax(line: usize, message: impl Into<String>) -> CmsError {
    CmsError::Template(format!("{} on line {}", message.into(), line))
}

// =============================================================================
// EXPRESSION LEXER
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(Value),
    Punct(&'static str),
}

const PUNCTS: &[&str] = &[
    "==", "!=", "<=", ">=", "<", ">", "=", "|", ".", ",", "(", ")", "{", "}", "[", "]", ":",
];

fn lex(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c == '"' || c == '\'' {
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    None => return Err("unterminated string".to_string()),
                    Some('\\') => {
                        if let Some(escaped) = chars.get(i + 1) {
                            text.push(*escaped);
                        }
                        i += 2;
                    }
                    Some(ch) if *ch == c => {
                        i += 1;
                        break;
                    }
                    Some(ch) => {
                        text.push(*ch);
                        i += 1;
                    }
                }
            }
            tokens.push(Token::Str(text));
        } else if c.is_ascii_digit() {
            let start = i;
            while chars.get(i).is_some_and(char::is_ascii_digit) {
                i += 1;
            }
            if chars.get(i) == Some(&'.') && chars.get(i + 1).is_some_and(char::is_ascii_digit) {
                i += 1;
                while chars.get(i).is_some_and(char::is_ascii_digit) {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().collect();
            let number = serde_json::from_str::<Value>(&text)
                .map_err(|_| format!("invalid number '{}'", text))?;
            tokens.push(Token::Num(number));
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while chars
                .get(i)
                .is_some_and(|ch| ch.is_alphanumeric() || *ch == '_')
            {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else {
            let rest: String = chars[i..chars.len().min(i + 2)].iter().collect();
            let punct = PUNCTS
                .iter()
                .copied()
                .find(|p| rest.starts_with(p))
                .ok_or_else(|| format!("unexpected character '{}'", c))?;
            tokens.push(Token::Punct(punct));
            i += punct.len();
        }
    }
    Ok(tokens)
}

// =============================================================================
// EXPRESSION PARSER
// =============================================================================

struct ExprParser<'p> {
    tokens: Vec<Token>,
    pos: usize,
    policy: &'p SecurityPolicy,
}

impl<'p> ExprParser<'p> {
    fn new(src: &str, policy: &'p SecurityPolicy) -> Result<Self, String> {
        Ok(Self {
            tokens: lex(src)?,
            pos: 0,
            policy,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn at_end(&self) -> bool {
        self.pos >= self.tokens.len()
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Some(Token::Punct(p)) if *p == punct) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Ident(w)) if w == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, punct: &str) -> Result<(), String> {
        if self.eat_punct(punct) {
            Ok(())
        } else {
            Err(format!("expected '{}'", punct))
        }
    }

    fn ident(&mut self) -> Result<String, String> {
        match self.next() {
            Some(Token::Ident(name)) => Ok(name),
            other => Err(format!("expected a name, found {:?}", other)),
        }
    }

    fn finish(&self) -> Result<(), String> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(format!("unexpected {:?}", token)),
        }
    }

    fn expr(&mut self) -> Result<Expr, String> {
        let mut left = self.and()?;
        while self.eat_keyword("or") {
            left = Expr::Or(Box::new(left), Box::new(self.and()?));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let mut left = self.not()?;
        while self.eat_keyword("and") {
            left = Expr::And(Box::new(left), Box::new(self.not()?));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, String> {
        if self.eat_keyword("not") {
            return Ok(Expr::Not(Box::new(self.not()?)));
        }
        self.compare()
    }

    fn compare(&mut self) -> Result<Expr, String> {
        let left = self.filtered()?;
        let op = match self.peek() {
            Some(Token::Punct("==")) => CompareOp::Eq,
            Some(Token::Punct("!=")) => CompareOp::Ne,
            Some(Token::Punct("<")) => CompareOp::Lt,
            Some(Token::Punct("<=")) => CompareOp::Le,
            Some(Token::Punct(">")) => CompareOp::Gt,
            Some(Token::Punct(">=")) => CompareOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.filtered()?;
        Ok(Expr::Compare(Box::new(left), op, Box::new(right)))
    }

    fn filtered(&mut self) -> Result<Expr, String> {
        let mut expr = self.postfix()?;
        while self.eat_punct("|") {
            let name = self.ident()?;
            if !KNOWN_FILTERS.contains(&name.as_str()) {
                return Err(format!("unknown filter '{}'", name));
            }
            if !self.policy.allows_filter(&name) {
                return Err(format!("filter '{}' is not allowed by the security policy", name));
            }
            let mut args = Vec::new();
            if self.eat_punct("(") {
                if !self.eat_punct(")") {
                    loop {
                        args.push(self.expr()?);
                        if self.eat_punct(")") {
                            break;
                        }
                        self.expect_punct(",")?;
                    }
                }
            }
            expr = Expr::Filter {
                name,
                input: Box::new(expr),
                args,
            };
        }
        Ok(expr)
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.primary()?;
        loop {
            if self.eat_punct(".") {
                let key = match self.next() {
                    Some(Token::Ident(name)) => Value::String(name),
                    Some(Token::Num(n)) => n,
                    other => return Err(format!("expected attribute, found {:?}", other)),
                };
                expr = Expr::Lookup(Box::new(expr), Box::new(Expr::Literal(key)));
            } else if self.eat_punct("[") {
                let key = self.expr()?;
                self.expect_punct("]")?;
                expr = Expr::Lookup(Box::new(expr), Box::new(key));
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(n)),
            Some(Token::Ident(word)) => Ok(match word.as_str() {
                "true" => Expr::Literal(Value::Bool(true)),
                "false" => Expr::Literal(Value::Bool(false)),
                "null" | "none" => Expr::Literal(Value::Null),
                _ => Expr::Var(word),
            }),
            Some(Token::Punct("(")) => {
                let inner = self.expr()?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            Some(Token::Punct("{")) => {
                let mut entries = Vec::new();
                if !self.eat_punct("}") {
                    loop {
                        let key = match self.next() {
                            Some(Token::Ident(k) | Token::Str(k)) => k,
                            other => return Err(format!("expected map key, found {:?}", other)),
                        };
                        self.expect_punct(":")?;
                        entries.push((key, self.expr()?));
                        if self.eat_punct("}") {
                            break;
                        }
                        self.expect_punct(",")?;
                    }
                }
                Ok(Expr::Map(entries))
            }
            Some(Token::Punct("[")) => {
                let mut items = Vec::new();
                if !self.eat_punct("]") {
                    loop {
                        items.push(self.expr()?);
                        if self.eat_punct("]") {
                            break;
                        }
                        self.expect_punct(",")?;
                    }
                }
                Ok(Expr::List(items))
            }
            other => Err(format!("unexpected {:?}", other)),
        }
    }

    /// `name=expr` pairs until the end of the tag.
    fn tag_args(&mut self) -> Result<TagArgs, String> {
        let mut args = Vec::new();
        while !self.at_end() {
            let name = self.ident()?;
            self.expect_punct("=")?;
            args.push((name, self.expr()?));
        }
        Ok(args)
    }
}

// =============================================================================
// TEMPLATE PARSER
// =============================================================================

/// Parse markup into a node tree under `policy`.
pub fn parse(source: &str, policy: &SecurityPolicy) -> Result<Vec<Node>, CmsError> {
    let segments = split_segments(source)?;
    let mut parser = TreeParser {
        segments,
        pos: 0,
        policy,
    };
    let (nodes, end) = parser.block(&[])?;
    match end {
        None => Ok(nodes),
        Some(tag) => Err(syntax(tag.line, format!("unexpected '{}'", tag.name))),
    }
}

struct EndTag {
    name: String,
    rest: String,
    line: usize,
}

struct TreeParser<'p> {
    segments: Vec<Segment>,
    pos: usize,
    policy: &'p SecurityPolicy,
}

fn split_tag(body: &str) -> (&str, &str) {
    match body.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (body, ""),
    }
}

impl<'p> TreeParser<'p> {
    fn expr_parser(&self, src: &str, line: usize) -> Result<ExprParser<'p>, CmsError> {
        ExprParser::new(src, self.policy).map_err(|e| syntax(line, e))
    }

    /// Parse until one of `terminators` (or the end of input).
    fn block(&mut self, terminators: &[&str]) -> Result<(Vec<Node>, Option<EndTag>), CmsError> {
        let mut nodes = Vec::new();

        while self.pos < self.segments.len() {
            let index = self.pos;
            self.pos += 1;
            let line = self.segments[index].line;
            let kind = self.segments[index].kind;
            let body = self.segments[index].body.clone();

            match kind {
                SegmentKind::Text => {
                    if !body.is_empty() {
                        nodes.push(Node::Text(body));
                    }
                }
                SegmentKind::Print => {
                    let mut p = self.expr_parser(&body, line)?;
                    let expr = p.expr().map_err(|e| syntax(line, e))?;
                    p.finish().map_err(|e| syntax(line, e))?;
                    nodes.push(Node::Print(expr));
                }
                SegmentKind::Tag => {
                    let (name, rest) = split_tag(&body);
                    if terminators.contains(&name) {
                        return Ok((
                            nodes,
                            Some(EndTag {
                                name: name.to_string(),
                                rest: rest.to_string(),
                                line,
                            }),
                        ));
                    }
                    nodes.push(self.tag(name, rest, line)?);
                }
            }
        }

        match terminators.last() {
            Some(end) => Err(syntax(
                self.last_line(),
                format!("unclosed block, expected '{}'", end),
            )),
            None => Ok((nodes, None)),
        }
    }

    fn last_line(&self) -> usize {
        self.segments.last().map(|s| s.line).unwrap_or(1)
    }

    fn tag(&mut self, name: &str, rest: &str, line: usize) -> Result<Node, CmsError> {
        if matches!(name, "else" | "elseif" | "endif" | "endfor") {
            return Err(syntax(line, format!("unexpected '{}'", name)));
        }
        if !self.policy.allows_tag(name) {
            return Err(syntax(
                line,
                format!("tag '{}' is not allowed by the security policy", name),
            ));
        }

        match name {
            "page" => {
                if !rest.is_empty() {
                    return Err(syntax(line, "'page' takes no arguments"));
                }
                Ok(Node::Page)
            }
            "partial" | "component" | "content" => {
                let mut p = self.expr_parser(rest, line)?;
                let target = p.expr().map_err(|e| syntax(line, e))?;
                let args = p.tag_args().map_err(|e| syntax(line, e))?;
                Ok(match name {
                    "partial" => Node::Partial { name: target, args },
                    "component" => Node::Component {
                        alias: target,
                        args,
                    },
                    _ => Node::Content { name: target, args },
                })
            }
            "if" => self.if_block(rest, line),
            "for" => self.for_block(rest, line),
            _ => Err(syntax(line, format!("unknown tag '{}'", name))),
        }
    }

    fn condition(&self, src: &str, line: usize) -> Result<Expr, CmsError> {
        let mut p = self.expr_parser(src, line)?;
        let cond = p.expr().map_err(|e| syntax(line, e))?;
        p.finish().map_err(|e| syntax(line, e))?;
        Ok(cond)
    }

    fn if_block(&mut self, rest: &str, line: usize) -> Result<Node, CmsError> {
        let cond = self.condition(rest, line)?;
        let (then, end) = self.block(&["elseif", "else", "endif"])?;
        let otherwise = match end {
            Some(tag) if tag.name == "elseif" => vec![self.if_block(&tag.rest, tag.line)?],
            Some(tag) if tag.name == "else" => self.block(&["endif"])?.0,
            _ => Vec::new(),
        };
        Ok(Node::If {
            cond,
            then,
            otherwise,
        })
    }

    fn for_block(&mut self, rest: &str, line: usize) -> Result<Node, CmsError> {
        let mut p = self.expr_parser(rest, line)?;
        let first = p.ident().map_err(|e| syntax(line, e))?;
        let (key, value) = if p.eat_punct(",") {
            let second = p.ident().map_err(|e| syntax(line, e))?;
            (Some(first), second)
        } else {
            (None, first)
        };
        if !p.eat_keyword("in") {
            return Err(syntax(line, "expected 'in'"));
        }
        let iter = p.expr().map_err(|e| syntax(line, e))?;
        p.finish().map_err(|e| syntax(line, e))?;

        let (body, end) = self.block(&["else", "endfor"])?;
        let empty = match end {
            Some(tag) if tag.name == "else" => self.block(&["endfor"])?.0,
            _ => Vec::new(),
        };
        Ok(Node::For {
            key,
            value,
            iter,
            body,
            empty,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_ok(src: &str) -> Vec<Node> {
        parse(src, &SecurityPolicy::permissive()).expect("parse")
    }

    #[test]
    fn text_and_prints() {
        let nodes = parse_ok("Hello {{ user.name|upper }}!");
        assert_eq!(nodes.len(), 3);
        assert!(matches!(&nodes[1], Node::Print(Expr::Filter { name, .. }) if name == "upper"));
    }

    #[test]
    fn comments_dropped() {
        assert_eq!(parse_ok("a{# note #}b"), vec![Node::Text("a".into()), Node::Text("b".into())]);
    }

    #[test]
    fn whitespace_control() {
        let nodes = parse_ok("a   {{- x -}}   b");
        assert_eq!(nodes[0], Node::Text("a".into()));
        assert_eq!(nodes[2], Node::Text("b".into()));
    }

    #[test]
    fn partial_with_args() {
        let nodes = parse_ok(r#"{% partial "card" item=post size=2 %}"#);
        match &nodes[0] {
            Node::Partial { name, args } => {
                assert_eq!(*name, Expr::Literal(Value::from("card")));
                assert_eq!(args.len(), 2);
                assert_eq!(args[0].0, "item");
            }
            other => unreachable!("unexpected {other:?}"),
        }
    }

    #[test]
    fn if_elseif_else() {
        let nodes = parse_ok("{% if a %}1{% elseif b %}2{% else %}3{% endif %}");
        let Node::If { otherwise, .. } = &nodes[0] else {
            unreachable!("expected if");
        };
        assert!(matches!(&otherwise[0], Node::If { otherwise, .. } if otherwise.len() == 1));
    }

    #[test]
    fn for_with_key_and_else() {
        let nodes = parse_ok("{% for k, v in items %}{{ k }}{% else %}none{% endfor %}");
        let Node::For { key, value, empty, .. } = &nodes[0] else {
            unreachable!("expected for");
        };
        assert_eq!(key.as_deref(), Some("k"));
        assert_eq!(value, "v");
        assert_eq!(empty.len(), 1);
    }

    #[test]
    fn closing_braces_inside_strings() {
        let nodes = parse_ok(r#"{{ "}}" }}"#);
        assert_eq!(nodes, vec![Node::Print(Expr::Literal(Value::from("}}")))]);
    }

    #[test]
    fn errors_carry_line_numbers() {
        let policy = SecurityPolicy::permissive();
        let err = parse("line1\n{% if x %}\nno end", &policy).expect_err("unclosed");
        assert!(err.to_string().contains("expected 'endif'"));

        let err = parse("\n\n{{ x|shout }}", &policy).expect_err("unknown filter");
        assert!(err.to_string().contains("line 3"));

        assert!(parse("{% endif %}", &policy).is_err());
        assert!(parse("{{ a b }}", &policy).is_err());
        assert!(parse("{% macro x %}", &policy).is_err());
    }

    #[test]
    fn policy_rejects_filters_and_tags() {
        let sandbox = SecurityPolicy::sandboxed();
        assert!(parse("{{ html|raw }}", &sandbox).is_err());
        let narrow = SecurityPolicy::permissive().with_tags(&["if"]);
        assert!(parse("{% for x in y %}{% endfor %}", &narrow).is_err());
    }
}
