//! Hand-written recursive-descent parser for the configuration grammar
//! sketched in SPEC_FULL.md's AMBIENT STACK section. Deliberately minimal:
//! no includes, no macros, no conditionals -- just enough surface to build
//! the [`Origin`] list and [`Tree`] the core engine requires.

use std::path::PathBuf;

use regex::Regex;

use crate::descriptor::{DescriptorKind, Origin};
use crate::rules::{parse_pattern, Node, NodeKind, Tree};

use super::{Config, DEFAULT_DATETIME_FORMAT, DEFAULT_FRACTSECOND_DIVIDER, DEFAULT_PIDFILE};

#[derive(Debug, snafu::Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to read config file {path}: {source}"))]
    Read { path: String, source: std::io::Error },
    #[snafu(display("line {line}: {reason}"))]
    Syntax { line: usize, reason: String },
    #[snafu(display("line {line}: invalid regex: {source}"))]
    Regex { line: usize, source: regex::Error },
    #[snafu(display("line {line}: invalid pattern: {source}"))]
    Pattern { line: usize, source: crate::rules::PatternError },
    #[snafu(display("unknown symbol {symbol:?} referenced in a write() directive"))]
    UnknownSymbol { symbol: String },
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(i64),
    Slash,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Semi,
    Comma,
    Eq,
    Eof,
}

struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    src: &'a str,
    line: usize,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Lexer { chars: src.char_indices().peekable(), src, line: 1 }
    }

    fn tokenize(mut self) -> Result<Vec<(Tok, usize)>, ConfigError> {
        let mut out = Vec::new();
        loop {
            self.skip_trivia();
            let line = self.line;
            let Some(&(i, c)) = self.chars.peek() else {
                out.push((Tok::Eof, line));
                break;
            };
            let tok = match c {
                '(' => { self.chars.next(); Tok::LParen }
                ')' => { self.chars.next(); Tok::RParen }
                '{' => { self.chars.next(); Tok::LBrace }
                '}' => { self.chars.next(); Tok::RBrace }
                ';' => { self.chars.next(); Tok::Semi }
                ',' => { self.chars.next(); Tok::Comma }
                '=' => { self.chars.next(); Tok::Eq }
                '/' => self.lex_regex(i)?,
                '"' => self.lex_string(i)?,
                c if c.is_ascii_digit() => self.lex_number(),
                c if c.is_alphabetic() || c == '_' => self.lex_ident(),
                other => {
                    return Err(ConfigError::Syntax { line, reason: format!("unexpected character {other:?}") });
                }
            };
            out.push((tok, line));
        }
        Ok(out)
    }

    fn skip_trivia(&mut self) {
        loop {
            match self.chars.peek() {
                Some(&(_, '\n')) => {
                    self.line += 1;
                    self.chars.next();
                }
                Some(&(_, c)) if c.is_whitespace() => {
                    self.chars.next();
                }
                Some(&(_, '#')) => {
                    while let Some(&(_, c)) = self.chars.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.chars.next();
                    }
                }
                _ => break,
            }
        }
    }

    fn lex_ident(&mut self) -> Tok {
        let start = self.chars.peek().unwrap().0;
        let mut end = start;
        while let Some(&(i, c)) = self.chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                end = i + c.len_utf8();
                self.chars.next();
            } else {
                break;
            }
        }
        Tok::Ident(self.src[start..end].to_owned())
    }

    fn lex_number(&mut self) -> Tok {
        let start = self.chars.peek().unwrap().0;
        let mut end = start;
        while let Some(&(i, c)) = self.chars.peek() {
            if c.is_ascii_digit() {
                end = i + 1;
                self.chars.next();
            } else {
                break;
            }
        }
        Tok::Num(self.src[start..end].parse().unwrap_or(0))
    }

    fn lex_string(&mut self, _start: usize) -> Result<Tok, ConfigError> {
        self.chars.next(); // opening quote
        let mut s = String::new();
        loop {
            match self.chars.next() {
                Some((_, '"')) => return Ok(Tok::Str(s)),
                Some((_, '\\')) => {
                    if let Some((_, esc)) = self.chars.next() {
                        s.push(match esc {
                            'n' => '\n',
                            't' => '\t',
                            other => other,
                        });
                    }
                }
                Some((_, c)) => s.push(c),
                None => return Err(ConfigError::Syntax { line: self.line, reason: "unterminated string".to_owned() }),
            }
        }
    }

    fn lex_regex(&mut self, _start: usize) -> Result<Tok, ConfigError> {
        self.chars.next(); // opening slash
        let mut s = String::new();
        loop {
            match self.chars.next() {
                Some((_, '/')) => break,
                Some((_, '\\')) => {
                    if let Some((_, esc)) = self.chars.next() {
                        if esc != '/' {
                            s.push('\\');
                        }
                        s.push(esc);
                    }
                }
                Some((_, c)) => s.push(c),
                None => return Err(ConfigError::Syntax { line: self.line, reason: "unterminated regex".to_owned() }),
            }
        }
        Ok(Tok::Str(s))
    }
}

struct Parser {
    toks: Vec<(Tok, usize)>,
    pos: usize,
    origins: Vec<Origin>,
    listen_port: Option<u16>,
    datetime_format: String,
    fractsecond_divider: u32,
    pidfile: PathBuf,
}

pub fn parse(text: &str) -> Result<Config, ConfigError> {
    let toks = Lexer::new(text).tokenize()?;
    let mut p = Parser {
        toks,
        pos: 0,
        origins: Vec::new(),
        listen_port: None,
        datetime_format: DEFAULT_DATETIME_FORMAT.to_owned(),
        fractsecond_divider: DEFAULT_FRACTSECOND_DIVIDER,
        pidfile: PathBuf::from(DEFAULT_PIDFILE),
    };

    let mut statements = Vec::new();
    while !p.at_eof() {
        if let Some(stmt) = p.parse_top_level()? {
            statements.push(stmt);
        }
    }

    for stmt in &statements {
        validate_destinations(stmt, &p.origins)?;
    }

    Ok(Config {
        origins: p.origins,
        tree: Tree::new(statements),
        listen_port: p.listen_port,
        datetime_format: p.datetime_format,
        fractsecond_divider: p.fractsecond_divider,
        pidfile: p.pidfile,
    })
}

fn validate_destinations(node: &Node, origins: &[Origin]) -> Result<(), ConfigError> {
    if let NodeKind::Write { destination, .. } = &node.kind {
        if !origins.iter().any(|o| &o.symbol == destination) {
            return Err(ConfigError::UnknownSymbol { symbol: destination.clone() });
        }
    }
    for child in &node.children {
        validate_destinations(child, origins)?;
    }
    Ok(())
}

impl Parser {
    fn at_eof(&self) -> bool {
        matches!(self.toks[self.pos].0, Tok::Eof)
    }

    fn peek(&self) -> &Tok {
        &self.toks[self.pos].0
    }

    fn line(&self) -> usize {
        self.toks[self.pos].1
    }

    fn advance(&mut self) -> Tok {
        let t = self.toks[self.pos].0.clone();
        if self.pos + 1 < self.toks.len() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, tok: &Tok) -> Result<(), ConfigError> {
        if self.peek() == tok {
            self.advance();
            Ok(())
        } else {
            Err(ConfigError::Syntax {
                line: self.line(),
                reason: format!("expected {tok:?}, found {:?}", self.peek()),
            })
        }
    }

    fn expect_ident(&mut self) -> Result<String, ConfigError> {
        match self.advance() {
            Tok::Ident(s) => Ok(s),
            other => Err(ConfigError::Syntax { line: self.line(), reason: format!("expected identifier, found {other:?}") }),
        }
    }

    fn expect_str(&mut self) -> Result<String, ConfigError> {
        match self.advance() {
            Tok::Str(s) => Ok(s),
            other => Err(ConfigError::Syntax { line: self.line(), reason: format!("expected string, found {other:?}") }),
        }
    }

    fn expect_num(&mut self) -> Result<i64, ConfigError> {
        match self.advance() {
            Tok::Num(n) => Ok(n),
            other => Err(ConfigError::Syntax { line: self.line(), reason: format!("expected number, found {other:?}") }),
        }
    }

    fn parse_top_level(&mut self) -> Result<Option<Node>, ConfigError> {
        let line = self.line();
        let kw = self.expect_ident()?;
        match kw.as_str() {
            "source" => { self.parse_source()?; Ok(None) }
            "sink" => { self.parse_sink()?; Ok(None) }
            "listen" => {
                let port = self.expect_num()?;
                self.expect(&Tok::Semi)?;
                self.listen_port = Some(port as u16);
                Ok(None)
            }
            "datetime_format" => {
                self.expect(&Tok::Eq)?;
                self.datetime_format = self.expect_str()?;
                self.expect(&Tok::Semi)?;
                Ok(None)
            }
            "fractsecond_divider" => {
                self.expect(&Tok::Eq)?;
                self.fractsecond_divider = self.expect_num()? as u32;
                self.expect(&Tok::Semi)?;
                Ok(None)
            }
            "pidfile" => {
                self.expect(&Tok::Eq)?;
                self.pidfile = PathBuf::from(self.expect_str()?);
                self.expect(&Tok::Semi)?;
                Ok(None)
            }
            "match" => Ok(Some(self.parse_match(line)?)),
            "matchall" => Ok(Some(self.parse_matchall(line)?)),
            "melse" => Ok(Some(self.parse_melse()?)),
            "break" => {
                self.expect(&Tok::Semi)?;
                Ok(Some(Node::leaf(NodeKind::Break)))
            }
            other => Err(ConfigError::Syntax { line, reason: format!("unexpected top-level keyword {other:?}") }),
        }
    }

    fn parse_source(&mut self) -> Result<(), ConfigError> {
        let symbol = self.expect_ident()?;
        self.expect(&Tok::Eq)?;
        let endpoint = self.expect_ident()?;
        self.expect(&Tok::LParen)?;
        let origin = match endpoint.as_str() {
            "file" => Origin { symbol, kind: DescriptorKind::FileRead, path: Some(PathBuf::from(self.expect_str()?)), host: None, port: None, rotate_threshold: None },
            "fifo" => Origin { symbol, kind: DescriptorKind::FifoRead, path: Some(PathBuf::from(self.expect_str()?)), host: None, port: None, rotate_threshold: None },
            other => return Err(ConfigError::Syntax { line: self.line(), reason: format!("unknown source endpoint {other:?}") }),
        };
        self.expect(&Tok::RParen)?;
        self.expect(&Tok::Semi)?;
        self.origins.push(origin);
        Ok(())
    }

    fn parse_sink(&mut self) -> Result<(), ConfigError> {
        let symbol = self.expect_ident()?;
        self.expect(&Tok::Eq)?;
        let endpoint = self.expect_ident()?;
        self.expect(&Tok::LParen)?;
        let origin = match endpoint.as_str() {
            "file" => Origin { symbol, kind: DescriptorKind::FileWrite, path: Some(PathBuf::from(self.expect_str()?)), host: None, port: None, rotate_threshold: None },
            "fifo" => Origin { symbol, kind: DescriptorKind::FifoWrite, path: Some(PathBuf::from(self.expect_str()?)), host: None, port: None, rotate_threshold: None },
            "rotated" => {
                let path = PathBuf::from(self.expect_str()?);
                self.expect(&Tok::Comma)?;
                let size_kw = self.expect_ident()?;
                if size_kw != "size" {
                    return Err(ConfigError::Syntax { line: self.line(), reason: "expected 'size' keyword".to_owned() });
                }
                self.expect(&Tok::Eq)?;
                let size = self.expect_num()?;
                Origin { symbol, kind: DescriptorKind::RotatedLog, path: Some(path), host: None, port: None, rotate_threshold: Some(size as u64) }
            }
            "tcp" => {
                let host = self.expect_str()?;
                self.expect(&Tok::Comma)?;
                let port = self.expect_num()?;
                Origin { symbol, kind: DescriptorKind::SocketWrite, path: None, host: Some(host), port: Some(port as u16), rotate_threshold: None }
            }
            other => return Err(ConfigError::Syntax { line: self.line(), reason: format!("unknown sink endpoint {other:?}") }),
        };
        self.expect(&Tok::RParen)?;
        self.expect(&Tok::Semi)?;
        self.origins.push(origin);
        Ok(())
    }

    fn parse_source_filter(&mut self) -> Result<Option<String>, ConfigError> {
        if matches!(self.peek(), Tok::Ident(s) if s == "source") {
            self.advance();
            self.expect(&Tok::LParen)?;
            let sym = self.expect_ident()?;
            self.expect(&Tok::RParen)?;
            Ok(Some(sym))
        } else {
            Ok(None)
        }
    }

    fn parse_match(&mut self, line: usize) -> Result<Node, ConfigError> {
        let source_filter = self.parse_source_filter()?;
        let regex_text = self.expect_str()?;
        let regex = Regex::new(&regex_text).map_err(|source| ConfigError::Regex { line, source })?;
        let children = self.parse_block()?;
        Ok(Node::with_children(
            NodeKind::Match {
                regex,
                target: crate::rules::Pattern(vec![crate::rules::Segment::LogLine]),
                source_filter,
            },
            children,
        ))
    }

    fn parse_matchall(&mut self, _line: usize) -> Result<Node, ConfigError> {
        let source_filter = self.parse_source_filter()?;
        let children = self.parse_block()?;
        Ok(Node::with_children(NodeKind::MatchAll { source_filter }, children))
    }

    fn parse_melse(&mut self) -> Result<Node, ConfigError> {
        let children = self.parse_block()?;
        Ok(Node::with_children(NodeKind::MElse, children))
    }

    fn parse_block(&mut self) -> Result<Vec<Node>, ConfigError> {
        self.expect(&Tok::LBrace)?;
        let mut nodes = Vec::new();
        while !matches!(self.peek(), Tok::RBrace) {
            let line = self.line();
            let kw = self.expect_ident()?;
            let node = match kw.as_str() {
                "assign" => {
                    let name = self.expect_ident()?;
                    self.expect(&Tok::Eq)?;
                    let text = self.expect_str()?;
                    self.expect(&Tok::Semi)?;
                    let pattern = parse_pattern(&text).map_err(|source| ConfigError::Pattern { line, source })?;
                    Node::leaf(NodeKind::Assign { var: name, pattern })
                }
                "write" => {
                    self.expect(&Tok::LParen)?;
                    let destination = self.expect_ident()?;
                    self.expect(&Tok::Comma)?;
                    let text = self.expect_str()?;
                    self.expect(&Tok::RParen)?;
                    self.expect(&Tok::Semi)?;
                    let pattern = parse_pattern(&text).map_err(|source| ConfigError::Pattern { line, source })?;
                    Node::leaf(NodeKind::Write { pattern, destination })
                }
                "break" => {
                    self.expect(&Tok::Semi)?;
                    Node::leaf(NodeKind::Break)
                }
                "match" => self.parse_match(line)?,
                "matchall" => self.parse_matchall(line)?,
                "melse" => self.parse_melse()?,
                other => return Err(ConfigError::Syntax { line, reason: format!("unexpected statement {other:?}") }),
            };
            nodes.push(node);
        }
        self.expect(&Tok::RBrace)?;
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_seed_scenario_one() {
        let text = r#"
            source A = file("/tmp/a.log");
            sink B = file("/tmp/b.log");
            match source(A) /hello (\w+)/ {
                write(B, "%{1}\n");
            }
        "#;
        let cfg = parse(text).unwrap();
        assert_eq!(cfg.origins.len(), 2);
        assert_eq!(cfg.tree.statements.len(), 1);
    }

    #[test]
    fn rejects_write_to_unknown_symbol() {
        let text = r#"
            source A = file("/tmp/a.log");
            matchall { write(GHOST, "x\n"); }
        "#;
        assert!(matches!(parse(text), Err(ConfigError::UnknownSymbol { .. })));
    }

    #[test]
    fn parses_rotated_and_tcp_sinks_and_listen() {
        let text = r#"
            sink R = rotated("/var/log/app.log", size = 1048576);
            sink T = tcp("example.invalid", 9000);
            listen 9001;
        "#;
        let cfg = parse(text).unwrap();
        assert_eq!(cfg.listen_port, Some(9001));
        assert_eq!(cfg.origins[0].rotate_threshold, Some(1_048_576));
        assert_eq!(cfg.origins[1].port, Some(9000));
    }
}
