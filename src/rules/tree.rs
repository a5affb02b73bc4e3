//! Tagged-node rule tree and its depth-first evaluator. Grounded on
//! `node.c`/`node.h`, reimplemented as a sealed sum type (`NodeKind`) per
//! SPEC_FULL.md S9 -- no run-time polymorphism, the evaluator dispatches
//! on the tag directly.
//!
//! Nodes own their children directly (`Vec<Node>`) rather than the
//! original's intrusive child/sibling/parent pointer triangle: evaluation
//! order is simply the `Vec`'s order, which is the same thing the sibling
//! chain expressed, without needing parent back-links to make recursion
//! sound.

use regex::Regex;

use crate::table::StringTable;

use super::pattern::{Pattern, ResolveContext};

#[derive(Debug)]
pub enum NodeKind {
    Passthrough,
    Assign { var: String, pattern: Pattern },
    Break,
    Match {
        regex: Regex,
        target: Pattern,
        source_filter: Option<String>,
    },
    MatchAll {
        source_filter: Option<String>,
    },
    MElse,
    Write {
        pattern: Pattern,
        destination: String,
    },
}

#[derive(Debug)]
pub struct Node {
    pub kind: NodeKind,
    pub children: Vec<Node>,
}

impl Node {
    pub fn leaf(kind: NodeKind) -> Self {
        Node { kind, children: Vec::new() }
    }

    pub fn with_children(kind: NodeKind, children: Vec<Node>) -> Self {
        Node { kind, children }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalResult {
    True,
    False,
    Break,
    Error,
}

/// One entry per currently-open `MATCH`, exposing its capture groups to
/// descendant nodes. A stack because matches nest.
pub struct CaptureFrame {
    pub groups: Vec<Option<String>>,
}

pub struct ExecContext<'a> {
    pub source_symbol: &'a str,
    pub line: &'a str,
    pub datetime_format: &'a str,
    pub fractsecond_divider: u32,
    pub match_stack: Vec<CaptureFrame>,
    pub vars: &'a mut StringTable<String>,
    /// (destination symbol, rendered line) pairs emitted by WRITE nodes,
    /// in evaluation order, for the runtime to append to write queues.
    pub writes: Vec<(String, String)>,
}

impl<'a> ExecContext<'a> {
    fn resolve_ctx(&self) -> ResolveContext<'_> {
        ResolveContext {
            source_symbol: self.source_symbol,
            line: self.line,
            captures: self.match_stack.last().map(|f| f.groups.as_slice()),
            datetime_format: self.datetime_format,
            fractsecond_divider: self.fractsecond_divider,
            vars: &*self.vars,
        }
    }
}

/// Evaluates a sibling block (the top-level rule list, or one MATCH's
/// children) per the control rules: BREAK/ERROR halts the block and
/// propagates to the caller without escaping further; MELSE consults the
/// immediately preceding sibling's result.
pub fn evaluate_block(nodes: &mut [Node], ctx: &mut ExecContext) -> EvalResult {
    let mut prev = EvalResult::False;
    for node in nodes.iter_mut() {
        let this = evaluate_node(node, prev, ctx);
        if matches!(this, EvalResult::Break | EvalResult::Error) {
            return this;
        }
        prev = this;
    }
    prev
}

fn evaluate_node(node: &mut Node, prev_res: EvalResult, ctx: &mut ExecContext) -> EvalResult {
    let topr = match &mut node.kind {
        NodeKind::Passthrough => EvalResult::True,
        NodeKind::Break => EvalResult::Break,
        NodeKind::MElse => {
            if prev_res == EvalResult::False {
                EvalResult::True
            } else {
                EvalResult::False
            }
        }
        NodeKind::Assign { var, pattern } => {
            let rendered = {
                let rctx = ctx.resolve_ctx();
                pattern.resolve(&rctx)
            };
            ctx.vars.upsert(var, rendered);
            EvalResult::True
        }
        NodeKind::Write { pattern, destination } => {
            let mut rendered = {
                let rctx = ctx.resolve_ctx();
                pattern.resolve(&rctx)
            };
            if !rendered.ends_with('\n') {
                rendered.push('\n');
            }
            ctx.writes.push((destination.clone(), rendered));
            EvalResult::True
        }
        NodeKind::MatchAll { source_filter } => {
            if source_filter.as_deref().map_or(true, |s| s == ctx.source_symbol) {
                ctx.match_stack.push(CaptureFrame { groups: Vec::new() });
                EvalResult::True
            } else {
                EvalResult::False
            }
        }
        NodeKind::Match { regex, target, source_filter } => {
            if source_filter.as_deref().map_or(false, |s| s != ctx.source_symbol) {
                EvalResult::False
            } else {
                let haystack = {
                    let rctx = ctx.resolve_ctx();
                    target.resolve(&rctx)
                };
                match regex.captures(&haystack) {
                    Some(caps) => {
                        let groups = (0..caps.len())
                            .map(|i| caps.get(i).map(|m| m.as_str().to_owned()))
                            .collect();
                        ctx.match_stack.push(CaptureFrame { groups });
                        EvalResult::True
                    }
                    None => EvalResult::False,
                }
            }
        }
    };

    if matches!(topr, EvalResult::Break | EvalResult::Error) {
        return topr;
    }

    if topr == EvalResult::True && !node.children.is_empty() {
        let child_result = evaluate_block(&mut node.children, ctx);
        if matches!(node.kind, NodeKind::Match { .. } | NodeKind::MatchAll { .. }) {
            ctx.match_stack.pop();
        }
        if matches!(child_result, EvalResult::Error) {
            return EvalResult::Error;
        }
    } else if topr == EvalResult::True && matches!(node.kind, NodeKind::Match { .. } | NodeKind::MatchAll { .. }) {
        ctx.match_stack.pop();
    }

    topr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::pattern::parse_pattern;

    fn vars() -> StringTable<String> {
        StringTable::with_buckets(8)
    }

    #[test]
    fn match_captures_feed_a_nested_write() {
        let mut tree = vec![Node::with_children(
            NodeKind::Match {
                regex: Regex::new(r"hello (\w+)").unwrap(),
                target: Pattern(vec![super::super::pattern::Segment::LogLine]),
                source_filter: None,
            },
            vec![Node::leaf(NodeKind::Write {
                pattern: parse_pattern("%{1}\n").unwrap(),
                destination: "B".to_owned(),
            })],
        )];

        let mut v = vars();
        let mut ctx = ExecContext {
            source_symbol: "A",
            line: "hello world",
            datetime_format: "%FT%T",
            fractsecond_divider: 1,
            match_stack: Vec::new(),
            vars: &mut v,
            writes: Vec::new(),
        };
        let result = evaluate_block(&mut tree, &mut ctx);
        assert_eq!(result, EvalResult::True);
        assert_eq!(ctx.writes, vec![("B".to_owned(), "world\n".to_owned())]);
        assert!(ctx.match_stack.is_empty());
    }

    #[test]
    fn melse_fires_only_when_preceding_sibling_was_false() {
        let mut tree = vec![
            Node::leaf(NodeKind::Match {
                regex: Regex::new("nomatch").unwrap(),
                target: Pattern(vec![super::super::pattern::Segment::LogLine]),
                source_filter: None,
            }),
            Node::leaf(NodeKind::MElse),
        ];
        let mut v = vars();
        let mut ctx = ExecContext {
            source_symbol: "A",
            line: "hello world",
            datetime_format: "%FT%T",
            fractsecond_divider: 1,
            match_stack: Vec::new(),
            vars: &mut v,
            writes: Vec::new(),
        };
        assert_eq!(evaluate_block(&mut tree, &mut ctx), EvalResult::True);
    }

    #[test]
    fn break_halts_sibling_evaluation() {
        let mut tree = vec![
            Node::leaf(NodeKind::Break),
            Node::leaf(NodeKind::Write {
                pattern: parse_pattern("never\n").unwrap(),
                destination: "B".to_owned(),
            }),
        ];
        let mut v = vars();
        let mut ctx = ExecContext {
            source_symbol: "A",
            line: "x",
            datetime_format: "%FT%T",
            fractsecond_divider: 1,
            match_stack: Vec::new(),
            vars: &mut v,
            writes: Vec::new(),
        };
        evaluate_block(&mut tree, &mut ctx);
        assert!(ctx.writes.is_empty());
    }

    #[test]
    fn assign_is_visible_to_a_later_write_in_program_order() {
        let mut tree = vec![
            Node::leaf(NodeKind::Assign {
                var: "greeting".to_owned(),
                pattern: parse_pattern("hi").unwrap(),
            }),
            Node::leaf(NodeKind::Write {
                pattern: parse_pattern("%{greeting}\n").unwrap(),
                destination: "B".to_owned(),
            }),
        ];
        let mut v = vars();
        let mut ctx = ExecContext {
            source_symbol: "A",
            line: "x",
            datetime_format: "%FT%T",
            fractsecond_divider: 1,
            match_stack: Vec::new(),
            vars: &mut v,
            writes: Vec::new(),
        };
        evaluate_block(&mut tree, &mut ctx);
        assert_eq!(ctx.writes, vec![("B".to_owned(), "hi\n".to_owned())]);
    }
}
