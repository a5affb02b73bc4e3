//! Rule-tree evaluator: per-line matching, variable capture and
//! interpolation, write routing. Grounded on `node.c`/`node.h` for the
//! tree shape and `strpartial.c` for pattern resolution.

pub mod pattern;
pub mod tree;

pub use pattern::{parse_pattern, Pattern, PatternError, Segment};
pub use tree::{evaluate_block, CaptureFrame, EvalResult, ExecContext, Node, NodeKind};

/// The top-level rule list a config file compiles to. Evaluated once per
/// input line against every top-level statement in declaration order.
#[derive(Debug, Default)]
pub struct Tree {
    pub statements: Vec<Node>,
}

impl Tree {
    pub fn new(statements: Vec<Node>) -> Self {
        Tree { statements }
    }

    pub fn evaluate(&mut self, ctx: &mut ExecContext) -> EvalResult {
        evaluate_block(&mut self.statements, ctx)
    }
}
