use thiserror::Error;

use crate::ast::{Interior, Node, NodeKind};
use crate::token::{Token, TokenKind};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("line {line}: expected {expected:?}, found {found:?} (\"{text}\")\n    {context}")]
    Unexpected {
        expected: TokenKind,
        found: TokenKind,
        text: String,
        line: usize,
        context: String,
    },
    #[error("unexpected end of input: expected {expected:?}")]
    UnexpectedEnd { expected: TokenKind },
    #[error("line {line}: invalid expression\n    {context}")]
    InvalidExpression { line: usize, context: String },
}

const COMPARISON_OPS: [TokenKind; 6] = [
    TokenKind::EqualEqual,
    TokenKind::BangEqual,
    TokenKind::Less,
    TokenKind::LessEqual,
    TokenKind::Greater,
    TokenKind::GreaterEqual,
];

/// Parse the token list into an AST rooted at `Root` → `StmtList`.
///
/// `lines` is the original source, used only for error context. Tokens after
/// the closing brace of the top-level statement list are ignored.
pub fn parse(tokens: &[Token], lines: &[&str]) -> Result<Node, ParseError> {
    let mut parser = Parser {
        tokens,
        lines,
        pos: 0,
    };
    let mut root = Interior::new(NodeKind::Root);
    match parser.statement_list()? {
        Some(list) => {
            root.push(list);
            Ok(root.into())
        }
        None => Err(parser.unexpected(TokenKind::LBrace)),
    }
}

struct Parser<'a> {
    tokens: &'a [Token],
    lines: &'a [&'a str],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn current(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn is(&self, kind: TokenKind) -> bool {
        self.current().map(|t| t.kind) == Some(kind)
    }

    fn is_any(&self, kinds: &[TokenKind]) -> bool {
        match self.current() {
            Some(token) => kinds.contains(&token.kind),
            None => false,
        }
    }

    /// Check the current token without consuming it; callers advance after.
    fn expect(&self, kind: TokenKind) -> Result<&'a Token, ParseError> {
        match self.current() {
            Some(token) if token.kind == kind => Ok(token),
            _ => Err(self.unexpected(kind)),
        }
    }

    fn unexpected(&self, expected: TokenKind) -> ParseError {
        match self.current() {
            Some(token) => ParseError::Unexpected {
                expected,
                found: token.kind,
                text: token.text.clone(),
                line: token.line,
                context: self.context_line(token.line),
            },
            None => ParseError::UnexpectedEnd { expected },
        }
    }

    fn invalid_expression(&self) -> ParseError {
        let line = self
            .current()
            .or_else(|| self.tokens.last())
            .map(|t| t.line)
            .unwrap_or(0);
        ParseError::InvalidExpression {
            line,
            context: self.context_line(line),
        }
    }

    /// The offending source line with leading whitespace stripped.
    fn context_line(&self, line: usize) -> String {
        self.lines
            .get(line.wrapping_sub(1))
            .map(|l| l.trim_start().to_string())
            .unwrap_or_default()
    }

    /// factor: function call | number | identifier | '(' expression ')'.
    ///
    /// The call alternative is tried first and backtracked on failure, since
    /// a lone identifier is also a valid factor.
    fn factor(&mut self) -> Result<Node, ParseError> {
        let mut node = Interior::new(NodeKind::Factor);

        if let Some(call) = self.func_call()? {
            node.push(call);
            return Ok(node.into());
        }

        if self.is(TokenKind::Number) || self.is(TokenKind::Identifier) {
            if let Some(token) = self.current() {
                node.push_leaf(token.clone());
            }
            self.advance();
            return Ok(node.into());
        }

        if self.is(TokenKind::LParen) {
            self.advance();
            node.push(self.expression()?);
            self.expect(TokenKind::RParen)?;
            self.advance();
            return Ok(node.into());
        }

        Err(self.invalid_expression())
    }

    /// term: factor (('*' | '/' | '%') factor)*.
    fn term(&mut self) -> Result<Node, ParseError> {
        let mut node = Interior::new(NodeKind::Term);
        node.push(self.factor()?);
        while self.is_any(&[TokenKind::Star, TokenKind::Slash, TokenKind::Percent]) {
            if let Some(token) = self.current() {
                node.push_leaf(token.clone());
            }
            self.advance();
            node.push(self.factor()?);
        }
        Ok(node.into())
    }

    /// expr_no_comp: ('+' | '-')? term (('+' | '-') term)*.
    fn expr_no_comp(&mut self) -> Result<Node, ParseError> {
        let mut node = Interior::new(NodeKind::ExprNoComp);
        if self.is_any(&[TokenKind::Plus, TokenKind::Minus]) {
            if let Some(token) = self.current() {
                node.push_leaf(token.clone());
            }
            self.advance();
        }
        node.push(self.term()?);
        while self.is_any(&[TokenKind::Plus, TokenKind::Minus]) {
            if let Some(token) = self.current() {
                node.push_leaf(token.clone());
            }
            self.advance();
            node.push(self.term()?);
        }
        Ok(node.into())
    }

    /// expression: expr_no_comp (comparison expr_no_comp)?. Comparisons do
    /// not chain.
    fn expression(&mut self) -> Result<Node, ParseError> {
        let mut node = Interior::new(NodeKind::Expr);
        node.push(self.expr_no_comp()?);
        if self.is_any(&COMPARISON_OPS) {
            if let Some(token) = self.current() {
                node.push_leaf(token.clone());
            }
            self.advance();
            node.push(self.expr_no_comp()?);
        }
        Ok(node.into())
    }

    /// expression_list: '(' ')' | '(' expression (',' expression)* ')'.
    fn expression_list(&mut self) -> Result<Option<Node>, ParseError> {
        if !self.is(TokenKind::LParen) {
            return Ok(None);
        }
        self.advance();

        let mut node = Interior::new(NodeKind::ExprList);
        if self.is(TokenKind::RParen) {
            self.advance();
            return Ok(Some(node.into()));
        }
        loop {
            node.push(self.expression()?);
            if self.is(TokenKind::RParen) {
                self.advance();
                return Ok(Some(node.into()));
            }
            self.expect(TokenKind::Comma)?;
            self.advance();
        }
    }

    /// assignment: identifier '=' expression. Recognized with a one-token
    /// lookahead: if '=' does not follow the identifier this is not an
    /// assignment (the cursor is restored), not an error.
    fn assignment(&mut self) -> Result<Option<Node>, ParseError> {
        let start = self.pos;
        let Some(ident) = self.current().filter(|t| t.kind == TokenKind::Identifier) else {
            return Ok(None);
        };
        let ident = ident.clone();
        self.advance();
        if !self.is(TokenKind::Equal) {
            self.pos = start;
            return Ok(None);
        }
        self.advance();

        let mut node = Interior::new(NodeKind::Assign);
        node.push_leaf(ident);
        node.push(self.expression()?);
        Ok(Some(node.into()))
    }

    /// func_call: identifier expression_list.
    fn func_call(&mut self) -> Result<Option<Node>, ParseError> {
        let start = self.pos;
        let Some(ident) = self.current().filter(|t| t.kind == TokenKind::Identifier) else {
            return Ok(None);
        };
        let ident = ident.clone();
        self.advance();

        match self.expression_list()? {
            Some(args) => {
                let mut node = Interior::new(NodeKind::FuncCall);
                node.push_leaf(ident);
                node.push(args);
                Ok(Some(node.into()))
            }
            None => {
                self.pos = start;
                Ok(None)
            }
        }
    }

    fn parse_return(&mut self) -> Result<Option<Node>, ParseError> {
        if !self.is(TokenKind::Return) {
            return Ok(None);
        }
        self.advance();
        let mut node = Interior::new(NodeKind::Return);
        node.push(self.expression()?);
        Ok(Some(node.into()))
    }

    fn continue_break(&mut self) -> Result<Option<Node>, ParseError> {
        if self.is(TokenKind::Continue) {
            self.advance();
            return Ok(Some(Interior::new(NodeKind::Continue).into()));
        }
        if self.is(TokenKind::Break) {
            self.advance();
            return Ok(Some(Interior::new(NodeKind::Break).into()));
        }
        Ok(None)
    }

    /// statement: ';' | assignment ';' | func_call ';' | conditional |
    /// for_loop | return ';' | (continue | break) ';'.
    ///
    /// Alternatives are tried in order; each failed trial restores the cursor
    /// before the next one.
    fn statement(&mut self) -> Result<Option<Node>, ParseError> {
        if self.is(TokenKind::Semicolon) {
            self.advance();
            return Ok(Some(Interior::new(NodeKind::Stmt).into()));
        }

        if let Some(assign) = self.assignment()? {
            return self.finish_simple_statement(assign).map(Some);
        }
        if let Some(call) = self.func_call()? {
            return self.finish_simple_statement(call).map(Some);
        }
        if let Some(cond) = self.conditional()? {
            let mut stmt = Interior::new(NodeKind::Stmt);
            stmt.push(cond);
            return Ok(Some(stmt.into()));
        }
        if let Some(for_loop) = self.for_loop()? {
            let mut stmt = Interior::new(NodeKind::Stmt);
            stmt.push(for_loop);
            return Ok(Some(stmt.into()));
        }
        if let Some(ret) = self.parse_return()? {
            return self.finish_simple_statement(ret).map(Some);
        }
        if let Some(jump) = self.continue_break()? {
            return self.finish_simple_statement(jump).map(Some);
        }
        Ok(None)
    }

    /// Wrap `child` in a `Stmt` node and consume the trailing ';'.
    fn finish_simple_statement(&mut self, child: Node) -> Result<Node, ParseError> {
        self.expect(TokenKind::Semicolon)?;
        self.advance();
        let mut stmt = Interior::new(NodeKind::Stmt);
        stmt.push(child);
        Ok(stmt.into())
    }

    /// statement_list: '{' statement* '}'.
    fn statement_list(&mut self) -> Result<Option<Node>, ParseError> {
        if !self.is(TokenKind::LBrace) {
            return Ok(None);
        }
        self.advance();

        let mut node = Interior::new(NodeKind::StmtList);
        while let Some(stmt) = self.statement()? {
            node.push(stmt);
        }
        self.expect(TokenKind::RBrace)?;
        self.advance();
        Ok(Some(node.into()))
    }

    /// conditional: 'if' '(' expression ')' statement_list
    ///              ('else' statement_list)?.
    fn conditional(&mut self) -> Result<Option<Node>, ParseError> {
        let start = self.pos;
        if !self.is(TokenKind::If) {
            return Ok(None);
        }
        self.advance();

        self.expect(TokenKind::LParen)?;
        self.advance();
        let mut node = Interior::new(NodeKind::Conditional);
        node.push(self.expression()?);
        self.expect(TokenKind::RParen)?;
        self.advance();

        let Some(then_list) = self.statement_list()? else {
            self.pos = start;
            return Ok(None);
        };
        node.push(then_list);

        if self.is(TokenKind::Else) {
            self.advance();
            let Some(else_list) = self.statement_list()? else {
                self.pos = start;
                return Ok(None);
            };
            node.push(else_list);
        }
        Ok(Some(node.into()))
    }

    /// for_loop: 'for' '(' assignment? ';' expression? ';' assignment? ')'
    ///           statement_list.
    ///
    /// The node always carries four children; an elided clause is an empty
    /// interior, and an empty condition means "always true" at lowering time.
    fn for_loop(&mut self) -> Result<Option<Node>, ParseError> {
        let start = self.pos;
        if !self.is(TokenKind::For) {
            return Ok(None);
        }
        self.advance();

        self.expect(TokenKind::LParen)?;
        self.advance();
        let mut node = Interior::new(NodeKind::For);

        let init = if self.is(TokenKind::Semicolon) {
            Interior::new(NodeKind::Assign).into()
        } else {
            let Some(init) = self.assignment()? else {
                self.pos = start;
                return Ok(None);
            };
            self.expect(TokenKind::Semicolon)?;
            init
        };
        self.advance();
        node.push(init);

        let condition = if self.is(TokenKind::Semicolon) {
            Interior::new(NodeKind::Expr).into()
        } else {
            let condition = self.expression()?;
            self.expect(TokenKind::Semicolon)?;
            condition
        };
        self.advance();
        node.push(condition);

        let step = if self.is(TokenKind::RParen) {
            Interior::new(NodeKind::Assign).into()
        } else {
            let Some(step) = self.assignment()? else {
                self.pos = start;
                return Ok(None);
            };
            self.expect(TokenKind::RParen)?;
            step
        };
        self.advance();
        node.push(step);

        let Some(body) = self.statement_list()? else {
            self.pos = start;
            return Ok(None);
        };
        node.push(body);
        Ok(Some(node.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner;

    fn parse_lines(lines: &[&str]) -> Result<Node, ParseError> {
        let tokens = scanner::scan(lines).expect("scan failed");
        parse(&tokens, lines)
    }

    fn stmt_list(root: &Node) -> &Interior {
        root.as_interior()
            .and_then(|r| r.child(0))
            .and_then(Node::as_interior)
            .expect("root statement list")
    }

    #[test]
    fn parses_assignment_shape() {
        let root = parse_lines(&["{ a = 1; }"]).expect("parse failed");
        let list = stmt_list(&root);
        assert_eq!(list.kind, NodeKind::StmtList);
        assert_eq!(list.len(), 1);

        let stmt = list.child(0).and_then(Node::as_interior).unwrap();
        assert_eq!(stmt.kind, NodeKind::Stmt);
        let assign = stmt.child(0).and_then(Node::as_interior).unwrap();
        assert_eq!(assign.kind, NodeKind::Assign);
        assert_eq!(assign.len(), 2);
        let ident = assign.child(0).and_then(Node::as_leaf).unwrap();
        assert_eq!(ident.text, "a");
        let expr = assign.child(1).and_then(Node::as_interior).unwrap();
        assert_eq!(expr.kind, NodeKind::Expr);
    }

    #[test]
    fn distinguishes_call_statement_from_assignment() {
        let root = parse_lines(&["{ put(1); }"]).expect("parse failed");
        let stmt = stmt_list(&root).child(0).and_then(Node::as_interior).unwrap();
        let call = stmt.child(0).and_then(Node::as_interior).unwrap();
        assert_eq!(call.kind, NodeKind::FuncCall);
        let args = call.child(1).and_then(Node::as_interior).unwrap();
        assert_eq!(args.kind, NodeKind::ExprList);
        assert_eq!(args.len(), 1);
    }

    #[test]
    fn call_in_expression_backtracks_to_identifier() {
        // `a` is first tried as a call; the cursor must come back cleanly.
        let root = parse_lines(&["{ b = a + 1; }"]).expect("parse failed");
        let leaves: Vec<String> = root
            .leaf_tokens()
            .iter()
            .map(|t| t.text.clone())
            .collect();
        assert_eq!(leaves, vec!["b", "a", "+", "1"]);
    }

    #[test]
    fn empty_statement_parses_to_empty_stmt_node() {
        let root = parse_lines(&["{ ; }"]).expect("parse failed");
        let stmt = stmt_list(&root).child(0).and_then(Node::as_interior).unwrap();
        assert_eq!(stmt.kind, NodeKind::Stmt);
        assert!(stmt.is_empty());
    }

    #[test]
    fn for_loop_always_has_four_children() {
        let root = parse_lines(&["{ for (;;) { } }"]).expect("parse failed");
        let stmt = stmt_list(&root).child(0).and_then(Node::as_interior).unwrap();
        let for_node = stmt.child(0).and_then(Node::as_interior).unwrap();
        assert_eq!(for_node.kind, NodeKind::For);
        assert_eq!(for_node.len(), 4);
        for (index, kind) in [
            NodeKind::Assign,
            NodeKind::Expr,
            NodeKind::Assign,
            NodeKind::StmtList,
        ]
        .iter()
        .enumerate()
        {
            let clause = for_node.child(index).and_then(Node::as_interior).unwrap();
            assert_eq!(clause.kind, *kind);
            if index < 3 {
                assert!(clause.is_empty());
            }
        }
    }

    #[test]
    fn full_for_loop_keeps_clauses() {
        let root =
            parse_lines(&["{ for (i = 0; i < 3; i = i + 1) { put(i); } }"]).expect("parse failed");
        let stmt = stmt_list(&root).child(0).and_then(Node::as_interior).unwrap();
        let for_node = stmt.child(0).and_then(Node::as_interior).unwrap();
        assert!(!for_node.child(0).and_then(Node::as_interior).unwrap().is_empty());
        assert!(!for_node.child(1).and_then(Node::as_interior).unwrap().is_empty());
        assert!(!for_node.child(2).and_then(Node::as_interior).unwrap().is_empty());
    }

    #[test]
    fn conditional_with_else_has_three_children() {
        let root = parse_lines(&["{ if (a == 0) { } else { } }"]).expect("parse failed");
        let stmt = stmt_list(&root).child(0).and_then(Node::as_interior).unwrap();
        let cond = stmt.child(0).and_then(Node::as_interior).unwrap();
        assert_eq!(cond.kind, NodeKind::Conditional);
        assert_eq!(cond.len(), 3);
    }

    #[test]
    fn missing_semicolon_is_reported_with_context() {
        let err = parse_lines(&["{", "a = 1", "}"]).unwrap_err();
        match err {
            ParseError::Unexpected {
                expected,
                found,
                line,
                context,
                ..
            } => {
                assert_eq!(expected, TokenKind::Semicolon);
                assert_eq!(found, TokenKind::RBrace);
                assert_eq!(line, 3);
                assert_eq!(context, "}");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn comparisons_do_not_chain() {
        let err = parse_lines(&["{ a = 1 < 2 < 3; }"]).unwrap_err();
        assert!(matches!(err, ParseError::Unexpected { .. }));
    }

    #[test]
    fn missing_top_level_brace_is_an_error() {
        let err = parse_lines(&["a = 1;"]).unwrap_err();
        assert!(matches!(
            err,
            ParseError::Unexpected {
                expected: TokenKind::LBrace,
                ..
            }
        ));
    }

    #[test]
    fn empty_input_is_an_error() {
        let err = parse_lines(&[]).unwrap_err();
        assert_eq!(
            err,
            ParseError::UnexpectedEnd {
                expected: TokenKind::LBrace
            }
        );
    }

    #[test]
    fn unclosed_call_is_a_hard_error() {
        let err = parse_lines(&["{ put(1 2); }"]).unwrap_err();
        assert!(matches!(
            err,
            ParseError::Unexpected {
                expected: TokenKind::Comma,
                ..
            }
        ));
    }

    #[test]
    fn invalid_factor_reports_invalid_expression() {
        let err = parse_lines(&["{ a = *; }"]).unwrap_err();
        assert!(matches!(err, ParseError::InvalidExpression { .. }));
    }

    #[test]
    fn unary_minus_is_kept_as_prefix_leaf() {
        let root = parse_lines(&["{ a = -5; }"]).expect("parse failed");
        let leaves: Vec<String> = root
            .leaf_tokens()
            .iter()
            .map(|t| t.text.clone())
            .collect();
        assert_eq!(leaves, vec!["a", "-", "5"]);
    }
}
