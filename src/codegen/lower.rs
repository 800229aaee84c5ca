use cranelift_codegen::ir::condcodes::IntCC;
use cranelift_codegen::ir::{types, Block, InstBuilder, Value};
use cranelift_frontend::FunctionBuilder;
use cranelift_module::{Linkage, Module};

use crate::ast::{Interior, Node, NodeKind};
use crate::symtab::ScopeMap;
use crate::token::TokenKind;

use super::funcs::FuncTable;
use super::CodegenError;

/// Current SSA value handle per variable name, one map per lexical scope.
pub(crate) type VarMap = ScopeMap<Value>;

/// Walks the AST and emits SSA IR through the function builder.
///
/// The general pattern for divergent control flow is snapshot-diverge-
/// reconcile: each divergent path lowers against its own `VarMap` snapshot,
/// and at the reconvergence block a merge value (a block parameter, one per
/// incoming-edge set) is created for exactly the names whose handles differ
/// across the live paths. Branches that are emitted before the merge block's
/// parameter list is known target a single-jump edge block instead, which is
/// filled once reconciliation has run.
pub(crate) struct Lowerer<'a, 'f, 'ast, M: Module> {
    module: &'a mut M,
    builder: FunctionBuilder<'f>,
    funcs: &'a mut FuncTable,
    loops: Vec<LoopFrame<'ast>>,
}

/// Lowering state for the innermost active loop.
struct LoopFrame<'ast> {
    /// Loop body; its block parameters are the entry phis, keyed by
    /// `phi_vars` order.
    body_block: Block,
    phi_vars: Vec<String>,
    condition: Option<&'ast Node>,
    step: Option<&'ast Node>,
    /// One entry per route into the loop's merge block, with the bindings
    /// that route carries.
    exits: Vec<LoopExit>,
}

struct LoopExit {
    block: Block,
    vars: VarMap,
}

impl<'a, 'f, 'ast, M: Module> Lowerer<'a, 'f, 'ast, M> {
    pub(crate) fn new(
        module: &'a mut M,
        builder: FunctionBuilder<'f>,
        funcs: &'a mut FuncTable,
    ) -> Self {
        Self {
            module,
            builder,
            funcs,
            loops: Vec::new(),
        }
    }

    pub(crate) fn emit_default_return(&mut self) {
        let zero = self.builder.ins().iconst(types::I32, 0);
        self.builder.ins().return_(&[zero]);
    }

    pub(crate) fn finish(mut self) {
        self.builder.seal_all_blocks();
        self.builder.finalize();
    }

    /// Lower the statements in order; reports true as soon as one of them
    /// terminated the current block, since nothing may be emitted after a
    /// terminator.
    pub(crate) fn lower_stmt_list(
        &mut self,
        node: &'ast Node,
        vars: &mut VarMap,
    ) -> Result<bool, CodegenError> {
        let list = expect_interior(node, NodeKind::StmtList)?;
        for child in &list.children {
            if self.lower_statement(child, vars)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn lower_statement(
        &mut self,
        node: &'ast Node,
        vars: &mut VarMap,
    ) -> Result<bool, CodegenError> {
        let stmt = expect_interior(node, NodeKind::Stmt)?;
        let Some(child) = stmt.child(0) else {
            // bare ';'
            return Ok(false);
        };
        match child.as_interior().map(|interior| interior.kind) {
            Some(NodeKind::Assign) => {
                self.lower_assignment(child, vars)?;
                Ok(false)
            }
            Some(NodeKind::FuncCall) => {
                // statement position: any result is discarded
                self.lower_func_call(child, vars)?;
                Ok(false)
            }
            Some(NodeKind::Conditional) => self.lower_conditional(child, vars),
            Some(NodeKind::For) => {
                self.lower_for_loop(child, vars)?;
                Ok(false)
            }
            Some(NodeKind::Return) => {
                self.lower_return(child, vars)?;
                Ok(true)
            }
            Some(NodeKind::Continue) => {
                self.lower_continue(vars)?;
                Ok(true)
            }
            Some(NodeKind::Break) => {
                self.lower_break(vars)?;
                Ok(true)
            }
            other => Err(CodegenError::MalformedAst(format!(
                "unexpected statement child {other:?}"
            ))),
        }
    }

    /// Bind the identifier to the lowered right-hand side. This is the only
    /// mutation of the symbol table outside reconciliation.
    fn lower_assignment(
        &mut self,
        node: &'ast Node,
        vars: &mut VarMap,
    ) -> Result<(), CodegenError> {
        let assign = expect_interior(node, NodeKind::Assign)?;
        if assign.len() != 2 {
            return Err(CodegenError::MalformedAst(format!(
                "assignment with {} children",
                assign.len()
            )));
        }
        let ident = assign
            .child(0)
            .and_then(Node::as_leaf)
            .filter(|token| token.kind == TokenKind::Identifier)
            .ok_or_else(|| CodegenError::MalformedAst("assignment without identifier".into()))?;
        let value = self.lower_expression(&assign.children[1], vars)?;
        vars.set(&ident.text, value);
        Ok(())
    }

    fn lower_return(&mut self, node: &'ast Node, vars: &VarMap) -> Result<(), CodegenError> {
        let ret = expect_interior(node, NodeKind::Return)?;
        if ret.len() != 1 {
            return Err(CodegenError::MalformedAst(format!(
                "return with {} children",
                ret.len()
            )));
        }
        let value = self.lower_expression(&ret.children[0], vars)?;
        self.builder.ins().return_(&[value]);
        Ok(())
    }

    fn lower_expression(&mut self, node: &'ast Node, vars: &VarMap) -> Result<Value, CodegenError> {
        let expr = expect_interior(node, NodeKind::Expr)?;
        match expr.len() {
            1 => self.lower_expr_no_comp(&expr.children[0], vars),
            3 => {
                let lhs = self.lower_expr_no_comp(&expr.children[0], vars)?;
                let op = leaf_kind(&expr.children[1])?;
                let rhs = self.lower_expr_no_comp(&expr.children[2], vars)?;
                let cc = comparison_cc(op)?;
                let flag = self.builder.ins().icmp(cc, lhs, rhs);
                // predicate result widened to the language's int
                Ok(self.builder.ins().uextend(types::I32, flag))
            }
            n => Err(CodegenError::MalformedAst(format!(
                "expression with {n} children"
            ))),
        }
    }

    fn lower_expr_no_comp(
        &mut self,
        node: &'ast Node,
        vars: &VarMap,
    ) -> Result<Value, CodegenError> {
        let expr = expect_interior(node, NodeKind::ExprNoComp)?;
        let mut index = 0;
        let mut negate = false;
        // a leading leaf is the optional sign prefix
        if let Some(Node::Leaf(token)) = expr.child(0) {
            negate = token.kind == TokenKind::Minus;
            index = 1;
        }
        let first = expr
            .child(index)
            .ok_or_else(|| CodegenError::MalformedAst("empty additive expression".into()))?;
        let mut lhs = self.lower_term(first, vars)?;
        if negate {
            let minus_one = self.builder.ins().iconst(types::I32, -1);
            lhs = self.builder.ins().imul(lhs, minus_one);
        }
        index += 1;
        while index + 1 < expr.len() {
            let op = leaf_kind(&expr.children[index])?;
            let rhs = self.lower_term(&expr.children[index + 1], vars)?;
            lhs = match op {
                TokenKind::Plus => self.builder.ins().iadd(lhs, rhs),
                TokenKind::Minus => self.builder.ins().isub(lhs, rhs),
                other => {
                    return Err(CodegenError::MalformedAst(format!(
                        "unexpected additive operator {other:?}"
                    )))
                }
            };
            index += 2;
        }
        if index != expr.len() {
            return Err(CodegenError::MalformedAst(
                "dangling additive operator".into(),
            ));
        }
        Ok(lhs)
    }

    fn lower_term(&mut self, node: &'ast Node, vars: &VarMap) -> Result<Value, CodegenError> {
        let term = expect_interior(node, NodeKind::Term)?;
        let first = term
            .child(0)
            .ok_or_else(|| CodegenError::MalformedAst("empty term".into()))?;
        let mut lhs = self.lower_factor(first, vars)?;
        let mut index = 1;
        while index + 1 < term.len() {
            let op = leaf_kind(&term.children[index])?;
            let rhs = self.lower_factor(&term.children[index + 1], vars)?;
            lhs = match op {
                TokenKind::Star => self.builder.ins().imul(lhs, rhs),
                TokenKind::Slash => self.builder.ins().sdiv(lhs, rhs),
                TokenKind::Percent => self.builder.ins().srem(lhs, rhs),
                other => {
                    return Err(CodegenError::MalformedAst(format!(
                        "unexpected multiplicative operator {other:?}"
                    )))
                }
            };
            index += 2;
        }
        if index != term.len() {
            return Err(CodegenError::MalformedAst(
                "dangling multiplicative operator".into(),
            ));
        }
        Ok(lhs)
    }

    fn lower_factor(&mut self, node: &'ast Node, vars: &VarMap) -> Result<Value, CodegenError> {
        let factor = expect_interior(node, NodeKind::Factor)?;
        let child = factor
            .child(0)
            .ok_or_else(|| CodegenError::MalformedAst("empty factor".into()))?;
        match child {
            Node::Interior(interior) if interior.kind == NodeKind::Expr => {
                self.lower_expression(child, vars)
            }
            Node::Interior(interior) if interior.kind == NodeKind::FuncCall => {
                let name = call_name(interior)?.to_string();
                match self.lower_func_call(child, vars)? {
                    Some(value) => Ok(value),
                    None => Err(CodegenError::VoidOperand(name)),
                }
            }
            Node::Leaf(token) if token.kind == TokenKind::Number => {
                let literal = token.literal.ok_or_else(|| {
                    CodegenError::MalformedAst("number token without literal".into())
                })?;
                Ok(self.builder.ins().iconst(types::I32, i64::from(literal)))
            }
            Node::Leaf(token) if token.kind == TokenKind::Identifier => vars
                .get(&token.text)
                .ok_or_else(|| CodegenError::UnboundVariable(token.text.clone())),
            _ => Err(CodegenError::MalformedAst("unexpected factor child".into())),
        }
    }

    /// Lower a call to a builtin. Returns `None` for a void callee.
    ///
    /// The callee is declared into the module at its first call site and the
    /// declaration is cached in the function table.
    fn lower_func_call(
        &mut self,
        node: &'ast Node,
        vars: &VarMap,
    ) -> Result<Option<Value>, CodegenError> {
        let call = expect_interior(node, NodeKind::FuncCall)?;
        let name = call_name(call)?;
        let args_node = call
            .child(1)
            .and_then(Node::as_interior)
            .filter(|interior| interior.kind == NodeKind::ExprList)
            .ok_or_else(|| CodegenError::MalformedAst("call without argument list".into()))?;

        let (is_builtin, expected, cached, sig) = match self.funcs.get(name) {
            Some(info) => (
                info.is_builtin,
                info.sig.params.len(),
                info.func_ref,
                info.sig.clone(),
            ),
            None => return Err(CodegenError::UnknownFunction(name.to_string())),
        };
        if !is_builtin {
            return Err(CodegenError::UnsupportedCall(name.to_string()));
        }
        let func_ref = match cached {
            Some(func_ref) => func_ref,
            None => {
                let id = self.module.declare_function(name, Linkage::Import, &sig)?;
                let func_ref = self.module.declare_func_in_func(id, &mut *self.builder.func);
                self.funcs.bind(name, id, func_ref);
                func_ref
            }
        };

        if args_node.len() != expected {
            return Err(CodegenError::ArityMismatch {
                name: name.to_string(),
                expected,
                found: args_node.len(),
            });
        }
        let mut args = Vec::with_capacity(args_node.len());
        for arg in &args_node.children {
            args.push(self.lower_expression(arg, vars)?);
        }

        let inst = self.builder.ins().call(func_ref, &args);
        let Some(result) = self.builder.inst_results(inst).first().copied() else {
            return Ok(None);
        };
        if self.builder.func.dfg.value_type(result) == types::I32 {
            Ok(Some(result))
        } else {
            // sub-word builtin results (char input) widen signed to int
            Ok(Some(self.builder.ins().sextend(types::I32, result)))
        }
    }

    /// Compare the condition against zero to get a branchable flag.
    fn lower_condition_value(
        &mut self,
        node: &'ast Node,
        vars: &VarMap,
    ) -> Result<Value, CodegenError> {
        let value = self.lower_expression(node, vars)?;
        Ok(self.builder.ins().icmp_imm(IntCC::NotEqual, value, 0))
    }

    /// An elided loop condition clause is always true.
    fn lower_loop_condition(
        &mut self,
        condition: Option<&'ast Node>,
        vars: &VarMap,
    ) -> Result<Value, CodegenError> {
        match condition {
            None => Ok(self.builder.ins().iconst(types::I32, 1)),
            Some(node) => self.lower_condition_value(node, vars),
        }
    }

    /// Reports true when no path continues past the conditional (both arms
    /// terminated); no merge block exists in that case.
    fn lower_conditional(
        &mut self,
        node: &'ast Node,
        vars: &mut VarMap,
    ) -> Result<bool, CodegenError> {
        let conditional = expect_interior(node, NodeKind::Conditional)?;
        let condition_node = conditional
            .child(0)
            .ok_or_else(|| CodegenError::MalformedAst("conditional without condition".into()))?;
        let condition = self.lower_condition_value(condition_node, vars)?;
        match conditional.len() {
            2 => {
                self.lower_if_then(conditional, vars, condition)?;
                Ok(false)
            }
            3 => self.lower_if_then_else(conditional, vars, condition),
            n => Err(CodegenError::MalformedAst(format!(
                "conditional with {n} children"
            ))),
        }
    }

    fn lower_if_then(
        &mut self,
        node: &'ast Interior,
        vars: &mut VarMap,
        condition: Value,
    ) -> Result<(), CodegenError> {
        let then_block = self.builder.create_block();
        // carries the condition-false edge until the merge block exists
        let skip_block = self.builder.create_block();
        self.builder
            .ins()
            .brif(condition, then_block, &[], skip_block, &[]);

        self.builder.switch_to_block(then_block);
        let mut then_vars = vars.snapshot();
        let terminated = self.lower_stmt_list(&node.children[1], &mut then_vars)?;

        // a terminated arm contributes no edge; the false path implicitly
        // carries the pre-if bindings
        let changed = if terminated {
            Vec::new()
        } else {
            changed_names(vars, &[&then_vars])
        };
        let merge_block = self.make_merge_block(&changed);
        if !terminated {
            let args = edge_args(&then_vars, &changed)?;
            self.builder.ins().jump(merge_block, &args);
        }
        self.builder.switch_to_block(skip_block);
        let args = edge_args(vars, &changed)?;
        self.builder.ins().jump(merge_block, &args);

        self.builder.switch_to_block(merge_block);
        self.install_merge_params(merge_block, &changed, vars);
        Ok(())
    }

    fn lower_if_then_else(
        &mut self,
        node: &'ast Interior,
        vars: &mut VarMap,
        condition: Value,
    ) -> Result<bool, CodegenError> {
        let then_block = self.builder.create_block();
        let else_block = self.builder.create_block();
        self.builder
            .ins()
            .brif(condition, then_block, &[], else_block, &[]);

        self.builder.switch_to_block(then_block);
        let mut then_vars = vars.snapshot();
        let then_terminated = self.lower_stmt_list(&node.children[1], &mut then_vars)?;
        // the then arm must end before the else arm starts, so its merge edge
        // waits in an edge block until the merge block exists
        let then_exit = if then_terminated {
            None
        } else {
            let stub = self.builder.create_block();
            self.builder.ins().jump(stub, &[]);
            Some(stub)
        };

        self.builder.switch_to_block(else_block);
        let mut else_vars = vars.snapshot();
        let else_terminated = self.lower_stmt_list(&node.children[2], &mut else_vars)?;

        if then_terminated && else_terminated {
            // nothing reaches past this conditional
            return Ok(true);
        }

        let mut live: Vec<&VarMap> = Vec::new();
        if !then_terminated {
            live.push(&then_vars);
        }
        if !else_terminated {
            live.push(&else_vars);
        }
        let changed = changed_names(vars, &live);

        let merge_block = self.make_merge_block(&changed);
        if !else_terminated {
            let args = edge_args(&else_vars, &changed)?;
            self.builder.ins().jump(merge_block, &args);
        }
        if let Some(stub) = then_exit {
            self.builder.switch_to_block(stub);
            let args = edge_args(&then_vars, &changed)?;
            self.builder.ins().jump(merge_block, &args);
        }

        self.builder.switch_to_block(merge_block);
        self.install_merge_params(merge_block, &changed, vars);
        Ok(false)
    }

    /// Two-stage loop lowering: entry phis on the body block for every
    /// variable bound before the loop (backedges come from the latch and from
    /// every `continue`), then exit phis on the merge block for the names
    /// whose handle changed on any route out of the loop (which models the
    /// zero-iteration case).
    fn lower_for_loop(&mut self, node: &'ast Node, vars: &mut VarMap) -> Result<(), CodegenError> {
        let for_node = expect_interior(node, NodeKind::For)?;
        if for_node.len() != 4 {
            return Err(CodegenError::MalformedAst(format!(
                "for loop with {} children",
                for_node.len()
            )));
        }
        let init = optional_clause(&for_node.children[0]);
        let condition = optional_clause(&for_node.children[1]);
        let step = optional_clause(&for_node.children[2]);
        let body = &for_node.children[3];

        // the init clause runs in the outer scope
        if let Some(init) = init {
            self.lower_assignment(init, vars)?;
        }

        let mut body_vars = vars.snapshot();
        let entry_condition = self.lower_loop_condition(condition, &body_vars)?;

        let phi_vars: Vec<String> = vars.names().map(String::from).collect();
        let body_block = self.builder.create_block();
        for _ in &phi_vars {
            self.builder.append_block_param(body_block, types::I32);
        }
        // carries the condition-false-on-entry edge
        let skip_block = self.builder.create_block();
        let entry_args = edge_args(vars, &phi_vars)?;
        self.builder
            .ins()
            .brif(entry_condition, body_block, &entry_args, skip_block, &[]);

        self.builder.switch_to_block(body_block);
        let params = self.builder.block_params(body_block).to_vec();
        for (name, value) in phi_vars.iter().zip(params) {
            body_vars.set(name, value);
        }

        self.loops.push(LoopFrame {
            body_block,
            phi_vars,
            condition,
            step,
            exits: vec![LoopExit {
                block: skip_block,
                vars: vars.snapshot(),
            }],
        });

        let terminated = self.lower_stmt_list(body, &mut body_vars)?;

        let mut frame = self
            .loops
            .pop()
            .ok_or_else(|| CodegenError::MalformedAst("loop context imbalance".into()))?;

        if !terminated {
            // latch: step, re-evaluated condition, branch back or out
            if let Some(step) = frame.step {
                self.lower_assignment(step, &mut body_vars)?;
            }
            let latch_condition = self.lower_loop_condition(frame.condition, &body_vars)?;
            let backedge_args = edge_args(&body_vars, &frame.phi_vars)?;
            let exit_block = self.builder.create_block();
            self.builder.ins().brif(
                latch_condition,
                frame.body_block,
                &backedge_args,
                exit_block,
                &[],
            );
            frame.exits.push(LoopExit {
                block: exit_block,
                vars: body_vars.snapshot(),
            });
        }

        let route_vars: Vec<&VarMap> = frame.exits.iter().map(|exit| &exit.vars).collect();
        let changed = changed_names(vars, &route_vars);
        let merge_block = self.make_merge_block(&changed);
        for exit in &frame.exits {
            self.builder.switch_to_block(exit.block);
            let args = edge_args(&exit.vars, &changed)?;
            self.builder.ins().jump(merge_block, &args);
        }

        self.builder.switch_to_block(merge_block);
        self.install_merge_params(merge_block, &changed, vars);
        Ok(())
    }

    /// A second route back to the loop's recurrence point: feed the entry
    /// phis from here, then run the step and condition exactly as the latch
    /// does and branch back in or out.
    fn lower_continue(&mut self, vars: &mut VarMap) -> Result<(), CodegenError> {
        let Some(frame) = self.loops.last() else {
            return Err(CodegenError::OutsideLoop("continue"));
        };
        let body_block = frame.body_block;
        let phi_vars = frame.phi_vars.clone();
        let (condition, step) = (frame.condition, frame.step);

        // the backedge carries the bindings as they stand at the continue
        // point, before the step clause runs
        let backedge_args = edge_args(vars, &phi_vars)?;

        if let Some(step) = step {
            self.lower_assignment(step, vars)?;
        }
        let condition = self.lower_loop_condition(condition, vars)?;

        let exit_block = self.builder.create_block();
        self.builder
            .ins()
            .brif(condition, body_block, &backedge_args, exit_block, &[]);
        if let Some(frame) = self.loops.last_mut() {
            frame.exits.push(LoopExit {
                block: exit_block,
                vars: vars.snapshot(),
            });
        }
        Ok(())
    }

    fn lower_break(&mut self, vars: &VarMap) -> Result<(), CodegenError> {
        if self.loops.is_empty() {
            return Err(CodegenError::OutsideLoop("break"));
        }
        let exit_block = self.builder.create_block();
        self.builder.ins().jump(exit_block, &[]);
        if let Some(frame) = self.loops.last_mut() {
            frame.exits.push(LoopExit {
                block: exit_block,
                vars: vars.snapshot(),
            });
        }
        Ok(())
    }

    fn make_merge_block(&mut self, changed: &[String]) -> Block {
        let block = self.builder.create_block();
        for _ in changed {
            self.builder.append_block_param(block, types::I32);
        }
        block
    }

    fn install_merge_params(&mut self, block: Block, changed: &[String], vars: &mut VarMap) {
        let params = self.builder.block_params(block).to_vec();
        for (name, value) in changed.iter().zip(params) {
            vars.set(name, value);
        }
    }
}

/// Names from the pre-divergence scope whose handle differs in at least one
/// of the diverged scopes, in sorted order.
fn changed_names(before: &VarMap, branches: &[&VarMap]) -> Vec<String> {
    before
        .iter()
        .filter(|&(name, value)| {
            branches
                .iter()
                .any(|branch| branch.get(name) != Some(value))
        })
        .map(|(name, _)| name.to_string())
        .collect()
}

fn edge_args(vars: &VarMap, names: &[String]) -> Result<Vec<Value>, CodegenError> {
    names
        .iter()
        .map(|name| {
            vars.get(name)
                .ok_or_else(|| CodegenError::UnboundVariable(name.clone()))
        })
        .collect()
}

/// An empty clause interior stands for an elided for-loop clause.
fn optional_clause(node: &Node) -> Option<&Node> {
    match node.as_interior() {
        Some(interior) if interior.is_empty() => None,
        _ => Some(node),
    }
}

pub(super) fn expect_interior<'n>(
    node: &'n Node,
    kind: NodeKind,
) -> Result<&'n Interior, CodegenError> {
    match node.as_interior() {
        Some(interior) if interior.kind == kind => Ok(interior),
        Some(interior) => Err(CodegenError::MalformedAst(format!(
            "expected {kind:?} node, found {:?}",
            interior.kind
        ))),
        None => Err(CodegenError::MalformedAst(format!(
            "expected {kind:?} node, found leaf"
        ))),
    }
}

fn leaf_kind(node: &Node) -> Result<TokenKind, CodegenError> {
    node.as_leaf()
        .map(|token| token.kind)
        .ok_or_else(|| CodegenError::MalformedAst("expected operator leaf".into()))
}

fn call_name(call: &Interior) -> Result<&str, CodegenError> {
    call.child(0)
        .and_then(Node::as_leaf)
        .filter(|token| token.kind == TokenKind::Identifier)
        .map(|token| token.text.as_str())
        .ok_or_else(|| CodegenError::MalformedAst("call without callee name".into()))
}

fn comparison_cc(kind: TokenKind) -> Result<IntCC, CodegenError> {
    let cc = match kind {
        TokenKind::EqualEqual => IntCC::Equal,
        TokenKind::BangEqual => IntCC::NotEqual,
        TokenKind::Less => IntCC::SignedLessThan,
        TokenKind::LessEqual => IntCC::SignedLessThanOrEqual,
        TokenKind::Greater => IntCC::SignedGreaterThan,
        TokenKind::GreaterEqual => IntCC::SignedGreaterThanOrEqual,
        other => {
            return Err(CodegenError::MalformedAst(format!(
                "unexpected comparison operator {other:?}"
            )))
        }
    };
    Ok(cc)
}
