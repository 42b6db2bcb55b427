//! Suspend state machine builder.
//!
//! Walks a suspend function body in evaluation order and cuts it into states
//! at every suspension point. Non-suspendable statements are moved verbatim
//! into the state they fall in; suspendable conditionals, loops and `try`
//! blocks are rebuilt out of states and explicit jumps.
//!
//! A jump to state `s` is `this.label = s; continue $sm`. While the graph is
//! under construction states are referenced through `StateRef` placeholders;
//! they become integer constants once the reachable states are numbered.
//!
//! The resume method body produced by [`StateMachine::into_resume_body`]:
//!
//! ```text
//! var suspendResult = this.result
//! var suspendState
//! $sm@ while (true) {
//!     try {
//!         suspendState = this.label
//!         val stateVar = suspendState
//!         when (stateVar) { 0 -> { .. } 1 -> { .. } .. }
//!     } catch (e: Throwable) {
//!         if (this.exceptionState == <root trap>) throw e
//!         this.label = this.exceptionState
//!         this.exception = e
//!     }
//! }
//! ```

use crate::context::LoweringContext;
use crate::coroutines::classify::SuspendableNodes;
use crate::coroutines::continuation::ContinuationSlots;
use crate::coroutines::stubs::get_or_create_function_with_continuation_stub;
use crate::error::{LowerError, LowerResult};
use crate::rewrite::{reparent_locals, retarget_returns};
use corvid_ir::{
    BinaryOp, Body, Catch, Const, DeclId, Expr, ExprId, ExprKind, LoopKind, SwitchCase, Type,
    TypeOp, ValueDecl, VarId,
};
use rustc_hash::FxHashMap;

const PASS: &str = "state machine builder";

/// Role of a state in the automaton.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    /// Runs statements of the original body.
    Normal,
    /// Exception dispatcher entered through the global catch.
    Trap,
}

/// A numbered state.
#[derive(Debug, Clone)]
pub struct SuspendState {
    /// Position in the dispatch switch.
    pub id: u32,
    /// Whether the state runs code or dispatches exceptions.
    pub kind: StateKind,
    /// Statements run when the state is entered.
    pub entry: Vec<Expr>,
    /// States this one can jump to, in the order the jumps were added.
    pub successors: Vec<u32>,
}

/// State under construction; indices into the builder arena.
#[derive(Debug, Clone)]
struct PendingState {
    kind: StateKind,
    entry: Vec<Expr>,
    successors: Vec<u32>,
}

#[derive(Debug, Clone, Copy)]
struct LoopTargets {
    continue_to: u32,
    exit: u32,
    /// Number of enclosing traps when the loop was entered.
    trap_depth: usize,
}

/// Numbered automaton of one suspend function.
#[derive(Debug, Clone)]
pub struct StateMachine {
    /// Indexed by state id.
    pub states: Vec<SuspendState>,
    /// Trap that rethrows to the caller.
    pub root_trap: u32,
    /// Local holding the result of the last suspension call.
    pub suspend_result: VarId,
    /// Local holding the state being dispatched.
    pub suspend_state: VarId,
    /// Immutable copy of the state that the dispatch switch reads.
    pub switch_subject: VarId,
    root_loop: ExprId,
    slots: ContinuationSlots,
}

impl StateMachine {
    /// Number of normal states; traps are not counted.
    pub fn state_count(&self) -> usize {
        self.states
            .iter()
            .filter(|s| s.kind == StateKind::Normal)
            .count()
    }

    /// Number of exception dispatchers, the root trap included.
    pub fn trap_count(&self) -> usize {
        self.states.len() - self.state_count()
    }

    pub fn successor_ids(&self) -> Vec<Vec<u32>> {
        self.states.iter().map(|s| s.successors.clone()).collect()
    }

    /// Synthetic locals managed through the continuation's own slots.
    pub fn reserved_locals(&self) -> [VarId; 3] {
        [self.suspend_result, self.suspend_state, self.switch_subject]
    }

    /// Check the structural invariants of the numbered graph.
    pub fn verify(&self) -> LowerResult<()> {
        let count = self.states.len();
        for (index, state) in self.states.iter().enumerate() {
            if state.id as usize != index {
                return Err(LowerError::internal(
                    PASS,
                    format!("state at position {index} has id {}", state.id),
                ));
            }
            if let Some(bad) = state.successors.iter().find(|&&s| s as usize >= count) {
                return Err(LowerError::internal(
                    PASS,
                    format!("state {index} jumps to unknown state {bad}"),
                ));
            }
            let mut placeholder = false;
            for stmt in &state.entry {
                placeholder |= stmt.any(&mut |e| matches!(e.kind, ExprKind::StateRef(_)));
            }
            if placeholder {
                return Err(LowerError::internal(
                    PASS,
                    format!("state {index} still references an unnumbered state"),
                ));
            }
        }
        if self.root_trap as usize + 1 != count {
            return Err(LowerError::internal(PASS, "root trap is not the last state"));
        }

        let mut seen = vec![false; count];
        let mut stack = vec![0u32];
        seen[0] = true;
        seen[self.root_trap as usize] = true;
        while let Some(s) = stack.pop() {
            for &next in &self.states[s as usize].successors {
                if !seen[next as usize] {
                    seen[next as usize] = true;
                    stack.push(next);
                }
            }
        }
        if let Some(orphan) = seen.iter().position(|&s| !s) {
            return Err(LowerError::internal(
                PASS,
                format!("state {orphan} is unreachable from the entry state"),
            ));
        }
        Ok(())
    }

    /// Wrap the states into the dispatch loop of the resume method.
    pub fn into_resume_body(self, cx: &mut LoweringContext<'_>) -> Body {
        let slots = self.slots;
        let mut b = cx.builder();

        let this = b.get(slots.this);
        let stored_result = b.get_field(this, slots.result);
        let decl_result = b.decl_var(self.suspend_result, Some(stored_result));
        let decl_state = b.decl_var(self.suspend_state, None);

        let cases: Vec<SwitchCase> = self
            .states
            .into_iter()
            .map(|state| {
                let label = b.int(i64::from(state.id));
                let body = b.typed_composite(Type::Unit, state.entry);
                SwitchCase { label, body }
            })
            .collect();

        let this = b.get(slots.this);
        let label = b.get_field(this, slots.label);
        let save_state = b.set(self.suspend_state, label);
        let saved = b.get(self.suspend_state);
        let decl_subject = b.decl_var(self.switch_subject, Some(saved));
        let subject = b.get(self.switch_subject);
        let switch_id = b.fresh_id();
        let switch = Expr::new(
            switch_id,
            Type::Unit,
            ExprKind::Switch {
                subject: Box::new(subject),
                cases,
                default: None,
            },
        );
        let try_body = b.block(vec![save_state, decl_subject, switch]);

        let e = b.catch_param("e", Type::Throwable);
        let this = b.get(slots.this);
        let trap = b.get_field(this, slots.exception_state);
        let root = b.int(i64::from(self.root_trap));
        let at_root = b.binary(BinaryOp::Eq, trap, root);
        let caught = b.get(e);
        let rethrow = b.throw(caught);
        let rethrow_at_root = b.if_then(at_root, rethrow);
        let this = b.get(slots.this);
        let this_again = b.get(slots.this);
        let trap = b.get_field(this_again, slots.exception_state);
        let goto_trap = b.set_field(this, slots.label, trap);
        let this = b.get(slots.this);
        let caught = b.get(e);
        let store_exception = b.set_field(this, slots.exception, caught);
        let catch_body = b.block(vec![rethrow_at_root, goto_trap, store_exception]);

        let dispatch = b.try_catch(
            try_body,
            vec![Catch {
                param: e,
                body: catch_body,
            }],
        );
        let forever = b.bool(true);
        let loop_body = b.block(vec![dispatch]);
        let root_loop = b.labeled_loop(self.root_loop, "$sm", forever, loop_body);

        Body::new(vec![decl_result, decl_state, root_loop])
    }
}

/// Splits a suspend body into states at its suspension points.
pub struct StateMachineBuilder<'a, 'm> {
    cx: &'a mut LoweringContext<'m>,
    nodes: &'a SuspendableNodes,
    slots: ContinuationSlots,
    /// The stub owning the body; its returns move to the resume method.
    function: DeclId,
    resume: DeclId,
    states: Vec<PendingState>,
    current: u32,
    terminated: bool,
    entry: u32,
    root_trap: u32,
    loops: FxHashMap<ExprId, LoopTargets>,
    traps: Vec<u32>,
    suspend_result: VarId,
    suspend_state: VarId,
    switch_subject: VarId,
    root_loop: ExprId,
    temps: u32,
}

impl<'a, 'm> StateMachineBuilder<'a, 'm> {
    pub fn new(
        cx: &'a mut LoweringContext<'m>,
        nodes: &'a SuspendableNodes,
        slots: ContinuationSlots,
        function: DeclId,
        resume: DeclId,
    ) -> Self {
        let suspend_result = cx
            .module
            .add_var(ValueDecl::local("suspendResult", Type::nullable_any(), true));
        let suspend_state = cx
            .module
            .add_var(ValueDecl::local("suspendState", Type::Int, true));
        let switch_subject = cx
            .module
            .add_var(ValueDecl::local("stateVar", Type::Int, false));
        let root_loop = cx.module.fresh_expr_id();

        let mut builder = Self {
            cx,
            nodes,
            slots,
            function,
            resume,
            states: Vec::new(),
            current: 0,
            terminated: false,
            entry: 0,
            root_trap: 0,
            loops: FxHashMap::default(),
            traps: Vec::new(),
            suspend_result,
            suspend_state,
            switch_subject,
            root_loop,
            temps: 0,
        };
        builder.entry = builder.new_state(StateKind::Normal);
        builder.root_trap = builder.new_state(StateKind::Trap);
        builder.current = builder.entry;
        builder
    }

    /// Lower `stmts` and number the reachable states.
    pub fn build(mut self, stmts: Vec<Expr>) -> LowerResult<StateMachine> {
        let root = self.state_ref(self.root_trap);
        let enter_root = self.set_slot(self.slots.exception_state, root);
        self.push(enter_root);

        for stmt in stmts {
            self.lower_into(stmt, None)?;
        }
        if !self.terminated {
            let ret = self.cx.builder().ret_unit(self.resume);
            self.push(ret);
        }

        self.switch_to(self.root_trap);
        let exception = self.get_slot(self.slots.exception);
        let rethrow = self.cx.builder().throw(exception);
        self.push(rethrow);

        self.finish()
    }

    // ===== States =====

    fn new_state(&mut self, kind: StateKind) -> u32 {
        self.states.push(PendingState {
            kind,
            entry: Vec::new(),
            successors: Vec::new(),
        });
        (self.states.len() - 1) as u32
    }

    fn switch_to(&mut self, state: u32) {
        self.current = state;
        self.terminated = false;
    }

    fn add_edge(&mut self, from: u32, to: u32) {
        let successors = &mut self.states[from as usize].successors;
        if !successors.contains(&to) {
            successors.push(to);
        }
    }

    fn has_predecessor(&self, state: u32) -> bool {
        self.states.iter().any(|s| s.successors.contains(&state))
    }

    fn push(&mut self, stmt: Expr) {
        if self.terminated {
            tracing::trace!(target: "corvid_lower::coroutines", stmt = %stmt.id, "dropping dead statement");
            return;
        }
        self.terminated = stmt.is_jump();
        self.states[self.current as usize].entry.push(stmt);
    }

    fn current_trap(&self) -> u32 {
        self.traps.last().copied().unwrap_or(self.root_trap)
    }

    // ===== Emission helpers =====

    fn state_ref(&mut self, state: u32) -> Expr {
        self.cx.builder().state_ref(state)
    }

    fn get_slot(&mut self, slot: DeclId) -> Expr {
        let mut b = self.cx.builder();
        let this = b.get(self.slots.this);
        b.get_field(this, slot)
    }

    fn set_slot(&mut self, slot: DeclId, value: Expr) -> Expr {
        let mut b = self.cx.builder();
        let this = b.get(self.slots.this);
        b.set_field(this, slot, value)
    }

    /// `this.label = target; continue $sm`.
    fn jump_stmts(&mut self, target: u32) -> Vec<Expr> {
        let target_ref = self.state_ref(target);
        let set_label = self.set_slot(self.slots.label, target_ref);
        let cont = self.cx.builder().cont(self.root_loop);
        vec![set_label, cont]
    }

    fn jump_to(&mut self, target: u32) {
        if self.terminated {
            return;
        }
        self.add_edge(self.current, target);
        for stmt in self.jump_stmts(target) {
            self.push(stmt);
        }
    }

    /// `if (cond) goto then_state else goto else_state`.
    fn branch_to(&mut self, cond: Expr, then_state: u32, else_state: u32) {
        if self.terminated {
            return;
        }
        self.add_edge(self.current, then_state);
        self.add_edge(self.current, else_state);
        let then_jump = self.jump_stmts(then_state);
        let else_jump = self.jump_stmts(else_state);
        let mut b = self.cx.builder();
        let then_branch = b.composite(then_jump);
        let else_branch = b.composite(else_jump);
        let branch = b.if_else(cond, then_branch, else_branch);
        self.push(branch);
        self.terminated = true;
    }

    /// Restore the trap that was active outside the innermost `depth` traps.
    fn leave_traps(&mut self, depth: usize) {
        if self.traps.len() <= depth {
            return;
        }
        let target = if depth == 0 {
            self.root_trap
        } else {
            self.traps[depth - 1]
        };
        let target_ref = self.state_ref(target);
        let restore = self.set_slot(self.slots.exception_state, target_ref);
        self.push(restore);
    }

    fn temp(&mut self, ty: Type, mutable: bool) -> VarId {
        let name = format!("tmp${}", self.temps);
        self.temps += 1;
        self.cx.module.add_var(ValueDecl::local(&name, ty, mutable))
    }

    fn unit(&mut self) -> Expr {
        self.cx.builder().unit()
    }

    fn render_function(&self) -> String {
        self.cx.module.render_decl(self.function)
    }

    // ===== Statements =====

    fn lower_into(&mut self, e: Expr, result: Option<VarId>) -> LowerResult<()> {
        if self.terminated {
            tracing::trace!(target: "corvid_lower::coroutines", stmt = %e.id, "dropping dead statement");
            return Ok(());
        }
        if !self.nodes.is_suspendable(e.id) {
            self.push_result(e, result);
            return Ok(());
        }

        let Expr { id, ty, kind } = e;
        match kind {
            ExprKind::Block { stmts, .. } => {
                let count = stmts.len();
                for (i, stmt) in stmts.into_iter().enumerate() {
                    let target = if i + 1 == count { result } else { None };
                    self.lower_into(stmt, target)?;
                }
            }
            ExprKind::If {
                cond,
                then_branch,
                else_branch,
            } => {
                let cond = self.value(*cond)?;
                self.lower_branches(cond, *then_branch, else_branch.map(|b| *b), result)?;
            }
            ExprKind::Loop {
                kind, cond, body, ..
            } => self.lower_loop(id, kind, *cond, *body)?,
            ExprKind::Break { target } => {
                let targets = self.loop_targets(target)?;
                self.leave_traps(targets.trap_depth);
                self.jump_to(targets.exit);
            }
            ExprKind::Continue { target } => {
                let targets = self.loop_targets(target)?;
                self.leave_traps(targets.trap_depth);
                self.jump_to(targets.continue_to);
            }
            ExprKind::Try {
                body,
                catches,
                finally,
            } => {
                if finally.is_some() {
                    return Err(LowerError::unsupported(
                        "suspendable try with finally",
                        self.render_function(),
                    ));
                }
                self.lower_try(*body, catches, result)?;
            }
            ExprKind::Switch {
                subject,
                cases,
                default,
            } => self.lower_switch(*subject, cases, default.map(|d| *d), result)?,
            ExprKind::Return { target, value } => {
                let value = self.value(*value)?;
                self.push(Expr::new(
                    id,
                    ty,
                    ExprKind::Return {
                        target,
                        value: Box::new(value),
                    },
                ));
            }
            ExprKind::Throw(value) => {
                let value = self.value(*value)?;
                self.push(Expr::new(id, ty, ExprKind::Throw(Box::new(value))));
            }
            ExprKind::VarDecl {
                var,
                init: Some(init),
            } => {
                let init = self.value(*init)?;
                self.push(Expr::new(
                    id,
                    ty,
                    ExprKind::VarDecl {
                        var,
                        init: Some(Box::new(init)),
                    },
                ));
            }
            ExprKind::SetVar { var, value } => {
                let value = self.value(*value)?;
                self.push(Expr::new(
                    id,
                    ty,
                    ExprKind::SetVar {
                        var,
                        value: Box::new(value),
                    },
                ));
            }
            kind => {
                let value = self.value(Expr::new(id, ty, kind))?;
                if result.is_some() || !is_side_effect_free(&value) {
                    self.push_result(value, result);
                }
            }
        }
        Ok(())
    }

    fn push_result(&mut self, e: Expr, result: Option<VarId>) {
        match result {
            Some(tmp) if produces_value(&e) => {
                let set = self.cx.builder().set(tmp, e);
                self.push(set);
            }
            _ => self.push(e),
        }
    }

    fn loop_targets(&self, target: ExprId) -> LowerResult<LoopTargets> {
        self.loops.get(&target).copied().ok_or_else(|| {
            LowerError::internal(
                PASS,
                format!("jump to loop {target} outside of it in {}", self.render_function()),
            )
        })
    }

    fn lower_branches(
        &mut self,
        cond: Expr,
        then_branch: Expr,
        else_branch: Option<Expr>,
        result: Option<VarId>,
    ) -> LowerResult<()> {
        let then_state = self.new_state(StateKind::Normal);
        let else_state = else_branch
            .as_ref()
            .map(|_| self.new_state(StateKind::Normal));
        let exit = self.new_state(StateKind::Normal);
        self.branch_to(cond, then_state, else_state.unwrap_or(exit));

        self.switch_to(then_state);
        self.lower_into(then_branch, result)?;
        self.jump_to(exit);

        if let (Some(branch), Some(state)) = (else_branch, else_state) {
            self.switch_to(state);
            self.lower_into(branch, result)?;
            self.jump_to(exit);
        }

        self.switch_to(exit);
        self.terminated = !self.has_predecessor(exit);
        Ok(())
    }

    /// The subject is evaluated once into a temporary. The state that holds
    /// it dispatches to one state per case, and every case joins in the exit
    /// state. Without a default, unmatched subjects go straight to the exit.
    fn lower_switch(
        &mut self,
        subject: Expr,
        cases: Vec<SwitchCase>,
        default: Option<Expr>,
        result: Option<VarId>,
    ) -> LowerResult<()> {
        let subject = self.value(subject)?;
        let tmp = self.temp(subject.ty.clone(), false);
        let decl = self.cx.builder().decl_var(tmp, Some(subject));
        self.push(decl);

        let (labels, bodies): (Vec<Expr>, Vec<Expr>) =
            cases.into_iter().map(|c| (c.label, c.body)).unzip();
        let case_states: Vec<u32> = bodies
            .iter()
            .map(|_| self.new_state(StateKind::Normal))
            .collect();
        let default_state = default
            .as_ref()
            .map(|_| self.new_state(StateKind::Normal));
        let exit = self.new_state(StateKind::Normal);
        let fallback = default_state.unwrap_or(exit);

        if !self.terminated {
            let jump = self.jump_stmts(fallback);
            let mut dispatch = self.cx.builder().composite(jump);
            for (label, &state) in labels.into_iter().zip(&case_states).rev() {
                let jump = self.jump_stmts(state);
                let mut b = self.cx.builder();
                let read = b.get(tmp);
                let test = b.binary(BinaryOp::Eq, read, label);
                let jump = b.composite(jump);
                dispatch = b.if_else(test, jump, dispatch);
            }
            for &state in &case_states {
                self.add_edge(self.current, state);
            }
            self.add_edge(self.current, fallback);
            self.push(dispatch);
            self.terminated = true;
        }

        for (body, state) in bodies.into_iter().zip(case_states) {
            self.switch_to(state);
            self.lower_into(body, result)?;
            self.jump_to(exit);
        }
        if let (Some(body), Some(state)) = (default, default_state) {
            self.switch_to(state);
            self.lower_into(body, result)?;
            self.jump_to(exit);
        }

        self.switch_to(exit);
        self.terminated = !self.has_predecessor(exit);
        Ok(())
    }

    fn lower_loop(&mut self, id: ExprId, kind: LoopKind, cond: Expr, body: Expr) -> LowerResult<()> {
        let trap_depth = self.traps.len();
        let exit = match kind {
            LoopKind::While => {
                let header = self.new_state(StateKind::Normal);
                let exit = self.new_state(StateKind::Normal);
                self.jump_to(header);
                self.loops.insert(
                    id,
                    LoopTargets {
                        continue_to: header,
                        exit,
                        trap_depth,
                    },
                );

                self.switch_to(header);
                let cond = self.value(cond)?;
                let body_state = self.new_state(StateKind::Normal);
                self.branch_to(cond, body_state, exit);

                self.switch_to(body_state);
                self.lower_into(body, None)?;
                self.jump_to(header);
                exit
            }
            LoopKind::DoWhile => {
                let body_state = self.new_state(StateKind::Normal);
                let check = self.new_state(StateKind::Normal);
                let exit = self.new_state(StateKind::Normal);
                self.jump_to(body_state);
                self.loops.insert(
                    id,
                    LoopTargets {
                        continue_to: check,
                        exit,
                        trap_depth,
                    },
                );

                self.switch_to(body_state);
                self.lower_into(body, None)?;
                self.jump_to(check);

                self.switch_to(check);
                let cond = self.value(cond)?;
                self.branch_to(cond, body_state, exit);
                exit
            }
        };
        self.switch_to(exit);
        self.terminated = !self.has_predecessor(exit);
        Ok(())
    }

    fn lower_try(&mut self, body: Expr, catches: Vec<Catch>, result: Option<VarId>) -> LowerResult<()> {
        let enclosing = self.current_trap();
        let trap = self.new_state(StateKind::Trap);
        let exit = self.new_state(StateKind::Normal);
        let entered_from = self.current;

        let trap_ref = self.state_ref(trap);
        let enter = self.set_slot(self.slots.exception_state, trap_ref);
        self.push(enter);
        self.traps.push(trap);
        self.lower_into(body, result)?;
        self.traps.pop();
        // Added last so the handler is numbered after the protected states
        self.add_edge(entered_from, trap);

        if !self.terminated {
            let enclosing_ref = self.state_ref(enclosing);
            let restore = self.set_slot(self.slots.exception_state, enclosing_ref);
            self.push(restore);
            self.jump_to(exit);
        }

        // The trap runs under the enclosing handler and picks a catch by type
        self.switch_to(trap);
        let enclosing_ref = self.state_ref(enclosing);
        let restore = self.set_slot(self.slots.exception_state, enclosing_ref);
        self.push(restore);

        let catch_states: Vec<u32> = catches
            .iter()
            .map(|_| self.new_state(StateKind::Normal))
            .collect();
        let exception = self.get_slot(self.slots.exception);
        let mut dispatch = self.cx.builder().throw(exception);
        for (catch, &state) in catches.iter().zip(&catch_states).rev() {
            let ty = self.cx.module.var(catch.param).ty.clone();
            let exception = self.get_slot(self.slots.exception);
            let jump = self.jump_stmts(state);
            let mut b = self.cx.builder();
            let test = b.instance_of(exception, ty);
            let jump = b.composite(jump);
            dispatch = b.if_else(test, jump, dispatch);
        }
        self.push(dispatch);
        for &state in &catch_states {
            self.add_edge(trap, state);
        }
        self.terminated = true;

        for (catch, state) in catches.into_iter().zip(catch_states) {
            self.switch_to(state);
            let ty = self.cx.module.var(catch.param).ty.clone();
            let exception = self.get_slot(self.slots.exception);
            let mut b = self.cx.builder();
            let value = b.implicit_cast(exception, ty);
            let bind = b.decl_var(catch.param, Some(value));
            self.push(bind);
            self.lower_into(catch.body, result)?;
            self.jump_to(exit);
        }

        self.switch_to(exit);
        self.terminated = !self.has_predecessor(exit);
        Ok(())
    }

    // ===== Values =====

    /// Lower `e` in value position. Everything `e` needs is emitted into the
    /// current state; the returned expression computes its value there.
    fn value(&mut self, e: Expr) -> LowerResult<Expr> {
        if !self.nodes.is_suspendable(e.id) {
            return Ok(e);
        }
        match &e.kind {
            ExprKind::Block { .. }
            | ExprKind::If { .. }
            | ExprKind::Try { .. }
            | ExprKind::Switch { .. } => {
                if e.ty.is_unit() || e.ty.is_nothing() {
                    self.lower_into(e, None)?;
                    return Ok(self.unit());
                }
                let tmp = self.temp(e.ty.clone(), true);
                let decl = self.cx.builder().decl_var(tmp, None);
                self.push(decl);
                self.lower_into(e, Some(tmp))?;
                Ok(self.cx.builder().get(tmp))
            }
            ExprKind::Binary {
                op: BinaryOp::And | BinaryOp::Or,
                right,
                ..
            } if self.nodes.is_suspendable(right.id) => self.lower_short_circuit(e),
            ExprKind::Loop { .. }
            | ExprKind::Break { .. }
            | ExprKind::Continue { .. }
            | ExprKind::Return { .. }
            | ExprKind::Throw(_)
            | ExprKind::VarDecl { .. }
            | ExprKind::SetVar { .. } => {
                self.lower_into(e, None)?;
                Ok(self.unit())
            }
            _ => {
                let is_point = self.nodes.is_suspension_point(e.id);
                let e = self.linearize_children(e)?;
                if is_point {
                    self.suspend(e)
                } else {
                    Ok(e)
                }
            }
        }
    }

    /// `a && b` / `a || b` where `b` suspends: only evaluated on demand.
    fn lower_short_circuit(&mut self, e: Expr) -> LowerResult<Expr> {
        let Expr { kind, .. } = e;
        let ExprKind::Binary { op, left, right } = kind else {
            return Err(LowerError::internal(PASS, "short-circuit lowering of a non-binary node"));
        };
        let tmp = self.temp(Type::Bool, true);
        let decl = self.cx.builder().decl_var(tmp, None);
        self.push(decl);
        let cond = self.value(*left)?;
        let short = self.cx.builder().bool(op == BinaryOp::Or);
        let (then_branch, else_branch) = match op {
            BinaryOp::And => (*right, short),
            _ => (short, *right),
        };
        self.lower_branches(cond, then_branch, Some(else_branch), Some(tmp))?;
        Ok(self.cx.builder().get(tmp))
    }

    /// Lower the children of `e` up to its last suspendable child. Children
    /// evaluated before a suspendable one are spilled into temporaries.
    fn linearize_children(&mut self, e: Expr) -> LowerResult<Expr> {
        let mut child_ids = Vec::new();
        e.visit_children(&mut |c| child_ids.push(c.id));
        let Some(last) = child_ids
            .iter()
            .rposition(|&id| self.nodes.is_suspendable(id))
        else {
            return Ok(e);
        };

        let mut index = 0;
        let mut error = None;
        let rebuilt = e.map_children(&mut |child| {
            let i = index;
            index += 1;
            if error.is_some() || i > last {
                return child;
            }
            match self.value(child) {
                Ok(v) if i < last => self.spill(v),
                Ok(v) => v,
                Err(err) => {
                    error = Some(err);
                    Expr::placeholder()
                }
            }
        });
        match error {
            Some(err) => Err(err),
            None => Ok(rebuilt),
        }
    }

    /// Evaluate `e` now into a temporary unless it is stable across a
    /// suspension.
    fn spill(&mut self, e: Expr) -> Expr {
        let stable = match &e.kind {
            ExprKind::Const(_) | ExprKind::Suspended => true,
            ExprKind::GetVar(v) => !self.cx.module.var(*v).mutable,
            _ => false,
        };
        if stable || e.ty.is_nothing() {
            return e;
        }
        let tmp = self.temp(e.ty.clone(), false);
        let mut b = self.cx.builder();
        let decl = b.decl_var(tmp, Some(e));
        let read = b.get(tmp);
        self.push(decl);
        read
    }

    /// Emit the suspension of `call` and open the state that resumes it.
    /// Returns the resumed value.
    fn suspend(&mut self, call: Expr) -> LowerResult<Expr> {
        let Expr { id, ty, kind } = call;
        let kind = match kind {
            ExprKind::Call { callee, mut args } => {
                let stub = get_or_create_function_with_continuation_stub(self.cx, callee)?;
                args.push(self.cx.builder().get(self.slots.this));
                ExprKind::Call { callee: stub, args }
            }
            ExprKind::Invoke { callee, mut args } => {
                args.push(self.cx.builder().get(self.slots.this));
                ExprKind::Invoke { callee, args }
            }
            _ => {
                return Err(LowerError::internal(
                    PASS,
                    format!("suspension point {id} is not a call"),
                ))
            }
        };
        let call = Expr::new(id, Type::nullable_any(), kind);

        let next = self.new_state(StateKind::Normal);
        let next_ref = self.state_ref(next);
        let set_label = self.set_slot(self.slots.label, next_ref);
        self.push(set_label);

        let mut b = self.cx.builder();
        let store = b.set(self.suspend_result, call);
        let result = b.get(self.suspend_result);
        let sentinel = b.suspended();
        let suspended = b.identity_eq(result, sentinel);
        let result = b.get(self.suspend_result);
        let leave = b.ret(self.resume, result);
        let check = b.if_then(suspended, leave);
        self.push(store);
        self.push(check);
        self.jump_to(next);

        self.switch_to(next);
        let mut b = self.cx.builder();
        let resumed = b.get(self.suspend_result);
        if ty.is_unit() {
            return Ok(b.unit());
        }
        Ok(b.implicit_cast(resumed, ty))
    }

    // ===== Numbering =====

    fn finish(mut self) -> LowerResult<StateMachine> {
        let order = self.reverse_postorder();
        let mut ids: Vec<Option<u32>> = vec![None; self.states.len()];
        for (id, &state) in order.iter().enumerate() {
            ids[state as usize] = Some(id as u32);
        }
        let root_id = order.len() as u32;
        ids[self.root_trap as usize] = Some(root_id);

        let dropped = self.states.len() - order.len() - 1;
        if dropped > 0 {
            tracing::trace!(target: "corvid_lower::coroutines", dropped, "discarding unreachable states");
        }

        let mut arena = std::mem::take(&mut self.states);
        let mut states = Vec::with_capacity(order.len() + 1);
        for state in order.into_iter().chain(std::iter::once(self.root_trap)) {
            let pending = std::mem::replace(
                &mut arena[state as usize],
                PendingState {
                    kind: StateKind::Normal,
                    entry: Vec::new(),
                    successors: Vec::new(),
                },
            );
            let mut entry = pending.entry;
            resolve_state_refs(&mut entry, &ids)?;
            retarget_returns(self.cx.module, &mut entry, self.function, self.resume);
            reparent_locals(self.cx.module, &entry, self.function, self.resume);

            let successors = pending
                .successors
                .iter()
                .map(|&s| ids[s as usize])
                .collect::<Option<Vec<u32>>>()
                .ok_or_else(|| LowerError::internal(PASS, "reachable state jumps to an unnumbered state"))?;
            states.push(SuspendState {
                id: states.len() as u32,
                kind: pending.kind,
                entry,
                successors,
            });
        }

        Ok(StateMachine {
            states,
            root_trap: root_id,
            suspend_result: self.suspend_result,
            suspend_state: self.suspend_state,
            switch_subject: self.switch_subject,
            root_loop: self.root_loop,
            slots: self.slots,
        })
    }

    /// States reachable from the entry in reverse postorder. Successors are
    /// visited last-first, so the first successor gets the lowest id. The root
    /// trap is left out: it is numbered last.
    fn reverse_postorder(&self) -> Vec<u32> {
        let mut visited = vec![false; self.states.len()];
        visited[self.entry as usize] = true;
        visited[self.root_trap as usize] = true;
        let mut post = Vec::new();
        let mut stack: Vec<(u32, usize)> = vec![(self.entry, 0)];
        while let Some(&(state, next)) = stack.last() {
            let successors = &self.states[state as usize].successors;
            if next < successors.len() {
                if let Some(top) = stack.last_mut() {
                    top.1 += 1;
                }
                let succ = successors[successors.len() - 1 - next];
                if !visited[succ as usize] {
                    visited[succ as usize] = true;
                    stack.push((succ, 0));
                }
            } else {
                post.push(state);
                stack.pop();
            }
        }
        post.reverse();
        post
    }
}

fn resolve_state_refs(entry: &mut [Expr], ids: &[Option<u32>]) -> LowerResult<()> {
    let mut missing = None;
    for stmt in entry.iter_mut() {
        stmt.walk_mut(&mut |e| {
            if let ExprKind::StateRef(state) = e.kind {
                match ids.get(state as usize).copied().flatten() {
                    Some(id) => e.kind = ExprKind::Const(Const::Int(i64::from(id))),
                    None => missing = Some(state),
                }
            }
        });
    }
    match missing {
        Some(state) => Err(LowerError::internal(
            PASS,
            format!("reference to discarded state {state}"),
        )),
        None => Ok(()),
    }
}

fn produces_value(e: &Expr) -> bool {
    !e.ty.is_unit() && !e.ty.is_nothing() && !e.is_jump()
}

fn is_side_effect_free(e: &Expr) -> bool {
    match &e.kind {
        ExprKind::Const(_) | ExprKind::GetVar(_) | ExprKind::Suspended => true,
        ExprKind::TypeOp {
            op: TypeOp::ImplicitCast,
            operand,
            ..
        } => is_side_effect_free(operand),
        _ => false,
    }
}
