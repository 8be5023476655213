//! The shader rewrite.
//!
//! Walks the shader body once, in source order, doing four jobs:
//!
//! 1. every intrinsic call site becomes a command emission on the lane's
//!    channel (`__sg.<helper>(op_id, ..).await?`) with a fresh static op id;
//! 2. a reconverge marker is inserted after every divergent construct
//!    (`if`, `match`, and loops containing a direct `continue` or `break`;
//!    a breaking lane leaves the loop without touching any marker inside
//!    it, so the post-loop marker is where it waits for the lanes still
//!    iterating);
//! 3. `continue` in such loops is captured by a labeled block so the thread
//!    lands on a per-iteration reconverge at the bottom of the body, where
//!    lanes that skipped the body catch up;
//! 4. adjacent sync points are peepholed: a reconverge right before any
//!    barrier is dropped, and a memory barrier right before a stronger
//!    barrier is dropped.
//!
//! Op ids are allocated by a counter during the walk, so they are
//! deterministic and ordered: a barrier's id is always greater than the ids
//! of any divergence it textually dominates.

use proc_macro2::TokenStream;
use quote::{format_ident, quote};
use syn::fold::{self, Fold};
use syn::visit::{self, Visit};
use syn::{
    parse_quote, Block, Expr, ExprCall, ExprClosure, ExprForLoop, ExprLoop, ExprWhile, FnArg,
    ItemFn, Pat, ReturnType, Stmt,
};

use crate::intrinsics::{self, Lowering, SyncClass};

pub fn expand(func: ItemFn) -> syn::Result<TokenStream> {
    if !func.sig.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &func.sig.generics,
            "shader functions cannot be generic",
        ));
    }
    if let Some(asyncness) = &func.sig.asyncness {
        return Err(syn::Error::new_spanned(
            asyncness,
            "shader functions are already cooperative; remove `async`",
        ));
    }
    if !matches!(func.sig.output, ReturnType::Default) {
        return Err(syn::Error::new_spanned(
            &func.sig.output,
            "shader functions cannot declare a return type",
        ));
    }

    let mut arg_names = Vec::new();
    let mut arg_types = Vec::new();
    for input in &func.sig.inputs {
        match input {
            FnArg::Typed(pat_type) => match &*pat_type.pat {
                Pat::Ident(ident) => {
                    arg_names.push(ident.ident.clone());
                    arg_types.push((*pat_type.ty).clone());
                }
                other => {
                    return Err(syn::Error::new_spanned(
                        other,
                        "shader arguments must be simple identifiers",
                    ))
                }
            },
            FnArg::Receiver(receiver) => {
                return Err(syn::Error::new_spanned(
                    receiver,
                    "shader functions cannot take self",
                ))
            }
        }
    }

    let mut rewriter = Rewriter::new();
    let body = rewriter.fold_block(*func.block);
    rewriter.finish()?;

    let vis = &func.vis;
    let name = &func.sig.ident;
    let args_ty = quote! { (#(#arg_types,)*) };
    let arg_bindings = arg_names.iter().enumerate().map(|(i, ident)| {
        let index = syn::Index::from(i);
        quote! { #[allow(unused_variables)] let #ident = __inv.args.#index; }
    });

    Ok(quote! {
        #vis fn #name() -> impl shader_emu::ComputeShader<#args_ty> {
            move |__inv: shader_emu::Invocation<#args_ty>| -> shader_emu::LaneFuture {
                ::std::boxed::Box::pin(async move {
                    let __sg = __inv.link;
                    #[allow(unused_variables)]
                    let ssbo = __inv.ssbo;
                    #[allow(unused_variables)]
                    let shared = __inv.shared;
                    #(#arg_bindings)*
                    #[allow(non_snake_case, unused_variables)]
                    let gl_NumWorkGroups = __inv.group.num_work_groups;
                    #[allow(non_snake_case, unused_variables)]
                    let gl_WorkGroupSize = __inv.group.work_group_size;
                    #[allow(non_snake_case, unused_variables)]
                    let gl_WorkGroupID = __inv.group.work_group_id;
                    #[allow(non_snake_case, unused_variables)]
                    let gl_NumSubgroups = __inv.group.num_subgroups;
                    #[allow(non_snake_case, unused_variables)]
                    let gl_SubgroupID = __inv.group.subgroup_id;
                    #[allow(non_snake_case, unused_variables)]
                    let gl_SubgroupSize = shader_emu::SUBGROUP_SIZE as u32;
                    #[allow(non_snake_case, unused_variables)]
                    let gl_LocalInvocationID = __inv.thread.local_invocation_id;
                    #[allow(non_snake_case, unused_variables)]
                    let gl_GlobalInvocationID = __inv.thread.global_invocation_id;
                    #[allow(non_snake_case, unused_variables)]
                    let gl_SubgroupInvocationID = __inv.thread.subgroup_invocation_id;
                    #[allow(non_snake_case, unused_variables)]
                    let gl_SubgroupEqMask = __inv.thread.subgroup_eq_mask;
                    #[allow(non_snake_case, unused_variables)]
                    let gl_SubgroupGeMask = __inv.thread.subgroup_ge_mask;
                    #[allow(non_snake_case, unused_variables)]
                    let gl_SubgroupGtMask = __inv.thread.subgroup_gt_mask;
                    #[allow(non_snake_case, unused_variables)]
                    let gl_SubgroupLeMask = __inv.thread.subgroup_le_mask;
                    #[allow(non_snake_case, unused_variables)]
                    let gl_SubgroupLtMask = __inv.thread.subgroup_lt_mask;
                    #body
                    ::core::result::Result::Ok(())
                })
            }
        }
    })
}

struct Rewriter {
    next_op_id: u32,
    next_label: u32,
    error: Option<syn::Error>,
}

impl Rewriter {
    fn new() -> Self {
        Rewriter {
            next_op_id: 1,
            next_label: 0,
            error: None,
        }
    }

    fn fresh_id(&mut self) -> u32 {
        let id = self.next_op_id;
        self.next_op_id += 1;
        id
    }

    fn fresh_label(&mut self) -> syn::Lifetime {
        let label = syn::Lifetime::new(
            &format!("'__body{}", self.next_label),
            proc_macro2::Span::call_site(),
        );
        self.next_label += 1;
        label
    }

    fn record(&mut self, err: syn::Error) {
        match &mut self.error {
            Some(existing) => existing.combine(err),
            None => self.error = Some(err),
        }
    }

    fn finish(self) -> syn::Result<()> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn reconverge_stmt(&mut self) -> Stmt {
        let id = self.fresh_id();
        parse_quote! { __sg.reconverge(#id).await?; }
    }

    /// Rewrites one intrinsic call site, or passes a plain call through.
    fn fold_call(&mut self, call: ExprCall) -> Expr {
        let Some(name) = call_target(&call) else {
            return Expr::Call(fold::fold_expr_call(self, call));
        };
        let Some(lowering) = intrinsics::lookup(&name) else {
            return Expr::Call(fold::fold_expr_call(self, call));
        };
        if call.args.len() != lowering.arity() {
            self.record(syn::Error::new_spanned(
                &call,
                format!(
                    "{} takes {} argument(s), found {}",
                    name,
                    lowering.arity(),
                    call.args.len()
                ),
            ));
            return Expr::Call(call);
        }

        let mut args: Vec<Expr> = call
            .args
            .into_iter()
            .map(|arg| self.fold_expr(arg))
            .collect();
        let id = self.fresh_id();
        match lowering {
            Lowering::Scalar { op, binary } => {
                let op = op_path(op);
                let value = args.remove(0);
                let aux: Expr = if binary {
                    args.remove(0)
                } else {
                    parse_quote!(0u32)
                };
                parse_quote!(__sg.scalar(#id, #op, #value, #aux).await?)
            }
            Lowering::ScalarTest { op } => {
                let op = op_path(op);
                let value = args.remove(0);
                parse_quote!(__sg.scalar_test(#id, #op, #value).await?)
            }
            Lowering::Predicate { op } => {
                let op = op_path(op);
                let value = args.remove(0);
                parse_quote!(__sg.predicate(#id, #op, #value).await?)
            }
            Lowering::Ballot => {
                let value = args.remove(0);
                parse_quote!(__sg.ballot(#id, #value).await?)
            }
            Lowering::Elect => parse_quote!(__sg.elect(#id).await?),
            Lowering::Sync { op } => {
                let op = op_path(op);
                parse_quote!(__sg.sync_op(#id, #op).await?)
            }
        }
    }

    /// Folds a loop body; when the loop has a direct `continue`, captures it
    /// with a labeled block and plants the per-iteration reconverge at the
    /// bottom, numbered after every site inside the body.
    fn fold_loop_body(&mut self, mut body: Block, captures_continue: bool) -> Block {
        if !captures_continue {
            return self.fold_block(body);
        }
        let label = self.fresh_label();
        capture_continues(&mut body, &label);
        let folded = self.fold_block(body);
        let stmts = folded.stmts;
        let id = self.fresh_id();
        parse_quote!({
            #label: {
                #(#stmts)*
            }
            __sg.reconverge(#id).await?;
        })
    }
}

impl Fold for Rewriter {
    fn fold_block(&mut self, block: Block) -> Block {
        let stmts = block.stmts;
        let n = stmts.len();

        let sync: Vec<Option<SyncClass>> = stmts.iter().map(stmt_sync_class).collect();
        let divergent: Vec<bool> = stmts.iter().map(stmt_is_divergent).collect();

        // Reverse pass: drop memory barriers subsumed by the next surviving
        // sync point, and remember what follows each statement.
        let mut keep = vec![true; n];
        let mut next_sync: Vec<Option<SyncClass>> = vec![None; n];
        let mut following: Option<SyncClass> = None;
        for i in (0..n).rev() {
            next_sync[i] = following;
            match sync[i] {
                Some(class)
                    if matches!(following, Some(later) if intrinsics::subsumes(later, class)) =>
                {
                    keep[i] = false;
                }
                class => following = class,
            }
        }

        let mut out: Vec<Stmt> = Vec::with_capacity(n + 1);
        for (i, stmt) in stmts.into_iter().enumerate() {
            if !keep[i] {
                continue;
            }
            if let Stmt::Item(syn::Item::Fn(nested)) = &stmt {
                self.record(syn::Error::new_spanned(
                    &nested.sig,
                    "nested routine definitions are not allowed in a shader body",
                ));
                continue;
            }
            // A trailing expression without a semicolon is the block's
            // value; appending a marker there would discard it. Divergence
            // re-merges at the enclosing construct's marker instead.
            let is_tail_value = i + 1 == n && matches!(stmt, Stmt::Expr(_, None));
            out.push(self.fold_stmt(stmt));
            // A reconverge right before a barrier would be subsumed by it;
            // skip emitting it at all.
            if divergent[i] && !is_tail_value && next_sync[i].is_none() {
                let marker = self.reconverge_stmt();
                out.push(marker);
            }
        }

        Block {
            brace_token: block.brace_token,
            stmts: out,
        }
    }

    fn fold_expr(&mut self, expr: Expr) -> Expr {
        match expr {
            Expr::Call(call) => self.fold_call(call),
            Expr::Closure(closure) => {
                if closure_mentions_intrinsic(&closure) {
                    self.record(syn::Error::new_spanned(
                        &closure,
                        "subgroup intrinsics cannot be used inside a nested closure",
                    ));
                }
                Expr::Closure(closure)
            }
            Expr::Return(ret) => {
                if let Some(value) = &ret.expr {
                    self.record(syn::Error::new_spanned(
                        value,
                        "a shader body cannot return a value",
                    ));
                }
                parse_quote!(return ::core::result::Result::Ok(()))
            }
            Expr::Async(inner) => {
                self.record(syn::Error::new_spanned(
                    &inner,
                    "async blocks are not allowed in a shader body",
                ));
                Expr::Async(inner)
            }
            Expr::Await(inner) => {
                self.record(syn::Error::new_spanned(
                    &inner,
                    "explicit await is not allowed in a shader body",
                ));
                Expr::Await(inner)
            }
            Expr::Continue(cont) if cont.label.is_some() => {
                self.record(syn::Error::new_spanned(
                    &cont,
                    "labeled continue is not supported in a shader body",
                ));
                Expr::Continue(cont)
            }
            // User-written labeled breaks can cross loop levels, which the
            // reconverge markers cannot follow. The `'__body*` labels the
            // continue capture generates are the one exception.
            Expr::Break(brk)
                if brk
                    .label
                    .as_ref()
                    .is_some_and(|label| !label.ident.to_string().starts_with("__body")) =>
            {
                self.record(syn::Error::new_spanned(
                    &brk,
                    "labeled break is not supported in a shader body",
                ));
                Expr::Break(brk)
            }
            other => fold::fold_expr(self, other),
        }
    }

    fn fold_expr_for_loop(&mut self, mut node: ExprForLoop) -> ExprForLoop {
        let captures = block_has_direct_continue(&node.body);
        node.pat = Box::new(self.fold_pat(*node.pat));
        node.expr = Box::new(self.fold_expr(*node.expr));
        node.body = self.fold_loop_body(node.body, captures);
        node
    }

    fn fold_expr_while(&mut self, mut node: ExprWhile) -> ExprWhile {
        let captures = block_has_direct_continue(&node.body);
        node.cond = Box::new(self.fold_expr(*node.cond));
        node.body = self.fold_loop_body(node.body, captures);
        node
    }

    fn fold_expr_loop(&mut self, mut node: ExprLoop) -> ExprLoop {
        let captures = block_has_direct_continue(&node.body);
        node.body = self.fold_loop_body(node.body, captures);
        node
    }
}

fn op_path(variant: &str) -> syn::Path {
    let ident = format_ident!("{}", variant);
    parse_quote!(shader_emu::Op::#ident)
}

fn call_target(call: &ExprCall) -> Option<String> {
    if let Expr::Path(path) = &*call.func {
        path.path.get_ident().map(|ident| ident.to_string())
    } else {
        None
    }
}

/// Classifies a bare `barrier();`-style statement for the peephole pass.
fn stmt_sync_class(stmt: &Stmt) -> Option<SyncClass> {
    if let Stmt::Expr(Expr::Call(call), _) = stmt {
        if let Some(name) = call_target(call) {
            return intrinsics::sync_class(&name);
        }
    }
    None
}

/// A statement is divergent when lanes can leave it at different program
/// points: `if`/`match` (in statement or let-initializer position), and
/// loops whose body can `continue` or `break`.
fn stmt_is_divergent(stmt: &Stmt) -> bool {
    match stmt {
        Stmt::Expr(expr, _) => expr_is_divergent(expr),
        Stmt::Local(local) => local
            .init
            .as_ref()
            .is_some_and(|init| expr_is_divergent(&init.expr)),
        _ => false,
    }
}

fn expr_is_divergent(expr: &Expr) -> bool {
    match expr {
        Expr::If(_) | Expr::Match(_) => true,
        Expr::ForLoop(node) => loop_body_diverges(&node.body),
        Expr::While(node) => loop_body_diverges(&node.body),
        Expr::Loop(node) => loop_body_diverges(&node.body),
        _ => false,
    }
}

/// A loop needs reconverge handling when lanes can exit an iteration (or
/// the loop itself) at different points: a direct `continue` or `break`.
fn loop_body_diverges(body: &Block) -> bool {
    block_has_direct_continue(body) || block_has_direct_break(body)
}

/// Whether a loop body contains a `continue` belonging to that loop (not to
/// a loop nested inside it).
fn block_has_direct_continue(block: &Block) -> bool {
    block_has_direct_exit(block, &|expr| {
        matches!(expr, Expr::Continue(cont) if cont.label.is_none())
    })
}

/// Whether a loop body contains a `break` belonging to that loop. Labeled
/// breaks are skipped: user labels are rejected elsewhere, and the breaks
/// the continue capture generates target a block, not the loop.
fn block_has_direct_break(block: &Block) -> bool {
    block_has_direct_exit(block, &|expr| {
        matches!(expr, Expr::Break(brk) if brk.label.is_none())
    })
}

/// Scans the statements reachable in the same loop iteration, stopping at
/// nested loops (their exits are their own).
fn block_has_direct_exit(block: &Block, is_exit: &dyn Fn(&Expr) -> bool) -> bool {
    block.stmts.iter().any(|stmt| match stmt {
        Stmt::Expr(expr, _) => expr_has_direct_exit(expr, is_exit),
        _ => false,
    })
}

fn expr_has_direct_exit(expr: &Expr, is_exit: &dyn Fn(&Expr) -> bool) -> bool {
    if is_exit(expr) {
        return true;
    }
    match expr {
        Expr::If(node) => {
            block_has_direct_exit(&node.then_branch, is_exit)
                || node
                    .else_branch
                    .as_ref()
                    .is_some_and(|(_, else_expr)| expr_has_direct_exit(else_expr, is_exit))
        }
        Expr::Match(node) => node
            .arms
            .iter()
            .any(|arm| expr_has_direct_exit(&arm.body, is_exit)),
        Expr::Block(node) => block_has_direct_exit(&node.block, is_exit),
        _ => false,
    }
}

/// Replaces this loop's direct `continue`s with breaks out of the labeled
/// body block, so continuing lanes land on the bottom reconverge.
fn capture_continues(block: &mut Block, label: &syn::Lifetime) {
    for stmt in &mut block.stmts {
        if let Stmt::Expr(expr, _) = stmt {
            capture_continues_expr(expr, label);
        }
    }
}

fn capture_continues_expr(expr: &mut Expr, label: &syn::Lifetime) {
    match expr {
        Expr::Continue(cont) if cont.label.is_none() => {
            *expr = parse_quote!(break #label);
        }
        Expr::If(node) => {
            capture_continues(&mut node.then_branch, label);
            if let Some((_, else_expr)) = &mut node.else_branch {
                capture_continues_expr(else_expr, label);
            }
        }
        Expr::Match(node) => {
            for arm in &mut node.arms {
                capture_continues_expr(&mut arm.body, label);
            }
        }
        Expr::Block(node) => capture_continues(&mut node.block, label),
        _ => {}
    }
}

struct IntrinsicScan {
    found: bool,
}

impl<'ast> Visit<'ast> for IntrinsicScan {
    fn visit_expr_call(&mut self, call: &'ast ExprCall) {
        if let Some(name) = call_target(call) {
            if intrinsics::lookup(&name).is_some() {
                self.found = true;
            }
        }
        visit::visit_expr_call(self, call);
    }
}

fn closure_mentions_intrinsic(closure: &ExprClosure) -> bool {
    let mut scan = IntrinsicScan { found: false };
    scan.visit_expr(&closure.body);
    scan.found
}
