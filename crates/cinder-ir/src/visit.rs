//! Tree traversal
//!
//! `Visit` and `VisitMut` walk every node by default; implementors override the
//! hooks they care about and call the matching `walk_*` function to continue
//! into children.

use crate::ir::{AnonymousFunction, Block, Expr, Stmt};

pub trait Visit {
    fn visit_block(&mut self, block: &Block) {
        walk_block(self, block);
    }

    fn visit_stmt(&mut self, stmt: &Stmt) {
        walk_stmt(self, stmt);
    }

    fn visit_expr(&mut self, expr: &Expr) {
        walk_expr(self, expr);
    }

    fn visit_lambda(&mut self, lambda: &AnonymousFunction) {
        self.visit_block(&lambda.body);
    }
}

pub fn walk_block<V: Visit + ?Sized>(v: &mut V, block: &Block) {
    for stmt in &block.stmts {
        v.visit_stmt(stmt);
    }
}

pub fn walk_stmt<V: Visit + ?Sized>(v: &mut V, stmt: &Stmt) {
    match stmt {
        Stmt::Block(block) => v.visit_block(block),
        Stmt::Local { init, .. } => {
            if let Some(init) = init {
                v.visit_expr(init);
            }
        }
        Stmt::Expr(expr) | Stmt::YieldReturn(expr) => v.visit_expr(expr),
        Stmt::Return(value) => {
            if let Some(value) = value {
                v.visit_expr(value);
            }
        }
        Stmt::If {
            cond,
            then_block,
            else_block,
        } => {
            v.visit_expr(cond);
            v.visit_block(then_block);
            if let Some(else_block) = else_block {
                v.visit_block(else_block);
            }
        }
        Stmt::While { cond, body } => {
            v.visit_expr(cond);
            v.visit_block(body);
        }
        Stmt::Switch {
            value,
            cases,
            default,
        } => {
            v.visit_expr(value);
            for case in cases {
                for stmt in &case.body {
                    v.visit_stmt(stmt);
                }
            }
            if let Some(default) = default {
                for stmt in default {
                    v.visit_stmt(stmt);
                }
            }
        }
        Stmt::Label(_) | Stmt::Goto(_) | Stmt::YieldBreak | Stmt::Empty => {}
    }
}

pub fn walk_expr<V: Visit + ?Sized>(v: &mut V, expr: &Expr) {
    match expr {
        Expr::Const { .. } | Expr::Local(_) | Expr::Param(_) | Expr::This => {}
        Expr::Field { target, .. } => {
            if let Some(target) = target {
                v.visit_expr(target);
            }
        }
        Expr::Assign { target, value } => {
            v.visit_expr(target);
            v.visit_expr(value);
        }
        Expr::Binary { lhs, rhs, .. } => {
            v.visit_expr(lhs);
            v.visit_expr(rhs);
        }
        Expr::Not(inner) => v.visit_expr(inner),
        Expr::Call { receiver, args, .. } => {
            if let Some(receiver) = receiver {
                v.visit_expr(receiver);
            }
            for arg in args {
                v.visit_expr(arg);
            }
        }
        Expr::New { args, .. } => {
            for arg in args {
                v.visit_expr(arg);
            }
        }
        Expr::Invoke { delegate, args } => {
            v.visit_expr(delegate);
            for arg in args {
                v.visit_expr(arg);
            }
        }
        Expr::CreateDelegate { receiver, .. } => {
            if let Some(receiver) = receiver {
                v.visit_expr(receiver);
            }
        }
        Expr::Convert { value, .. } => v.visit_expr(value),
        Expr::Lambda(lambda) => v.visit_lambda(lambda),
        Expr::Sequence { stmts, value } => {
            for stmt in stmts {
                v.visit_stmt(stmt);
            }
            v.visit_expr(value);
        }
    }
}

pub trait VisitMut {
    fn visit_block_mut(&mut self, block: &mut Block) {
        walk_block_mut(self, block);
    }

    fn visit_stmt_mut(&mut self, stmt: &mut Stmt) {
        walk_stmt_mut(self, stmt);
    }

    fn visit_expr_mut(&mut self, expr: &mut Expr) {
        walk_expr_mut(self, expr);
    }

    fn visit_lambda_mut(&mut self, lambda: &mut AnonymousFunction) {
        self.visit_block_mut(&mut lambda.body);
    }
}

pub fn walk_block_mut<V: VisitMut + ?Sized>(v: &mut V, block: &mut Block) {
    for stmt in &mut block.stmts {
        v.visit_stmt_mut(stmt);
    }
}

pub fn walk_stmt_mut<V: VisitMut + ?Sized>(v: &mut V, stmt: &mut Stmt) {
    match stmt {
        Stmt::Block(block) => v.visit_block_mut(block),
        Stmt::Local { init, .. } => {
            if let Some(init) = init {
                v.visit_expr_mut(init);
            }
        }
        Stmt::Expr(expr) | Stmt::YieldReturn(expr) => v.visit_expr_mut(expr),
        Stmt::Return(value) => {
            if let Some(value) = value {
                v.visit_expr_mut(value);
            }
        }
        Stmt::If {
            cond,
            then_block,
            else_block,
        } => {
            v.visit_expr_mut(cond);
            v.visit_block_mut(then_block);
            if let Some(else_block) = else_block {
                v.visit_block_mut(else_block);
            }
        }
        Stmt::While { cond, body } => {
            v.visit_expr_mut(cond);
            v.visit_block_mut(body);
        }
        Stmt::Switch {
            value,
            cases,
            default,
        } => {
            v.visit_expr_mut(value);
            for case in cases {
                for stmt in &mut case.body {
                    v.visit_stmt_mut(stmt);
                }
            }
            if let Some(default) = default {
                for stmt in default {
                    v.visit_stmt_mut(stmt);
                }
            }
        }
        Stmt::Label(_) | Stmt::Goto(_) | Stmt::YieldBreak | Stmt::Empty => {}
    }
}

pub fn walk_expr_mut<V: VisitMut + ?Sized>(v: &mut V, expr: &mut Expr) {
    match expr {
        Expr::Const { .. } | Expr::Local(_) | Expr::Param(_) | Expr::This => {}
        Expr::Field { target, .. } => {
            if let Some(target) = target {
                v.visit_expr_mut(target);
            }
        }
        Expr::Assign { target, value } => {
            v.visit_expr_mut(target);
            v.visit_expr_mut(value);
        }
        Expr::Binary { lhs, rhs, .. } => {
            v.visit_expr_mut(lhs);
            v.visit_expr_mut(rhs);
        }
        Expr::Not(inner) => v.visit_expr_mut(inner),
        Expr::Call { receiver, args, .. } => {
            if let Some(receiver) = receiver {
                v.visit_expr_mut(receiver);
            }
            for arg in args {
                v.visit_expr_mut(arg);
            }
        }
        Expr::New { args, .. } => {
            for arg in args {
                v.visit_expr_mut(arg);
            }
        }
        Expr::Invoke { delegate, args } => {
            v.visit_expr_mut(delegate);
            for arg in args {
                v.visit_expr_mut(arg);
            }
        }
        Expr::CreateDelegate { receiver, .. } => {
            if let Some(receiver) = receiver {
                v.visit_expr_mut(receiver);
            }
        }
        Expr::Convert { value, .. } => v.visit_expr_mut(value),
        Expr::Lambda(lambda) => v.visit_lambda_mut(lambda),
        Expr::Sequence { stmts, value } => {
            for stmt in stmts {
                v.visit_stmt_mut(stmt);
            }
            v.visit_expr_mut(value);
        }
    }
}
