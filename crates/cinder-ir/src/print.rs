//! Text rendering of modules and method bodies

use std::fmt::Write;

use cinder_types::{MethodId, TypeDefId, TypeId, TypeKind};

use crate::ir::{AnonymousFunction, Block, Constant, Expr, MethodRef, Module, Stmt};

/// Render every non-platform type of the module.
pub fn print_module(module: &Module) -> String {
    let mut printer = Printer::new(module);
    for def in &module.type_defs {
        if def.external || def.declaring.is_some() {
            continue;
        }
        printer.type_def(def.id);
    }
    printer.out
}

/// Render one method with its body.
pub fn print_method(module: &Module, method: MethodId) -> String {
    let mut printer = Printer::new(module);
    printer.method(method);
    printer.out
}

/// Render a block of statements at indentation zero.
pub fn print_block(module: &Module, block: &Block) -> String {
    let mut printer = Printer::new(module);
    for stmt in &block.stmts {
        printer.stmt(stmt);
    }
    printer.out
}

/// Render an expression on one line.
pub fn print_expr(module: &Module, expr: &Expr) -> String {
    let mut printer = Printer::new(module);
    printer.expr(expr);
    printer.out
}

/// Name of a type as written in source.
pub fn type_name(module: &Module, ty: TypeId) -> String {
    match module.types.kind(ty) {
        TypeKind::Void => "void".to_string(),
        TypeKind::Bool => "bool".to_string(),
        TypeKind::Int32 => "int32".to_string(),
        TypeKind::Int64 => "int64".to_string(),
        TypeKind::Float64 => "float64".to_string(),
        TypeKind::Char => "char".to_string(),
        TypeKind::String => "string".to_string(),
        TypeKind::Def(def) => def_name(module, *def),
        TypeKind::Instance { def, args } => {
            let args: Vec<String> = args.iter().map(|a| type_name(module, *a)).collect();
            format!("{}<{}>", def_name(module, *def), args.join(", "))
        }
        TypeKind::TypeParam { owner, index } => module
            .type_def(*owner)
            .generic_params
            .get(*index as usize)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| format!("!{}", index)),
        TypeKind::MethodParam { owner, index } => module
            .method(*owner)
            .generic_params
            .get(*index as usize)
            .map(|p| p.name.clone())
            .unwrap_or_else(|| format!("!!{}", index)),
        TypeKind::Array(elem) => format!("{}[]", type_name(module, *elem)),
        TypeKind::Delegate { params, ret } => {
            let params: Vec<String> = params.iter().map(|p| type_name(module, *p)).collect();
            format!("delegate {}({})", type_name(module, *ret), params.join(", "))
        }
    }
}

fn def_name(module: &Module, def: TypeDefId) -> String {
    let def = module.type_def(def);
    // Strip the arity suffix of generic platform types
    match def.name.split_once('`') {
        Some((name, _)) => name.to_string(),
        None => def.name.clone(),
    }
}

struct Printer<'m> {
    module: &'m Module,
    out: String,
    indent: usize,
}

impl<'m> Printer<'m> {
    fn new(module: &'m Module) -> Self {
        Self {
            module,
            out: String::new(),
            indent: 0,
        }
    }

    fn line(&mut self, text: &str) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
        self.out.push_str(text);
        self.out.push('\n');
    }

    fn start_line(&mut self) {
        for _ in 0..self.indent {
            self.out.push_str("    ");
        }
    }

    fn type_def(&mut self, id: TypeDefId) {
        let module = self.module;
        let def = module.type_def(id);
        let mut header = String::new();
        if def.compiler_generated {
            header.push_str("[CompilerGenerated] ");
        }
        if def.sealed {
            header.push_str("sealed ");
        }
        let _ = write!(header, "class {}", def.name);
        if !def.generic_params.is_empty() {
            let names: Vec<String> = def
                .generic_params
                .iter()
                .map(|p| {
                    if p.constraints.is_empty() {
                        p.name.clone()
                    } else {
                        let bounds: Vec<String> =
                            p.constraints.iter().map(|c| type_name(module, *c)).collect();
                        format!("{}: {}", p.name, bounds.join(" + "))
                    }
                })
                .collect();
            let _ = write!(header, "<{}>", names.join(", "));
        }
        let mut supers = Vec::new();
        if let Some(base) = def.base {
            supers.push(type_name(module, base));
        }
        supers.extend(def.interfaces.iter().map(|i| type_name(module, *i)));
        if !supers.is_empty() {
            let _ = write!(header, " : {}", supers.join(", "));
        }
        header.push_str(" {");
        self.line(&header);
        self.indent += 1;

        for field in &def.fields {
            let field = module.field(*field);
            let mut text = String::from("field ");
            if field.is_static {
                text.push_str("static ");
            }
            let _ = write!(text, "{} {}", type_name(module, field.ty), field.name);
            self.line(&text);
        }
        for binding in &def.method_impls {
            let text = format!(
                ".override {} with {}",
                self.method_ref_name(&binding.implemented),
                module.method(binding.implementing.method).name
            );
            self.line(&text);
        }
        for method in &def.methods {
            self.method(*method);
        }
        for nested in &def.nested {
            self.type_def(*nested);
        }

        self.indent -= 1;
        self.line("}");
    }

    fn method(&mut self, id: MethodId) {
        let module = self.module;
        let method = module.method(id);
        let mut header = String::from("method ");
        if method.is_static {
            header.push_str("static ");
        }
        if method.is_virtual {
            header.push_str("virtual ");
        }
        let _ = write!(header, "{} {}", type_name(module, method.return_type), method.name);
        if !method.generic_params.is_empty() {
            let names: Vec<&str> = method.generic_params.iter().map(|p| p.name.as_str()).collect();
            let _ = write!(header, "<{}>", names.join(", "));
        }
        let params: Vec<String> = method
            .params
            .iter()
            .map(|p| {
                let param = module.param(*p);
                format!("{} {}", type_name(module, param.ty), param.name)
            })
            .collect();
        let _ = write!(header, "({})", params.join(", "));
        match &method.body {
            Some(body) => {
                header.push_str(" {");
                self.line(&header);
                self.indent += 1;
                for stmt in &body.stmts {
                    self.stmt(stmt);
                }
                self.indent -= 1;
                self.line("}");
            }
            None => {
                header.push(';');
                self.line(&header);
            }
        }
    }

    fn block_body(&mut self, block: &Block) {
        self.indent += 1;
        for stmt in &block.stmts {
            self.stmt(stmt);
        }
        self.indent -= 1;
    }

    fn stmt(&mut self, stmt: &Stmt) {
        let module = self.module;
        match stmt {
            Stmt::Block(block) => {
                self.line("{");
                self.block_body(block);
                self.line("}");
            }
            Stmt::Local { local, init } => {
                let local = module.local(*local);
                self.start_line();
                let _ = write!(self.out, "{} {}", type_name(module, local.ty), local.name);
                if let Some(init) = init {
                    self.out.push_str(" = ");
                    self.expr(init);
                }
                self.out.push_str(";\n");
            }
            Stmt::Expr(expr) => {
                self.start_line();
                self.expr(expr);
                self.out.push_str(";\n");
            }
            Stmt::Return(value) => {
                self.start_line();
                self.out.push_str("return");
                if let Some(value) = value {
                    self.out.push(' ');
                    self.expr(value);
                }
                self.out.push_str(";\n");
            }
            Stmt::If {
                cond,
                then_block,
                else_block,
            } => {
                self.start_line();
                self.out.push_str("if (");
                self.expr(cond);
                self.out.push_str(") {\n");
                self.block_body(then_block);
                if let Some(else_block) = else_block {
                    self.line("} else {");
                    self.block_body(else_block);
                }
                self.line("}");
            }
            Stmt::While { cond, body } => {
                self.start_line();
                self.out.push_str("while (");
                self.expr(cond);
                self.out.push_str(") {\n");
                self.block_body(body);
                self.line("}");
            }
            Stmt::Label(label) => {
                let text = format!("L{}:", label.0);
                self.line(&text);
            }
            Stmt::Goto(label) => {
                let text = format!("goto L{};", label.0);
                self.line(&text);
            }
            Stmt::Switch {
                value,
                cases,
                default,
            } => {
                self.start_line();
                self.out.push_str("switch (");
                self.expr(value);
                self.out.push_str(") {\n");
                self.indent += 1;
                for case in cases {
                    let text = format!("case {}:", case.value);
                    self.line(&text);
                    self.indent += 1;
                    for stmt in &case.body {
                        self.stmt(stmt);
                    }
                    self.indent -= 1;
                }
                if let Some(default) = default {
                    self.line("default:");
                    self.indent += 1;
                    for stmt in default {
                        self.stmt(stmt);
                    }
                    self.indent -= 1;
                }
                self.indent -= 1;
                self.line("}");
            }
            Stmt::YieldReturn(value) => {
                self.start_line();
                self.out.push_str("yield return ");
                self.expr(value);
                self.out.push_str(";\n");
            }
            Stmt::YieldBreak => self.line("yield break;"),
            Stmt::Empty => self.line(";"),
        }
    }

    fn args(&mut self, args: &[Expr]) {
        self.out.push('(');
        for (i, arg) in args.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.expr(arg);
        }
        self.out.push(')');
    }

    fn method_ref_name(&self, method: &MethodRef) -> String {
        let module = self.module;
        let mut name = module.method(method.method).name.clone();
        if !method.type_args.is_empty() {
            let args: Vec<String> = method
                .type_args
                .iter()
                .map(|t| type_name(module, *t))
                .collect();
            let _ = write!(name, "<{}>", args.join(", "));
        }
        name
    }

    fn operand(&mut self, expr: &Expr) {
        if matches!(expr, Expr::Binary { .. } | Expr::Assign { .. }) {
            self.out.push('(');
            self.expr(expr);
            self.out.push(')');
        } else {
            self.expr(expr);
        }
    }

    fn expr(&mut self, expr: &Expr) {
        let module = self.module;
        match expr {
            Expr::Const { value, .. } => match value {
                Constant::Null => self.out.push_str("null"),
                Constant::Bool(b) => {
                    let _ = write!(self.out, "{}", b);
                }
                Constant::Int(i) => {
                    let _ = write!(self.out, "{}", i);
                }
                Constant::Float(f) => {
                    let _ = write!(self.out, "{:?}", f);
                }
                Constant::Str(s) => {
                    let _ = write!(self.out, "{:?}", s);
                }
            },
            Expr::Local(id) => self.out.push_str(&module.local(*id).name),
            Expr::Param(id) => self.out.push_str(&module.param(*id).name),
            Expr::This => self.out.push_str("this"),
            Expr::Field { target, field } => {
                match target {
                    Some(target) => self.operand(target),
                    None => self.out.push_str(&type_name(module, field.owner)),
                }
                self.out.push('.');
                self.out.push_str(&module.field(field.field).name);
            }
            Expr::Assign { target, value } => {
                self.expr(target);
                self.out.push_str(" = ");
                self.expr(value);
            }
            Expr::Binary { op, lhs, rhs } => {
                self.operand(lhs);
                let _ = write!(self.out, " {} ", op.symbol());
                self.operand(rhs);
            }
            Expr::Not(inner) => {
                self.out.push('!');
                self.operand(inner);
            }
            Expr::Call {
                method,
                receiver,
                args,
            } => {
                match receiver {
                    Some(receiver) => self.operand(receiver),
                    None => self.out.push_str(&type_name(module, method.owner)),
                }
                self.out.push('.');
                let name = self.method_ref_name(method);
                self.out.push_str(&name);
                self.args(args);
            }
            Expr::New { ctor, args } => {
                let _ = write!(self.out, "new {}", type_name(module, ctor.owner));
                self.args(args);
            }
            Expr::Invoke { delegate, args } => {
                self.operand(delegate);
                self.args(args);
            }
            Expr::CreateDelegate {
                method,
                receiver,
                ty,
            } => {
                let _ = write!(self.out, "new {}(", type_name(module, *ty));
                match receiver {
                    Some(receiver) => self.operand(receiver),
                    None => self.out.push_str(&type_name(module, method.owner)),
                }
                self.out.push('.');
                let name = self.method_ref_name(method);
                self.out.push_str(&name);
                self.out.push(')');
            }
            Expr::Convert { value, ty } => {
                let _ = write!(self.out, "({})", type_name(module, *ty));
                self.operand(value);
            }
            Expr::Lambda(lambda) => self.lambda(lambda),
            Expr::Sequence { stmts, value } => {
                self.out.push_str("{\n");
                self.indent += 1;
                for stmt in stmts {
                    self.stmt(stmt);
                }
                self.indent -= 1;
                self.start_line();
                self.out.push_str("} ");
                self.expr(value);
            }
        }
    }

    fn lambda(&mut self, lambda: &AnonymousFunction) {
        let module = self.module;
        let params: Vec<String> = lambda
            .params
            .iter()
            .map(|p| {
                let param = module.param(*p);
                format!("{} {}", type_name(module, param.ty), param.name)
            })
            .collect();
        let _ = writeln!(self.out, "({}) => {{", params.join(", "));
        self.block_body(&lambda.body);
        self.start_line();
        self.out.push('}');
    }
}
