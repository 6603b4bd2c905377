use super::ExecError;
use super::ast::*;
use super::lexer::{Tok, tokenize};

/// Parse source into a statement list.
///
/// Security screening happens here, before any execution: blocked
/// identifiers (dynamic eval, filesystem, reflection) and dunder attribute
/// access are rejected as violations, and unsupported constructs fail as
/// syntax errors.
pub fn parse(source: &str) -> Result<Vec<Stmt>, ExecError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_program()
}

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Tok {
        self.tokens.get(self.pos).unwrap_or(&Tok::Eof)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.tokens.get(self.pos).cloned().unwrap_or(Tok::Eof);
        self.pos += 1;
        tok
    }

    fn eat_op(&mut self, op: &str) -> bool {
        if self.check_op(op) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn check_op(&self, op: &str) -> bool {
        matches!(self.peek(), Tok::Op(o) if *o == op)
    }

    fn expect_op(&mut self, op: &str) -> Result<(), ExecError> {
        if self.check_op(op) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.unexpected(&format!("expected '{op}'")))
        }
    }

    fn check_name(&self, keyword: &str) -> bool {
        matches!(self.peek(), Tok::Name(n) if n == keyword)
    }

    fn eat_name(&mut self, keyword: &str) -> bool {
        if self.check_name(keyword) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_name(&mut self) -> Result<String, ExecError> {
        match self.advance() {
            Tok::Name(n) => Ok(n),
            other => Err(ExecError::Syntax(format!(
                "expected a name, found {other:?}"
            ))),
        }
    }

    fn unexpected(&self, context: &str) -> ExecError {
        ExecError::Syntax(format!("{context}, found {:?}", self.peek()))
    }

    fn parse_program(&mut self) -> Result<Vec<Stmt>, ExecError> {
        let mut stmts = Vec::new();
        loop {
            match self.peek() {
                Tok::Eof => break,
                Tok::Newline => {
                    self.pos += 1;
                }
                _ => stmts.push(self.parse_stmt()?),
            }
        }
        Ok(stmts)
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ExecError> {
        if let Tok::Name(name) = self.peek() {
            match name.as_str() {
                "if" => return self.parse_if(),
                "while" => return self.parse_while(),
                "for" => return self.parse_for(),
                "def" => return self.parse_def(),
                "class" | "try" | "with" | "lambda" | "global" | "nonlocal" => {
                    return Err(ExecError::Syntax(format!(
                        "'{name}' is not supported in the sandbox"
                    )));
                }
                "from" => {
                    return Err(ExecError::Syntax(
                        "from-imports are not supported; use 'import module'".into(),
                    ));
                }
                _ => {}
            }
        }
        let stmt = self.parse_simple_stmt()?;
        self.end_of_statement()?;
        Ok(stmt)
    }

    fn end_of_statement(&mut self) -> Result<(), ExecError> {
        match self.peek() {
            Tok::Newline => {
                self.pos += 1;
                Ok(())
            }
            Tok::Eof | Tok::Dedent => Ok(()),
            _ => Err(self.unexpected("expected end of statement")),
        }
    }

    fn parse_simple_stmt(&mut self) -> Result<Stmt, ExecError> {
        if self.eat_name("import") {
            let module = self.expect_name()?;
            let alias = if self.eat_name("as") {
                Some(self.expect_name()?)
            } else {
                None
            };
            return Ok(Stmt::Import { module, alias });
        }
        if self.eat_name("return") {
            let value = if matches!(self.peek(), Tok::Newline | Tok::Eof | Tok::Dedent) {
                None
            } else {
                Some(self.parse_expr()?)
            };
            return Ok(Stmt::Return(value));
        }
        if self.eat_name("break") {
            return Ok(Stmt::Break);
        }
        if self.eat_name("continue") {
            return Ok(Stmt::Continue);
        }
        if self.eat_name("pass") {
            return Ok(Stmt::Pass);
        }

        let expr = self.parse_expr()?;
        if self.eat_op("=") {
            let target = to_target(expr)?;
            let value = self.parse_expr()?;
            return Ok(Stmt::Assign { target, value });
        }
        for (tok, op) in [
            ("+=", AugOp::Add),
            ("-=", AugOp::Sub),
            ("*=", AugOp::Mul),
            ("/=", AugOp::Div),
        ] {
            if self.eat_op(tok) {
                let target = to_target(expr)?;
                let value = self.parse_expr()?;
                return Ok(Stmt::AugAssign { target, op, value });
            }
        }
        Ok(Stmt::Expr(expr))
    }

    fn parse_if(&mut self) -> Result<Stmt, ExecError> {
        self.pos += 1; // 'if'
        let mut branches = Vec::new();
        let cond = self.parse_expr()?;
        let body = self.parse_block()?;
        branches.push((cond, body));

        let mut else_body = Vec::new();
        loop {
            if self.eat_name("elif") {
                let cond = self.parse_expr()?;
                let body = self.parse_block()?;
                branches.push((cond, body));
            } else if self.eat_name("else") {
                else_body = self.parse_block()?;
                break;
            } else {
                break;
            }
        }
        Ok(Stmt::If {
            branches,
            else_body,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, ExecError> {
        self.pos += 1; // 'while'
        let cond = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(Stmt::While { cond, body })
    }

    fn parse_for(&mut self) -> Result<Stmt, ExecError> {
        self.pos += 1; // 'for'
        let mut vars = vec![self.checked_name()?];
        while self.eat_op(",") {
            vars.push(self.checked_name()?);
        }
        if !self.eat_name("in") {
            return Err(self.unexpected("expected 'in'"));
        }
        let iterable = self.parse_expr()?;
        let body = self.parse_block()?;
        Ok(Stmt::For {
            vars,
            iterable,
            body,
        })
    }

    fn parse_def(&mut self) -> Result<Stmt, ExecError> {
        self.pos += 1; // 'def'
        let name = self.checked_name()?;
        self.expect_op("(")?;
        let mut params = Vec::new();
        if !self.check_op(")") {
            loop {
                params.push(self.checked_name()?);
                if !self.eat_op(",") {
                    break;
                }
            }
        }
        self.expect_op(")")?;
        let body = self.parse_block()?;
        Ok(Stmt::Def(FunctionDef { name, params, body }))
    }

    /// `:` then either an indented suite or a single inline statement.
    fn parse_block(&mut self) -> Result<Vec<Stmt>, ExecError> {
        self.expect_op(":")?;
        if matches!(self.peek(), Tok::Newline) {
            self.pos += 1;
            if !matches!(self.peek(), Tok::Indent) {
                return Err(self.unexpected("expected an indented block"));
            }
            self.pos += 1;
            let mut stmts = Vec::new();
            loop {
                match self.peek() {
                    Tok::Dedent => {
                        self.pos += 1;
                        break;
                    }
                    Tok::Newline => {
                        self.pos += 1;
                    }
                    Tok::Eof => break,
                    _ => stmts.push(self.parse_stmt()?),
                }
            }
            if stmts.is_empty() {
                return Err(ExecError::Syntax("empty block".into()));
            }
            Ok(stmts)
        } else {
            let stmt = self.parse_simple_stmt()?;
            self.end_of_statement()?;
            Ok(vec![stmt])
        }
    }

    /// A name in binding position, screened against the blocklist.
    fn checked_name(&mut self) -> Result<String, ExecError> {
        let name = self.expect_name()?;
        screen_identifier(&name)?;
        Ok(name)
    }

    // --- Expressions ---

    fn parse_expr(&mut self) -> Result<Expr, ExecError> {
        let value = self.parse_or()?;
        if self.check_name("if") {
            // `a if cond else b` — but not the statement keyword position.
            self.pos += 1;
            let cond = self.parse_or()?;
            if !self.eat_name("else") {
                return Err(self.unexpected("expected 'else' in conditional expression"));
            }
            let other = self.parse_expr()?;
            return Ok(Expr::Conditional {
                cond: Box::new(cond),
                then: Box::new(value),
                other: Box::new(other),
            });
        }
        Ok(value)
    }

    fn parse_or(&mut self) -> Result<Expr, ExecError> {
        let mut left = self.parse_and()?;
        while self.eat_name("or") {
            let right = self.parse_and()?;
            left = Expr::Binary {
                op: BinOp::Or,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExecError> {
        let mut left = self.parse_not()?;
        while self.eat_name("and") {
            let right = self.parse_not()?;
            left = Expr::Binary {
                op: BinOp::And,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ExecError> {
        if self.eat_name("not") {
            let operand = self.parse_not()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand),
            });
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExecError> {
        let left = self.parse_arith()?;
        let op = if self.eat_op("==") {
            BinOp::Eq
        } else if self.eat_op("!=") {
            BinOp::Ne
        } else if self.eat_op("<=") {
            BinOp::Le
        } else if self.eat_op(">=") {
            BinOp::Ge
        } else if self.eat_op("<") {
            BinOp::Lt
        } else if self.eat_op(">") {
            BinOp::Gt
        } else if self.check_name("in") {
            self.pos += 1;
            BinOp::In
        } else if self.check_name("not") {
            // `not in`
            self.pos += 1;
            if !self.eat_name("in") {
                return Err(self.unexpected("expected 'in' after 'not'"));
            }
            BinOp::NotIn
        } else {
            return Ok(left);
        };
        let right = self.parse_arith()?;
        Ok(Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
    }

    fn parse_arith(&mut self) -> Result<Expr, ExecError> {
        let mut left = self.parse_term()?;
        loop {
            let op = if self.eat_op("+") {
                BinOp::Add
            } else if self.eat_op("-") {
                BinOp::Sub
            } else {
                break;
            };
            let right = self.parse_term()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ExecError> {
        let mut left = self.parse_factor()?;
        loop {
            let op = if self.eat_op("*") {
                BinOp::Mul
            } else if self.eat_op("//") {
                BinOp::FloorDiv
            } else if self.eat_op("/") {
                BinOp::Div
            } else if self.eat_op("%") {
                BinOp::Mod
            } else {
                break;
            };
            let right = self.parse_factor()?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_factor(&mut self) -> Result<Expr, ExecError> {
        if self.eat_op("-") {
            let operand = self.parse_factor()?;
            return Ok(Expr::Unary {
                op: UnaryOp::Neg,
                operand: Box::new(operand),
            });
        }
        self.parse_power()
    }

    fn parse_power(&mut self) -> Result<Expr, ExecError> {
        let base = self.parse_postfix()?;
        if self.eat_op("**") {
            let exponent = self.parse_factor()?;
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn parse_postfix(&mut self) -> Result<Expr, ExecError> {
        let mut expr = self.parse_atom()?;
        loop {
            if self.eat_op("(") {
                let mut args = Vec::new();
                if !self.check_op(")") {
                    loop {
                        let arg = self.parse_expr()?;
                        if self.check_op("=") {
                            return Err(ExecError::Syntax(
                                "keyword arguments are not supported".into(),
                            ));
                        }
                        args.push(arg);
                        if !self.eat_op(",") {
                            break;
                        }
                        if self.check_op(")") {
                            break;
                        }
                    }
                }
                self.expect_op(")")?;
                expr = Expr::Call {
                    func: Box::new(expr),
                    args,
                };
            } else if self.eat_op("[") {
                let start = if self.check_op(":") {
                    None
                } else {
                    Some(Box::new(self.parse_expr()?))
                };
                if self.eat_op(":") {
                    let stop = if self.check_op("]") {
                        None
                    } else {
                        Some(Box::new(self.parse_expr()?))
                    };
                    self.expect_op("]")?;
                    expr = Expr::Slice {
                        obj: Box::new(expr),
                        start,
                        stop,
                    };
                } else {
                    self.expect_op("]")?;
                    let index =
                        start.ok_or_else(|| ExecError::Syntax("empty subscript".into()))?;
                    expr = Expr::Index {
                        obj: Box::new(expr),
                        index,
                    };
                }
            } else if self.eat_op(".") {
                let name = self.expect_name()?;
                if name.starts_with('_') {
                    return Err(ExecError::Security {
                        module: None,
                        operation: Some(format!(".{name}")),
                    });
                }
                expr = Expr::Attr {
                    obj: Box::new(expr),
                    name,
                };
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_atom(&mut self) -> Result<Expr, ExecError> {
        match self.advance() {
            Tok::Int(n) => Ok(Expr::Int(n)),
            Tok::Float(x) => Ok(Expr::Float(x)),
            Tok::Str(s) => Ok(Expr::Str(s)),
            Tok::Name(name) => match name.as_str() {
                "True" => Ok(Expr::Bool(true)),
                "False" => Ok(Expr::Bool(false)),
                "None" => Ok(Expr::None),
                _ => {
                    screen_identifier(&name)?;
                    Ok(Expr::Name(name))
                }
            },
            Tok::Op("(") => {
                let expr = self.parse_expr()?;
                self.expect_op(")")?;
                Ok(expr)
            }
            Tok::Op("[") => self.parse_list_display(),
            Tok::Op("{") => self.parse_dict_display(),
            other => Err(ExecError::Syntax(format!(
                "unexpected token {other:?} in expression"
            ))),
        }
    }

    fn parse_list_display(&mut self) -> Result<Expr, ExecError> {
        if self.eat_op("]") {
            return Ok(Expr::List(Vec::new()));
        }
        let first = self.parse_expr()?;

        if self.eat_name("for") {
            let var = self.checked_name()?;
            if !self.eat_name("in") {
                return Err(self.unexpected("expected 'in' in comprehension"));
            }
            let iterable = self.parse_or()?;
            let cond = if self.eat_name("if") {
                Some(Box::new(self.parse_or()?))
            } else {
                None
            };
            self.expect_op("]")?;
            return Ok(Expr::ListComp {
                element: Box::new(first),
                var,
                iterable: Box::new(iterable),
                cond,
            });
        }

        let mut items = vec![first];
        while self.eat_op(",") {
            if self.check_op("]") {
                break;
            }
            items.push(self.parse_expr()?);
        }
        self.expect_op("]")?;
        Ok(Expr::List(items))
    }

    fn parse_dict_display(&mut self) -> Result<Expr, ExecError> {
        if self.eat_op("}") {
            return Ok(Expr::Dict(Vec::new()));
        }
        let mut pairs = Vec::new();
        loop {
            let key = self.parse_expr()?;
            self.expect_op(":")?;
            let value = self.parse_expr()?;
            pairs.push((key, value));
            if !self.eat_op(",") {
                break;
            }
            if self.check_op("}") {
                break;
            }
        }
        self.expect_op("}")?;
        Ok(Expr::Dict(pairs))
    }
}

fn to_target(expr: Expr) -> Result<Target, ExecError> {
    match expr {
        Expr::Name(name) => Ok(Target::Name(name)),
        Expr::Index { obj, index } => Ok(Target::Index { obj, index }),
        _ => Err(ExecError::Syntax("cannot assign to this expression".into())),
    }
}

fn screen_identifier(name: &str) -> Result<(), ExecError> {
    if super::BLOCKED_IDENTIFIERS.contains(&name) || name.starts_with("__") {
        return Err(ExecError::Security {
            module: None,
            operation: Some(name.to_string()),
        });
    }
    Ok(())
}
