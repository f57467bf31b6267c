//! Script front end: parse with oxc, then lower the oxc tree into the
//! engine's own syntax tree

use super::ast::*;
use crate::convert::number_to_string;
use oxc_allocator::Allocator;
use oxc_ast::ast as js;
use oxc_parser::Parser;
use oxc_span::SourceType;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ParseError {
    pub message: String,
    pub pos: Pos,
}

type PResult<T> = Result<T, ParseError>;

/// Parse a whole script
pub fn parse_program(source: &str, origin: &str) -> PResult<Program> {
    let allocator = Allocator::default();
    let source_type = SourceType::default().with_script(true);
    let result = Parser::new(&allocator, source, source_type).parse();
    let lines = LineIndex::new(source);

    if let Some(error) = result.errors.first() {
        let offset = error
            .labels
            .as_ref()
            .and_then(|labels| labels.first())
            .map_or(0, |label| label.offset());
        return Err(ParseError {
            message: error.to_string(),
            pos: lines.pos(offset),
        });
    }

    let lower = Lower {
        lines,
        origin: origin.into(),
    };
    let program = &result.program;
    let mut body = lower.directives(&program.directives);
    for stmt in &program.body {
        body.push(lower.statement(stmt)?);
    }
    Ok(Program {
        origin: lower.origin,
        body,
    })
}

/// Byte offset to 1-based line and column
struct LineIndex<'s> {
    source: &'s str,
    starts: Vec<usize>,
}

impl<'s> LineIndex<'s> {
    fn new(source: &'s str) -> Self {
        let mut starts = vec![0];
        starts.extend(
            source
                .char_indices()
                .filter(|(_, c)| *c == '\n')
                .map(|(i, _)| i + 1),
        );
        Self { source, starts }
    }

    fn pos(&self, offset: usize) -> Pos {
        let offset = offset.min(self.source.len());
        let line = self.starts.partition_point(|start| *start <= offset).max(1);
        let start = self.starts[line - 1];
        let column = self
            .source
            .get(start..offset)
            .map_or(offset - start, |text| text.chars().count());
        Pos {
            line: line as u32,
            column: column as u32 + 1,
        }
    }
}

struct Lower<'s> {
    lines: LineIndex<'s>,
    origin: Arc<str>,
}

fn name(atom: &str) -> Arc<str> {
    Arc::from(atom)
}

impl Lower<'_> {
    fn at(&self, span: oxc_span::Span) -> Pos {
        self.lines.pos(span.start as usize)
    }

    fn unsupported(&self, what: &str, span: oxc_span::Span) -> ParseError {
        ParseError {
            message: format!("Unsupported syntax: {what}"),
            pos: self.at(span),
        }
    }

    /// A directive prologue is an ordinary string expression statement here
    fn directives(&self, directives: &[js::Directive<'_>]) -> Vec<Stmt> {
        directives
            .iter()
            .map(|directive| {
                Stmt::Expr(
                    Expr::Str(name(directive.expression.value.as_str())),
                    self.at(directive.span),
                )
            })
            .collect()
    }

    fn statements(&self, stmts: &[js::Statement<'_>]) -> PResult<Vec<Stmt>> {
        stmts.iter().map(|stmt| self.statement(stmt)).collect()
    }

    fn statement(&self, stmt: &js::Statement<'_>) -> PResult<Stmt> {
        use js::Statement as S;
        match stmt {
            S::ExpressionStatement(expr_stmt) => Ok(Stmt::Expr(
                self.expression(&expr_stmt.expression)?,
                self.at(expr_stmt.span),
            )),
            S::VariableDeclaration(decl) => self.declaration(decl),
            S::FunctionDeclaration(func) => Ok(Stmt::Function(self.function(func)?)),
            S::ReturnStatement(ret) => {
                let value = match &ret.argument {
                    Some(arg) => Some(self.expression(arg)?),
                    None => None,
                };
                Ok(Stmt::Return(value, self.at(ret.span)))
            }
            S::ThrowStatement(throw) => Ok(Stmt::Throw(
                self.expression(&throw.argument)?,
                self.at(throw.span),
            )),
            S::BlockStatement(block) => Ok(Stmt::Block(self.statements(&block.body)?)),
            S::IfStatement(if_stmt) => Ok(Stmt::If {
                cond: self.expression(&if_stmt.test)?,
                then: Box::new(self.statement(&if_stmt.consequent)?),
                otherwise: match &if_stmt.alternate {
                    Some(alt) => Some(Box::new(self.statement(alt)?)),
                    None => None,
                },
            }),
            S::WhileStatement(while_stmt) => Ok(Stmt::While {
                cond: self.expression(&while_stmt.test)?,
                body: Box::new(self.statement(&while_stmt.body)?),
            }),
            S::ForStatement(for_stmt) => self.for_statement(for_stmt),
            S::TryStatement(try_stmt) => self.try_statement(try_stmt),
            S::BreakStatement(brk) if brk.label.is_none() => Ok(Stmt::Break),
            S::ContinueStatement(cont) if cont.label.is_none() => Ok(Stmt::Continue),
            S::EmptyStatement(_) => Ok(Stmt::Empty),
            other => Err(self.unsupported("statement", oxc_span::GetSpan::span(other))),
        }
    }

    fn declaration(&self, decl: &js::VariableDeclaration<'_>) -> PResult<Stmt> {
        let kind = match decl.kind {
            js::VariableDeclarationKind::Var => DeclKind::Var,
            js::VariableDeclarationKind::Let => DeclKind::Let,
            js::VariableDeclarationKind::Const => DeclKind::Const,
            _ => return Err(self.unsupported("using declaration", decl.span)),
        };
        let mut decls = Vec::with_capacity(decl.declarations.len());
        for declarator in &decl.declarations {
            let js::BindingPattern::BindingIdentifier(ident) = &declarator.id else {
                return Err(self.unsupported("destructuring pattern", declarator.span));
            };
            let init = match &declarator.init {
                Some(init) => Some(self.expression(init)?),
                None => None,
            };
            decls.push((name(ident.name.as_str()), init));
        }
        Ok(Stmt::Decl {
            kind,
            decls,
            pos: self.at(decl.span),
        })
    }

    fn for_statement(&self, for_stmt: &js::ForStatement<'_>) -> PResult<Stmt> {
        let init = match &for_stmt.init {
            None => None,
            Some(js::ForStatementInit::VariableDeclaration(decl)) => {
                Some(Box::new(self.declaration(decl)?))
            }
            Some(init) => match init.as_expression() {
                Some(expr) => Some(Box::new(Stmt::Expr(
                    self.expression(expr)?,
                    self.at(for_stmt.span),
                ))),
                None => return Err(self.unsupported("for initializer", for_stmt.span)),
            },
        };
        let cond = match &for_stmt.test {
            Some(test) => Some(self.expression(test)?),
            None => None,
        };
        let update = match &for_stmt.update {
            Some(update) => Some(self.expression(update)?),
            None => None,
        };
        Ok(Stmt::For {
            init,
            cond,
            update,
            body: Box::new(self.statement(&for_stmt.body)?),
        })
    }

    fn try_statement(&self, try_stmt: &js::TryStatement<'_>) -> PResult<Stmt> {
        let block = self.statements(&try_stmt.block.body)?;
        let (param, handler) = match &try_stmt.handler {
            Some(clause) => {
                let param = match &clause.param {
                    Some(param) => match &param.pattern {
                        js::BindingPattern::BindingIdentifier(ident) => {
                            Some(name(ident.name.as_str()))
                        }
                        _ => return Err(self.unsupported("destructuring pattern", clause.span)),
                    },
                    None => None,
                };
                (param, Some(self.statements(&clause.body.body)?))
            }
            None => (None, None),
        };
        let finalizer = match &try_stmt.finalizer {
            Some(block) => Some(self.statements(&block.body)?),
            None => None,
        };
        Ok(Stmt::Try {
            block,
            param,
            handler,
            finalizer,
        })
    }

    fn params(&self, params: &js::FormalParameters<'_>) -> PResult<Vec<Arc<str>>> {
        if params.rest.is_some() {
            return Err(self.unsupported("rest parameter", params.span));
        }
        params
            .items
            .iter()
            .map(|param| match &param.pattern {
                js::BindingPattern::BindingIdentifier(ident) => Ok(name(ident.name.as_str())),
                _ => Err(self.unsupported("destructuring pattern", param.span)),
            })
            .collect()
    }

    fn function(&self, func: &js::Function<'_>) -> PResult<Arc<FunctionCode>> {
        if func.r#async || func.generator {
            return Err(self.unsupported("async or generator function", func.span));
        }
        let body = match &func.body {
            Some(body) => {
                let mut stmts = self.directives(&body.directives);
                stmts.extend(self.statements(&body.statements)?);
                stmts
            }
            None => Vec::new(),
        };
        Ok(Arc::new(FunctionCode {
            name: func.id.as_ref().map(|id| name(id.name.as_str())),
            params: self.params(&func.params)?,
            body,
            arrow: false,
            origin: self.origin.clone(),
            pos: self.at(func.span),
        }))
    }

    fn arrow(&self, arrow: &js::ArrowFunctionExpression<'_>) -> PResult<Arc<FunctionCode>> {
        if arrow.r#async {
            return Err(self.unsupported("async arrow function", arrow.span));
        }
        let body = if arrow.expression {
            match arrow.body.statements.first() {
                Some(js::Statement::ExpressionStatement(expr_stmt)) => vec![Stmt::Return(
                    Some(self.expression(&expr_stmt.expression)?),
                    self.at(expr_stmt.span),
                )],
                _ => Vec::new(),
            }
        } else {
            let mut stmts = self.directives(&arrow.body.directives);
            stmts.extend(self.statements(&arrow.body.statements)?);
            stmts
        };
        Ok(Arc::new(FunctionCode {
            name: None,
            params: self.params(&arrow.params)?,
            body,
            arrow: true,
            origin: self.origin.clone(),
            pos: self.at(arrow.span),
        }))
    }

    fn arguments(&self, args: &[js::Argument<'_>]) -> PResult<Vec<Expr>> {
        args.iter()
            .map(|arg| match arg {
                js::Argument::SpreadElement(spread) => {
                    Err(self.unsupported("spread argument", spread.span))
                }
                _ => self.expression(arg.to_expression()),
            })
            .collect()
    }

    fn expression(&self, expr: &js::Expression<'_>) -> PResult<Expr> {
        use js::Expression as E;
        let boxed = |expr: &js::Expression<'_>| self.expression(expr).map(Box::new);
        match expr {
            E::NumericLiteral(lit) => Ok(Expr::Number(lit.value)),
            E::StringLiteral(lit) => Ok(Expr::Str(name(lit.value.as_str()))),
            E::BooleanLiteral(lit) => Ok(Expr::Bool(lit.value)),
            E::NullLiteral(_) => Ok(Expr::Null),
            E::ThisExpression(_) => Ok(Expr::This),
            E::Identifier(ident) => Ok(Expr::Ident(name(ident.name.as_str()))),
            E::ParenthesizedExpression(paren) => self.expression(&paren.expression),
            E::TemplateLiteral(template) => self.template(template),
            E::ArrayExpression(array) => {
                let mut elements = Vec::with_capacity(array.elements.len());
                for element in &array.elements {
                    match element {
                        js::ArrayExpressionElement::SpreadElement(spread) => {
                            return Err(self.unsupported("array spread", spread.span));
                        }
                        js::ArrayExpressionElement::Elision(elision) => {
                            return Err(self.unsupported("array hole", elision.span));
                        }
                        _ => elements.push(self.expression(element.to_expression())?),
                    }
                }
                Ok(Expr::Array(elements))
            }
            E::ObjectExpression(object) => {
                let mut props = Vec::with_capacity(object.properties.len());
                for prop in &object.properties {
                    let js::ObjectPropertyKind::ObjectProperty(prop) = prop else {
                        return Err(self.unsupported("object spread", object.span));
                    };
                    if prop.kind != js::PropertyKind::Init {
                        return Err(self.unsupported("accessor property", prop.span));
                    }
                    let key = match &prop.key {
                        js::PropertyKey::StaticIdentifier(ident) => name(ident.name.as_str()),
                        js::PropertyKey::StringLiteral(lit) => name(lit.value.as_str()),
                        js::PropertyKey::NumericLiteral(lit) => number_to_string(lit.value).into(),
                        _ => return Err(self.unsupported("computed property key", prop.span)),
                    };
                    props.push((key, self.expression(&prop.value)?));
                }
                Ok(Expr::Object(props))
            }
            E::FunctionExpression(func) => Ok(Expr::Function(self.function(func)?)),
            E::ArrowFunctionExpression(arrow) => Ok(Expr::Function(self.arrow(arrow)?)),
            E::UnaryExpression(unary) => {
                let op = match unary.operator {
                    js::UnaryOperator::LogicalNot => UnaryOp::Not,
                    js::UnaryOperator::UnaryNegation => UnaryOp::Neg,
                    js::UnaryOperator::UnaryPlus => UnaryOp::Plus,
                    js::UnaryOperator::Typeof => UnaryOp::TypeOf,
                    js::UnaryOperator::Void => UnaryOp::Void,
                    _ => return Err(self.unsupported("unary operator", unary.span)),
                };
                Ok(Expr::Unary(op, boxed(&unary.argument)?))
            }
            E::UpdateExpression(update) => Ok(Expr::Update {
                increment: update.operator == js::UpdateOperator::Increment,
                prefix: update.prefix,
                target: Box::new(self.simple_target(&update.argument)?),
            }),
            E::BinaryExpression(binary) => {
                let op = match binary.operator {
                    js::BinaryOperator::Addition => BinaryOp::Add,
                    js::BinaryOperator::Subtraction => BinaryOp::Sub,
                    js::BinaryOperator::Multiplication => BinaryOp::Mul,
                    js::BinaryOperator::Division => BinaryOp::Div,
                    js::BinaryOperator::Remainder => BinaryOp::Rem,
                    js::BinaryOperator::LessThan => BinaryOp::Lt,
                    js::BinaryOperator::GreaterThan => BinaryOp::Gt,
                    js::BinaryOperator::LessEqualThan => BinaryOp::Le,
                    js::BinaryOperator::GreaterEqualThan => BinaryOp::Ge,
                    js::BinaryOperator::Equality => BinaryOp::Eq,
                    js::BinaryOperator::Inequality => BinaryOp::Ne,
                    js::BinaryOperator::StrictEquality => BinaryOp::StrictEq,
                    js::BinaryOperator::StrictInequality => BinaryOp::StrictNe,
                    _ => return Err(self.unsupported("binary operator", binary.span)),
                };
                Ok(Expr::Binary(op, boxed(&binary.left)?, boxed(&binary.right)?))
            }
            E::LogicalExpression(logical) => {
                let op = match logical.operator {
                    js::LogicalOperator::And => LogicalOp::And,
                    js::LogicalOperator::Or => LogicalOp::Or,
                    js::LogicalOperator::Coalesce => {
                        return Err(self.unsupported("nullish coalescing", logical.span));
                    }
                };
                Ok(Expr::Logical(op, boxed(&logical.left)?, boxed(&logical.right)?))
            }
            E::ConditionalExpression(cond) => Ok(Expr::Conditional(
                boxed(&cond.test)?,
                boxed(&cond.consequent)?,
                boxed(&cond.alternate)?,
            )),
            E::AssignmentExpression(assign) => {
                let op = match assign.operator {
                    js::AssignmentOperator::Assign => None,
                    js::AssignmentOperator::Addition => Some(BinaryOp::Add),
                    js::AssignmentOperator::Subtraction => Some(BinaryOp::Sub),
                    js::AssignmentOperator::Multiplication => Some(BinaryOp::Mul),
                    js::AssignmentOperator::Division => Some(BinaryOp::Div),
                    js::AssignmentOperator::Remainder => Some(BinaryOp::Rem),
                    _ => return Err(self.unsupported("assignment operator", assign.span)),
                };
                let target = match &assign.left {
                    js::AssignmentTarget::AssignmentTargetIdentifier(ident) => {
                        Expr::Ident(name(ident.name.as_str()))
                    }
                    js::AssignmentTarget::StaticMemberExpression(member) => {
                        Expr::Member(boxed(&member.object)?, name(member.property.name.as_str()))
                    }
                    js::AssignmentTarget::ComputedMemberExpression(member) => {
                        Expr::Index(boxed(&member.object)?, boxed(&member.expression)?)
                    }
                    _ => return Err(self.unsupported("assignment target", assign.span)),
                };
                Ok(Expr::Assign {
                    op,
                    target: Box::new(target),
                    value: boxed(&assign.right)?,
                })
            }
            E::StaticMemberExpression(member) if !member.optional => Ok(Expr::Member(
                boxed(&member.object)?,
                name(member.property.name.as_str()),
            )),
            E::ComputedMemberExpression(member) if !member.optional => Ok(Expr::Index(
                boxed(&member.object)?,
                boxed(&member.expression)?,
            )),
            E::CallExpression(call) if !call.optional => Ok(Expr::Call {
                callee: boxed(&call.callee)?,
                args: self.arguments(&call.arguments)?,
                pos: self.at(call.span),
            }),
            E::NewExpression(new) => Ok(Expr::New {
                callee: boxed(&new.callee)?,
                args: self.arguments(&new.arguments)?,
                pos: self.at(new.span),
            }),
            other => Err(self.unsupported("expression", oxc_span::GetSpan::span(other))),
        }
    }

    fn simple_target(&self, target: &js::SimpleAssignmentTarget<'_>) -> PResult<Expr> {
        match target {
            js::SimpleAssignmentTarget::AssignmentTargetIdentifier(ident) => {
                Ok(Expr::Ident(name(ident.name.as_str())))
            }
            js::SimpleAssignmentTarget::StaticMemberExpression(member) => Ok(Expr::Member(
                Box::new(self.expression(&member.object)?),
                name(member.property.name.as_str()),
            )),
            js::SimpleAssignmentTarget::ComputedMemberExpression(member) => Ok(Expr::Index(
                Box::new(self.expression(&member.object)?),
                Box::new(self.expression(&member.expression)?),
            )),
            other => Err(self.unsupported("update target", oxc_span::GetSpan::span(other))),
        }
    }

    /// Template literals become a left-to-right string concatenation
    fn template(&self, template: &js::TemplateLiteral<'_>) -> PResult<Expr> {
        let cooked = |index: usize| -> PResult<Expr> {
            let quasi = &template.quasis[index];
            match &quasi.value.cooked {
                Some(text) => Ok(Expr::Str(name(text.as_str()))),
                None => Err(self.unsupported("invalid escape in template", quasi.span)),
            }
        };
        let mut expr = cooked(0)?;
        for (index, part) in template.expressions.iter().enumerate() {
            let part = Expr::Binary(BinaryOp::Add, Box::new(expr), Box::new(self.expression(part)?));
            expr = Expr::Binary(BinaryOp::Add, Box::new(part), Box::new(cooked(index + 1)?));
        }
        Ok(expr)
    }
}
