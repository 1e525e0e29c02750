use super::{
    Arg, AssignOp, BinaryOp, CompareOp, ExternDecl, Expr, FunctionDecl, Param, ParseError, Stmt,
    StructDecl, Test, TypeName,
};

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Int(i64),
    Float(f32),
    KwInt,
    KwFloat,
    KwPtr,
    Void,
    Struct,
    Extern,
    If,
    Else,
    While,
    Foreach,
    In,
    Return,
    Plus,
    Minus,
    Star,
    Slash,
    PlusEqual,
    MinusEqual,
    StarEqual,
    SlashEqual,
    Equal,
    EqualEqual,
    Bang,
    BangEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Ampersand,
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Semicolon,
    Dot,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    line: u32,
}

struct Lexer<'a> {
    chars: std::str::Chars<'a>,
    current: Option<char>,
    line: u32,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        let mut chars = source.chars();
        let current = chars.next();
        Self {
            chars,
            current,
            line: 1,
        }
    }

    fn tokenize(mut self) -> Result<Vec<Token>, ParseError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.kind == TokenKind::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    fn next_token(&mut self) -> Result<Token, ParseError> {
        self.skip_whitespace_and_comments()?;
        let line = self.line;
        let Some(ch) = self.current else {
            return Ok(Token {
                kind: TokenKind::Eof,
                line,
            });
        };

        if ch.is_ascii_digit() {
            let kind = self.consume_number()?;
            return Ok(Token { kind, line });
        }
        if is_ident_start(ch) {
            let ident = self.consume_ident();
            let kind = match ident.as_str() {
                "int" => TokenKind::KwInt,
                "float" => TokenKind::KwFloat,
                "ptr" => TokenKind::KwPtr,
                "void" => TokenKind::Void,
                "struct" => TokenKind::Struct,
                "extern" => TokenKind::Extern,
                "if" => TokenKind::If,
                "else" => TokenKind::Else,
                "while" => TokenKind::While,
                "foreach" => TokenKind::Foreach,
                "in" => TokenKind::In,
                "return" => TokenKind::Return,
                _ => TokenKind::Ident(ident),
            };
            return Ok(Token { kind, line });
        }

        self.advance();
        let followed_by_equal = self.current == Some('=');
        let with_equal = |plain: TokenKind, combined: TokenKind| {
            if followed_by_equal { combined } else { plain }
        };
        let kind = match ch {
            '+' => with_equal(TokenKind::Plus, TokenKind::PlusEqual),
            '-' => with_equal(TokenKind::Minus, TokenKind::MinusEqual),
            '*' => with_equal(TokenKind::Star, TokenKind::StarEqual),
            '/' => with_equal(TokenKind::Slash, TokenKind::SlashEqual),
            '=' => with_equal(TokenKind::Equal, TokenKind::EqualEqual),
            '!' => with_equal(TokenKind::Bang, TokenKind::BangEqual),
            '<' => with_equal(TokenKind::Less, TokenKind::LessEqual),
            '>' => with_equal(TokenKind::Greater, TokenKind::GreaterEqual),
            '&' => TokenKind::Ampersand,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            ',' => TokenKind::Comma,
            ';' => TokenKind::Semicolon,
            '.' => TokenKind::Dot,
            other => {
                return Err(ParseError {
                    line,
                    message: format!("unexpected character '{other}'"),
                });
            }
        };
        if followed_by_equal
            && matches!(ch, '+' | '-' | '*' | '/' | '=' | '!' | '<' | '>')
        {
            self.advance();
        }
        Ok(Token { kind, line })
    }

    fn advance(&mut self) {
        if self.current == Some('\n') {
            self.line += 1;
        }
        self.current = self.chars.next();
    }

    fn peek(&self) -> Option<char> {
        self.chars.clone().next()
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), ParseError> {
        loop {
            while matches!(self.current, Some(c) if c.is_whitespace()) {
                self.advance();
            }

            if self.current == Some('/') && self.peek() == Some('/') {
                while let Some(ch) = self.current {
                    self.advance();
                    if ch == '\n' {
                        break;
                    }
                }
                continue;
            }
            if self.current == Some('/') && self.peek() == Some('*') {
                let start_line = self.line;
                self.advance();
                self.advance();
                loop {
                    let Some(ch) = self.current else {
                        return Err(ParseError {
                            line: start_line,
                            message: "unterminated block comment".to_string(),
                        });
                    };
                    if ch == '*' && self.peek() == Some('/') {
                        self.advance();
                        self.advance();
                        break;
                    }
                    self.advance();
                }
                continue;
            }
            break;
        }
        Ok(())
    }

    fn consume_number(&mut self) -> Result<TokenKind, ParseError> {
        let line = self.line;
        let mut text = String::new();
        while let Some(ch) = self.current {
            if ch.is_ascii_digit() {
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        let is_float = self.current == Some('.') && matches!(self.peek(), Some(c) if c.is_ascii_digit());
        if !is_float {
            return text.parse::<i64>().map(TokenKind::Int).map_err(|_| ParseError {
                line,
                message: format!("invalid number '{text}'"),
            });
        }
        text.push('.');
        self.advance();
        while let Some(ch) = self.current {
            if ch.is_ascii_digit() {
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        text.parse::<f32>().map(TokenKind::Float).map_err(|_| ParseError {
            line,
            message: format!("invalid number '{text}'"),
        })
    }

    fn consume_ident(&mut self) -> String {
        let mut text = String::new();
        while let Some(ch) = self.current {
            if is_ident_continue(ch) {
                text.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        text
    }
}

fn is_ident_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_ident_continue(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

pub(super) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    pub(super) fn new(source: &str) -> Result<Self, ParseError> {
        let tokens = Lexer::new(source).tokenize()?;
        Ok(Self { tokens, pos: 0 })
    }

    pub(super) fn parse_program(&mut self) -> Result<Vec<Stmt>, ParseError> {
        let mut stmts = Vec::new();
        while !self.check(&TokenKind::Eof) {
            stmts.push(self.parse_item()?);
        }
        Ok(stmts)
    }

    fn parse_item(&mut self) -> Result<Stmt, ParseError> {
        match self.peek_kind() {
            TokenKind::Struct => self.parse_struct_decl(),
            TokenKind::Extern => self.parse_extern_decl(),
            TokenKind::Void => self.parse_function(),
            _ if self.starts_function() => self.parse_function(),
            _ => self.parse_stmt(),
        }
    }

    fn parse_stmt(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        match self.peek_kind() {
            TokenKind::Struct | TokenKind::Extern | TokenKind::Void => Err(ParseError {
                line,
                message: "declarations of structs, externs and functions must be top level"
                    .to_string(),
            }),
            _ if self.starts_function() => Err(ParseError {
                line,
                message: "functions must be declared at top level".to_string(),
            }),
            TokenKind::If => self.parse_if(),
            TokenKind::While => self.parse_while(),
            TokenKind::Foreach => self.parse_foreach(),
            TokenKind::Return => self.parse_return(),
            TokenKind::LBrace => {
                let body = self.parse_block()?;
                Ok(Stmt::Block(body))
            }
            TokenKind::KwInt | TokenKind::KwFloat | TokenKind::KwPtr => self.parse_var_decl(),
            TokenKind::Ident(_) => match self.peek_kind_at(1) {
                TokenKind::Ident(_) => self.parse_var_decl(),
                TokenKind::LParen => {
                    let name = self.expect_ident("expected function name")?;
                    let args = self.parse_call_args()?;
                    self.expect(&TokenKind::Semicolon, "expected ';' after call")?;
                    Ok(Stmt::Call { name, args, line })
                }
                _ => self.parse_assign(),
            },
            other => Err(ParseError {
                line,
                message: format!("unexpected {} at start of statement", describe(&other)),
            }),
        }
    }

    fn parse_struct_decl(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        self.expect(&TokenKind::Struct, "expected 'struct'")?;
        let name = self.expect_ident("expected struct name")?;
        self.expect(&TokenKind::LBrace, "expected '{' after struct name")?;
        let mut fields = Vec::new();
        while !self.match_kind(&TokenKind::RBrace) {
            let ty = self.parse_type()?;
            loop {
                let field = self.expect_ident("expected field name")?;
                fields.push(Param {
                    ty: ty.clone(),
                    name: field,
                });
                if !self.match_kind(&TokenKind::Comma) {
                    break;
                }
            }
            self.expect(&TokenKind::Semicolon, "expected ';' after struct field")?;
        }
        self.match_kind(&TokenKind::Semicolon);
        Ok(Stmt::Struct(StructDecl { name, fields, line }))
    }

    fn parse_extern_decl(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        self.expect(&TokenKind::Extern, "expected 'extern'")?;
        let ret = self.parse_return_type()?;
        let name = self.expect_ident("expected external function name")?;
        let params = self.parse_params()?;
        self.expect(&TokenKind::Semicolon, "expected ';' after extern declaration")?;
        Ok(Stmt::Extern(ExternDecl {
            name,
            ret,
            params,
            line,
        }))
    }

    fn parse_function(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        let ret = self.parse_return_type()?;
        let name = self.expect_ident("expected function name")?;
        let params = self.parse_params()?;
        let body = self.parse_block()?;
        Ok(Stmt::Function(FunctionDecl {
            name,
            ret,
            params,
            body,
            line,
        }))
    }

    fn parse_return_type(&mut self) -> Result<Option<TypeName>, ParseError> {
        if self.match_kind(&TokenKind::Void) {
            Ok(None)
        } else {
            self.parse_type().map(Some)
        }
    }

    fn parse_params(&mut self) -> Result<Vec<Param>, ParseError> {
        self.expect(&TokenKind::LParen, "expected '(' before parameters")?;
        let mut params = Vec::new();
        if self.match_kind(&TokenKind::RParen) {
            return Ok(params);
        }
        loop {
            let ty = self.parse_type()?;
            let name = self.expect_ident("expected parameter name")?;
            params.push(Param { ty, name });
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "expected ')' after parameters")?;
        Ok(params)
    }

    fn parse_type(&mut self) -> Result<TypeName, ParseError> {
        let line = self.current_line();
        let ty = match self.peek_kind() {
            TokenKind::KwInt => TypeName::Int,
            TokenKind::KwFloat => TypeName::Float,
            TokenKind::KwPtr => TypeName::Ptr,
            TokenKind::Ident(name) => TypeName::Struct(name),
            other => {
                return Err(ParseError {
                    line,
                    message: format!("expected a type, found {}", describe(&other)),
                });
            }
        };
        self.pos += 1;
        Ok(ty)
    }

    fn parse_var_decl(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        let ty = self.parse_type()?;
        let mut names = vec![self.expect_ident("expected variable name")?];
        while self.match_kind(&TokenKind::Comma) {
            names.push(self.expect_ident("expected variable name after ','")?);
        }
        let init = if self.match_kind(&TokenKind::Equal) {
            if names.len() > 1 {
                return Err(ParseError {
                    line,
                    message: "an initializer needs a single variable".to_string(),
                });
            }
            Some(self.parse_expr()?)
        } else {
            None
        };
        self.expect(&TokenKind::Semicolon, "expected ';' after declaration")?;
        Ok(Stmt::VarDecl {
            ty,
            names,
            init,
            line,
        })
    }

    fn parse_assign(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        let target = self.parse_path()?;
        let op = match self.peek_kind() {
            TokenKind::Equal => AssignOp::Set,
            TokenKind::PlusEqual => AssignOp::Add,
            TokenKind::MinusEqual => AssignOp::Sub,
            TokenKind::StarEqual => AssignOp::Mul,
            TokenKind::SlashEqual => AssignOp::Div,
            other => {
                return Err(ParseError {
                    line,
                    message: format!("expected assignment to '{target}', found {}", describe(&other)),
                });
            }
        };
        self.pos += 1;
        let value = self.parse_expr()?;
        self.expect(&TokenKind::Semicolon, "expected ';' after assignment")?;
        Ok(Stmt::Assign {
            target,
            op,
            value,
            line,
        })
    }

    fn parse_if(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        self.expect(&TokenKind::If, "expected 'if'")?;
        self.expect(&TokenKind::LParen, "expected '(' after 'if'")?;
        let test = self.parse_test()?;
        self.expect(&TokenKind::RParen, "expected ')' after condition")?;
        let then = Box::new(self.parse_stmt()?);
        let otherwise = if self.match_kind(&TokenKind::Else) {
            Some(Box::new(self.parse_stmt()?))
        } else {
            None
        };
        Ok(Stmt::If {
            test,
            then,
            otherwise,
            line,
        })
    }

    fn parse_while(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        self.expect(&TokenKind::While, "expected 'while'")?;
        self.expect(&TokenKind::LParen, "expected '(' after 'while'")?;
        let test = self.parse_test()?;
        self.expect(&TokenKind::RParen, "expected ')' after condition")?;
        let body = Box::new(self.parse_stmt()?);
        Ok(Stmt::While { test, body, line })
    }

    fn parse_foreach(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        self.expect(&TokenKind::Foreach, "expected 'foreach'")?;
        let var = self.expect_ident("expected loop variable")?;
        self.expect(&TokenKind::In, "expected 'in' after loop variable")?;
        self.expect(&TokenKind::LParen, "expected '(' before foreach list")?;
        let mut items = Vec::new();
        while !self.match_kind(&TokenKind::RParen) {
            items.push(self.parse_path()?);
            self.match_kind(&TokenKind::Comma);
        }
        let body = Box::new(self.parse_stmt()?);
        Ok(Stmt::Foreach {
            var,
            items,
            body,
            line,
        })
    }

    fn parse_return(&mut self) -> Result<Stmt, ParseError> {
        let line = self.current_line();
        self.expect(&TokenKind::Return, "expected 'return'")?;
        let value = if self.check(&TokenKind::Semicolon) {
            None
        } else {
            Some(self.parse_expr()?)
        };
        self.expect(&TokenKind::Semicolon, "expected ';' after return")?;
        Ok(Stmt::Return { value, line })
    }

    fn parse_block(&mut self) -> Result<Vec<Stmt>, ParseError> {
        self.expect(&TokenKind::LBrace, "expected '{'")?;
        let mut body = Vec::new();
        while !self.match_kind(&TokenKind::RBrace) {
            if self.check(&TokenKind::Eof) {
                return Err(ParseError {
                    line: self.current_line(),
                    message: "expected '}' before end of input".to_string(),
                });
            }
            body.push(self.parse_stmt()?);
        }
        Ok(body)
    }

    fn parse_test(&mut self) -> Result<Test, ParseError> {
        if self.match_kind(&TokenKind::Bang) {
            let inner = self.parse_test()?;
            return Ok(Test::Not(Box::new(inner)));
        }
        if self.check(&TokenKind::LParen) {
            let saved = self.pos;
            self.pos += 1;
            if let Ok(test) = self.parse_test()
                && self.match_kind(&TokenKind::RParen)
            {
                return Ok(test);
            }
            self.pos = saved;
        }

        let line = self.current_line();
        let lhs = self.parse_expr()?;
        let op = match self.peek_kind() {
            TokenKind::Less => CompareOp::Lt,
            TokenKind::Greater => CompareOp::Gt,
            TokenKind::LessEqual => CompareOp::Le,
            TokenKind::GreaterEqual => CompareOp::Ge,
            TokenKind::EqualEqual => CompareOp::Eq,
            TokenKind::BangEqual => CompareOp::Ne,
            other => {
                return Err(ParseError {
                    line,
                    message: format!("expected comparison operator, found {}", describe(&other)),
                });
            }
        };
        self.pos += 1;
        let rhs = self.parse_expr()?;
        Ok(Test::Compare(op, lhs, rhs))
    }

    fn parse_expr(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_term()?;
        loop {
            if self.match_kind(&TokenKind::Plus) {
                let rhs = self.parse_term()?;
                expr = Expr::Binary(BinaryOp::Add, Box::new(expr), Box::new(rhs));
            } else if self.match_kind(&TokenKind::Minus) {
                let rhs = self.parse_term()?;
                expr = Expr::Binary(BinaryOp::Sub, Box::new(expr), Box::new(rhs));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.parse_unary()?;
        loop {
            if self.match_kind(&TokenKind::Star) {
                let rhs = self.parse_unary()?;
                expr = Expr::Binary(BinaryOp::Mul, Box::new(expr), Box::new(rhs));
            } else if self.match_kind(&TokenKind::Slash) {
                let rhs = self.parse_unary()?;
                expr = Expr::Binary(BinaryOp::Div, Box::new(expr), Box::new(rhs));
            } else {
                break;
            }
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if !self.match_kind(&TokenKind::Minus) {
            return self.parse_primary();
        }
        let line = self.current_line();
        match self.peek_kind() {
            TokenKind::Int(value) => {
                self.pos += 1;
                int_literal(-value, line)
            }
            TokenKind::Float(value) => {
                self.pos += 1;
                Ok(Expr::Float(-value))
            }
            _ => {
                let inner = self.parse_unary()?;
                Ok(Expr::Neg(Box::new(inner)))
            }
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let line = self.current_line();
        match self.peek_kind() {
            TokenKind::Int(value) => {
                self.pos += 1;
                int_literal(value, line)
            }
            TokenKind::Float(value) => {
                self.pos += 1;
                Ok(Expr::Float(value))
            }
            TokenKind::LParen => {
                self.pos += 1;
                let expr = self.parse_expr()?;
                self.expect(&TokenKind::RParen, "expected ')' after expression")?;
                Ok(expr)
            }
            TokenKind::Ident(_) if self.peek_kind_at(1) == TokenKind::LParen => {
                let name = self.expect_ident("expected function name")?;
                let args = self.parse_call_args()?;
                Ok(Expr::Call(name, args))
            }
            TokenKind::Ident(_) => self.parse_path().map(Expr::Var),
            other => Err(ParseError {
                line,
                message: format!("expected expression, found {}", describe(&other)),
            }),
        }
    }

    fn parse_call_args(&mut self) -> Result<Vec<Arg>, ParseError> {
        self.expect(&TokenKind::LParen, "expected '(' before arguments")?;
        let mut args = Vec::new();
        if self.match_kind(&TokenKind::RParen) {
            return Ok(args);
        }
        loop {
            if self.match_kind(&TokenKind::Ampersand) {
                args.push(Arg::Ref(self.parse_path()?));
            } else {
                args.push(Arg::Value(self.parse_expr()?));
            }
            if !self.match_kind(&TokenKind::Comma) {
                break;
            }
        }
        self.expect(&TokenKind::RParen, "expected ')' after arguments")?;
        Ok(args)
    }

    fn parse_path(&mut self) -> Result<String, ParseError> {
        let mut path = self.expect_ident("expected variable name")?;
        while self.match_kind(&TokenKind::Dot) {
            let field = self.expect_ident("expected field name after '.'")?;
            path.push('.');
            path.push_str(&field);
        }
        Ok(path)
    }

    /// `type name (` at the current position.
    fn starts_function(&self) -> bool {
        let is_type = matches!(
            self.peek_kind(),
            TokenKind::KwInt | TokenKind::KwFloat | TokenKind::KwPtr | TokenKind::Ident(_)
        );
        is_type
            && matches!(self.peek_kind_at(1), TokenKind::Ident(_))
            && self.peek_kind_at(2) == TokenKind::LParen
    }

    fn expect(&mut self, kind: &TokenKind, message: &str) -> Result<(), ParseError> {
        if self.match_kind(kind) {
            Ok(())
        } else {
            Err(ParseError {
                line: self.current_line(),
                message: message.to_string(),
            })
        }
    }

    fn expect_ident(&mut self, message: &str) -> Result<String, ParseError> {
        if let TokenKind::Ident(name) = self.peek_kind() {
            self.pos += 1;
            Ok(name)
        } else {
            Err(ParseError {
                line: self.current_line(),
                message: message.to_string(),
            })
        }
    }

    fn match_kind(&mut self, kind: &TokenKind) -> bool {
        if self.check(kind) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn check(&self, kind: &TokenKind) -> bool {
        self.tokens
            .get(self.pos)
            .is_some_and(|token| std::mem::discriminant(&token.kind) == std::mem::discriminant(kind))
    }

    fn peek_kind(&self) -> TokenKind {
        self.peek_kind_at(0)
    }

    fn peek_kind_at(&self, ahead: usize) -> TokenKind {
        self.tokens
            .get(self.pos + ahead)
            .map_or(TokenKind::Eof, |token| token.kind.clone())
    }

    fn current_line(&self) -> u32 {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |token| token.line)
    }
}

fn int_literal(value: i64, line: u32) -> Result<Expr, ParseError> {
    i32::try_from(value).map(Expr::Int).map_err(|_| ParseError {
        line,
        message: format!("integer literal {value} does not fit in 32 bits"),
    })
}

fn describe(kind: &TokenKind) -> String {
    match kind {
        TokenKind::Ident(name) => format!("identifier '{name}'"),
        TokenKind::Int(value) => format!("integer {value}"),
        TokenKind::Float(value) => format!("float {value}"),
        TokenKind::Eof => "end of input".to_string(),
        other => format!("{other:?}"),
    }
}
