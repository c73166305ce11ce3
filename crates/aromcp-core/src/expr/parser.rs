use super::ast::{BinaryOp, Expr, UnaryOp};
use super::lexer::Token;

pub fn parse(tokens: &[Token]) -> Result<Expr, String> {
    let mut p = Parser { tokens, pos: 0 };
    let expr = p.parse_ternary()?;
    p.expect_eof()?;
    Ok(expr)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn expect_eof(&self) -> Result<(), String> {
        if matches!(self.peek(), Token::Eof) {
            Ok(())
        } else {
            Err(format!("unexpected trailing tokens near {:?}", self.peek()))
        }
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == tok {
            self.advance();
            true
        } else {
            false
        }
    }

    // ternary: nullish ('?' ternary ':' ternary)?
    fn parse_ternary(&mut self) -> Result<Expr, String> {
        let cond = self.parse_nullish()?;
        if self.eat(&Token::Question) {
            let then_branch = self.parse_ternary()?;
            if !self.eat(&Token::Colon) {
                return Err("expected ':' in ternary expression".to_string());
            }
            let else_branch = self.parse_ternary()?;
            Ok(Expr::Ternary(
                Box::new(cond),
                Box::new(then_branch),
                Box::new(else_branch),
            ))
        } else {
            Ok(cond)
        }
    }

    fn parse_nullish(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_or()?;
        while self.eat(&Token::QuestionQuestion) {
            let right = self.parse_or()?;
            left = Expr::Binary(Box::new(left), BinaryOp::Nullish, Box::new(right));
        }
        Ok(left)
    }

    fn parse_or(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_and()?;
        while self.eat(&Token::OrOr) {
            let right = self.parse_and()?;
            left = Expr::Binary(Box::new(left), BinaryOp::Or, Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_equality()?;
        while self.eat(&Token::AndAnd) {
            let right = self.parse_equality()?;
            left = Expr::Binary(Box::new(left), BinaryOp::And, Box::new(right));
        }
        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_relational()?;
        loop {
            let op = match self.peek() {
                Token::EqEq => BinaryOp::Eq,
                Token::NotEq => BinaryOp::NotEq,
                _ => break,
            };
            self.advance();
            let right = self.parse_relational()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_relational(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Token::Lt => BinaryOp::Lt,
                Token::Lte => BinaryOp::Lte,
                Token::Gt => BinaryOp::Gt,
                Token::Gte => BinaryOp::Gte,
                _ => break,
            };
            self.advance();
            let right = self.parse_additive()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let right = self.parse_multiplicative()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, String> {
        let mut left = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let right = self.parse_unary()?;
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, String> {
        match self.peek() {
            Token::Bang => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_unary()?)))
            }
            Token::Minus => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_unary()?)))
            }
            Token::Plus => {
                self.advance();
                Ok(Expr::Unary(UnaryOp::Pos, Box::new(self.parse_unary()?)))
            }
            Token::Ident(name) if name == "new" => {
                Err("the 'new' operator is forbidden".to_string())
            }
            _ => self.parse_postfix(),
        }
    }

    fn parse_postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let name = match self.advance() {
                        Token::Ident(n) => n,
                        other => return Err(format!("expected identifier after '.', got {other:?}")),
                    };
                    expr = match expr {
                        Expr::Path(mut segs) => {
                            segs.push(name);
                            Expr::Path(segs)
                        }
                        other => Expr::Member(Box::new(other), name),
                    };
                }
                Token::LBracket => {
                    self.advance();
                    let index = self.parse_ternary()?;
                    if !self.eat(&Token::RBracket) {
                        return Err("expected ']' to close index expression".to_string());
                    }
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                Token::LParen => {
                    self.advance();
                    let args = self.parse_args()?;
                    if !self.eat(&Token::RParen) {
                        return Err("expected ')' to close call arguments".to_string());
                    }
                    expr = Expr::Call(Box::new(expr), args);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, String> {
        let mut args = Vec::new();
        if matches!(self.peek(), Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.parse_arg_or_lambda()?);
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        Ok(args)
    }

    /// An argument may be a lambda (`x => expr` or `(x, y) => expr`) or any
    /// ordinary expression. Lambdas are only meaningful when passed to a
    /// whitelisted higher-order method; the evaluator enforces that.
    fn parse_arg_or_lambda(&mut self) -> Result<Expr, String> {
        // Single-identifier lambda: `ident =>`
        if let Token::Ident(name) = self.peek().clone() {
            if self.tokens.get(self.pos + 1) == Some(&Token::Arrow) {
                self.advance(); // ident
                self.advance(); // =>
                let body = self.parse_ternary()?;
                return Ok(Expr::Lambda(vec![name], Box::new(body)));
            }
        }

        // Parenthesized param list lambda: `(a, b) =>`
        if matches!(self.peek(), Token::LParen) {
            if let Some(params) = self.try_parse_lambda_params() {
                let body = self.parse_ternary()?;
                return Ok(Expr::Lambda(params, Box::new(body)));
            }
        }

        self.parse_ternary()
    }

    /// Attempt to consume `(ident, ident, ...) =>` from the current position.
    /// On success, advances past the arrow and returns the parameter names.
    /// On failure, leaves the cursor untouched.
    fn try_parse_lambda_params(&mut self) -> Option<Vec<String>> {
        let start = self.pos;
        if !matches!(self.peek(), Token::LParen) {
            return None;
        }
        self.advance();
        let mut params = Vec::new();
        if matches!(self.peek(), Token::RParen) {
            self.advance();
        } else {
            loop {
                match self.advance() {
                    Token::Ident(name) => params.push(name),
                    _ => {
                        self.pos = start;
                        return None;
                    }
                }
                if self.eat(&Token::Comma) {
                    continue;
                }
                break;
            }
            if !self.eat(&Token::RParen) {
                self.pos = start;
                return None;
            }
        }
        if !self.eat(&Token::Arrow) {
            self.pos = start;
            return None;
        }
        Some(params)
    }

    fn parse_primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Token::Number(n) => Ok(Expr::Number(n)),
            Token::Str(s) => Ok(Expr::Str(s)),
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Bool(true)),
                "false" => Ok(Expr::Bool(false)),
                "null" | "undefined" => Ok(Expr::Null),
                _ => Ok(Expr::Path(vec![name])),
            },
            Token::LParen => {
                let expr = self.parse_ternary()?;
                if !self.eat(&Token::RParen) {
                    return Err("expected ')' to close parenthesized expression".to_string());
                }
                Ok(expr)
            }
            Token::LBracket => {
                let mut items = Vec::new();
                if !matches!(self.peek(), Token::RBracket) {
                    loop {
                        items.push(self.parse_ternary()?);
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                if !self.eat(&Token::RBracket) {
                    return Err("expected ']' to close array literal".to_string());
                }
                Ok(Expr::Array(items))
            }
            Token::LBrace => {
                let mut fields = Vec::new();
                if !matches!(self.peek(), Token::RBrace) {
                    loop {
                        let key = match self.advance() {
                            Token::Ident(n) => n,
                            Token::Str(s) => s,
                            other => {
                                return Err(format!(
                                    "expected object key, got {other:?}"
                                ))
                            }
                        };
                        if !self.eat(&Token::Colon) {
                            return Err("expected ':' after object key".to_string());
                        }
                        let value = self.parse_ternary()?;
                        fields.push((key, value));
                        if !self.eat(&Token::Comma) {
                            break;
                        }
                    }
                }
                if !self.eat(&Token::RBrace) {
                    return Err("expected '}' to close object literal".to_string());
                }
                Ok(Expr::Object(fields))
            }
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::lexer::tokenize;

    fn parse_str(s: &str) -> Expr {
        parse(&tokenize(s).unwrap()).unwrap()
    }

    #[test]
    fn parses_path() {
        assert_eq!(
            parse_str("this.x.y"),
            Expr::Path(vec!["this".into(), "x".into(), "y".into()])
        );
    }

    #[test]
    fn parses_lambda_single_param() {
        let e = parse_str("x => x + 1");
        match e {
            Expr::Lambda(params, _) => assert_eq!(params, vec!["x".to_string()]),
            other => panic!("expected lambda, got {other:?}"),
        }
    }

    #[test]
    fn parses_call_with_lambda_arg() {
        let e = parse_str("this.items.filter(x => x > 1)");
        match e {
            Expr::Call(_, args) => assert_eq!(args.len(), 1),
            other => panic!("expected call, got {other:?}"),
        }
    }

    #[test]
    fn rejects_new_operator() {
        assert!(parse(&tokenize("new Foo()").unwrap()).is_err());
    }
}
