#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Arrow, // =>
    Dot,
    Comma,
    Colon,
    Question,
    QuestionQuestion,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqEq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    AndAnd,
    OrOr,
    Eof,
}

pub fn tokenize(src: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0usize;
    let mut tokens = Vec::new();

    while i < chars.len() {
        let c = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit()))
        {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let n: f64 = text
                .parse()
                .map_err(|_| format!("invalid number literal '{text}'"))?;
            tokens.push(Token::Number(n));
            continue;
        }

        if c == '\'' || c == '"' {
            let quote = c;
            i += 1;
            let mut s = String::new();
            let mut closed = false;
            while i < chars.len() {
                let ch = chars[i];
                if ch == '\\' && i + 1 < chars.len() {
                    let esc = chars[i + 1];
                    s.push(match esc {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                    i += 2;
                    continue;
                }
                if ch == quote {
                    closed = true;
                    i += 1;
                    break;
                }
                s.push(ch);
                i += 1;
            }
            if !closed {
                return Err("unterminated string literal".to_string());
            }
            tokens.push(Token::Str(s));
            continue;
        }

        if c.is_alphabetic() || c == '_' || c == '$' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
            {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            tokens.push(Token::Ident(text));
            continue;
        }

        macro_rules! two {
            ($next:expr, $tok2:expr, $tok1:expr) => {{
                if chars.get(i + 1) == Some(&$next) {
                    i += 2;
                    tokens.push($tok2);
                } else {
                    i += 1;
                    tokens.push($tok1);
                }
            }};
        }

        match c {
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '{' => {
                tokens.push(Token::LBrace);
                i += 1;
            }
            '}' => {
                tokens.push(Token::RBrace);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '?' => two!('?', Token::QuestionQuestion, Token::Question),
            '!' => two!('=', Token::NotEq, Token::Bang),
            '=' => {
                if chars.get(i + 1) == Some(&'>') {
                    i += 2;
                    tokens.push(Token::Arrow);
                } else if chars.get(i + 1) == Some(&'=') {
                    // accept both == and === as the same equality operator
                    i += 2;
                    if chars.get(i) == Some(&'=') {
                        i += 1;
                    }
                    tokens.push(Token::EqEq);
                } else {
                    return Err("bare '=' is not a valid operator (assignment is forbidden)".into());
                }
            }
            '<' => two!('=', Token::Lte, Token::Lt),
            '>' => two!('=', Token::Gte, Token::Gt),
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    i += 2;
                    tokens.push(Token::AndAnd);
                } else {
                    return Err("bitwise '&' is not supported".into());
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    i += 2;
                    tokens.push(Token::OrOr);
                } else {
                    return Err("bitwise '|' is not supported".into());
                }
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    tokens.push(Token::Eof);
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_simple_arithmetic() {
        let toks = tokenize("1 + 2").unwrap();
        assert_eq!(
            toks,
            vec![Token::Number(1.0), Token::Plus, Token::Number(2.0), Token::Eof]
        );
    }

    #[test]
    fn tokenizes_string_with_escape() {
        let toks = tokenize("'a\\'b'").unwrap();
        assert_eq!(toks, vec![Token::Str("a'b".into()), Token::Eof]);
    }

    #[test]
    fn rejects_bare_assignment() {
        assert!(tokenize("x = 1").is_err());
    }
}
