use super::ExecError;

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Newline,
    Indent,
    Dedent,
    Name(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(&'static str),
    Eof,
}

const TWO_CHAR_OPS: &[&str] = &[
    "**", "//", "==", "!=", "<=", ">=", "+=", "-=", "*=", "/=",
];
const ONE_CHAR_OPS: &[&str] = &[
    "+", "-", "*", "/", "%", "=", "<", ">", "(", ")", "[", "]", "{", "}", ",", ":", ".",
];

/// Tokenize source into a flat stream with INDENT/DEDENT block markers.
///
/// Indentation uses spaces (a tab counts as four). Newlines inside
/// brackets are ignored, so bracketed expressions may span lines.
pub fn tokenize(source: &str) -> Result<Vec<Tok>, ExecError> {
    let mut tokens = Vec::new();
    let mut indents: Vec<usize> = vec![0];
    let mut bracket_depth: usize = 0;
    let chars: Vec<char> = source.chars().collect();
    let mut pos = 0;
    let mut line_no = 1;

    while pos < chars.len() {
        // At a physical line start outside brackets, handle indentation.
        if bracket_depth == 0 {
            let mut indent = 0;
            while pos < chars.len() && (chars[pos] == ' ' || chars[pos] == '\t') {
                indent += if chars[pos] == '\t' { 4 } else { 1 };
                pos += 1;
            }
            // Blank or comment-only lines do not affect indentation.
            if pos >= chars.len() {
                break;
            }
            if chars[pos] == '\n' || chars[pos] == '\r' {
                if chars[pos] == '\n' {
                    line_no += 1;
                }
                pos += 1;
                continue;
            }
            if chars[pos] == '#' {
                while pos < chars.len() && chars[pos] != '\n' {
                    pos += 1;
                }
                continue;
            }

            let current = *indents.last().expect("indent stack never empty");
            if indent > current {
                indents.push(indent);
                tokens.push(Tok::Indent);
            } else if indent < current {
                while indent < *indents.last().expect("indent stack never empty") {
                    indents.pop();
                    tokens.push(Tok::Dedent);
                }
                if indent != *indents.last().expect("indent stack never empty") {
                    return Err(ExecError::Syntax(format!(
                        "inconsistent indentation on line {line_no}"
                    )));
                }
            }
        }

        // Lex tokens until end of the logical line.
        loop {
            if pos >= chars.len() {
                break;
            }
            let c = chars[pos];
            match c {
                ' ' | '\t' => {
                    pos += 1;
                }
                '#' => {
                    while pos < chars.len() && chars[pos] != '\n' {
                        pos += 1;
                    }
                }
                '\n' => {
                    pos += 1;
                    line_no += 1;
                    if bracket_depth == 0 {
                        if !matches!(tokens.last(), None | Some(Tok::Newline) | Some(Tok::Indent)) {
                            tokens.push(Tok::Newline);
                        }
                        break;
                    }
                }
                '\r' => {
                    pos += 1;
                }
                '\'' | '"' => {
                    let (string, consumed) = lex_string(&chars[pos..], line_no)?;
                    tokens.push(Tok::Str(string));
                    pos += consumed;
                }
                '0'..='9' => {
                    let (tok, consumed) = lex_number(&chars[pos..], line_no)?;
                    tokens.push(tok);
                    pos += consumed;
                }
                c if c.is_alphabetic() || c == '_' => {
                    let start = pos;
                    while pos < chars.len()
                        && (chars[pos].is_alphanumeric() || chars[pos] == '_')
                    {
                        pos += 1;
                    }
                    tokens.push(Tok::Name(chars[start..pos].iter().collect()));
                }
                _ => {
                    if pos + 1 < chars.len() {
                        let pair: String = chars[pos..pos + 2].iter().collect();
                        if let Some(op) = TWO_CHAR_OPS.iter().find(|o| **o == pair) {
                            tokens.push(Tok::Op(op));
                            pos += 2;
                            continue;
                        }
                    }
                    let single = c.to_string();
                    if let Some(op) = ONE_CHAR_OPS.iter().find(|o| **o == single) {
                        match c {
                            '(' | '[' | '{' => bracket_depth += 1,
                            ')' | ']' | '}' => {
                                bracket_depth = bracket_depth.saturating_sub(1);
                            }
                            _ => {}
                        }
                        tokens.push(Tok::Op(op));
                        pos += 1;
                    } else {
                        return Err(ExecError::Syntax(format!(
                            "unexpected character '{c}' on line {line_no}"
                        )));
                    }
                }
            }
        }
    }

    if !matches!(tokens.last(), None | Some(Tok::Newline)) {
        tokens.push(Tok::Newline);
    }
    while indents.len() > 1 {
        indents.pop();
        tokens.push(Tok::Dedent);
    }
    tokens.push(Tok::Eof);
    Ok(tokens)
}

/// Lex a quoted string starting at `chars[0]`. Supports single, double,
/// and triple quotes with the usual escapes.
fn lex_string(chars: &[char], line_no: usize) -> Result<(String, usize), ExecError> {
    let quote = chars[0];
    let triple = chars.len() >= 3 && chars[1] == quote && chars[2] == quote;
    let (open_len, close_len) = if triple { (3, 3) } else { (1, 1) };

    let mut out = String::new();
    let mut pos = open_len;
    loop {
        if pos >= chars.len() {
            return Err(ExecError::Syntax(format!(
                "unterminated string starting on line {line_no}"
            )));
        }
        let c = chars[pos];
        if c == quote {
            if !triple {
                return Ok((out, pos + close_len));
            }
            if chars.len() >= pos + 3 && chars[pos + 1] == quote && chars[pos + 2] == quote {
                return Ok((out, pos + close_len));
            }
            out.push(c);
            pos += 1;
        } else if c == '\\' {
            pos += 1;
            let escaped = chars.get(pos).ok_or_else(|| {
                ExecError::Syntax(format!("unterminated escape on line {line_no}"))
            })?;
            out.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '\\' => '\\',
                '\'' => '\'',
                '"' => '"',
                '0' => '\0',
                other => *other,
            });
            pos += 1;
        } else if c == '\n' && !triple {
            return Err(ExecError::Syntax(format!(
                "unterminated string on line {line_no}"
            )));
        } else {
            out.push(c);
            pos += 1;
        }
    }
}

fn lex_number(chars: &[char], line_no: usize) -> Result<(Tok, usize), ExecError> {
    let mut pos = 0;
    while pos < chars.len() && chars[pos].is_ascii_digit() {
        pos += 1;
    }
    let mut is_float = false;
    if pos < chars.len()
        && chars[pos] == '.'
        && chars.get(pos + 1).is_some_and(|c| c.is_ascii_digit())
    {
        is_float = true;
        pos += 1;
        while pos < chars.len() && chars[pos].is_ascii_digit() {
            pos += 1;
        }
    }
    if pos < chars.len() && (chars[pos] == 'e' || chars[pos] == 'E') {
        let mut look = pos + 1;
        if look < chars.len() && (chars[look] == '+' || chars[look] == '-') {
            look += 1;
        }
        if look < chars.len() && chars[look].is_ascii_digit() {
            is_float = true;
            pos = look;
            while pos < chars.len() && chars[pos].is_ascii_digit() {
                pos += 1;
            }
        }
    }

    let text: String = chars[..pos].iter().collect();
    if is_float {
        let value: f64 = text
            .parse()
            .map_err(|_| ExecError::Syntax(format!("bad float literal on line {line_no}")))?;
        Ok((Tok::Float(value), pos))
    } else {
        let value: i64 = text
            .parse()
            .map_err(|_| ExecError::Syntax(format!("integer literal too large on line {line_no}")))?;
        Ok((Tok::Int(value), pos))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(tokens: &[Tok]) -> Vec<String> {
        tokens
            .iter()
            .filter_map(|t| match t {
                Tok::Name(n) => Some(n.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn simple_assignment() {
        let tokens = tokenize("x = 1 + 2\n").unwrap();
        assert_eq!(
            tokens,
            vec![
                Tok::Name("x".into()),
                Tok::Op("="),
                Tok::Int(1),
                Tok::Op("+"),
                Tok::Int(2),
                Tok::Newline,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn indentation_emits_indent_dedent() {
        let tokens = tokenize("if x:\n    y = 1\nz = 2\n").unwrap();
        assert!(tokens.contains(&Tok::Indent));
        assert!(tokens.contains(&Tok::Dedent));
        let indent_pos = tokens.iter().position(|t| *t == Tok::Indent).unwrap();
        let dedent_pos = tokens.iter().position(|t| *t == Tok::Dedent).unwrap();
        assert!(indent_pos < dedent_pos);
    }

    #[test]
    fn trailing_dedents_at_eof() {
        let tokens = tokenize("if x:\n    if y:\n        z = 1\n").unwrap();
        let dedents = tokens.iter().filter(|t| **t == Tok::Dedent).count();
        assert_eq!(dedents, 2);
    }

    #[test]
    fn newlines_inside_brackets_are_ignored() {
        let tokens = tokenize("xs = [1,\n      2,\n      3]\n").unwrap();
        let newlines = tokens.iter().filter(|t| **t == Tok::Newline).count();
        assert_eq!(newlines, 1);
        assert!(!tokens.contains(&Tok::Indent));
    }

    #[test]
    fn comments_and_blank_lines_skipped() {
        let tokens = tokenize("# a comment\n\nx = 1  # trailing\n").unwrap();
        assert_eq!(names(&tokens), vec!["x"]);
    }

    #[test]
    fn string_escapes() {
        let tokens = tokenize(r#"s = "a\nb""#).unwrap();
        assert!(tokens.contains(&Tok::Str("a\nb".into())));
    }

    #[test]
    fn triple_quoted_string_spans_lines() {
        let tokens = tokenize("s = \"\"\"one\ntwo\"\"\"\n").unwrap();
        assert!(tokens.contains(&Tok::Str("one\ntwo".into())));
    }

    #[test]
    fn numbers_int_float_exponent() {
        let tokens = tokenize("a = 42\nb = 3.25\nc = 1e3\n").unwrap();
        assert!(tokens.contains(&Tok::Int(42)));
        assert!(tokens.contains(&Tok::Float(3.25)));
        assert!(tokens.contains(&Tok::Float(1000.0)));
    }

    #[test]
    fn two_char_operators() {
        let tokens = tokenize("x **= 2\n").err();
        // **= is not an operator; ** then = is what gets lexed
        assert!(tokens.is_none());
        let tokens = tokenize("a // b ** c == d\n").unwrap();
        assert!(tokens.contains(&Tok::Op("//")));
        assert!(tokens.contains(&Tok::Op("**")));
        assert!(tokens.contains(&Tok::Op("==")));
    }

    #[test]
    fn unterminated_string_is_syntax_error() {
        let err = tokenize("s = 'oops\n").unwrap_err();
        assert!(matches!(err, ExecError::Syntax(_)));
    }

    #[test]
    fn inconsistent_dedent_is_syntax_error() {
        let err = tokenize("if x:\n    y = 1\n  z = 2\n").unwrap_err();
        assert!(matches!(err, ExecError::Syntax(_)));
    }

    #[test]
    fn unexpected_character_is_syntax_error() {
        let err = tokenize("x = 1 ; y = 2\n").unwrap_err();
        assert!(matches!(err, ExecError::Syntax(_)));
    }
}
