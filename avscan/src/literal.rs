//! Restricted structural-literal parser
//!
//! Accepts Python and JSON literal syntax for mappings, lists, tuples, strings,
//! numbers, booleans and null, and produces a [`serde_json::Value`].
//! Identifiers other than the literal keywords (`True`, `False`, `None`,
//! `true`, `false`, `null`) are rejected, as are calls, operators, byte strings
//! and f-strings. Nothing in the input is ever evaluated.

use serde_json::{Map, Number, Value};
use thiserror::Error;

/// Deepest container nesting accepted
pub const MAX_DEPTH: usize = 128;

/// Literal parse errors (offsets are in characters)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LiteralError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("unexpected character {found:?} at offset {offset}")]
    Unexpected { found: char, offset: usize },

    #[error("unsupported token {token:?} at offset {offset}")]
    UnsupportedToken { token: String, offset: usize },

    #[error("invalid number {0:?}")]
    InvalidNumber(String),

    #[error("invalid escape sequence at offset {0}")]
    InvalidEscape(usize),

    #[error("unterminated string starting at offset {0}")]
    UnterminatedString(usize),

    #[error("unsupported mapping key at offset {0}")]
    UnsupportedKey(usize),

    #[error("trailing input at offset {0}")]
    TrailingInput(usize),

    #[error("nesting deeper than {0} levels")]
    TooDeep(usize),
}

/// Parse `text` as a single structural literal
pub fn parse_literal(text: &str) -> Result<Value, LiteralError> {
    let mut parser = Parser {
        chars: text.chars().collect(),
        pos: 0,
        depth: 0,
    };
    let value = parser.parse_value()?;
    parser.skip_ws();
    if parser.pos < parser.chars.len() {
        return Err(LiteralError::TrailingInput(parser.pos));
    }
    Ok(value)
}

struct Parser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, want: char) -> Result<(), LiteralError> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(found) => Err(LiteralError::Unexpected {
                found,
                offset: self.pos - 1,
            }),
            None => Err(LiteralError::UnexpectedEnd),
        }
    }

    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, LiteralError>,
    ) -> Result<T, LiteralError> {
        if self.depth >= MAX_DEPTH {
            return Err(LiteralError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn parse_value(&mut self) -> Result<Value, LiteralError> {
        self.skip_ws();
        let offset = self.pos;
        match self.peek() {
            None => Err(LiteralError::UnexpectedEnd),
            Some('{') => self.nested(Self::parse_mapping),
            Some('[') => self.nested(|p| p.parse_items('[', ']').map(|(items, _)| Value::Array(items))),
            Some('(') => self.nested(Self::parse_tuple),
            Some('\'' | '"') => self.parse_string(false).map(Value::String),
            Some(c) if c.is_ascii_digit() || matches!(c, '-' | '+' | '.') => self.parse_number(),
            Some(c) if c.is_alphabetic() || c == '_' => self.parse_word(),
            Some(found) => Err(LiteralError::Unexpected { found, offset }),
        }
    }

    fn parse_mapping(&mut self) -> Result<Value, LiteralError> {
        self.expect('{')?;
        let mut map = Map::new();
        loop {
            self.skip_ws();
            if self.peek() == Some('}') {
                self.pos += 1;
                break;
            }
            let key_offset = self.pos;
            let key = mapping_key(self.parse_value()?).ok_or(LiteralError::UnsupportedKey(key_offset))?;
            self.expect(':')?;
            let value = self.parse_value()?;
            map.insert(key, value);

            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some('}') => break,
                Some(found) => {
                    return Err(LiteralError::Unexpected {
                        found,
                        offset: self.pos - 1,
                    })
                }
                None => return Err(LiteralError::UnexpectedEnd),
            }
        }
        Ok(Value::Object(map))
    }

    /// Comma-separated items between `open` and `close`; also reports whether a comma was seen
    fn parse_items(&mut self, open: char, close: char) -> Result<(Vec<Value>, bool), LiteralError> {
        self.expect(open)?;
        let mut items = Vec::new();
        let mut saw_comma = false;
        loop {
            self.skip_ws();
            if self.peek() == Some(close) {
                self.pos += 1;
                break;
            }
            items.push(self.parse_value()?);

            self.skip_ws();
            match self.bump() {
                Some(',') => saw_comma = true,
                Some(c) if c == close => break,
                Some(found) => {
                    return Err(LiteralError::Unexpected {
                        found,
                        offset: self.pos - 1,
                    })
                }
                None => return Err(LiteralError::UnexpectedEnd),
            }
        }
        Ok((items, saw_comma))
    }

    fn parse_tuple(&mut self) -> Result<Value, LiteralError> {
        let (mut items, saw_comma) = self.parse_items('(', ')')?;
        // `(x)` is a parenthesized value, `(x,)` a one-element tuple
        if items.len() == 1 && !saw_comma {
            return Ok(items.remove(0));
        }
        Ok(Value::Array(items))
    }

    fn parse_word(&mut self) -> Result<Value, LiteralError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();

        if matches!(self.peek(), Some('\'' | '"')) {
            return match word.as_str() {
                "u" | "U" => self.parse_string(false).map(Value::String),
                "r" | "R" => self.parse_string(true).map(Value::String),
                // byte strings and f-strings
                _ => Err(LiteralError::UnsupportedToken {
                    token: word,
                    offset: start,
                }),
            };
        }

        match word.as_str() {
            "True" | "true" => Ok(Value::Bool(true)),
            "False" | "false" => Ok(Value::Bool(false)),
            "None" | "null" => Ok(Value::Null),
            _ => Err(LiteralError::UnsupportedToken {
                token: word,
                offset: start,
            }),
        }
    }

    fn parse_string(&mut self, raw: bool) -> Result<String, LiteralError> {
        let start = self.pos;
        let quote = self.bump().ok_or(LiteralError::UnexpectedEnd)?;
        let triple = self.peek() == Some(quote) && self.peek_at(1) == Some(quote);
        if triple {
            self.pos += 2;
        }

        let mut out = String::new();
        loop {
            let c = self.bump().ok_or(LiteralError::UnterminatedString(start))?;
            if c == quote {
                if !triple {
                    break;
                }
                if self.peek() == Some(quote) && self.peek_at(1) == Some(quote) {
                    self.pos += 2;
                    break;
                }
                out.push(c);
                continue;
            }
            match c {
                '\n' if !triple => return Err(LiteralError::UnterminatedString(start)),
                '\\' if raw => {
                    out.push('\\');
                    if let Some(next) = self.bump() {
                        out.push(next);
                    }
                }
                '\\' => self.parse_escape(&mut out)?,
                _ => out.push(c),
            }
        }
        Ok(out)
    }

    fn parse_escape(&mut self, out: &mut String) -> Result<(), LiteralError> {
        let offset = self.pos - 1;
        let c = self.bump().ok_or(LiteralError::UnexpectedEnd)?;
        match c {
            // line continuation
            '\n' => {}
            '\\' | '\'' | '"' | '/' => out.push(c),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'a' => out.push('\u{7}'),
            'v' => out.push('\u{b}'),
            '0' => out.push('\0'),
            'x' => {
                let code = self.hex_digits(2, offset)?;
                out.push(char::from_u32(code).ok_or(LiteralError::InvalidEscape(offset))?);
            }
            'u' => {
                let unit = self.hex_digits(4, offset)?;
                let decoded = self.utf16_unit(unit, offset)?;
                out.push(decoded);
            }
            'U' => {
                let code = self.hex_digits(8, offset)?;
                out.push(char::from_u32(code).ok_or(LiteralError::InvalidEscape(offset))?);
            }
            // unknown escapes are kept verbatim
            other => {
                out.push('\\');
                out.push(other);
            }
        }
        Ok(())
    }

    fn hex_digits(&mut self, count: usize, offset: usize) -> Result<u32, LiteralError> {
        let mut value = 0u32;
        for _ in 0..count {
            let digit = self
                .bump()
                .and_then(|c| c.to_digit(16))
                .ok_or(LiteralError::InvalidEscape(offset))?;
            value = value * 16 + digit;
        }
        Ok(value)
    }

    /// Decode a `\uXXXX` unit, joining a following low surrogate if present
    fn utf16_unit(&mut self, high: u32, offset: usize) -> Result<char, LiteralError> {
        if (0xD800..0xDC00).contains(&high) {
            if self.peek() == Some('\\') && self.peek_at(1) == Some('u') {
                let save = self.pos;
                self.pos += 2;
                let low = self.hex_digits(4, offset)?;
                if (0xDC00..0xE000).contains(&low) {
                    let combined = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                    return char::from_u32(combined).ok_or(LiteralError::InvalidEscape(offset));
                }
                self.pos = save;
            }
            return Ok(char::REPLACEMENT_CHARACTER);
        }
        Ok(char::from_u32(high).unwrap_or(char::REPLACEMENT_CHARACTER))
    }

    fn take_digits(&mut self, radix: u32, out: &mut String) {
        while let Some(c) = self.peek() {
            if c.is_digit(radix) {
                out.push(c);
            } else if c != '_' {
                break;
            }
            self.pos += 1;
        }
    }

    fn parse_number(&mut self) -> Result<Value, LiteralError> {
        let start = self.pos;
        let mut negative = false;
        if let Some(sign @ ('-' | '+')) = self.peek() {
            negative = sign == '-';
            self.pos += 1;
        }

        // 0x / 0o / 0b integers
        if self.peek() == Some('0') {
            let radix = match self.peek_at(1) {
                Some('x' | 'X') => Some(16),
                Some('o' | 'O') => Some(8),
                Some('b' | 'B') => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.pos += 2;
                let mut digits = String::new();
                self.take_digits(radix, &mut digits);
                self.reject_suffix(start)?;
                let magnitude = u64::from_str_radix(&digits, radix)
                    .map_err(|_| LiteralError::InvalidNumber(self.text_from(start)))?;
                return integer_value(negative, magnitude)
                    .ok_or_else(|| LiteralError::InvalidNumber(self.text_from(start)));
            }
        }

        let mut text = String::new();
        self.take_digits(10, &mut text);
        let mut is_float = false;
        if self.peek() == Some('.') {
            is_float = true;
            text.push('.');
            self.pos += 1;
            self.take_digits(10, &mut text);
        }
        if text.chars().any(|c| c.is_ascii_digit()) && matches!(self.peek(), Some('e' | 'E')) {
            is_float = true;
            text.push('e');
            self.pos += 1;
            if let Some(sign @ ('-' | '+')) = self.peek() {
                text.push(sign);
                self.pos += 1;
            }
            self.take_digits(10, &mut text);
        }
        self.reject_suffix(start)?;

        if !text.chars().any(|c| c.is_ascii_digit()) {
            return Err(LiteralError::InvalidNumber(self.text_from(start)));
        }

        if !is_float {
            if let Ok(magnitude) = text.parse::<u64>() {
                if let Some(value) = integer_value(negative, magnitude) {
                    return Ok(value);
                }
            }
        }

        // floats, and integers too large for 64 bits
        let magnitude: f64 = text
            .parse()
            .map_err(|_| LiteralError::InvalidNumber(self.text_from(start)))?;
        let value = if negative { -magnitude } else { magnitude };
        Number::from_f64(value)
            .map(Value::Number)
            .ok_or_else(|| LiteralError::InvalidNumber(self.text_from(start)))
    }

    /// Complex literals (`1j`) and glued identifiers (`1abc`) are not numbers
    fn reject_suffix(&mut self, start: usize) -> Result<(), LiteralError> {
        if matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
            while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_') {
                self.pos += 1;
            }
            return Err(LiteralError::UnsupportedToken {
                token: self.text_from(start),
                offset: start,
            });
        }
        Ok(())
    }

    fn text_from(&self, start: usize) -> String {
        self.chars[start..self.pos].iter().collect()
    }
}

fn integer_value(negative: bool, magnitude: u64) -> Option<Value> {
    if !negative {
        return Some(Value::Number(magnitude.into()));
    }
    let signed = -i128::from(magnitude);
    i64::try_from(signed).ok().map(|i| Value::Number(i.into()))
}

/// Mapping keys follow JSON encoding of scalar keys
fn mapping_key(key: Value) -> Option<String> {
    match key {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some("null".to_string()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_python_dict_repr() {
        let text = "{'stats': {'malicious': 3, 'harmless': 7}, 'results': {'E1': {'method': 'blacklist', 'result': None, 'flag': True}}}";
        assert_eq!(
            parse_literal(text).unwrap(),
            json!({
                "stats": {"malicious": 3, "harmless": 7},
                "results": {"E1": {"method": "blacklist", "result": null, "flag": true}}
            })
        );
    }

    #[test]
    fn test_json_text_accepted() {
        let text = r#"{"a": [1, 2.5, -3, true, false, null], "b": "x\"y"}"#;
        assert_eq!(
            parse_literal(text).unwrap(),
            json!({"a": [1, 2.5, -3, true, false, null], "b": "x\"y"})
        );
    }

    #[test]
    fn test_key_order_preserved() {
        let value = parse_literal("{'z': 1, 'a': 2, 'm': 3}").unwrap();
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_tuples_and_trailing_commas() {
        assert_eq!(parse_literal("(1, 'a')").unwrap(), json!([1, "a"]));
        assert_eq!(parse_literal("(1,)").unwrap(), json!([1]));
        assert_eq!(parse_literal("(1)").unwrap(), json!(1));
        assert_eq!(parse_literal("()").unwrap(), json!([]));
        assert_eq!(parse_literal("[1, 2,]").unwrap(), json!([1, 2]));
        assert_eq!(parse_literal("{'a': 1,}").unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(parse_literal(r"'it\'s\n'").unwrap(), json!("it's\n"));
        assert_eq!(parse_literal(r"'\x41\u00e9'").unwrap(), json!("Aé"));
        assert_eq!(parse_literal(r#""\ud83d\ude00""#).unwrap(), json!("😀"));
        assert_eq!(parse_literal(r"r'C:\temp'").unwrap(), json!(r"C:\temp"));
        assert_eq!(parse_literal("'''a'b'''").unwrap(), json!("a'b"));
        assert_eq!(parse_literal("''").unwrap(), json!(""));
    }

    #[test]
    fn test_numbers() {
        assert_eq!(parse_literal("0x1F").unwrap(), json!(31));
        assert_eq!(parse_literal("1_000").unwrap(), json!(1000));
        assert_eq!(parse_literal("-9223372036854775808").unwrap(), json!(i64::MIN));
        assert_eq!(parse_literal("1e3").unwrap(), json!(1000.0));
        assert_eq!(parse_literal(".5").unwrap(), json!(0.5));
        assert_eq!(parse_literal("18446744073709551616").unwrap(), json!(18446744073709551616.0));
    }

    #[test]
    fn test_non_string_keys_encoded_like_json() {
        assert_eq!(
            parse_literal("{1: 'a', True: 'b', None: 'c'}").unwrap(),
            json!({"1": "a", "true": "b", "null": "c"})
        );
        assert_eq!(parse_literal("{(1, 2): 'a'}"), Err(LiteralError::UnsupportedKey(1)));
    }

    #[test]
    fn test_executable_text_rejected() {
        assert!(matches!(
            parse_literal("__import__('os').system('rm -rf /')"),
            Err(LiteralError::UnsupportedToken { token, .. }) if token == "__import__"
        ));
        assert!(matches!(
            parse_literal("{'a': open('/etc/passwd').read()}"),
            Err(LiteralError::UnsupportedToken { token, .. }) if token == "open"
        ));
        assert!(matches!(
            parse_literal("f'{secret}'"),
            Err(LiteralError::UnsupportedToken { token, .. }) if token == "f"
        ));
        assert!(matches!(parse_literal("b'MZ'"), Err(LiteralError::UnsupportedToken { .. })));
        assert!(matches!(parse_literal("1 + 2"), Err(LiteralError::TrailingInput(2))));
        assert!(matches!(parse_literal("2j"), Err(LiteralError::UnsupportedToken { .. })));
        assert!(matches!(parse_literal("-Infinity"), Err(LiteralError::UnsupportedToken { .. })));
    }

    #[test]
    fn test_malformed_input_rejected() {
        assert_eq!(parse_literal(""), Err(LiteralError::UnexpectedEnd));
        assert_eq!(parse_literal("{'a': 1"), Err(LiteralError::UnexpectedEnd));
        assert_eq!(parse_literal("'abc"), Err(LiteralError::UnterminatedString(0)));
        assert!(matches!(parse_literal("{1, 2}"), Err(LiteralError::Unexpected { found: ',', .. })));
        assert!(matches!(parse_literal("[1 2]"), Err(LiteralError::Unexpected { found: '2', .. })));
        assert!(matches!(parse_literal("-"), Err(LiteralError::InvalidNumber(_))));
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}{}", "[".repeat(MAX_DEPTH + 1), "]".repeat(MAX_DEPTH + 1));
        assert_eq!(parse_literal(&deep), Err(LiteralError::TooDeep(MAX_DEPTH)));

        let ok = format!("{}{}", "[".repeat(MAX_DEPTH), "]".repeat(MAX_DEPTH));
        assert!(parse_literal(&ok).is_ok());
    }
}
