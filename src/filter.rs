//! Filter expression language for profile/channel routing (spec §4.6).
//!
//! Grounded in `examples/original_source/base/src/utils/profiles/filter.c`,
//! which parses the same grammar with a yacc/lex pair (spec §9 "Hand-rolled
//! YACC/LEX filter parser" re-architecture note: "a PEG/combinator parser
//! in the target language yields the same AST"). This is a small,
//! hand-written recursive-descent parser rather than pulling in a parser
//! combinator crate — the grammar is tiny and fixed, matching the spirit
//! of the original's also-fixed grammar.

use std::net::IpAddr;

use ipnet::{Contains, IpNet};
use regex::Regex;

use crate::decode::{Header, InputInfo};
use crate::ie::{ElementDictionary, IeRef};
use crate::record::RecordView;

/// The synthetic header fields a filter may reference besides IPFIX IEs
/// (spec §4.6 "synthetic header fields").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    Odid,
    SrcAddr,
    SrcPort,
    DstAddr,
    DstPort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldOperand {
    Header(HeaderField),
    Ie(IeRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
pub enum FilterValue {
    Number(i128),
    Ipv4(std::net::Ipv4Addr),
    Ipv6(std::net::Ipv6Addr),
    Prefix(IpNet),
    Timestamp(u64),
    Str(String),
    Regex(Regex),
}

/// Filter expression AST (spec §4.6).
#[derive(Debug, Clone)]
pub enum FilterExpr {
    And(Box<FilterExpr>, Box<FilterExpr>),
    Or(Box<FilterExpr>, Box<FilterExpr>),
    Not(Box<FilterExpr>),
    Exists(FieldOperand),
    Compare { field: FieldOperand, op: CompareOp, value: FilterValue },
    Contains { field: FieldOperand, needle: String },
    Matches { field: FieldOperand, pattern: Regex },
    InPrefix { field: FieldOperand, prefix: IpNet },
}

/// Context a filter is evaluated against: one decoded record plus the
/// message-level data a synthetic header field draws from (spec §4.6).
pub struct EvalContext<'a> {
    pub record: RecordView<'a>,
    pub header: &'a Header,
    pub input_info: &'a InputInfo,
    pub dict: &'a dyn ElementDictionary,
}

impl FilterExpr {
    pub fn eval(&self, ctx: &EvalContext) -> bool {
        match self {
            FilterExpr::And(a, b) => a.eval(ctx) && b.eval(ctx),
            FilterExpr::Or(a, b) => a.eval(ctx) || b.eval(ctx),
            FilterExpr::Not(inner) => !inner.eval(ctx),
            FilterExpr::Exists(field) => field_bytes(ctx, *field).is_some() || header_present(ctx, *field),
            FilterExpr::Compare { field, op, value } => eval_compare(ctx, *field, *op, value),
            FilterExpr::Contains { field, needle } => field_as_string(ctx, *field).map(|s| s.contains(needle.as_str())).unwrap_or(false),
            FilterExpr::Matches { field, pattern } => field_as_string(ctx, *field).map(|s| pattern.is_match(&s)).unwrap_or(false),
            FilterExpr::InPrefix { field, prefix } => field_as_ip(ctx, *field).map(|ip| prefix.contains(&ip)).unwrap_or(false),
        }
    }
}

fn header_present(_ctx: &EvalContext, field: FieldOperand) -> bool {
    matches!(field, FieldOperand::Header(_))
}

fn field_bytes<'a>(ctx: &EvalContext<'a>, field: FieldOperand) -> Option<&'a [u8]> {
    match field {
        FieldOperand::Header(_) => None,
        FieldOperand::Ie(ie) => ctx.record.field(ie),
    }
}

fn field_as_number(ctx: &EvalContext, field: FieldOperand) -> Option<i128> {
    match field {
        FieldOperand::Header(HeaderField::Odid) => Some(ctx.header.observation_domain_id as i128),
        FieldOperand::Header(HeaderField::SrcPort) => Some(ctx.input_info.source_port as i128),
        FieldOperand::Header(HeaderField::DstPort) => Some(ctx.input_info.dest_port as i128),
        FieldOperand::Header(HeaderField::SrcAddr) | FieldOperand::Header(HeaderField::DstAddr) => None,
        FieldOperand::Ie(ie) => {
            let bytes = ctx.record.field(ie)?;
            Some(bytes_to_uint(bytes))
        }
    }
}

fn bytes_to_uint(bytes: &[u8]) -> i128 {
    let mut acc: i128 = 0;
    for &b in bytes {
        acc = (acc << 8) | b as i128;
    }
    acc
}

fn field_as_ip(ctx: &EvalContext, field: FieldOperand) -> Option<IpAddr> {
    match field {
        FieldOperand::Header(HeaderField::SrcAddr) => Some(ctx.input_info.source_addr),
        FieldOperand::Header(HeaderField::DstAddr) => Some(ctx.input_info.dest_addr),
        FieldOperand::Header(_) => None,
        FieldOperand::Ie(ie) => {
            let bytes = ctx.record.field(ie)?;
            match bytes.len() {
                4 => Some(IpAddr::from(<[u8; 4]>::try_from(bytes).ok()?)),
                16 => Some(IpAddr::from(<[u8; 16]>::try_from(bytes).ok()?)),
                _ => None,
            }
        }
    }
}

fn field_as_string(ctx: &EvalContext, field: FieldOperand) -> Option<String> {
    let bytes = field_bytes(ctx, field)?;
    Some(String::from_utf8_lossy(bytes).into_owned())
}

fn eval_compare(ctx: &EvalContext, field: FieldOperand, op: CompareOp, value: &FilterValue) -> bool {
    let missing_result = op == CompareOp::Ne;

    match value {
        FilterValue::Number(n) => match field_as_number(ctx, field) {
            None => missing_result,
            Some(actual) => apply_op(op, actual, *n),
        },
        FilterValue::Timestamp(ts) => match field_as_number(ctx, field) {
            None => missing_result,
            Some(actual) => apply_op(op, actual, *ts as i128),
        },
        FilterValue::Ipv4(addr) => match field_as_ip(ctx, field) {
            None => missing_result,
            Some(IpAddr::V4(a)) => apply_op_eq_only(op, a == *addr),
            Some(IpAddr::V6(_)) => false,
        },
        FilterValue::Ipv6(addr) => match field_as_ip(ctx, field) {
            None => missing_result,
            Some(IpAddr::V6(a)) => apply_op_eq_only(op, a == *addr),
            Some(IpAddr::V4(_)) => false,
        },
        FilterValue::Prefix(net) => match field_as_ip(ctx, field) {
            None => missing_result,
            Some(ip) => apply_op_eq_only(op, net.contains(&ip)),
        },
        FilterValue::Str(s) => match field_as_string(ctx, field) {
            None => missing_result,
            Some(actual) => apply_op_eq_only(op, &actual == s),
        },
        FilterValue::Regex(re) => match field_as_string(ctx, field) {
            None => missing_result,
            Some(actual) => apply_op_eq_only(op, re.is_match(&actual)),
        },
    }
}

fn apply_op(op: CompareOp, actual: i128, expected: i128) -> bool {
    match op {
        CompareOp::Eq => actual == expected,
        CompareOp::Ne => actual != expected,
        CompareOp::Lt => actual < expected,
        CompareOp::Le => actual <= expected,
        CompareOp::Gt => actual > expected,
        CompareOp::Ge => actual >= expected,
    }
}

fn apply_op_eq_only(op: CompareOp, matched: bool) -> bool {
    match op {
        CompareOp::Eq => matched,
        CompareOp::Ne => !matched,
        _ => false,
    }
}

// ---------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseError<'a> {
    pub message: &'a str,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    And,
    Or,
    Not,
    Exists,
    In,
    LParen,
    RParen,
    Op(CompareOp),
    Tilde,
    Ident(String),
    Str(String),
    Number(String),
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    let mut out = Vec::new();

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '(' => {
                out.push(Token::LParen);
                i += 1;
            }
            ')' => {
                out.push(Token::RParen);
                i += 1;
            }
            '~' => {
                out.push(Token::Tilde);
                i += 1;
            }
            '=' => {
                i += 1;
                if chars.get(i) == Some(&'=') {
                    i += 1;
                }
                out.push(Token::Op(CompareOp::Eq));
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                i += 2;
                out.push(Token::Op(CompareOp::Ne));
            }
            '<' => {
                i += 1;
                if chars.get(i) == Some(&'=') {
                    i += 1;
                    out.push(Token::Op(CompareOp::Le));
                } else {
                    out.push(Token::Op(CompareOp::Lt));
                }
            }
            '>' => {
                i += 1;
                if chars.get(i) == Some(&'=') {
                    i += 1;
                    out.push(Token::Op(CompareOp::Ge));
                } else {
                    out.push(Token::Op(CompareOp::Gt));
                }
            }
            '"' => {
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != '"' {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(format!("unterminated string at {}", start));
                }
                out.push(Token::Str(chars[start..j].iter().collect()));
                i = j + 1;
            }
            _ if c.is_alphanumeric() || c == '_' || c == ':' || c == '.' || c == '/' || c == '-' => {
                let start = i;
                while i < chars.len() && {
                    let c = chars[i];
                    c.is_alphanumeric() || c == '_' || c == ':' || c == '.' || c == '/' || c == '-'
                } {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                out.push(classify_word(word));
            }
            other => return Err(format!("unexpected character '{}' at {}", other, i)),
        }
    }

    Ok(out)
}

fn classify_word(word: String) -> Token {
    match word.to_ascii_uppercase().as_str() {
        "AND" => Token::And,
        "OR" => Token::Or,
        "NOT" => Token::Not,
        "EXISTS" => Token::Exists,
        "IN" => Token::In,
        _ => {
            if word.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) || word.starts_with('-') {
                Token::Number(word)
            } else {
                Token::Ident(word)
            }
        }
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    dict: &'static dyn ElementDictionary,
}

/// Parses a filter expression (spec §4.6 grammar) against a dictionary used
/// to resolve bare IE names. `dict` must outlive the parse call; callers
/// typically hold a `'static` reference to their loaded dictionary (the
/// profile tree is itself long-lived for the process, spec §6.5).
pub fn parse(input: &str, dict: &'static dyn ElementDictionary) -> Result<FilterExpr, String> {
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0, dict };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(format!("trailing tokens at {}", parser.pos));
    }
    Ok(expr)
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn parse_or(&mut self) -> Result<FilterExpr, String> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = FilterExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<FilterExpr, String> {
        let mut left = self.parse_unary()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_unary()?;
            left = FilterExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<FilterExpr, String> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            return Ok(FilterExpr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<FilterExpr, String> {
        match self.peek() {
            Some(Token::LParen) => {
                self.advance();
                let inner = self.parse_or()?;
                if self.advance() != Some(Token::RParen) {
                    return Err("expected ')'".to_string());
                }
                Ok(inner)
            }
            Some(Token::Exists) => {
                self.advance();
                let field = self.parse_field()?;
                Ok(FilterExpr::Exists(field))
            }
            _ => {
                let field = self.parse_field()?;
                self.parse_predicate(field)
            }
        }
    }

    fn parse_field(&mut self) -> Result<FieldOperand, String> {
        match self.advance() {
            Some(Token::Ident(name)) => Ok(resolve_field(&name, self.dict)),
            other => Err(format!("expected field name, got {:?}", other)),
        }
    }

    fn parse_predicate(&mut self, field: FieldOperand) -> Result<FilterExpr, String> {
        match self.peek() {
            Some(Token::Op(op)) => {
                let op = *op;
                self.advance();
                let value = self.parse_value()?;
                Ok(FilterExpr::Compare { field, op, value })
            }
            Some(Token::Tilde) => {
                self.advance();
                let value = self.parse_value()?;
                match value {
                    FilterValue::Str(s) => {
                        let re = Regex::new(&s).map_err(|e| e.to_string())?;
                        Ok(FilterExpr::Matches { field, pattern: re })
                    }
                    _ => Err("regex operand must be a string".to_string()),
                }
            }
            Some(Token::In) => {
                self.advance();
                match self.advance() {
                    Some(Token::Ident(s)) | Some(Token::Str(s)) => {
                        let prefix: IpNet = s.parse().map_err(|_| format!("invalid prefix '{}'", s))?;
                        Ok(FilterExpr::InPrefix { field, prefix })
                    }
                    other => Err(format!("expected prefix literal, got {:?}", other)),
                }
            }
            // No operator: implicit substring match for strings (spec §4.6,
            // grounded in `filter_new_leaf_node_opless`'s "no operator
            // means substring" rule), implicit equality otherwise.
            _ => {
                let value = self.parse_value()?;
                match value {
                    FilterValue::Str(s) => Ok(FilterExpr::Contains { field, needle: s }),
                    other => Ok(FilterExpr::Compare { field, op: CompareOp::Eq, value: other }),
                }
            }
        }
    }

    fn parse_value(&mut self) -> Result<FilterValue, String> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(FilterValue::Str(s)),
            Some(Token::Number(word)) => Ok(parse_number_literal(&word)),
            Some(Token::Ident(word)) => Ok(parse_number_literal(&word)),
            other => Err(format!("expected value, got {:?}", other)),
        }
    }
}

fn parse_number_literal(word: &str) -> FilterValue {
    if let Some(hex) = word.strip_prefix("0x").or_else(|| word.strip_prefix("0X")) {
        if let Ok(n) = i128::from_str_radix(hex, 16) {
            return FilterValue::Number(n);
        }
    }
    if let Some(last) = word.chars().last() {
        if "smun".contains(last) {
            let suffix = &word[..word.len() - last.len_utf8()];
            if let Ok(n) = suffix.parse::<u64>() {
                let multiplier = match last {
                    's' => 1,
                    'm' => 1_000,
                    'u' => 1_000_000,
                    'n' => 1_000_000_000,
                    _ => unreachable!(),
                };
                return FilterValue::Timestamp(n.saturating_mul(multiplier));
            }
        }
    }
    if let Ok(ipv4) = word.parse::<std::net::Ipv4Addr>() {
        return FilterValue::Ipv4(ipv4);
    }
    if let Ok(ipv6) = word.parse::<std::net::Ipv6Addr>() {
        return FilterValue::Ipv6(ipv6);
    }
    if let Ok(net) = word.parse::<IpNet>() {
        return FilterValue::Prefix(net);
    }
    if let Ok(n) = word.parse::<i128>() {
        return FilterValue::Number(n);
    }
    FilterValue::Str(word.to_string())
}

fn resolve_field(name: &str, dict: &'static dyn ElementDictionary) -> FieldOperand {
    match name.to_ascii_uppercase().as_str() {
        "ODID" => return FieldOperand::Header(HeaderField::Odid),
        "SRCADDR" => return FieldOperand::Header(HeaderField::SrcAddr),
        "SRCPORT" => return FieldOperand::Header(HeaderField::SrcPort),
        "DSTADDR" => return FieldOperand::Header(HeaderField::DstAddr),
        "DSTPORT" => return FieldOperand::Header(HeaderField::DstPort),
        _ => {}
    }
    if let Some((ent, rest)) = name.split_once(':') {
        if let (Ok(ent), Ok(id)) = (ent.parse::<u32>(), rest.parse::<u16>()) {
            return FieldOperand::Ie(IeRef::new(ent, id));
        }
    }
    let lookup = dict.by_name(name, false);
    match lookup.first {
        Some(def) => FieldOperand::Ie(def.ie),
        None => FieldOperand::Ie(IeRef::standard(0)), // unresolvable name: never matches a real field
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ie::BuiltinDictionary;
    use crate::template::TemplateStore;
    use hex_literal::hex;
    use std::net::Ipv4Addr;
    use std::sync::OnceLock;

    fn dict() -> &'static dyn ElementDictionary {
        static DICT: OnceLock<BuiltinDictionary> = OnceLock::new();
        DICT.get_or_init(BuiltinDictionary::new)
    }

    fn header() -> Header {
        Header {
            version: 10,
            length: 0,
            export_time: 0,
            sequence_number: 0,
            observation_domain_id: 7,
        }
    }

    fn input_info() -> InputInfo {
        InputInfo {
            transport: crate::decode::Transport::Udp,
            source_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            source_port: 443,
            dest_addr: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            dest_port: 12345,
            template_life_time: None,
            options_template_life_time: None,
            template_life_packet: None,
            options_template_life_packet: None,
        }
    }

    #[test]
    fn parses_and_evaluates_port_equality() {
        let expr = parse("SRCPORT = 443", dict()).unwrap();
        let store = TemplateStore::new();
        let (tpl, _, _) = store.add(1, 7, &hex!("012c 0001 0007 0002"), false).unwrap();
        let data = hex!("01bb"); // 443
        let record = crate::record::records_in_set(&data, &tpl).next().unwrap();
        let header = header();
        let info = input_info();
        let ctx = EvalContext {
            record,
            header: &header,
            input_info: &info,
            dict: dict(),
        };
        assert!(expr.eval(&ctx));
    }

    #[test]
    fn missing_field_is_false_except_under_not_equal() {
        let eq = parse("SourceIPv4Address = 10.0.0.1", dict()).unwrap();
        let ne = parse("SourceIPv4Address != 10.0.0.1", dict()).unwrap();

        let store = TemplateStore::new();
        let (tpl, _, _) = store.add(1, 7, &hex!("012c 0001 0004 0001"), false).unwrap(); // unrelated field
        let data = hex!("06");
        let record = crate::record::records_in_set(&data, &tpl).next().unwrap();
        let header = header();
        let info = input_info();
        let ctx = EvalContext {
            record,
            header: &header,
            input_info: &info,
            dict: dict(),
        };

        assert!(!eq.eval(&ctx));
        assert!(ne.eval(&ctx));
    }

    #[test]
    fn cidr_membership() {
        let expr = parse("SourceIPv4Address IN 10.0.0.0/24", dict()).unwrap();
        let store = TemplateStore::new();
        let (tpl, _, _) = store.add(1, 7, &hex!("012c 0001 0008 0004"), false).unwrap();
        let data = hex!("0a000005");
        let record = crate::record::records_in_set(&data, &tpl).next().unwrap();
        let header = header();
        let info = input_info();
        let ctx = EvalContext {
            record,
            header: &header,
            input_info: &info,
            dict: dict(),
        };
        assert!(expr.eval(&ctx));
    }

    #[test]
    fn and_or_not_precedence() {
        let expr = parse("EXISTS SourceIPv4Address AND NOT EXISTS DestinationIPv4Address", dict()).unwrap();
        let store = TemplateStore::new();
        let (tpl, _, _) = store.add(1, 7, &hex!("012c 0001 0008 0004"), false).unwrap();
        let data = hex!("0a000005");
        let record = crate::record::records_in_set(&data, &tpl).next().unwrap();
        let header = header();
        let info = input_info();
        let ctx = EvalContext {
            record,
            header: &header,
            input_info: &info,
            dict: dict(),
        };
        assert!(expr.eval(&ctx));
    }
}
