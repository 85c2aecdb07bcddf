//! Search filters (RFC 4515).
//!
//! Raw filter strings are parsed before anything goes over the wire; values
//! that end up inside a filter are always escaped when rendered.

use std::fmt;

use crate::directory::{is_valid_attribute_name, Attributes, Value};
use crate::error::DirectoryError;


const OID_MATCHING_RULE_BIT_AND: &str = "1.2.840.113556.1.4.803";
const OID_MATCHING_RULE_BIT_OR: &str = "1.2.840.113556.1.4.804";


/// Escapes a string for use as an assertion value inside a filter.
pub fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\5c"),
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\0' => escaped.push_str("\\00"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn escape_filter_bytes(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(s) => escape_filter_value(s),
        Err(_) => {
            let mut escaped = String::with_capacity(value.len() * 3);
            for b in value {
                match *b {
                    b'\\' | b'*' | b'(' | b')' | 0x00 | 0x80..=0xFF => {
                        escaped.push_str(&format!("\\{:02x}", b));
                    },
                    other => escaped.push(char::from(other)),
                }
            }
            escaped
        },
    }
}


#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Equal { attribute: String, value: Vec<u8> },
    Approx { attribute: String, value: Vec<u8> },
    GreaterOrEqual { attribute: String, value: Vec<u8> },
    LessOrEqual { attribute: String, value: Vec<u8> },
    Present { attribute: String },
    Substring { attribute: String, initial: Option<Vec<u8>>, any: Vec<Vec<u8>>, last: Option<Vec<u8>> },
    Extensible { attribute: Option<String>, rule: Option<String>, dn_attributes: bool, value: Vec<u8> },
}
impl Filter {
    pub fn eq<A: Into<String>>(attribute: A, value: &str) -> Result<Self, DirectoryError> {
        let attribute = check_attribute_description(attribute.into())?;
        Ok(Self::Equal { attribute, value: value.as_bytes().to_vec() })
    }

    pub fn present<A: Into<String>>(attribute: A) -> Result<Self, DirectoryError> {
        let attribute = check_attribute_description(attribute.into())?;
        Ok(Self::Present { attribute })
    }

    pub fn contains<A: Into<String>>(attribute: A, value: &str) -> Result<Self, DirectoryError> {
        let attribute = check_attribute_description(attribute.into())?;
        Ok(Self::Substring { attribute, initial: None, any: vec![value.as_bytes().to_vec()], last: None })
    }

    pub fn starts_with<A: Into<String>>(attribute: A, value: &str) -> Result<Self, DirectoryError> {
        let attribute = check_attribute_description(attribute.into())?;
        Ok(Self::Substring { attribute, initial: Some(value.as_bytes().to_vec()), any: Vec::new(), last: None })
    }

    pub fn ends_with<A: Into<String>>(attribute: A, value: &str) -> Result<Self, DirectoryError> {
        let attribute = check_attribute_description(attribute.into())?;
        Ok(Self::Substring { attribute, initial: None, any: Vec::new(), last: Some(value.as_bytes().to_vec()) })
    }

    pub fn and(filters: Vec<Filter>) -> Self { Self::And(filters) }
    pub fn or(filters: Vec<Filter>) -> Self { Self::Or(filters) }
    pub fn not(filter: Filter) -> Self { Self::Not(Box::new(filter)) }

    /// Parses and validates a raw filter string.
    ///
    /// A bare item such as `cn=alice` is accepted as if it were parenthesized.
    pub fn parse(input: &str) -> Result<Self, DirectoryError> {
        if input.contains('\0') {
            return Err(DirectoryError::FilterValidation("filter contains a NUL character".to_owned()));
        }
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(DirectoryError::FilterValidation("filter is empty".to_owned()));
        }
        let wrapped;
        let source = if trimmed.starts_with('(') {
            trimmed
        } else {
            wrapped = format!("({})", trimmed);
            &wrapped
        };

        let mut parser = Parser { input: source.as_bytes(), pos: 0 };
        let filter = parser.filter()?;
        if parser.pos != parser.input.len() {
            return Err(parser.error("unexpected characters after the end of the filter"));
        }
        Ok(filter)
    }

    /// Evaluates the filter against an entry's attributes.
    pub fn matches(&self, attributes: &Attributes) -> bool {
        match self {
            Self::And(filters) => filters.iter().all(|f| f.matches(attributes)),
            Self::Or(filters) => filters.iter().any(|f| f.matches(attributes)),
            Self::Not(filter) => !filter.matches(attributes),
            Self::Present { attribute } => {
                attribute.eq_ignore_ascii_case("objectClass") || !attributes.get(attribute).is_empty()
            },
            Self::Equal { attribute, value } | Self::Approx { attribute, value } => {
                let wanted = fold(value);
                attributes.get(attribute).iter().any(|v| fold(v.as_bytes()) == wanted)
            },
            Self::GreaterOrEqual { attribute, value } => {
                attributes.get(attribute).iter().any(|v| compare(v, value) != std::cmp::Ordering::Less)
            },
            Self::LessOrEqual { attribute, value } => {
                attributes.get(attribute).iter().any(|v| compare(v, value) != std::cmp::Ordering::Greater)
            },
            Self::Substring { attribute, initial, any, last } => {
                attributes.get(attribute).iter().any(|v| substring_matches(&fold(v.as_bytes()), initial, any, last))
            },
            Self::Extensible { attribute: Some(attribute), rule, value, .. } => {
                let Some(wanted) = std::str::from_utf8(value).ok().and_then(|s| s.parse::<u64>().ok()) else {
                    return false;
                };
                attributes.get(attribute).iter().any(|v| {
                    let Some(have) = v.as_text().and_then(|s| s.parse::<i64>().ok()) else { return false };
                    let have = have as u64;
                    match rule.as_deref() {
                        Some(OID_MATCHING_RULE_BIT_AND) => have & wanted == wanted,
                        Some(OID_MATCHING_RULE_BIT_OR) => have & wanted != 0,
                        _ => have == wanted,
                    }
                })
            },
            Self::Extensible { attribute: None, .. } => false,
        }
    }
}
impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::And(filters) => {
                write!(f, "(&")?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                write!(f, ")")
            },
            Self::Or(filters) => {
                write!(f, "(|")?;
                for filter in filters {
                    write!(f, "{}", filter)?;
                }
                write!(f, ")")
            },
            Self::Not(filter) => write!(f, "(!{})", filter),
            Self::Equal { attribute, value } => write!(f, "({}={})", attribute, escape_filter_bytes(value)),
            Self::Approx { attribute, value } => write!(f, "({}~={})", attribute, escape_filter_bytes(value)),
            Self::GreaterOrEqual { attribute, value } => write!(f, "({}>={})", attribute, escape_filter_bytes(value)),
            Self::LessOrEqual { attribute, value } => write!(f, "({}<={})", attribute, escape_filter_bytes(value)),
            Self::Present { attribute } => write!(f, "({}=*)", attribute),
            Self::Substring { attribute, initial, any, last } => {
                write!(f, "({}=", attribute)?;
                if let Some(initial) = initial {
                    write!(f, "{}", escape_filter_bytes(initial))?;
                }
                write!(f, "*")?;
                for piece in any {
                    write!(f, "{}*", escape_filter_bytes(piece))?;
                }
                if let Some(last) = last {
                    write!(f, "{}", escape_filter_bytes(last))?;
                }
                write!(f, ")")
            },
            Self::Extensible { attribute, rule, dn_attributes, value } => {
                write!(f, "(")?;
                if let Some(attribute) = attribute {
                    write!(f, "{}", attribute)?;
                }
                if *dn_attributes {
                    write!(f, ":dn")?;
                }
                if let Some(rule) = rule {
                    write!(f, ":{}", rule)?;
                }
                write!(f, ":={})", escape_filter_bytes(value))
            },
        }
    }
}


fn fold(value: &[u8]) -> Vec<u8> {
    match std::str::from_utf8(value) {
        Ok(s) => s.to_lowercase().into_bytes(),
        Err(_) => value.to_vec(),
    }
}

fn compare(have: &Value, wanted: &[u8]) -> std::cmp::Ordering {
    let as_numbers = have.as_text()
        .and_then(|h| h.parse::<i64>().ok())
        .zip(std::str::from_utf8(wanted).ok().and_then(|w| w.parse::<i64>().ok()));
    match as_numbers {
        Some((h, w)) => h.cmp(&w),
        None => fold(have.as_bytes()).cmp(&fold(wanted)),
    }
}

fn substring_matches(haystack: &[u8], initial: &Option<Vec<u8>>, any: &[Vec<u8>], last: &Option<Vec<u8>>) -> bool {
    let mut rest = haystack;
    if let Some(initial) = initial {
        let initial = fold(initial);
        if !rest.starts_with(&initial) {
            return false;
        }
        rest = &rest[initial.len()..];
    }
    for piece in any {
        let piece = fold(piece);
        if piece.is_empty() {
            continue;
        }
        match rest.windows(piece.len()).position(|w| w == piece.as_slice()) {
            Some(i) => rest = &rest[i + piece.len()..],
            None => return false,
        }
    }
    match last {
        Some(last) => rest.ends_with(&fold(last)),
        None => true,
    }
}


/// An attribute name with optional `;option` suffixes, such as
/// `userCertificate;binary`.
fn check_attribute_description(description: String) -> Result<String, DirectoryError> {
    let mut parts = description.split(';');
    let name_ok = parts.next().map(is_valid_attribute_name).unwrap_or(false);
    let options_ok = parts.all(|o| !o.is_empty() && o.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-'));
    if name_ok && options_ok {
        Ok(description)
    } else {
        Err(DirectoryError::FilterValidation(format!("invalid attribute description {:?}", description)))
    }
}

fn is_attribute_description_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b';'
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}
impl<'a> Parser<'a> {
    fn error(&self, message: &str) -> DirectoryError {
        DirectoryError::FilterValidation(format!("{} at offset {}", message, self.pos))
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, b: u8) -> Result<(), DirectoryError> {
        if self.peek() == Some(b) {
            self.pos += 1;
            Ok(())
        } else if self.peek().is_none() {
            Err(self.error("unbalanced parentheses"))
        } else {
            Err(self.error(&format!("expected {:?}", char::from(b))))
        }
    }

    fn filter(&mut self) -> Result<Filter, DirectoryError> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And(self.filter_list()?)
            },
            Some(b'|') => {
                self.pos += 1;
                Filter::Or(self.filter_list()?)
            },
            Some(b'!') => {
                self.pos += 1;
                Filter::Not(Box::new(self.filter()?))
            },
            Some(_) => self.item()?,
            None => return Err(self.error("unbalanced parentheses")),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn filter_list(&mut self) -> Result<Vec<Filter>, DirectoryError> {
        let mut filters = Vec::new();
        while self.peek() == Some(b'(') {
            filters.push(self.filter()?);
        }
        Ok(filters)
    }

    fn attribute_description(&mut self) -> Result<String, DirectoryError> {
        let start = self.pos;
        while self.peek().map(is_attribute_description_byte).unwrap_or(false) {
            self.pos += 1;
        }
        let name = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| self.error("invalid attribute description"))?;
        Ok(name.to_owned())
    }

    fn item(&mut self) -> Result<Filter, DirectoryError> {
        let attribute = self.attribute_description()?;

        if self.peek() == Some(b':') {
            return self.extensible(attribute);
        }
        if attribute.is_empty() || !attribute.as_bytes()[0].is_ascii_alphanumeric() {
            return Err(self.error("invalid attribute description"));
        }

        let operator = match self.peek() {
            Some(b'=') => {
                self.pos += 1;
                b'='
            },
            Some(op @ (b'~' | b'>' | b'<')) => {
                self.pos += 1;
                self.expect(b'=')?;
                op
            },
            _ => return Err(self.error("expected a comparison operator")),
        };

        let pieces = self.value_pieces()?;
        if operator != b'=' {
            if pieces.len() != 1 {
                return Err(self.error("wildcards are only allowed in equality matches"));
            }
            let value = pieces.into_iter().next().unwrap_or_default();
            return Ok(match operator {
                b'~' => Filter::Approx { attribute, value },
                b'>' => Filter::GreaterOrEqual { attribute, value },
                _ => Filter::LessOrEqual { attribute, value },
            });
        }

        match pieces.len() {
            1 => {
                let value = pieces.into_iter().next().unwrap_or_default();
                Ok(Filter::Equal { attribute, value })
            },
            2 if pieces.iter().all(|p| p.is_empty()) => Ok(Filter::Present { attribute }),
            _ => {
                let count = pieces.len();
                let mut initial = None;
                let mut any = Vec::new();
                let mut last = None;
                for (i, piece) in pieces.into_iter().enumerate() {
                    if i == 0 {
                        if !piece.is_empty() {
                            initial = Some(piece);
                        }
                    } else if i + 1 == count {
                        if !piece.is_empty() {
                            last = Some(piece);
                        }
                    } else if piece.is_empty() {
                        return Err(self.error("consecutive wildcards"));
                    } else {
                        any.push(piece);
                    }
                }
                Ok(Filter::Substring { attribute, initial, any, last })
            },
        }
    }

    fn extensible(&mut self, attribute: String) -> Result<Filter, DirectoryError> {
        let attribute = if attribute.is_empty() { None } else { Some(attribute) };
        let mut dn_attributes = false;
        let mut rule = None;
        loop {
            self.expect(b':')?;
            if self.peek() == Some(b'=') {
                self.pos += 1;
                break;
            }
            let part = self.attribute_description()?;
            if part.eq_ignore_ascii_case("dn") && !dn_attributes && rule.is_none() {
                dn_attributes = true;
            } else if !part.is_empty() && rule.is_none() {
                rule = Some(part);
            } else {
                return Err(self.error("malformed extensible match"));
            }
        }
        if attribute.is_none() && rule.is_none() {
            return Err(self.error("extensible match needs an attribute or a matching rule"));
        }
        let pieces = self.value_pieces()?;
        if pieces.len() != 1 {
            return Err(self.error("wildcards are not allowed in extensible matches"));
        }
        let value = pieces.into_iter().next().unwrap_or_default();
        Ok(Filter::Extensible { attribute, rule, dn_attributes, value })
    }

    /// Reads an assertion value up to the closing parenthesis, split at
    /// unescaped asterisks, with escapes decoded.
    fn value_pieces(&mut self) -> Result<Vec<Vec<u8>>, DirectoryError> {
        let mut pieces = vec![Vec::new()];
        loop {
            match self.peek() {
                None => return Err(self.error("unbalanced parentheses")),
                Some(b')') => break,
                Some(b'(') => return Err(self.error("unescaped '(' in value")),
                Some(0x00) => return Err(self.error("NUL in value")),
                Some(b'*') => {
                    self.pos += 1;
                    pieces.push(Vec::new());
                },
                Some(b'\\') => {
                    let hex = self.input.get(self.pos + 1..self.pos + 3)
                        .and_then(|h| std::str::from_utf8(h).ok())
                        .filter(|h| h.chars().all(|c| c.is_ascii_hexdigit()))
                        .and_then(|h| u8::from_str_radix(h, 16).ok());
                    let Some(byte) = hex else {
                        return Err(self.error("invalid escape sequence"));
                    };
                    if let Some(current) = pieces.last_mut() {
                        current.push(byte);
                    }
                    self.pos += 3;
                },
                Some(b) => {
                    if let Some(current) = pieces.last_mut() {
                        current.push(b);
                    }
                    self.pos += 1;
                },
            }
        }
        Ok(pieces)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn attrs() -> Attributes {
        Attributes::new()
            .with("objectClass", vec!["top", "person", "user"])
            .with("cn", "Alice Smith")
            .with("userAccountControl", "514")
            .with("uidNumber", "1500")
    }

    #[test]
    fn test_escape_filter_value() {
        assert_eq!(escape_filter_value("John Doe"), "John Doe");
        assert_eq!(escape_filter_value("John*"), "John\\2a");
        assert_eq!(escape_filter_value("(admin)"), "\\28admin\\29");
        assert_eq!(escape_filter_value("a\\b"), "a\\5cb");
        assert_eq!(escape_filter_value("a\0b"), "a\\00b");
    }

    #[test]
    fn test_injection_is_neutralized() {
        let raw = "a)(b=*)(c=";
        let escaped = escape_filter_value(raw);
        assert!(!escaped.contains('('));
        assert!(!escaped.contains(')'));
        assert!(!escaped.contains('*'));

        let filter = Filter::parse(&format!("(cn={})", escaped)).unwrap();
        assert_eq!(filter, Filter::Equal { attribute: "cn".to_owned(), value: raw.as_bytes().to_vec() });
    }

    #[test]
    fn test_every_special_character_round_trips_as_one_value() {
        for raw in ["*", "(", ")", "\\", "\0", "x*)(|(cn=*", "\\2a", "((()))"] {
            let rendered = Filter::eq("cn", raw).unwrap().to_string();
            let parsed = Filter::parse(&rendered).unwrap();
            assert_eq!(parsed, Filter::eq("cn", raw).unwrap(), "for input {:?}", raw);
        }
    }

    #[test]
    fn test_render_tree() {
        let filter = Filter::and(vec![
            Filter::eq("objectClass", "user").unwrap(),
            Filter::or(vec![Filter::starts_with("cn", "Al*").unwrap(), Filter::present("mail").unwrap()]),
            Filter::not(Filter::contains("description", "(x)").unwrap()),
        ]);
        assert_eq!(
            filter.to_string(),
            "(&(objectClass=user)(|(cn=Al\\2a*)(mail=*))(!(description=*\\28x\\29*)))",
        );
        assert_eq!(Filter::parse(&filter.to_string()).unwrap(), filter);
    }

    #[test]
    fn test_builders_reject_bad_attribute_names() {
        for bad in ["cn=x)(|(objectClass", "cn=admin)(objectClass", "", "cn*", "(cn", "cn;", "-cn"] {
            assert!(matches!(Filter::eq(bad, "x"), Err(DirectoryError::FilterValidation(_))), "accepted {:?}", bad);
            assert!(matches!(Filter::present(bad), Err(DirectoryError::FilterValidation(_))), "accepted {:?}", bad);
            assert!(matches!(Filter::contains(bad, "x"), Err(DirectoryError::FilterValidation(_))), "accepted {:?}", bad);
            assert!(matches!(Filter::starts_with(bad, "x"), Err(DirectoryError::FilterValidation(_))), "accepted {:?}", bad);
            assert!(matches!(Filter::ends_with(bad, "x"), Err(DirectoryError::FilterValidation(_))), "accepted {:?}", bad);
        }
        assert_eq!(Filter::present("userCertificate;binary").unwrap().to_string(), "(userCertificate;binary=*)");
        assert_eq!(Filter::eq("2.5.4.3", "alice").unwrap().to_string(), "(2.5.4.3=alice)");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["", "(cn=a", "(cn=a))", "((cn=a)", "(cn=a(b)", "(=a)", "(cn=\\zz)", "(c n=a)", "(cn=a\0)", "(cn>=a*)"] {
            assert!(
                matches!(Filter::parse(bad), Err(DirectoryError::FilterValidation(_))),
                "accepted {:?}", bad,
            );
        }
    }

    #[test]
    fn test_parse_bare_and_present() {
        assert_eq!(Filter::parse("objectClass=user").unwrap(), Filter::eq("objectClass", "user").unwrap());
        assert_eq!(Filter::parse("(mail=*)").unwrap(), Filter::present("mail").unwrap());
    }

    #[test]
    fn test_parse_extensible() {
        let filter = Filter::parse("(userAccountControl:1.2.840.113556.1.4.803:=2)").unwrap();
        assert_eq!(filter.to_string(), "(userAccountControl:1.2.840.113556.1.4.803:=2)");
        assert!(filter.matches(&attrs()));
    }

    #[test]
    fn test_matches() {
        let attributes = attrs();
        assert!(Filter::parse("(objectClass=USER)").unwrap().matches(&attributes));
        assert!(Filter::parse("(cn=ali*smith)").unwrap().matches(&attributes));
        assert!(Filter::parse("(cn=*ice*)").unwrap().matches(&attributes));
        assert!(!Filter::parse("(cn=bob*)").unwrap().matches(&attributes));
        assert!(Filter::parse("(&(uidNumber>=1000)(uidNumber<=2000))").unwrap().matches(&attributes));
        assert!(!Filter::parse("(uidNumber>=9000)").unwrap().matches(&attributes));
        assert!(Filter::parse("(!(mail=*))").unwrap().matches(&attributes));
        assert!(Filter::parse("(|(mail=*)(cn=Alice Smith))").unwrap().matches(&attributes));
    }
}
