//! Distinguished name handling (RFC 4514).


#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Rdn {
    pub key: String,
    pub value: Vec<u8>,
}
impl Rdn {
    pub fn new(key: String, value: Vec<u8>) -> Self {
        Self {
            key,
            value,
        }
    }

    /// Case-insensitive comparison of both type and value.
    pub fn matches(&self, other: &Rdn) -> bool {
        self.key.eq_ignore_ascii_case(&other.key)
            && fold_value(&self.value) == fold_value(&other.value)
    }
}

fn fold_value(value: &[u8]) -> Vec<u8> {
    match std::str::from_utf8(value) {
        Ok(s) => s.to_lowercase().into_bytes(),
        Err(_) => value.to_vec(),
    }
}


pub fn dn_to_rdns(dn: &str) -> Option<Vec<Rdn>> {
    if dn.trim().len() == 0 {
        return Some(Vec::with_capacity(0));
    }

    let tokens = tokenize(dn)?;

    let pieces = split_at_unescaped_commas(&tokens);
    let mut rdns = Vec::with_capacity(pieces.len());
    for piece in pieces {
        let (key_tokens, value_tokens) = split_at_first_unescaped_equals(&piece)?;
        let key_bytes = tokens_to_bytes(&key_tokens);
        let value_bytes = tokens_to_bytes(&trim_unescaped_spaces(&value_tokens));

        let key_string = String::from_utf8(key_bytes).ok()?;
        let key_string = key_string.trim();
        if key_string.len() == 0 {
            return None;
        }
        rdns.push(Rdn::new(key_string.to_owned(), value_bytes));
    }

    Some(rdns)
}

#[derive(Clone, Copy, Debug, Hash, Eq, Ord, PartialEq, PartialOrd)]
enum Token<'a> {
    UnescapedSlice(&'a str),
    EscapedByte(u8),
}

/// Tokenizes the given DN string.
///
/// Used to abstract away escapes.
fn tokenize(dn: &str) -> Option<Vec<Token>> {
    let mut tokens = Vec::new();

    let mut current_start = 0;
    loop {
        let next_backslash = match find_from(dn, '\\', current_start) {
            Some(nb) => nb,
            None => {
                let rest_slice = &dn[current_start..];
                if rest_slice.len() > 0 {
                    tokens.push(Token::UnescapedSlice(rest_slice));
                }
                break;
            },
        };

        // eat the part until the backslash
        let eaten = &dn[current_start..next_backslash];
        if eaten.len() > 0 {
            tokens.push(Token::UnescapedSlice(eaten));
        }

        // what follows the backslash?
        let c = dn[next_backslash+1..].chars().nth(0)?;
        if [' ', '"', '#', '+', ',', ';', '<', '=', '>', '\\'].binary_search(&c).is_ok() {
            tokens.push(Token::EscapedByte(c as u8));

            // continue after that escaped character
            current_start = next_backslash + 2;
        } else if c.is_ascii_hexdigit() {
            // DN ends with a string like "\9" or "\F"
            let c2 = dn[next_backslash+2..].chars().nth(0)?;
            if !c2.is_ascii_hexdigit() {
                // a string like "\A%"
                return None;
            }
            let hex_slice = &dn[next_backslash+1..next_backslash+3];
            let hex_value = u8::from_str_radix(hex_slice, 16).ok()?;
            tokens.push(Token::EscapedByte(hex_value));

            // continue after the second hex digit
            current_start = next_backslash + 3;
        } else {
            // not a valid escape
            return None;
        }
    }

    Some(tokens)
}


fn find_from(haystack: &str, needle: char, offset: usize) -> Option<usize> {
    haystack[offset..]
        .find(needle)
        .map(|i| i + offset)
}

fn split_at_unescaped_commas<'a>(tokens: &[Token<'a>]) -> Vec<Vec<Token<'a>>> {
    let mut pieces = Vec::new();
    let mut current_piece = Vec::new();
    for token in tokens {
        match token {
            Token::EscapedByte(_) => {
                current_piece.push(*token);
            },
            Token::UnescapedSlice(s) => {
                let mut parts = s.split(',');
                if let Some(first) = parts.next() {
                    if first.len() > 0 {
                        current_piece.push(Token::UnescapedSlice(first));
                    }
                }
                for part in parts {
                    pieces.push(std::mem::take(&mut current_piece));
                    if part.len() > 0 {
                        current_piece.push(Token::UnescapedSlice(part));
                    }
                }
            },
        }
    }
    pieces.push(current_piece);
    pieces
}

fn split_at_first_unescaped_equals<'a>(tokens: &[Token<'a>]) -> Option<(Vec<Token<'a>>, Vec<Token<'a>>)> {
    let mut front_pieces = Vec::new();
    for (i, token) in tokens.iter().enumerate() {
        match token {
            Token::EscapedByte(_) => {
                front_pieces.push(*token);
            },
            Token::UnescapedSlice(s) => {
                let Some((before, after)) = s.split_once('=') else {
                    front_pieces.push(*token);
                    continue;
                };

                if before.len() > 0 {
                    front_pieces.push(Token::UnescapedSlice(before));
                }

                // everything else belongs to the value
                let mut rear_pieces = Vec::new();
                if after.len() > 0 {
                    rear_pieces.push(Token::UnescapedSlice(after));
                }
                rear_pieces.extend(tokens.iter().skip(i + 1).copied());

                return Some((front_pieces, rear_pieces));
            },
        }
    }

    // no unescaped equals found
    None
}

fn trim_unescaped_spaces<'a>(tokens: &[Token<'a>]) -> Vec<Token<'a>> {
    let mut trimmed: Vec<Token<'a>> = tokens.to_vec();
    if let Some(Token::UnescapedSlice(s)) = trimmed.first_mut() {
        let slice: &'a str = *s;
        *s = slice.trim_start_matches(' ');
    }
    if let Some(Token::UnescapedSlice(s)) = trimmed.last_mut() {
        let slice: &'a str = *s;
        *s = slice.trim_end_matches(' ');
    }
    trimmed
}

fn tokens_to_bytes(tokens: &[Token]) -> Vec<u8> {
    let mut ret = Vec::new();
    for token in tokens {
        match token {
            Token::EscapedByte(b) => ret.push(*b),
            Token::UnescapedSlice(slice) => ret.extend_from_slice(slice.as_bytes()),
        }
    }
    ret
}


/// Byte offset of the first comma that separates RDNs.
fn first_unescaped_comma(dn: &str) -> Option<usize> {
    let mut escaped = false;
    for (i, c) in dn.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == ',' {
            return Some(i);
        }
    }
    None
}

/// The DN of the entry's parent, `""` for a top-level entry.
pub fn parent_dn(dn: &str) -> &str {
    match first_unescaped_comma(dn) {
        Some(i) => dn[i+1..].trim_start(),
        None => "",
    }
}

/// The leftmost RDN of the DN, as written.
pub fn leaf_rdn(dn: &str) -> &str {
    match first_unescaped_comma(dn) {
        Some(i) => dn[..i].trim(),
        None => dn.trim(),
    }
}

pub fn is_valid_dn(dn: &str) -> bool {
    dn_to_rdns(dn).is_some()
}

pub fn is_valid_rdn(rdn: &str) -> bool {
    matches!(dn_to_rdns(rdn), Some(rdns) if rdns.len() == 1)
}

/// Whether two DNs name the same entry, ignoring case and insignificant spaces.
pub fn same_dn(a: &str, b: &str) -> bool {
    match (dn_to_rdns(a), dn_to_rdns(b)) {
        (Some(a), Some(b)) => a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.matches(y)),
        _ => a.eq_ignore_ascii_case(b),
    }
}

/// Whether `dn` is `base` or lies anywhere below it.
pub fn is_within(dn: &str, base: &str) -> bool {
    let (Some(dn_rdns), Some(base_rdns)) = (dn_to_rdns(dn), dn_to_rdns(base)) else {
        return false;
    };
    if base_rdns.len() > dn_rdns.len() {
        return false;
    }
    let offset = dn_rdns.len() - base_rdns.len();
    dn_rdns[offset..]
        .iter()
        .zip(base_rdns.iter())
        .all(|(x, y)| x.matches(y))
}

/// The DN an entry ends up with after a rename/move.
pub fn rename_target(dn: &str, new_rdn: &str, new_parent: Option<&str>) -> String {
    let parent = new_parent.unwrap_or_else(|| parent_dn(dn));
    if parent.is_empty() {
        new_rdn.to_owned()
    } else {
        format!("{},{}", new_rdn, parent)
    }
}

/// Escapes an attribute value for use inside a DN.
pub fn escape_dn_value(value: &str) -> String {
    let char_count = value.chars().count();
    let mut result = String::with_capacity(value.len() * 2);
    for (i, ch) in value.chars().enumerate() {
        let is_first = i == 0;
        let is_last = i + 1 == char_count;
        match ch {
            ',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
                result.push('\\');
                result.push(ch);
            },
            '\0' => result.push_str("\\00"),
            ' ' if is_first || is_last => result.push_str("\\20"),
            '#' if is_first => result.push_str("\\23"),
            _ => result.push(ch),
        }
    }
    result
}
