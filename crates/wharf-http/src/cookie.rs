use std::collections::BTreeMap;

/// A response side cookie, with its attributes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub value: String,
    /// Attributes such as `Max-Age` or `Path`, an empty value is written as a bare flag.
    pub options: BTreeMap<String, String>,
}

impl Cookie {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }
}

/// Parse the value of a request `Cookie` header into `cookies`.
///
/// Cookies are separated by `,` and `;`, every pair is split on the first `=`.
pub fn parse_cookie_header(value: &str, cookies: &mut BTreeMap<String, String>) {
    for group in value.split(',') {
        for pair in group.split(';') {
            let (name, value) = split_pair(pair);
            if name.is_empty() {
                continue;
            }

            cookies.insert(name.to_string(), value.to_string());
        }
    }
}

/// Parse the value of a `Set-Cookie` header into `cookies`.
///
/// The first `;` separated pair is the cookie itself, the remaining pairs are its options.
pub fn parse_set_cookie_header(value: &str, cookies: &mut BTreeMap<String, Cookie>) {
    for entry in split_set_cookie(value) {
        let mut pairs = entry.split(';');

        let Some(first) = pairs.next() else { continue };
        let (name, value) = split_pair(first);
        if name.is_empty() {
            continue;
        }

        let mut cookie = Cookie::new(value);
        for pair in pairs {
            let (option, value) = split_pair(pair);
            if option.is_empty() {
                continue;
            }

            cookie.options.insert(option.to_string(), value.to_string());
        }

        cookies.insert(name.to_string(), cookie);
    }
}

/// Serialize a cookie as the value of a `Set-Cookie` header.
pub fn format_set_cookie(name: &str, cookie: &Cookie) -> String {
    let mut line = format!("{}={}", name, cookie.value);

    for (option, value) in &cookie.options {
        line.push_str("; ");
        line.push_str(option);

        if !value.is_empty() {
            line.push('=');
            line.push_str(value);
        }
    }

    line
}

fn split_pair(pair: &str) -> (&str, &str) {
    match pair.split_once('=') {
        Some((name, value)) => (trim(name), trim(value)),
        None => (trim(pair), ""),
    }
}

fn trim(value: &str) -> &str {
    value.trim_matches(|c| c == ' ' || c == '\t')
}

/// Split multiple comma separated cookies, without breaking up `Expires` dates.
fn split_set_cookie(value: &str) -> Vec<String> {
    let mut entries: Vec<String> = Vec::new();

    for part in value.split(',') {
        match entries.last_mut() {
            Some(last) if inside_expires(last) => {
                last.push(',');
                last.push_str(part);
            }
            _ => entries.push(part.to_string()),
        }
    }

    entries
}

/// True if the text ends within the weekday of an `Expires` date, before its comma.
fn inside_expires(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    let Some(position) = lower.rfind("expires") else {
        return false;
    };

    let rest = lower[position + "expires".len()..].trim_start();
    let Some(date) = rest.strip_prefix('=') else {
        return false;
    };

    let date = date.trim();
    !date.is_empty() && date.chars().all(|c| c.is_ascii_alphabetic())
}
