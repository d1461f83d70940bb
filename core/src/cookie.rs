//! Session cookies.
//!
//! The jar is a flat name→value map. `Set-Cookie` attributes are parsed and
//! exposed on `SetCookie`, but the jar does not enforce expiry, domain, path or
//! the secure flag: every cookie the server sets is sent back on every
//! subsequent request of the session.

use std::collections::BTreeMap;

/// One parsed `Set-Cookie` header value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SetCookie {
    pub name: String,
    pub value: String,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub expires: Option<String>,
    pub max_age: Option<i64>,
    pub secure: bool,
    pub http_only: bool,
}

impl SetCookie {
    /// Parse a header value such as `id=a3f; Path=/; HttpOnly`.
    ///
    /// Returns `None` when the first pair has no `=` or an empty name.
    pub fn parse(header: &str) -> Option<Self> {
        let mut parts = header.split(';').map(str::trim);
        let (name, value) = parts.next()?.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }

        let mut cookie = SetCookie {
            name: name.to_string(),
            value: value.trim().trim_matches('"').to_string(),
            ..SetCookie::default()
        };
        for attr in parts {
            match attr.split_once('=') {
                Some((key, val)) => {
                    let val = val.trim();
                    match key.trim().to_ascii_lowercase().as_str() {
                        "domain" => cookie.domain = Some(val.trim_start_matches('.').to_string()),
                        "path" => cookie.path = Some(val.to_string()),
                        "expires" => cookie.expires = Some(val.to_string()),
                        "max-age" => cookie.max_age = val.parse().ok(),
                        _ => {}
                    }
                }
                None if attr.eq_ignore_ascii_case("secure") => cookie.secure = true,
                None if attr.eq_ignore_ascii_case("httponly") => cookie.http_only = true,
                None => {}
            }
        }
        Some(cookie)
    }
}

/// `Set-Cookie` values found in a raw header block.
pub fn set_cookie_values(headers: &str) -> impl Iterator<Item = &str> {
    headers.lines().filter_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim().eq_ignore_ascii_case("set-cookie").then(|| value.trim())
    })
}

/// Name→value cookie store for one client session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: BTreeMap<String, String>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a cookie, or remove it when `value` is `None`.
    pub fn set(&mut self, name: impl Into<String>, value: Option<String>) {
        let name = name.into();
        match value {
            Some(value) => {
                self.cookies.insert(name, value);
            }
            None => {
                self.cookies.remove(&name);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.cookies.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.cookies.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn clear(&mut self) {
        self.cookies.clear();
    }

    /// Store every cookie set by a raw header block. Returns how many were
    /// stored.
    pub fn update_from_headers(&mut self, headers: &str) -> usize {
        let mut stored = 0;
        for cookie in set_cookie_values(headers).filter_map(SetCookie::parse) {
            self.cookies.insert(cookie.name, cookie.value);
            stored += 1;
        }
        stored
    }

    /// Value for a `Cookie` request header, if the jar is not empty.
    pub fn header_value(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }
}
