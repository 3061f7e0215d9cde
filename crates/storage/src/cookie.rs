use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub path: String,
    /// Milliseconds since the Unix epoch; `None` for a session cookie
    pub expires_at: Option<i64>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into(), path: "/".to_string(), expires_at: None }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn expires_at(mut self, at_ms: i64) -> Self {
        self.expires_at = Some(at_ms);
        self
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| now_ms >= at)
    }
}

/// Origin-wide cookie jar; clones share the same cookies, the way every tab
/// sees the same `document.cookie`.
#[derive(Debug, Clone, Default)]
pub struct CookieJar {
    cookies: Arc<Mutex<Vec<Cookie>>>,
}

impl CookieJar {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Cookie>> {
        self.cookies.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replaces any cookie with the same name and path.
    pub fn set(&self, cookie: Cookie) {
        let mut cookies = self.lock();
        cookies.retain(|c| !(c.name == cookie.name && c.path == cookie.path));
        cookies.push(cookie);
    }

    /// Applies a `document.cookie = "..."` assignment. Understands `path` and
    /// `max-age`; a non-positive `max-age` deletes the cookie.
    pub fn set_from_str(&self, assignment: &str, now_ms: i64) {
        let mut parts = assignment.split(';');
        let Some((name, value)) = parts.next().and_then(|pair| pair.split_once('=')) else {
            tracing::debug!(assignment, "Ignoring cookie assignment without name=value");
            return;
        };
        let mut cookie = Cookie::new(name.trim(), value.trim());
        for attribute in parts {
            let (key, val) = attribute.split_once('=').unwrap_or((attribute, ""));
            match key.trim().to_ascii_lowercase().as_str() {
                "path" => cookie.path = val.trim().to_string(),
                "max-age" => match val.trim().parse::<i64>() {
                    Ok(seconds) => cookie.expires_at = Some(now_ms.saturating_add(seconds.saturating_mul(1000))),
                    Err(_) => tracing::debug!(value = val.trim(), "Ignoring unparseable max-age"),
                },
                _ => {}
            }
        }
        if cookie.is_expired(now_ms) {
            self.remove(&cookie.name, &cookie.path);
        } else {
            self.set(cookie);
        }
    }

    /// Live value of `name`; expired cookies are dropped on the way.
    pub fn get(&self, name: &str, now_ms: i64) -> Option<String> {
        let mut cookies = self.lock();
        cookies.retain(|c| !c.is_expired(now_ms));
        cookies.iter().find(|c| c.name == name).map(|c| c.value.clone())
    }

    pub fn remove(&self, name: &str, path: &str) {
        self.lock().retain(|c| !(c.name == name && c.path == path));
    }

    /// The `document.cookie` getter string.
    pub fn header(&self, now_ms: i64) -> String {
        let mut cookies = self.lock();
        cookies.retain(|c| !c.is_expired(now_ms));
        cookies
            .iter()
            .map(|c| format!("{}={}", c.name, c.value))
            .collect::<Vec<_>>()
            .join("; ")
    }
}
