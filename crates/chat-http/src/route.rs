//! REST routes and rate-limit bucket keys
//!
//! A route is a method plus a path template such as
//! `/channels/{channel_id}/messages/{message_id}`. Only the major parameters
//! (`channel_id`, `guild_id`, `webhook_id`) take part in the bucket key, so
//! every message in one channel shares the same local bucket.

use reqwest::Method;
use std::borrow::Cow;
use std::fmt;
use url::Url;

/// Parameters the server scopes rate limits by
const MAJOR_PARAMS: [&str; 3] = ["channel_id", "guild_id", "webhook_id"];

/// Errors rendering a route into a URL
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("missing value for path parameter `{0}`")]
    MissingParam(String),

    #[error("base URL cannot carry a path: {0}")]
    InvalidBase(String),
}

/// An outbound REST route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    method: Method,
    path: Cow<'static, str>,
    params: Vec<(Cow<'static, str>, String)>,
    query: Vec<(String, String)>,
}

impl Route {
    pub fn new(method: Method, path: impl Into<Cow<'static, str>>) -> Self {
        Self {
            method,
            path: path.into(),
            params: Vec::new(),
            query: Vec::new(),
        }
    }

    pub fn get(path: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<Cow<'static, str>>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// Bind a path parameter; a second bind of the same name replaces the first
    pub fn param(mut self, name: impl Into<Cow<'static, str>>, value: impl fmt::Display) -> Self {
        let name = name.into();
        let value = value.to_string();
        match self.params.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.params.push((name, value)),
        }
        self
    }

    /// Append a query string pair (never part of the bucket key)
    pub fn query(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Value bound to a path parameter
    pub fn get_param(&self, name: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Local rate-limit grouping key: `METHOD:channel:guild:path[:webhook]`
    ///
    /// Missing major parameters render as empty segments.
    pub fn bucket_key(&self) -> String {
        let channel = self.get_param(MAJOR_PARAMS[0]).unwrap_or_default();
        let guild = self.get_param(MAJOR_PARAMS[1]).unwrap_or_default();
        let mut key = format!("{}:{}:{}:{}", self.method, channel, guild, self.path);
        if let Some(webhook) = self.get_param(MAJOR_PARAMS[2]) {
            key.push(':');
            key.push_str(webhook);
        }
        key
    }

    /// `"METHOD /path/template"`, for logs
    pub fn endpoint(&self) -> String {
        format!("{} {}", self.method, self.path)
    }

    /// Render the full URL under `base` (e.g. `https://discord.com/api/v10`)
    ///
    /// Parameter values are percent-encoded as single path segments.
    pub fn url(&self, base: &Url) -> Result<Url, RouteError> {
        let mut url = base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| RouteError::InvalidBase(base.to_string()))?;
            segments.pop_if_empty();

            for segment in self.path.split('/').filter(|s| !s.is_empty()) {
                match segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                    Some(name) => {
                        let value = self
                            .get_param(name)
                            .ok_or_else(|| RouteError::MissingParam(name.to_string()))?;
                        segments.push(value);
                    }
                    None => {
                        segments.push(segment);
                    }
                }
            }
        }

        if !self.query.is_empty() {
            url.query_pairs_mut().extend_pairs(&self.query);
        }

        Ok(url)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.path)
    }
}
