use std::fmt;

/// Query parameter that carries the client's API key.
pub const API_KEY_PARAM: &str = "api_key";

/// Number of leading characters kept when an API key is rendered for logs.
const MASK_VISIBLE_CHARS: usize = 4;

/// An API key recovered from an inbound upgrade request.
///
/// The key is forwarded upstream verbatim but never rendered in full: both
/// `Debug` and `Display` print the masked form.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap a raw key. Returns `None` for an empty string.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// The raw key, for building the upstream credential.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// The first few characters followed by an ellipsis.
    pub fn masked(&self) -> String {
        let visible: String = self.0.chars().take(MASK_VISIBLE_CHARS).collect();
        format!("{visible}…")
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ApiKey").field(&self.masked()).finish()
    }
}

impl fmt::Display for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

/// Extracts the `api_key` query parameter from a raw request target such as
/// `/realtime?api_key=abc`.
///
/// - Values are form-decoded (`%2B` becomes `+`, `+` becomes a space).
/// - Blank values are skipped, so the first non-empty `api_key` wins.
/// - A target without a query string, or with a query that does not decode
///   to any `api_key` pair, yields `None`. Malformed input never errors.
pub fn extract_api_key(target: &str) -> Option<ApiKey> {
    let (_, query) = target.split_once('?')?;
    // Fragments are not part of the query.
    let query = query.split('#').next().unwrap_or_default();

    url::form_urlencoded::parse(query.as_bytes())
        .filter(|(name, _)| name == API_KEY_PARAM)
        .find_map(|(_, value)| ApiKey::new(value.into_owned()))
}
