use std::sync::OnceLock;

use regex::Regex;

use crate::{
    domain::{ApiKey, ControlAction},
    errors::Error,
    Result,
};

/// Longest key accepted from a sender.
pub const MAX_KEY_LEN: usize = 128;

fn key_charset() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_.~-]+$").expect("valid regex"))
}

/// Validate a key typed by a sender.
///
/// Surrounding whitespace is dropped; the remainder must be URL-safe and at most
/// [`MAX_KEY_LEN`] characters.
pub fn parse_api_key(raw: &str) -> Result<ApiKey> {
    let key = raw.trim();
    if key.is_empty() {
        return Err(Error::InvalidKey("key is empty".to_string()));
    }
    if key.chars().count() > MAX_KEY_LEN {
        return Err(Error::InvalidKey(format!(
            "key is longer than {MAX_KEY_LEN} characters"
        )));
    }
    if !key_charset().is_match(key) {
        return Err(Error::InvalidKey(
            "key may only contain letters, digits and - _ . ~".to_string(),
        ));
    }
    Ok(ApiKey::new(key))
}

/// `<base>/api/key/<key>/action/<action>` with the key percent-encoded.
pub fn action_url(base: &str, api_key: &ApiKey, action: ControlAction) -> String {
    format!(
        "{}/api/key/{}/action/{}",
        base.trim_end_matches('/'),
        urlencoding::encode(api_key.as_str()),
        action.as_path()
    )
}
