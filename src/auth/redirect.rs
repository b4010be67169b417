//! Post-login navigation target.
//!
//! The callback route may carry an application-level `redirect_uri` query
//! parameter (distinct from the OAuth `redirect_uri` sent to the provider).
//! It is honored only when it points back into the running application.

use url::{Origin, Url};

/// Query parameter carrying the post-login destination on the callback URL.
pub const RETURN_TO_PARAM: &str = "redirect_uri";

/// Append the caller's return URL to the callback URL sent to the provider.
pub fn append_return_to(callback: &Url, return_url: &str) -> Url {
    let mut url = callback.clone();
    url.query_pairs_mut()
        .append_pair(RETURN_TO_PARAM, return_url);
    url
}

/// Pick the route to navigate to after a successful login.
///
/// Looks at the callback's `redirect_uri` parameter first, then at
/// `carried_return_url` (the value stored when the login started). The first
/// candidate that exists decides: same-origin values yield their local path,
/// anything else yields `default_route`.
pub fn resolve_post_login_target(
    callback_url: &Url,
    carried_return_url: Option<&str>,
    app_origin: &Origin,
    default_route: &str,
) -> String {
    let from_query = callback_url
        .query_pairs()
        .find(|(key, _)| key == RETURN_TO_PARAM)
        .map(|(_, value)| value.into_owned());
    let candidate = match from_query.as_deref().or(carried_return_url) {
        Some(candidate) => candidate,
        None => return default_route.to_string(),
    };
    local_target(candidate, app_origin).unwrap_or_else(|| {
        tracing::warn!(target_url = %candidate, "ignoring cross-origin post-login target");
        default_route.to_string()
    })
}

fn local_target(candidate: &str, app_origin: &Origin) -> Option<String> {
    let candidate = candidate.trim();
    if candidate.starts_with('/') && !candidate.starts_with("//") && !candidate.contains('\\') {
        return Some(candidate.to_string());
    }
    let parsed = Url::parse(candidate).ok()?;
    if &parsed.origin() != app_origin {
        return None;
    }
    let mut target = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        target.push('?');
        target.push_str(query);
    }
    if let Some(fragment) = parsed.fragment() {
        target.push('#');
        target.push_str(fragment);
    }
    Some(target)
}
