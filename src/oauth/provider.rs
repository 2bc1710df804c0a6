//! Authorization URL construction.

/// Build the marketplace authorization URL.
///
/// Parameters: `response_type=code`, `client_id`, `redirect_uri` (when
/// known), `state`. The `state` value is round-tripped unmodified (only
/// percent-encoded).
pub fn build_authorization_url(
    auth_url: &str,
    client_id: &str,
    redirect_uri: Option<&str>,
    state: &str,
) -> String {
    let separator = if auth_url.contains('?') { '&' } else { '?' };
    let mut url = format!(
        "{}{}response_type=code&client_id={}",
        auth_url,
        separator,
        urlencoding::encode(client_id)
    );

    if let Some(redirect_uri) = redirect_uri {
        url.push_str("&redirect_uri=");
        url.push_str(&urlencoding::encode(redirect_uri));
    }

    url.push_str("&state=");
    url.push_str(&urlencoding::encode(state));

    url
}
