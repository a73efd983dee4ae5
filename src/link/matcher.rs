//! Pattern matching over bridge-bot replies.

use regex::Regex;

/// Extracts login URLs and detects success phrases in bot messages.
pub struct LoginMatcher {
    url_pattern: Regex,
    success_phrases: Vec<String>,
}

impl LoginMatcher {
    /// Builds a matcher for the given external-service domain and success
    /// phrase list.
    ///
    /// The URL pattern accepts `http` or `https`, an optional `www.` prefix,
    /// and anything up to the next whitespace after the domain.
    pub fn new(login_domain: &str, success_phrases: Vec<String>) -> Result<Self, regex::Error> {
        let pattern = format!(
            r"https?://(?:www\.)?{}/?[^\s]*",
            regex::escape(login_domain)
        );

        Ok(LoginMatcher {
            url_pattern: Regex::new(&pattern)?,
            success_phrases,
        })
    }

    /// Returns the first login URL in the body, if any.
    pub fn extract_login_url(&self, body: &str) -> Option<String> {
        self.url_pattern
            .find(body)
            .map(|found| found.as_str().to_owned())
    }

    /// Whether the body contains one of the success phrases.
    pub fn is_login_success(&self, body: &str) -> bool {
        self.success_phrases
            .iter()
            .any(|phrase| body.contains(phrase.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> LoginMatcher {
        LoginMatcher::new(
            "instagram.com",
            vec![
                "Successfully logged in".to_owned(),
                "Login successful".to_owned(),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_extracts_the_exact_login_url() {
        let url = matcher()
            .extract_login_url("Please login: https://instagram.com/accounts/login/?next=/")
            .unwrap();
        assert_eq!(url, "https://instagram.com/accounts/login/?next=/");
    }

    #[test]
    fn test_accepts_www_and_plain_http() {
        let m = matcher();
        assert_eq!(
            m.extract_login_url("go to http://www.instagram.com/login now").as_deref(),
            Some("http://www.instagram.com/login")
        );
    }

    #[test]
    fn test_body_without_url_yields_none() {
        assert!(matcher().extract_login_url("scan the QR code instead").is_none());
        assert!(
            matcher()
                .extract_login_url("see https://example.com/instagram")
                .is_none()
        );
    }

    #[test]
    fn test_success_phrase_detection() {
        let m = matcher();
        assert!(m.is_login_success("Successfully logged in as alice"));
        assert!(m.is_login_success("Login successful, syncing chats"));
        assert!(!m.is_login_success("Still waiting for login"));
    }

    #[test]
    fn test_domain_is_escaped_in_the_pattern() {
        // The dot must not act as a wildcard.
        let m = matcher();
        assert!(m.extract_login_url("https://instagramXcom/login").is_none());
    }
}
