//! Secret handling utilities.
//!
//! Re-exports the secrecy types used for credentials such as the database URL,
//! and redacts credentials embedded in connection strings for display.

pub use secrecy::{ExposeSecret, SecretString};

/// Render a connection URL with any password replaced by `***`.
pub fn redact_url(url: &SecretString) -> String {
    let raw = url.expose_secret();
    let Some((scheme, rest)) = raw.split_once("://") else {
        return "***".to_string();
    };
    match rest.split_once('@') {
        Some((userinfo, host)) => {
            let user = userinfo.split(':').next().unwrap_or_default();
            format!("{scheme}://{user}:***@{host}")
        }
        None => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hides_password() {
        let url = SecretString::from("postgres://tiles:hunter2@db:5432/tiles");
        assert_eq!(redact_url(&url), "postgres://tiles:***@db:5432/tiles");
    }

    #[test]
    fn leaves_passwordless_urls_alone() {
        let url = SecretString::from("postgres://localhost/tiles");
        assert_eq!(redact_url(&url), "postgres://localhost/tiles");
        assert_eq!(redact_url(&SecretString::from("garbage")), "***");
    }
}
