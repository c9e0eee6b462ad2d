//! Input validation utilities

use once_cell::sync::Lazy;
use regex::Regex;

/// URL slugs: lowercase words joined by single hyphens
static SLUG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+(?:-[a-z0-9]+)*$").unwrap());

/// Bare DNS domain as registered for auto-join
static DOMAIN_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?\.)+[a-z]{2,63}$").unwrap()
});

static USERNAME_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[\w.@+-]+$").unwrap());

static NON_SLUG_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Validate an organization slug
pub fn validate_slug(slug: &str) -> bool {
    !slug.is_empty() && slug.len() <= 255 && SLUG_REGEX.is_match(slug)
}

/// Validate an email domain
pub fn validate_email_domain(domain: &str) -> bool {
    domain.len() <= 253 && DOMAIN_REGEX.is_match(domain)
}

/// Validate a username
pub fn validate_username(username: &str) -> bool {
    !username.is_empty() && username.len() <= 150 && USERNAME_REGEX.is_match(username)
}

/// Derive a slug from a display name
pub fn slugify(name: &str) -> String {
    NON_SLUG_CHARS
        .replace_all(&name.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}
