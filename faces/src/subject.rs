use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::source::Source;

const MAX_NAME_LEN: usize = 160;

/// A named person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub uid: String,
    pub name: String,
    pub slug: String,
    pub subj_src: Source,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subject {
    /// Returns `None` if the name is empty after sanitizing.
    pub fn new(name: &str, src: Source) -> Option<Subject> {
        let name = sanitize_name(name);
        if name.is_empty() {
            return None;
        }
        let now = Utc::now();
        Some(Subject {
            uid: new_uid('j'),
            slug: slugify(&name),
            name,
            subj_src: src,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn set_name(&mut self, name: &str) -> bool {
        let name = sanitize_name(name);
        if name.is_empty() || name == self.name {
            return false;
        }
        self.slug = slugify(&name);
        self.name = name;
        self.updated_at = Utc::now();
        true
    }
}

/// Trims, collapses inner whitespace and drops control characters.
pub fn sanitize_name(name: &str) -> String {
    let cleaned: String = name.chars().filter(|c| !c.is_control()).collect();
    let joined = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    joined.chars().take(MAX_NAME_LEN).collect()
}

/// Lowercase name with runs of non-alphanumerics folded into `-`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut dash = false;
    for c in name.chars().flat_map(char::to_lowercase) {
        if c.is_alphanumeric() {
            slug.push(c);
            dash = false;
        } else if !dash && !slug.is_empty() {
            slug.push('-');
            dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Random record id with a one-letter type prefix.
pub(crate) fn new_uid(prefix: char) -> String {
    format!("{prefix}{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_sanitized() {
        assert_eq!(sanitize_name("  Jane \t  Doe\u{7} "), "Jane Doe");
        assert_eq!(sanitize_name(" \n "), "");
        assert!(Subject::new("   ", Source::Manual).is_none());
    }

    #[test]
    fn slugs_fold_punctuation() {
        assert_eq!(slugify("Jane  O'Doe"), "jane-o-doe");
        assert_eq!(slugify("--Zoë!"), "zoë");
    }

    #[test]
    fn new_subject() {
        let s = Subject::new(" Ada  Lovelace ", Source::Manual).unwrap();
        assert_eq!(s.name, "Ada Lovelace");
        assert_eq!(s.slug, "ada-lovelace");
        assert!(s.uid.starts_with('j'));
        assert_eq!(s.subj_src, Source::Manual);
    }

    #[test]
    fn set_name_reports_change() {
        let mut s = Subject::new("Ada", Source::Manual).unwrap();
        assert!(!s.set_name(" Ada "));
        assert!(s.set_name("Ada L"));
        assert_eq!(s.slug, "ada-l");
    }
}
