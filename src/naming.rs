//! Unique names for buckets and scratch files.

use uuid::Uuid;

/// Length of the random token embedded in scratch file names.
const TEMP_TOKEN_LEN: usize = 6;

/// Build a bucket name of the form `{prefix}-{uuid-v4}`.
///
/// The prefix is not validated; it must already satisfy the backend's
/// bucket naming rules (lowercase, DNS-compatible).
pub fn generate_bucket_name(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::new_v4())
}

/// Build a scratch file name of the form `tmp_{6 hex chars}_{base_name}`.
pub fn temp_file_name(base_name: &str) -> String {
    let token = Uuid::new_v4().simple().to_string();
    format!("tmp_{}_{}", &token[..TEMP_TOKEN_LEN], base_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn bucket_name_keeps_prefix_and_separator() {
        let name = generate_bucket_name("first");
        assert!(name.starts_with("first-"));
        let suffix = &name["first-".len()..];
        assert!(Uuid::parse_str(suffix).is_ok(), "suffix {suffix} is not a uuid");
    }

    #[test]
    fn bucket_names_do_not_repeat() {
        let names: HashSet<String> = (0..10_000).map(|_| generate_bucket_name("p")).collect();
        assert_eq!(names.len(), 10_000);
    }

    #[test]
    fn empty_prefix_still_gets_separator() {
        assert!(generate_bucket_name("").starts_with('-'));
    }

    #[test]
    fn temp_file_name_layout() {
        let name = temp_file_name("firstfile.txt");
        assert!(name.starts_with("tmp_"));
        assert!(name.ends_with("_firstfile.txt"));
        let token = &name[4..4 + TEMP_TOKEN_LEN];
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(name.len(), "tmp_".len() + TEMP_TOKEN_LEN + "_firstfile.txt".len());
    }
}
