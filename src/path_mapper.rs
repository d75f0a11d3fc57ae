/// Rewrites absolute paths using a list of (from, to) prefix rules.
///
/// Intentionally naive: byte-wise prefix match, no case folding, no path
/// normalization. The caller is expected to supply correctly-cased prefixes
/// per host. Rules must already be sorted longest-`from`-first (done once at
/// [`crate::config::Config`] load time) so that a longer, more specific
/// prefix always wins over a shorter one that also matches.
pub fn map_path(rules: &[(String, String)], candidate: &str) -> String {
    for (from, to) in rules {
        if candidate.starts_with(from.as_str()) {
            return format!("{to}{}", &candidate[from.len()..]);
        }
    }
    candidate.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmatched_path_is_returned_unchanged() {
        let rules = vec![("/media".to_string(), "/mnt/media".to_string())];
        assert_eq!(map_path(&rules, "/other/x.mkv"), "/other/x.mkv");
    }

    #[test]
    fn matched_prefix_is_rewritten() {
        let rules = vec![("/media".to_string(), "/mnt/media".to_string())];
        assert_eq!(
            map_path(&rules, "/media/movies/x.mkv"),
            "/mnt/media/movies/x.mkv"
        );
    }

    #[test]
    fn longest_prefix_wins_when_sorted_first() {
        // Caller is responsible for the longest-first sort; this test
        // documents that the mapper itself just takes the first match.
        let rules = vec![
            ("/config/cache".to_string(), "/mnt/cache".to_string()),
            ("/config".to_string(), "/mnt/config".to_string()),
        ];
        assert_eq!(
            map_path(&rules, "/config/cache/thumbs/1.jpg"),
            "/mnt/cache/thumbs/1.jpg"
        );
        assert_eq!(
            map_path(&rules, "/config/other/1.jpg"),
            "/mnt/config/other/1.jpg"
        );
    }

    #[test]
    fn no_case_folding_or_separator_translation() {
        let rules = vec![("/Media".to_string(), "/mnt/media".to_string())];
        assert_eq!(map_path(&rules, "/media/x.mkv"), "/media/x.mkv");
    }
}
