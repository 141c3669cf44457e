//! Re-homing of source paths recorded on another machine.

use common::{CoverageError, Result};
use regex::Regex;

/// An ordered list of path-prefix aliases applied while merging data files.
///
/// Each alias maps a leading directory (glob-style, `*` and `?` wildcards)
/// to a local replacement. `map` applies the first matching alias and leaves
/// unmatched paths untouched, so it is always safe to call.
#[derive(Debug, Default)]
pub struct PathAliases {
    aliases: Vec<(Regex, String)>,
}

impl PathAliases {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `pattern` -> `result`. Aliases apply in registration order.
    pub fn add(&mut self, pattern: &str, result: &str) -> Result<()> {
        let pattern = pattern.trim_end_matches(['/', '\\']);
        if pattern.is_empty() {
            return Err(CoverageError::Config(
                "Path alias pattern can't be empty".to_string(),
            ));
        }
        let regex = prefix_pattern_to_regex(pattern)?;
        let mut result = result.trim_end_matches(['/', '\\']).to_string();
        result.push('/');
        self.aliases.push((regex, result));
        Ok(())
    }

    /// Map `path` through the aliases: the matched leading directory is
    /// replaced, the relative remainder is kept.
    pub fn map(&self, path: &str) -> String {
        for (regex, result) in &self.aliases {
            if let Some(found) = regex.find(path) {
                return format!("{result}{}", &path[found.end()..]);
            }
        }
        path.to_string()
    }
}

/// Compile a glob-style directory prefix into an anchored regex that
/// consumes the prefix and its trailing separator.
fn prefix_pattern_to_regex(pattern: &str) -> Result<Regex> {
    let mut rx = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '*' => rx.push_str(".*"),
            '?' => rx.push('.'),
            '/' | '\\' => rx.push_str(r"[/\\]"),
            other => rx.push_str(&regex::escape(&other.to_string())),
        }
    }
    rx.push_str(r"[/\\]");
    Regex::new(&rx)
        .map_err(|e| CoverageError::Config(format!("Invalid path alias pattern '{pattern}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmatched_paths_pass_through() {
        let aliases = PathAliases::new();
        assert_eq!(aliases.map("/src/a.py"), "/src/a.py");

        let mut aliases = PathAliases::new();
        aliases.add("/remote/src", "/local/src").unwrap();
        assert_eq!(aliases.map("/other/src/a.py"), "/other/src/a.py");
    }

    #[test]
    fn prefix_is_replaced() {
        let mut aliases = PathAliases::new();
        aliases.add("/remote/src", "/local/src").unwrap();
        assert_eq!(aliases.map("/remote/src/a.py"), "/local/src/a.py");
        assert_eq!(aliases.map("/remote/src/pkg/b.py"), "/local/src/pkg/b.py");
        // The alias names a whole directory, not a string prefix.
        assert_eq!(aliases.map("/remote/srcs/a.py"), "/remote/srcs/a.py");
    }

    #[test]
    fn first_matching_alias_wins() {
        let mut aliases = PathAliases::new();
        aliases.add("/ci/*/project", "/home/dev/project").unwrap();
        aliases.add("/ci", "/elsewhere").unwrap();
        assert_eq!(
            aliases.map("/ci/build7/project/main.py"),
            "/home/dev/project/main.py"
        );
        assert_eq!(aliases.map("/ci/other.py"), "/elsewhere/other.py");
    }

    #[test]
    fn windows_separators_match() {
        let mut aliases = PathAliases::new();
        aliases.add(r"c:\agent\work", "/home/build").unwrap();
        assert_eq!(aliases.map(r"c:\agent\work\src\a.py"), r"/home/build/src\a.py");
    }

    #[test]
    fn question_mark_matches_one_char() {
        let mut aliases = PathAliases::new();
        aliases.add("/node?", "/nodes").unwrap();
        assert_eq!(aliases.map("/node1/x.py"), "/nodes/x.py");
        assert_eq!(aliases.map("/node12/x.py"), "/node12/x.py");
    }

    #[test]
    fn empty_pattern_is_rejected() {
        let mut aliases = PathAliases::new();
        assert!(aliases.add("", "/local").is_err());
        assert!(aliases.add("///", "/local").is_err());
    }
}
