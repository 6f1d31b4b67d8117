//! `.gitignore` parsing and the per-walk ignore stack.
//!
//! The diff engine pushes one frame per directory containing a
//! `.gitignore`; classification of an untracked path consults frames from
//! the innermost outward, and within a file the last matching rule wins.
//! Reserved subtrees (`.hg`, `.eden`) are *hidden*: they are dropped from
//! diff output entirely rather than reported as ignored.

use std::sync::Arc;

use bstr::{BStr, BString, ByteSlice};
use glob::{MatchOptions, Pattern};
use tracing::debug;

/// Directory names that never appear in diff output.
pub const HIDDEN_NAMES: &[&[u8]] = &[b".hg", b".eden"];

/// Classification of a path against the ignore stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreStatus {
    Ignored,
    NotIgnored,
    /// Reserved subtree: drop the entry entirely.
    Hidden,
}

struct Rule {
    pattern: Pattern,
    /// `!pattern`: re-includes a previously ignored path.
    negated: bool,
    /// `pattern/`: matches directories only.
    dir_only: bool,
    /// Patterns with an interior slash are anchored to the ignore file's
    /// directory; bare names match the basename at any depth.
    anchored: bool,
}

/// One parsed `.gitignore` file.
#[derive(Default)]
pub struct GitIgnoreFile {
    rules: Vec<Rule>,
}

impl GitIgnoreFile {
    pub fn parse(contents: &[u8]) -> Self {
        let mut rules = Vec::new();
        for line in contents.split_str(b"\n") {
            if let Some(rule) = parse_line(line) {
                rules.push(rule);
            }
        }
        GitIgnoreFile { rules }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Matches `rel_path` (relative to this file's directory) against the
    /// rules. `None` means no rule matched.
    fn status(&self, rel_path: &BStr, is_dir: bool) -> Option<IgnoreStatus> {
        let Ok(path_str) = std::str::from_utf8(rel_path) else {
            // Non-UTF-8 paths can't match textual patterns.
            return None;
        };
        let basename = rel_path
            .rsplit_str(b"/")
            .next()
            .and_then(|b| std::str::from_utf8(b).ok())
            .unwrap_or(path_str);

        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        // Last matching rule wins.
        for rule in self.rules.iter().rev() {
            if rule.dir_only && !is_dir {
                continue;
            }
            let matched = if rule.anchored {
                rule.pattern.matches_with(path_str, options)
            } else {
                rule.pattern.matches_with(basename, options)
                    || rule.pattern.matches_with(path_str, options)
            };
            if matched {
                return Some(if rule.negated {
                    IgnoreStatus::NotIgnored
                } else {
                    IgnoreStatus::Ignored
                });
            }
        }
        None
    }
}

fn parse_line(line: &[u8]) -> Option<Rule> {
    // Trailing unescaped whitespace is insignificant.
    let mut line = line;
    while let Some((&last, rest)) = line.split_last() {
        if last == b' ' && !rest.ends_with(b"\\") {
            line = rest;
        } else {
            break;
        }
    }
    if line.is_empty() || line.starts_with(b"#") {
        return None;
    }

    let mut negated = false;
    if let Some(rest) = line.strip_prefix(b"!") {
        negated = true;
        line = rest;
    }
    // An escaped leading `!` or `#` is literal.
    if line.starts_with(b"\\!") || line.starts_with(b"\\#") {
        line = &line[1..];
    }

    let mut dir_only = false;
    if let Some(rest) = line.strip_suffix(b"/") {
        dir_only = true;
        line = rest;
    }

    let mut anchored = line.contains(&b'/');
    if let Some(rest) = line.strip_prefix(b"/") {
        line = rest;
        anchored = true;
    }

    let text = std::str::from_utf8(line).ok()?;
    match Pattern::new(text) {
        Ok(pattern) => Some(Rule {
            pattern,
            negated,
            dir_only,
            anchored,
        }),
        Err(e) => {
            debug!(pattern = text, error = %e, "skipping unparseable ignore pattern");
            None
        }
    }
}

/// A frame of the per-walk ignore stack: the `.gitignore` of one directory
/// plus a link to the frames above it.
pub struct IgnoreStack {
    parent: Option<Arc<IgnoreStack>>,
    /// Path of the directory this frame belongs to, relative to the mount
    /// root; empty for the root itself.
    base_path: BString,
    file: Option<GitIgnoreFile>,
}

impl IgnoreStack {
    /// The stack for the mount root, before any `.gitignore` is loaded.
    pub fn root() -> Arc<Self> {
        Arc::new(IgnoreStack {
            parent: None,
            base_path: BString::default(),
            file: None,
        })
    }

    /// Pushes a directory's ignore file (or a placeholder when it has
    /// none, to keep path bookkeeping uniform).
    pub fn push(
        self: &Arc<Self>,
        base_path: BString,
        file: Option<GitIgnoreFile>,
    ) -> Arc<IgnoreStack> {
        Arc::new(IgnoreStack {
            parent: Some(self.clone()),
            base_path,
            file,
        })
    }

    /// Classifies a path (relative to the mount root).
    pub fn status(&self, path: &BStr, is_dir: bool) -> IgnoreStatus {
        // Reserved subtrees are hidden at any depth.
        if let Some(first) = path.split_str(b"/").next() {
            if HIDDEN_NAMES.contains(&first) {
                return IgnoreStatus::Hidden;
            }
        }

        let mut frame = Some(self);
        while let Some(stack) = frame {
            if let Some(file) = &stack.file {
                let rel: &BStr = if stack.base_path.is_empty() {
                    path
                } else if let Some(rest) = path
                    .strip_prefix(stack.base_path.as_slice())
                    .and_then(|r| r.strip_prefix(b"/"))
                {
                    rest.as_bstr()
                } else {
                    frame = stack.parent.as_deref();
                    continue;
                };
                if let Some(status) = file.status(rel, is_dir) {
                    return status;
                }
            }
            frame = stack.parent.as_deref();
        }
        IgnoreStatus::NotIgnored
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn stack_with(contents: &str) -> Arc<IgnoreStack> {
        IgnoreStack::root().push(
            BString::default(),
            Some(GitIgnoreFile::parse(contents.as_bytes())),
        )
    }

    #[rstest]
    #[case("*.o", "main.o", false, IgnoreStatus::Ignored)]
    #[case("*.o", "src/deep/main.o", false, IgnoreStatus::Ignored)]
    #[case("*.o", "main.c", false, IgnoreStatus::NotIgnored)]
    #[case("build/", "build", true, IgnoreStatus::Ignored)]
    #[case("build/", "build", false, IgnoreStatus::NotIgnored)]
    #[case("/top.txt", "top.txt", false, IgnoreStatus::Ignored)]
    #[case("/top.txt", "sub/top.txt", false, IgnoreStatus::NotIgnored)]
    #[case("docs/*.md", "docs/a.md", false, IgnoreStatus::Ignored)]
    #[case("docs/*.md", "other/docs/a.md", false, IgnoreStatus::NotIgnored)]
    fn basic_patterns(
        #[case] pattern: &str,
        #[case] path: &str,
        #[case] is_dir: bool,
        #[case] expected: IgnoreStatus,
    ) {
        let stack = stack_with(pattern);
        assert_eq!(stack.status(path.into(), is_dir), expected);
    }

    #[test]
    fn last_matching_rule_wins() {
        let stack = stack_with("*.log\n!keep.log\n");
        assert_eq!(
            stack.status("debug.log".into(), false),
            IgnoreStatus::Ignored
        );
        assert_eq!(
            stack.status("keep.log".into(), false),
            IgnoreStatus::NotIgnored
        );
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        let file = GitIgnoreFile::parse(b"# comment\n\n  \n*.tmp\n");
        assert_eq!(file.rules.len(), 1);
    }

    #[test]
    fn inner_frames_override_outer_ones() {
        let outer = stack_with("*.gen");
        let inner = outer.push(
            "sub".into(),
            Some(GitIgnoreFile::parse(b"!special.gen\n")),
        );
        assert_eq!(
            inner.status("sub/other.gen".into(), false),
            IgnoreStatus::Ignored
        );
        assert_eq!(
            inner.status("sub/special.gen".into(), false),
            IgnoreStatus::NotIgnored
        );
    }

    #[test]
    fn reserved_subtrees_are_hidden() {
        let stack = IgnoreStack::root();
        assert_eq!(
            stack.status(".hg/store".into(), false),
            IgnoreStatus::Hidden
        );
        assert_eq!(stack.status(".eden".into(), true), IgnoreStatus::Hidden);
        assert_eq!(
            stack.status("src/main.rs".into(), false),
            IgnoreStatus::NotIgnored
        );
    }
}
