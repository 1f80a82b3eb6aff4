//! Grapheme-cluster boundaries and display widths.

use unicode_segmentation::{GraphemeCursor, GraphemeIncomplete};
use unicode_width::UnicodeWidthStr;

/// Decides whether a cluster ends before the next codepoint.
pub trait GraphemeBoundary: Send + Sync {
    /// `cluster` is the non-empty cluster accumulated so far.
    fn is_boundary(&self, cluster: &str, next: char) -> bool;
}

/// Extended grapheme clusters as defined by UAX #29.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnicodeBoundary;

impl GraphemeBoundary for UnicodeBoundary {
    fn is_boundary(&self, cluster: &str, next: char) -> bool {
        let Some(last) = cluster.chars().next_back() else {
            return false;
        };
        // Earlier context is supplied only on request.
        let prefix = &cluster[..cluster.len() - last.len_utf8()];
        let mut pair = String::with_capacity(8);
        pair.push(last);
        pair.push(next);

        let mut cursor = GraphemeCursor::new(cluster.len(), cluster.len() + next.len_utf8(), true);
        loop {
            match cursor.is_boundary(&pair, prefix.len()) {
                Ok(boundary) => return boundary,
                Err(GraphemeIncomplete::PreContext(end)) if end > 0 && end <= prefix.len() => {
                    cursor.provide_context(&prefix[..end], 0);
                }
                Err(_) => return true,
            }
        }
    }
}

/// Treats every codepoint as its own cluster.
#[derive(Debug, Default, Clone, Copy)]
pub struct CodepointBoundary;

impl GraphemeBoundary for CodepointBoundary {
    fn is_boundary(&self, _cluster: &str, _next: char) -> bool {
        true
    }
}

/// Whether a cluster terminates its line (`"\n"` or `"\r\n"`).
pub fn ends_line(cluster: &str) -> bool {
    cluster.ends_with('\n')
}

pub fn is_tab(cluster: &str) -> bool {
    cluster == "\t"
}

/// Position-independent display width of a cluster. Tabs are handled by the
/// caller since their width depends on the column.
pub fn display_width(cluster: &str) -> usize {
    UnicodeWidthStr::width(cluster)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combining_mark_extends_cluster() {
        assert!(!UnicodeBoundary.is_boundary("e", '\u{301}'));
        assert!(UnicodeBoundary.is_boundary("e\u{301}", 'x'));
    }

    #[test]
    fn test_crlf_is_one_cluster() {
        assert!(!UnicodeBoundary.is_boundary("\r", '\n'));
        assert!(UnicodeBoundary.is_boundary("\r\n", 'a'));
        assert!(ends_line("\r\n"));
    }

    #[test]
    fn test_regional_indicators_pair() {
        let flag_half = "\u{1F1EB}";
        assert!(!UnicodeBoundary.is_boundary(flag_half, '\u{1F1F7}'));
        assert!(UnicodeBoundary.is_boundary("\u{1F1EB}\u{1F1F7}", '\u{1F1E9}'));
    }

    #[test]
    fn test_emoji_zwj_sequence_stays_joined() {
        let family = "\u{1F468}\u{200D}\u{1F469}";
        assert!(!UnicodeBoundary.is_boundary("\u{1F468}", '\u{200D}'));
        assert!(!UnicodeBoundary.is_boundary("\u{1F468}\u{200D}", '\u{1F469}'));
        assert!(UnicodeBoundary.is_boundary(family, 'a'));
    }

    #[test]
    fn test_long_combining_run_is_linear() {
        let mut cluster = String::from("a");
        let start = std::time::Instant::now();
        for _ in 0..50_000 {
            assert!(!UnicodeBoundary.is_boundary(&cluster, '\u{301}'));
            cluster.push('\u{301}');
        }
        assert!(UnicodeBoundary.is_boundary(&cluster, 'b'));
        assert!(start.elapsed() < std::time::Duration::from_secs(5));
    }

    #[test]
    fn test_widths() {
        assert_eq!(display_width("a"), 1);
        assert_eq!(display_width("中"), 2);
        assert_eq!(display_width("e\u{301}"), 1);
    }
}
