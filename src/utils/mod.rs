//! Utility functions.

pub mod target;

pub use target::{Target, resolve_target};

/// Escape text for Telegram's HTML parse mode.
pub fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Clickable mention of a user, for HTML messages.
pub fn mention_html(user_id: u64, name: &str) -> String {
    format!("<a href=\"tg://user?id={}\">{}</a>", user_id, html_escape(name))
}

/// Whitespace-separated arguments after the command itself.
pub fn command_args(text: &str) -> Vec<&str> {
    text.split_whitespace().skip(1).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_html() {
        assert_eq!(html_escape("<b>Tom & Jerry</b>"), "&lt;b&gt;Tom &amp; Jerry&lt;/b&gt;");
    }

    #[test]
    fn mentions_escape_the_name() {
        assert_eq!(
            mention_html(42, "a<b"),
            "<a href=\"tg://user?id=42\">a&lt;b</a>"
        );
    }

    #[test]
    fn splits_arguments() {
        assert_eq!(command_args("/move @ann -1001"), vec!["@ann", "-1001"]);
        assert!(command_args("/move").is_empty());
    }
}
