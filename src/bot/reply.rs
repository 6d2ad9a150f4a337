//! Parsing of the in-band envelope conventions in model replies.
//!
//! - `...</think>rest`: everything up to the closing think tag is a reasoning
//!   trace and is dropped.
//! - `[IMAGE]<path>[/IMAGE]caption`: a local image to send, then the caption.
//! - `a \ b \ c`: a backslash splits the reply into separately sent parts.

const THINK_CLOSE: &str = "</think>";
const IMAGE_OPEN: &str = "[IMAGE]";
const IMAGE_CLOSE: &str = "[/IMAGE]";
const SEGMENT_SEPARATOR: char = '\\';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedReply {
    Image { path: String, caption: String },
    Segments(Vec<String>),
    Single(String),
}

/// Drop a leading reasoning trace, if present.
pub fn strip_thinking(reply: &str) -> &str {
    match reply.split_once(THINK_CLOSE) {
        Some((_, rest)) => rest.trim(),
        None => reply,
    }
}

/// Wrap a local image path and caption in the image envelope.
pub fn image_envelope(path: &str, caption: &str) -> String {
    format!("{IMAGE_OPEN}{path}{IMAGE_CLOSE}\n{caption}")
}

/// Classify an already think-stripped reply. Image envelope wins over segments.
pub fn parse(reply: &str) -> ParsedReply {
    if let Some((_, after_open)) = reply.split_once(IMAGE_OPEN) {
        let (path, caption) = after_open.split_once(IMAGE_CLOSE).unwrap_or((after_open, ""));
        return ParsedReply::Image {
            path: path.trim().to_string(),
            caption: caption.trim().to_string(),
        };
    }

    if reply.contains(SEGMENT_SEPARATOR) {
        let parts = reply
            .split(SEGMENT_SEPARATOR)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(String::from)
            .collect();
        return ParsedReply::Segments(parts);
    }

    ParsedReply::Single(reply.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_thinking() {
        assert_eq!(strip_thinking("<think>hmm</think>\n  好的"), "好的");
        assert_eq!(strip_thinking("no trace"), "no trace");
        assert_eq!(strip_thinking("a</think>b</think>c"), "b</think>c");
    }

    #[test]
    fn test_image_envelope_with_caption() {
        let reply = image_envelope("/tmp/image_1.jpg", "这是图片\\(^o^)/~");
        assert_eq!(
            parse(&reply),
            ParsedReply::Image {
                path: "/tmp/image_1.jpg".into(),
                caption: "这是图片\\(^o^)/~".into()
            }
        );
    }

    #[test]
    fn test_image_envelope_without_close_tag() {
        assert_eq!(
            parse("[IMAGE] /tmp/x.png "),
            ParsedReply::Image { path: "/tmp/x.png".into(), caption: String::new() }
        );
    }

    #[test]
    fn test_segments_trimmed_and_non_empty() {
        assert_eq!(
            parse("早上好 \\ \\ 今天也要加油哦\\  "),
            ParsedReply::Segments(vec!["早上好".into(), "今天也要加油哦".into()])
        );
    }

    #[test]
    fn test_single() {
        assert_eq!(parse("晚安"), ParsedReply::Single("晚安".into()));
    }
}
