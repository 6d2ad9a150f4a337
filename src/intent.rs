//! Keyword and pattern based intent detection for inbound chat text.
//!
//! All checks are pure. A single text can satisfy several predicates at once;
//! `classify` resolves that with a fixed precedence (voice, emoji, image).

use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    VoiceRequest,
    EmojiRequest,
    ImageRequest,
    PlainChat,
}

/// First-match classification: voice > emoji > image > plain.
pub fn classify(text: &str) -> Intent {
    if is_voice_request(text) {
        Intent::VoiceRequest
    } else if is_emoji_request(text) {
        Intent::EmojiRequest
    } else if is_image_request(text) {
        Intent::ImageRequest
    } else {
        Intent::PlainChat
    }
}

static IMAGE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"画.*[猫狗人物花草山水]",
        r"画.*[一个张只条串份副幅]",
        r"帮.*画.*",
        r"给.*画.*",
        r"生成.*图",
        r"创建.*图",
        r"能.*画.*吗",
        r"可以.*画.*吗",
        r"要.*[张个幅].*图",
        r"想要.*图",
        r"做[一个张]*.*图",
        r"画画",
        r"画一画",
    ]
    .into_iter()
    .map(|p| Regex::new(p).expect("static image pattern"))
    .collect()
});

const DRAW_VERBS: &[&str] = &["画", "绘", "生成", "创建", "做"];
const IMAGE_NOUNS: &[&str] = &["图", "图片", "画", "照片", "插画", "像"];
const QUANTIFIERS: &[&str] = &["一下", "一个", "一张", "个", "张", "幅"];

const IMAGE_PHRASES: &[&str] = &[
    "帮我画", "给我画", "帮画", "给画",
    "能画吗", "可以画吗", "会画吗",
    "想要图", "要图", "需要图",
];

pub fn is_image_request(text: &str) -> bool {
    if IMAGE_PATTERNS.iter().any(|re| re.is_match(text)) {
        return true;
    }

    // verb+noun, verb+quantifier+noun, verb+noun+quantifier
    for verb in DRAW_VERBS {
        for noun in IMAGE_NOUNS {
            if text.contains(&format!("{verb}{noun}")) {
                return true;
            }
            for q in QUANTIFIERS {
                if text.contains(&format!("{verb}{q}{noun}")) || text.contains(&format!("{verb}{noun}{q}")) {
                    return true;
                }
            }
        }
    }

    IMAGE_PHRASES.iter().any(|phrase| text.contains(phrase))
}

const EMOJI_KEYWORDS: &[&str] = &["表情包", "表情", "斗图", "gif", "动图"];

const EMOTION_KEYWORDS: &[&str] = &[
    "开心", "难过", "生气", "委屈", "高兴", "伤心",
    "哭", "笑", "怒", "喜", "悲", "乐", "泪", "哈哈",
    "呜呜", "嘿嘿", "嘻嘻", "哼", "啊啊", "呵呵", "可爱",
];

pub fn is_emoji_request(text: &str) -> bool {
    let lower = text.to_lowercase();
    EMOJI_KEYWORDS.iter().any(|k| lower.contains(k)) || EMOTION_KEYWORDS.iter().any(|k| text.contains(k))
}

const VOICE_KEYWORDS: &[&str] = &["语音", "说话", "念", "读", "朗读", "播放", "声音"];

pub fn is_voice_request(text: &str) -> bool {
    VOICE_KEYWORDS.iter().any(|k| text.contains(k))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_draw_a_cat_is_image_request() {
        assert!(is_image_request("画一只猫"));
        assert!(!is_emoji_request("画一只猫"));
        assert!(!is_voice_request("画一只猫"));
        assert_eq!(classify("画一只猫"), Intent::ImageRequest);
    }

    #[test]
    fn test_happy_today_is_emoji_request() {
        assert!(is_emoji_request("今天好开心"));
        assert!(!is_image_request("今天好开心"));
        assert_eq!(classify("今天好开心"), Intent::EmojiRequest);
    }

    #[test]
    fn test_image_phrasings() {
        assert!(is_image_request("帮我画个太阳"));
        assert!(is_image_request("能不能画一张风景吗"));
        assert!(is_image_request("生成一张海报图"));
        assert!(is_image_request("我想要一幅图"));
        assert!(is_image_request("绘图"));
        assert!(is_image_request("做一张图"));
        assert!(!is_image_request("你吃饭了吗"));
    }

    #[test]
    fn test_emoji_keywords_case_insensitive() {
        assert!(is_emoji_request("来个GIF"));
        assert!(is_emoji_request("斗图吗"));
        assert!(!is_emoji_request("明天见"));
    }

    #[test]
    fn test_voice_keywords() {
        assert!(is_voice_request("给我发条语音"));
        assert!(is_voice_request("读一下这段话"));
        assert!(!is_voice_request("晚安"));
    }

    #[test]
    fn test_precedence_voice_over_emoji_over_image() {
        // voice + emoji
        assert_eq!(classify("哈哈，用语音说"), Intent::VoiceRequest);
        // emoji + image
        assert!(is_image_request("画一只可爱的猫"));
        assert_eq!(classify("画一只可爱的猫"), Intent::EmojiRequest);
        assert_eq!(classify("明天天气怎么样"), Intent::PlainChat);
    }
}
