/*
 * SPDX-FileCopyrightText: 2026 Tanzaku Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Extraction over pre-parsed body tokens. The markup parser itself lives
//! outside this crate; it hands us a flat token list per source (body, CW,
//! poll choices) and we pull out the semantic references.

pub const MAX_TAG_LENGTH: usize = 128;
pub const MAX_TAGS: usize = 64;

/// Output contract of the external markup parser.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Text(String),
    Hashtag(String),
    EmojiCode(String),
    Mention { username: String, host: Option<String> },
}

/// Minimal reference tokenizer. The full markup grammar lives outside this
/// crate; anything that produces `Token`s can stand in for this. Recognizes
/// whitespace-separated `#hashtag`, `:emoji:` and `@user`/`@user@host`
/// words.
pub fn parse_basic(text: &str) -> Vec<Token> {
    let mut out = Vec::new();
    for word in text.split_whitespace() {
        if let Some(tag) = word.strip_prefix('#') {
            if !tag.is_empty() {
                out.push(Token::Hashtag(tag.to_string()));
                continue;
            }
        }
        if word.len() > 2 && word.starts_with(':') && word.ends_with(':') {
            let name = &word[1..word.len() - 1];
            if !name.is_empty() && !name.contains(':') {
                out.push(Token::EmojiCode(name.to_string()));
                continue;
            }
        }
        if let Some(rest) = word.strip_prefix('@') {
            let mut parts = rest.splitn(2, '@');
            let username = parts.next().unwrap_or_default();
            if !username.is_empty() {
                out.push(Token::Mention {
                    username: username.to_string(),
                    host: parts.next().filter(|h| !h.is_empty()).map(str::to_string),
                });
                continue;
            }
        }
        out.push(Token::Text(word.to_string()));
    }
    out
}

/// Deduplicated hashtags in first-seen order, case preserved. Tags longer
/// than 128 chars are dropped entirely; the list is truncated to 64.
pub fn extract_hashtags(tokens: &[Token]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for t in tokens {
        if let Token::Hashtag(tag) = t {
            if tag.chars().count() > MAX_TAG_LENGTH {
                continue;
            }
            if !out.iter().any(|x| x == tag) {
                out.push(tag.clone());
            }
        }
    }
    out.truncate(MAX_TAGS);
    out
}

/// Lowercased variant kept alongside the display form for lookup.
pub fn normalize_tag(tag: &str) -> String {
    tag.to_lowercase()
}

pub fn extract_emojis(tokens: &[Token]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for t in tokens {
        if let Token::EmojiCode(name) = t {
            if !out.iter().any(|x| x == name) {
                out.push(name.clone());
            }
        }
    }
    out
}

/// Raw `{username, host}` pairs, deduplicated. Resolution to concrete users
/// happens in the pipeline (it needs the user resolver collaborator).
pub fn extract_mentions(tokens: &[Token]) -> Vec<(String, Option<String>)> {
    let mut out: Vec<(String, Option<String>)> = Vec::new();
    for t in tokens {
        if let Token::Mention { username, host } = t {
            let pair = (username.clone(), host.clone());
            if !out.contains(&pair) {
                out.push(pair);
            }
        }
    }
    out
}

/// Recognizes the short-lived-note tag convention `exp<1..=6 digits><s|m|h|d>`
/// and returns the delay in milliseconds, clamped to [5 seconds, 7 days].
pub fn parse_expire_tag(tag: &str) -> Option<i64> {
    let rest = tag.strip_prefix("exp")?;
    if rest.len() < 2 {
        return None;
    }
    let (digits, unit) = rest.split_at(rest.len() - 1);
    if digits.is_empty() || digits.len() > 6 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let n: i64 = digits.parse().ok()?;
    let ms = match unit {
        "s" => n * 1_000,
        "m" => n * 60_000,
        "h" => n * 3_600_000,
        "d" => n * 86_400_000,
        _ => return None,
    };
    Some(ms.clamp(5_000, 7 * 86_400_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(s: &str) -> Token {
        Token::Hashtag(s.to_string())
    }

    #[test]
    fn hashtags_dedupe_and_cap() {
        let mut tokens: Vec<Token> = (0..70).map(|i| tag(&format!("tag{i}"))).collect();
        tokens.push(tag("tag0"));
        let tags = extract_hashtags(&tokens);
        assert_eq!(tags.len(), MAX_TAGS);
        assert_eq!(tags[0], "tag0");
        assert!(tags.iter().all(|t| t.chars().count() <= MAX_TAG_LENGTH));
    }

    #[test]
    fn oversized_hashtag_dropped_entirely() {
        let long = "x".repeat(200);
        let tags = extract_hashtags(&[tag(&long), tag("ok")]);
        assert_eq!(tags, vec!["ok".to_string()]);
    }

    #[test]
    fn hashtag_case_preserved() {
        let tags = extract_hashtags(&[tag("RustLang")]);
        assert_eq!(tags, vec!["RustLang".to_string()]);
        assert_eq!(normalize_tag(&tags[0]), "rustlang");
    }

    #[test]
    fn emojis_and_mentions_dedupe() {
        let tokens = vec![
            Token::EmojiCode("blobcat".into()),
            Token::EmojiCode("blobcat".into()),
            Token::Mention {
                username: "alice".into(),
                host: None,
            },
            Token::Mention {
                username: "alice".into(),
                host: None,
            },
            Token::Mention {
                username: "alice".into(),
                host: Some("remote.example".into()),
            },
        ];
        assert_eq!(extract_emojis(&tokens), vec!["blobcat".to_string()]);
        assert_eq!(extract_mentions(&tokens).len(), 2);
    }

    #[test]
    fn basic_tokenizer() {
        let tokens = parse_basic("hello #world :blobcat: @alice @bob@remote.example");
        assert_eq!(
            tokens,
            vec![
                Token::Text("hello".into()),
                Token::Hashtag("world".into()),
                Token::EmojiCode("blobcat".into()),
                Token::Mention {
                    username: "alice".into(),
                    host: None
                },
                Token::Mention {
                    username: "bob".into(),
                    host: Some("remote.example".into())
                },
            ]
        );
    }

    #[test]
    fn expire_tag_parse_and_clamp() {
        assert_eq!(parse_expire_tag("exp10m"), Some(600_000));
        assert_eq!(parse_expire_tag("exp1s"), Some(5_000));
        assert_eq!(parse_expire_tag("exp999d"), Some(7 * 86_400_000));
        assert_eq!(parse_expire_tag("exp"), None);
        assert_eq!(parse_expire_tag("expx5s"), None);
        assert_eq!(parse_expire_tag("exp1234567s"), None);
        assert_eq!(parse_expire_tag("hello"), None);
    }
}
