use sha2::{Digest, Sha256};

use crate::models::{StyleFlag, ValidatedRequest};

fn style_directive(flag: StyleFlag) -> &'static str {
    match flag {
        StyleFlag::UseEmoji => "Use emoji where appropriate.",
        StyleFlag::SimpleLanguage => "Use simple, direct language.",
        StyleFlag::AcademicLanguage => "Use academic, formal language.",
        StyleFlag::BulletPoints => "Organize the content as key bullet points.",
        StyleFlag::DiscussionQuestions => "Add discussion questions at the end of the content.",
    }
}

/// Assemble the generation prompt. Line order is part of the fingerprint:
/// type and topic, length, style directives in canonical order, then custom
/// fields in the order they were supplied.
pub fn build_prompt(request: &ValidatedRequest) -> String {
    let mut prompt = format!(
        "Please write {} about the following topic: {}.\n",
        request.content_type.label(),
        request.topic
    );
    prompt.push_str(&format!("Requested length: {}.\n", request.length.label()));

    for flag in &request.styles {
        prompt.push_str(style_directive(*flag));
        prompt.push('\n');
    }

    for (key, value) in &request.custom_fields {
        prompt.push_str(&format!("{key}: {value}.\n"));
    }

    prompt.trim().to_string()
}

/// Stable cache key for a prompt.
pub fn fingerprint(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    format!("sha256:{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::models::{ContentLength, ContentType};

    fn request() -> ValidatedRequest {
        ValidatedRequest {
            topic: "Solar energy".to_string(),
            content_type: ContentType::Leaflet,
            length: ContentLength::Medium,
            styles: BTreeSet::new(),
            custom_fields: Vec::new(),
            chat_id: None,
            user_id: None,
        }
    }

    #[test]
    fn builds_base_prompt() {
        assert_eq!(
            build_prompt(&request()),
            "Please write a leaflet about the following topic: Solar energy.\nRequested length: medium."
        );
    }

    #[test]
    fn style_lines_follow_canonical_order() {
        let mut req = request();
        // insertion order deliberately reversed
        req.styles.insert(StyleFlag::DiscussionQuestions);
        req.styles.insert(StyleFlag::UseEmoji);
        req.styles.insert(StyleFlag::BulletPoints);

        let prompt = build_prompt(&req);
        let emoji = prompt.find("emoji").unwrap();
        let bullets = prompt.find("bullet points").unwrap();
        let questions = prompt.find("discussion questions").unwrap();
        assert!(emoji < bullets && bullets < questions);
    }

    #[test]
    fn custom_fields_keep_supplied_order() {
        let mut req = request();
        req.custom_fields = vec![
            ("Audience".to_string(), "students".to_string()),
            ("Region".to_string(), "Morocco".to_string()),
        ];
        let prompt = build_prompt(&req);
        assert!(prompt.ends_with("Audience: students.\nRegion: Morocco."));
    }

    #[test]
    fn prompt_and_fingerprint_are_deterministic() {
        let mut req = request();
        req.styles = [StyleFlag::SimpleLanguage, StyleFlag::AcademicLanguage].into_iter().collect();
        let a = build_prompt(&req);
        let b = build_prompt(&req.clone());
        assert_eq!(a, b);
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }

    #[test]
    fn requester_identity_does_not_affect_fingerprint() {
        let mut other = request();
        other.user_id = Some(7);
        other.chat_id = Some(70);
        assert_eq!(fingerprint(&build_prompt(&request())), fingerprint(&build_prompt(&other)));
    }

    #[test]
    fn fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint("abc"),
            "sha256:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
