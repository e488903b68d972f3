use mailparse::MailHeaderMap;

/// Resolves the conversation a message belongs to.
///
/// Precedence: `In-Reply-To`, then the first `References` entry, then the
/// message's own id. Header names match case-insensitively and folded values
/// are unfolded by the header parser.
pub fn resolve_thread_id(raw_headers: &str, own_message_id: Option<&str>) -> Option<String> {
    let from_headers = mailparse::parse_headers(raw_headers.as_bytes())
        .ok()
        .and_then(|(headers, _)| {
            headers
                .get_first_value("In-Reply-To")
                .as_deref()
                .and_then(first_angle_value)
                .or_else(|| {
                    headers
                        .get_first_value("References")
                        .as_deref()
                        .and_then(first_reference)
                })
        });
    from_headers.or_else(|| own_message_id.and_then(normalize_message_id))
}

/// Trims a Message-Id and drops its surrounding angle brackets so that a
/// thread root and the replies pointing at it carry the same identifier.
pub fn normalize_message_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(trimmed)
        .trim();
    if inner.is_empty() {
        None
    } else {
        Some(inner.to_string())
    }
}

fn first_angle_value(value: &str) -> Option<String> {
    if let Some(start) = value.find('<') {
        let rest = &value[start + 1..];
        let end = rest.find('>')?;
        let id = rest[..end].trim();
        return (!id.is_empty()).then(|| id.to_string());
    }
    // Some clients omit the brackets; take the bare token.
    value
        .split_whitespace()
        .next()
        .map(|token| token.to_string())
}

fn first_reference(value: &str) -> Option<String> {
    let token = value.split_whitespace().next()?;
    let id = token.replace(['<', '>'], "");
    let id = id.trim();
    (!id.is_empty()).then(|| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_reply_to_wins_over_references() {
        let headers = "From: a@x.com\r\nReferences: <root@x.com> <mid@x.com>\r\nIn-Reply-To: <mid@x.com>\r\n";
        assert_eq!(
            resolve_thread_id(headers, Some("<own@x.com>")).as_deref(),
            Some("mid@x.com")
        );
    }

    #[test]
    fn in_reply_to_header_name_is_case_insensitive() {
        for name in ["in-reply-to", "IN-REPLY-TO", "In-reply-To"] {
            let headers = format!("Subject: hi\r\n{}: <parent@x.com>\r\n", name);
            assert_eq!(
                resolve_thread_id(&headers, None).as_deref(),
                Some("parent@x.com"),
                "header spelled {}",
                name
            );
        }
    }

    #[test]
    fn references_first_token_is_the_root() {
        let headers = "references:   <root@x.com>  <second@x.com>\r\n";
        assert_eq!(
            resolve_thread_id(headers, Some("<own@x.com>")).as_deref(),
            Some("root@x.com")
        );
    }

    #[test]
    fn folded_references_are_unfolded() {
        let headers = "References:\r\n <root@x.com>\r\n <second@x.com>\r\nSubject: x\r\n";
        assert_eq!(
            resolve_thread_id(headers, None).as_deref(),
            Some("root@x.com")
        );
    }

    #[test]
    fn empty_in_reply_to_falls_through_to_references() {
        let headers = "In-Reply-To: \r\nReferences: <root@x.com>\r\n";
        assert_eq!(
            resolve_thread_id(headers, None).as_deref(),
            Some("root@x.com")
        );
    }

    #[test]
    fn message_roots_its_own_thread() {
        let headers = "From: a@x.com\r\nSubject: new topic\r\n";
        assert_eq!(
            resolve_thread_id(headers, Some("  <own@x.com> ")).as_deref(),
            Some("own@x.com")
        );
    }

    #[test]
    fn no_headers_and_no_id_means_no_thread() {
        assert_eq!(resolve_thread_id("From: a@x.com\r\n", None), None);
        assert_eq!(resolve_thread_id("", Some("   ")), None);
    }

    #[test]
    fn bare_in_reply_to_token_is_accepted() {
        let headers = "In-Reply-To: parent@x.com\r\n";
        assert_eq!(
            resolve_thread_id(headers, None).as_deref(),
            Some("parent@x.com")
        );
    }

    #[test]
    fn message_id_normalization() {
        assert_eq!(normalize_message_id(" <a@b> ").as_deref(), Some("a@b"));
        assert_eq!(normalize_message_id("a@b").as_deref(), Some("a@b"));
        assert_eq!(normalize_message_id("<>"), None);
    }
}
