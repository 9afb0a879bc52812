use std::time::Duration;

use mailroom_contracts::EntityRef;
use sha2::{Digest, Sha256};

/// First candidate (in the order given) whose non-empty title is a
/// case-insensitive substring of the subject.
///
/// Deliberately a substring test, not token or fuzzy matching: an entity
/// titled with a generic word will match many subjects, and the first one
/// in listing order wins. Lowercasing goes through `str::to_lowercase`, so
/// multi-byte titles compare correctly.
pub fn match_by_subject<'a>(subject: &str, candidates: &'a [EntityRef]) -> Option<&'a EntityRef> {
    let subject = subject.to_lowercase();
    candidates.iter().find(|entity| {
        let title = entity.title.to_lowercase();
        !title.is_empty() && subject.contains(&title)
    })
}

/// Extract a lowercased address from a mailbox string.
///
/// Accepts the display form `"Jane Doe <jane@example.com>"` (anything
/// inside the brackets is taken as-is) or a bare address. Returns `None`
/// when neither form yields a plausible address.
pub fn parse_mailbox(value: &str) -> Option<String> {
    if let (Some(open), Some(close)) = (value.find('<'), value.rfind('>')) {
        if open < close {
            let inner = value[open + 1..close].trim();
            if !inner.is_empty() {
                return Some(inner.to_lowercase());
            }
        }
        return None;
    }

    let bare = value.trim();
    if is_plausible_address(bare) {
        Some(bare.to_lowercase())
    } else {
        None
    }
}

fn is_plausible_address(value: &str) -> bool {
    if value.chars().any(char::is_whitespace) {
        return false;
    }
    let mut parts = value.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) => {
            !local.is_empty()
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
        }
        _ => false,
    }
}

/// Stable marker-file name for a dedup key. The key is hashed so that
/// arbitrary key strings map to a safe, fixed-length filename.
pub fn lock_marker_name(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let short: String = digest[..8].iter().map(|b| format!("{b:02x}")).collect();
    format!("mailroom-{short}.lock")
}

/// Number of visibility polls for a create-and-wait budget:
/// `ceil(timeout / interval)`. A zero interval degenerates to one attempt.
pub fn poll_attempts(timeout: Duration, interval: Duration) -> u32 {
    let interval_ms = interval.as_millis();
    if interval_ms == 0 {
        return 1;
    }
    let timeout_ms = timeout.as_millis();
    timeout_ms.div_ceil(interval_ms) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(titles: &[&str]) -> Vec<EntityRef> {
        titles
            .iter()
            .enumerate()
            .map(|(i, title)| EntityRef {
                id: i as i64 + 1,
                title: title.to_string(),
            })
            .collect()
    }

    #[test]
    fn matches_first_candidate_contained_in_subject() {
        let list = candidates(&["Website redesign", "Ads"]);
        let hit = match_by_subject("Re: Website redesign — invoice", &list).unwrap();
        assert_eq!(hit.id, 1);
    }

    #[test]
    fn matching_is_case_insensitive_both_ways() {
        let list = candidates(&["website redesign"]);
        assert!(match_by_subject("WEBSITE REDESIGN", &list).is_some());

        let upper = candidates(&["WEBSITE REDESIGN"]);
        assert!(match_by_subject("fwd: website redesign", &upper).is_some());
    }

    #[test]
    fn lowercases_multibyte_titles() {
        let list = candidates(&["Договор ПОСТАВКИ"]);
        assert!(match_by_subject("re: договор поставки №7", &list).is_some());
    }

    #[test]
    fn empty_titles_never_match() {
        let list = candidates(&["", "Ads"]);
        let hit = match_by_subject("ads budget for march", &list).unwrap();
        assert_eq!(hit.id, 2);
        assert!(match_by_subject("anything", &candidates(&[""])).is_none());
    }

    #[test]
    fn first_in_order_wins_over_longer_match() {
        let list = candidates(&["Atlas", "Project Atlas kickoff"]);
        let hit = match_by_subject("Project Atlas kickoff", &list).unwrap();
        assert_eq!(hit.id, 1);
    }

    #[test]
    fn no_candidates_no_match() {
        assert!(match_by_subject("anything", &[]).is_none());
    }

    #[test]
    fn parses_display_form_mailbox() {
        assert_eq!(
            parse_mailbox("Jane Doe <Jane@Example.com>"),
            Some("jane@example.com".to_string())
        );
        assert_eq!(
            parse_mailbox("<box@mail.example>"),
            Some("box@mail.example".to_string())
        );
    }

    #[test]
    fn parses_bare_address() {
        assert_eq!(
            parse_mailbox("  Client@Example.COM "),
            Some("client@example.com".to_string())
        );
    }

    #[test]
    fn rejects_implausible_addresses() {
        assert_eq!(parse_mailbox("not an address"), None);
        assert_eq!(parse_mailbox("missing-at.example.com"), None);
        assert_eq!(parse_mailbox("a@b"), None);
        assert_eq!(parse_mailbox("a@@b.c"), None);
        assert_eq!(parse_mailbox("Jane Doe <>"), None);
        assert_eq!(parse_mailbox(""), None);
    }

    #[test]
    fn marker_names_are_stable_and_distinct() {
        let a = lock_marker_name("incoming-webhook");
        assert_eq!(a, lock_marker_name("incoming-webhook"));
        assert_ne!(a, lock_marker_name("other-key"));
        assert!(a.starts_with("mailroom-") && a.ends_with(".lock"));
    }

    #[test]
    fn poll_attempts_rounds_up() {
        let secs = Duration::from_secs;
        assert_eq!(poll_attempts(secs(30), secs(2)), 15);
        assert_eq!(poll_attempts(secs(4), secs(2)), 2);
        assert_eq!(poll_attempts(secs(5), secs(2)), 3);
        assert_eq!(poll_attempts(secs(10), secs(1)), 10);
        assert_eq!(poll_attempts(secs(0), secs(2)), 0);
        assert_eq!(poll_attempts(secs(10), secs(0)), 1);
    }
}
