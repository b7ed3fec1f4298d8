use sha2::{Digest, Sha256};

use crate::model::{SyncFields, normalize_text};

/// Content hash of the synchronizable fields.
///
/// Every field is written as a tag byte followed by a length-prefixed value,
/// in a fixed order. Tags come from a sorted set, text is
/// whitespace-normalized and due dates are reduced to unix seconds, so equal
/// content always yields the same hex digest.
pub fn hash_fields(fields: &SyncFields) -> String {
    let mut hasher = Sha256::new();
    write_str(&mut hasher, b't', &normalize_text(&fields.text));
    write_str(&mut hasher, b'd', &normalize_text(&fields.description));
    match fields.due {
        Some(due) => write_str(&mut hasher, b'u', &due.unix_timestamp().to_string()),
        None => write_str(&mut hasher, b'u', ""),
    }
    write_str(&mut hasher, b'p', fields.priority.as_str());
    hasher.update([b'g']);
    hasher.update((fields.tags.len() as u64).to_be_bytes());
    for tag in &fields.tags {
        write_str(&mut hasher, b'-', tag);
    }
    write_str(&mut hasher, b'j', &fields.project);
    hasher.update([b'c', u8::from(fields.completed)]);
    to_hex(&hasher.finalize())
}

fn write_str(hasher: &mut Sha256, tag: u8, value: &str) {
    hasher.update([tag]);
    hasher.update((value.len() as u64).to_be_bytes());
    hasher.update(value.as_bytes());
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Priority, Task};
    use proptest::prelude::*;
    use std::collections::BTreeSet;
    use time::macros::datetime;

    fn fields() -> SyncFields {
        let mut task = Task::new(1, "Buy milk");
        task.tags = vec!["errand".into(), "home".into()];
        task.due = Some(datetime!(2024-05-01 09:30 UTC));
        task.sync_fields()
    }

    #[test]
    fn ignores_whitespace_noise() {
        let base = fields();
        let mut noisy = base.clone();
        noisy.text = "  Buy   milk\n".into();
        assert_eq!(hash_fields(&base), hash_fields(&noisy));
    }

    #[test]
    fn ignores_sub_second_due_precision() {
        let base = fields();
        let mut shifted = base.clone();
        shifted.due = Some(datetime!(2024-05-01 09:30:00.250 UTC));
        assert_eq!(hash_fields(&base), hash_fields(&shifted));
    }

    #[test]
    fn detects_priority_change() {
        let base = fields();
        let mut changed = base.clone();
        changed.priority = Priority::High;
        assert_ne!(hash_fields(&base), hash_fields(&changed));
    }

    #[test]
    fn tag_boundaries_matter() {
        let mut left = fields();
        left.tags = ["ab".to_string(), "c".to_string()].into_iter().collect();
        let mut right = fields();
        right.tags = ["a".to_string(), "bc".to_string()].into_iter().collect();
        assert_ne!(hash_fields(&left), hash_fields(&right));
    }

    #[test]
    fn digest_is_hex_sha256() {
        let digest = hash_fields(&fields());
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
    }

    proptest! {
        #[test]
        fn tag_insertion_order_is_irrelevant(tags in proptest::collection::vec("[a-z]{1,8}", 0..6)) {
            let mut forward = fields();
            forward.tags = tags.iter().cloned().collect();
            let mut backward = fields();
            backward.tags = tags.iter().rev().cloned().collect::<BTreeSet<_>>();
            prop_assert_eq!(hash_fields(&forward), hash_fields(&backward));
        }

        #[test]
        fn text_change_changes_hash(a in "[a-z]{1,12}", b in "[a-z]{1,12}") {
            prop_assume!(a != b);
            let mut left = fields();
            left.text = a;
            let mut right = fields();
            right.text = b;
            prop_assert_ne!(hash_fields(&left), hash_fields(&right));
        }

        #[test]
        fn completion_and_project_are_hashed(project in "[A-Za-z]{1,10}") {
            let base = fields();
            let mut moved = base.clone();
            moved.project = format!("{project}-x");
            let mut done = base.clone();
            done.completed = true;
            prop_assert_ne!(hash_fields(&base), hash_fields(&moved));
            prop_assert_ne!(hash_fields(&base), hash_fields(&done));
        }
    }
}
