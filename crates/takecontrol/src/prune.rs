//! Image-history pruning.
//!
//! Screenshots dominate the payload cost of a take-control conversation.
//! Before each decision call, every image except the most recent few is
//! replaced with a short textual placeholder. Pruning is idempotent: a
//! conversation with no prunable images is left untouched.

use deskclaw_core::Conversation;
use tracing::debug;

/// Placeholder text left behind where a screenshot was removed.
pub const PRUNED_PLACEHOLDER: &str = "[earlier screenshot removed]";

/// Keep only the `keep` most recent images in the conversation, replacing
/// older ones with [`PRUNED_PLACEHOLDER`]. Returns how many were removed.
pub fn prune_images(conversation: &mut Conversation, keep: usize) -> usize {
    let mut kept = 0usize;
    let mut removed = 0usize;

    for message in conversation.messages.iter_mut().rev() {
        let count = message.images.len();
        if count == 0 {
            continue;
        }

        if kept + count <= keep {
            kept += count;
            continue;
        }

        // Within a message, later images are more recent.
        let keep_here = keep.saturating_sub(kept);
        let drop_count = count - keep_here;
        message.images.drain(..drop_count);
        kept += keep_here;
        removed += drop_count;

        if message.content.is_empty() {
            message.content = PRUNED_PLACEHOLDER.to_string();
        } else {
            message.content = format!("{PRUNED_PLACEHOLDER}\n{}", message.content);
        }
    }

    if removed > 0 {
        debug!(removed, kept, "Pruned conversation image history");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskclaw_core::{ImageBlock, Message};

    fn image() -> ImageBlock {
        ImageBlock::from_bytes("image/png", &[1, 2, 3], 4, 4)
    }

    fn conversation_with_images(n: usize) -> Conversation {
        let mut conv = Conversation::new();
        for i in 0..n {
            conv.push(Message::user_with_image(format!("screen {i}"), image()));
        }
        conv
    }

    #[test]
    fn keeps_most_recent_images() {
        let mut conv = conversation_with_images(5);
        let removed = prune_images(&mut conv, 3);

        assert_eq!(removed, 2);
        assert_eq!(conv.image_count(), 3);
        // the two oldest lost their images and gained placeholders
        assert!(conv.messages[0].images.is_empty());
        assert!(conv.messages[0].content.contains(PRUNED_PLACEHOLDER));
        assert!(conv.messages[1].images.is_empty());
        // the newest three are untouched
        for msg in &conv.messages[2..] {
            assert_eq!(msg.images.len(), 1);
            assert!(!msg.content.contains(PRUNED_PLACEHOLDER));
        }
    }

    #[test]
    fn pruning_is_idempotent() {
        let mut conv = conversation_with_images(5);
        prune_images(&mut conv, 2);
        let snapshot: Vec<(String, usize)> = conv
            .messages
            .iter()
            .map(|m| (m.content.clone(), m.images.len()))
            .collect();

        let removed = prune_images(&mut conv, 2);
        assert_eq!(removed, 0);
        let after: Vec<(String, usize)> = conv
            .messages
            .iter()
            .map(|m| (m.content.clone(), m.images.len()))
            .collect();
        assert_eq!(snapshot, after);
    }

    #[test]
    fn under_budget_is_untouched() {
        let mut conv = conversation_with_images(2);
        assert_eq!(prune_images(&mut conv, 3), 0);
        assert_eq!(conv.image_count(), 2);
    }

    #[test]
    fn prunes_within_a_single_message() {
        let mut conv = Conversation::new();
        let mut msg = Message::user("multi");
        msg.images = vec![image(), image(), image()];
        conv.push(msg);

        let removed = prune_images(&mut conv, 1);
        assert_eq!(removed, 2);
        assert_eq!(conv.messages[0].images.len(), 1);
        assert!(conv.messages[0].content.starts_with(PRUNED_PLACEHOLDER));
    }

    #[test]
    fn text_only_conversation_is_noop() {
        let mut conv = Conversation::new();
        conv.push(Message::user("no images here"));
        assert_eq!(prune_images(&mut conv, 3), 0);
        assert_eq!(conv.messages[0].content, "no images here");
    }
}
