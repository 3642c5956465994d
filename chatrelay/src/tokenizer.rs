//! Token counting and conversation trimming.
//!
//! Counting uses the `cl100k_base` BPE vocabulary (the GPT-4 encoding), loaded
//! once at startup and shared for the life of the process. Trimming drops the
//! oldest messages of a conversation until it fits a fixed token budget.

use std::collections::VecDeque;

use anyhow::{Context, Result};
use log::{debug, info};
use tiktoken_rs::CoreBPE;

use crate::conversation::{Conversation, Message};

/// Budget applied to a stored conversation plus its pending message.
pub const DEFAULT_TOKEN_BUDGET: usize = 7600;

pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

/// BPE token counter backed by tiktoken's `cl100k_base` tables.
pub struct TiktokenCounter {
    bpe: CoreBPE,
}

impl TiktokenCounter {
    /// Builds the encoder. A failure here is a startup error; there is no
    /// per-request fallback.
    pub fn load() -> Result<Self> {
        info!("Loading cl100k_base vocabulary");
        let bpe = tiktoken_rs::cl100k_base().context("failed to load cl100k_base vocabulary")?;
        Ok(Self { bpe })
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        self.bpe.encode_with_special_tokens(text).len()
    }
}

/// Removes messages from the front of `messages` until their token total plus
/// `pending_tokens` fits in `budget`, or nothing is left.
///
/// Returns the number of messages removed. Each message is counted once.
pub fn trim_messages(
    messages: &mut Vec<Message>,
    pending_tokens: usize,
    budget: usize,
    counter: &dyn TokenCounter,
) -> usize {
    let mut counts: VecDeque<usize> = messages
        .iter()
        .map(|m| counter.count_tokens(&m.content))
        .collect();
    let mut total = counts.iter().sum::<usize>() + pending_tokens;

    let mut removed = 0;
    while total > budget {
        let Some(oldest) = counts.pop_front() else {
            break;
        };
        total -= oldest;
        removed += 1;
    }

    if removed > 0 {
        messages.drain(..removed);
        debug!(
            "Trimmed {} oldest message(s); {} remain at {} tokens (budget {})",
            removed,
            messages.len(),
            total,
            budget
        );
    }
    removed
}

/// Applies [`trim_messages`] to a conversation's history.
pub fn trim_conversation(
    mut conversation: Conversation,
    pending_tokens: usize,
    budget: usize,
    counter: &dyn TokenCounter,
) -> Conversation {
    trim_messages(&mut conversation.messages, pending_tokens, budget, counter);
    conversation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::SamplingParams;

    /// Counts a message as the number parsed from its content, so tests can
    /// state token sizes directly.
    struct LiteralCounter;

    impl TokenCounter for LiteralCounter {
        fn count_tokens(&self, text: &str) -> usize {
            text.parse().unwrap_or(0)
        }
    }

    fn history(sizes: &[usize]) -> Vec<Message> {
        sizes.iter().map(|n| Message::user(n.to_string())).collect()
    }

    fn total(messages: &[Message]) -> usize {
        messages.iter().map(|m| LiteralCounter.count_tokens(&m.content)).sum()
    }

    #[test]
    fn boundary_case_removes_exactly_two() {
        let mut messages = history(&[100, 100, 7500]);
        let removed = trim_messages(&mut messages, 50, 7600, &LiteralCounter);
        assert_eq!(removed, 2);
        assert_eq!(messages, history(&[7500]));
        assert!(total(&messages) + 50 <= 7600);
    }

    #[test]
    fn within_budget_is_unchanged() {
        let mut messages = history(&[10, 20, 30]);
        let removed = trim_messages(&mut messages, 5, 100, &LiteralCounter);
        assert_eq!(removed, 0);
        assert_eq!(messages, history(&[10, 20, 30]));

        // A second pass over trimmed output is also a no-op.
        let mut once = history(&[400, 300, 200, 100]);
        trim_messages(&mut once, 0, 350, &LiteralCounter);
        let mut twice = once.clone();
        assert_eq!(trim_messages(&mut twice, 0, 350, &LiteralCounter), 0);
        assert_eq!(once, twice);
    }

    #[test]
    fn retained_messages_are_a_suffix() {
        let original = history(&[5, 50, 1, 40, 3, 30]);
        for budget in 0..140 {
            let mut messages = original.clone();
            let removed = trim_messages(&mut messages, 7, budget, &LiteralCounter);
            assert_eq!(messages.as_slice(), &original[removed..]);
            assert!(messages.is_empty() || total(&messages) + 7 <= budget);
            // Minimal: keeping one more message would break the budget.
            if removed > 0 {
                assert!(total(&original[removed - 1..]) + 7 > budget);
            }
        }
    }

    #[test]
    fn unsatisfiable_budget_empties_history() {
        let mut messages = history(&[1, 2, 3]);
        let removed = trim_messages(&mut messages, 500, 100, &LiteralCounter);
        assert_eq!(removed, 3);
        assert!(messages.is_empty());
    }

    #[test]
    fn system_prompt_is_not_protected() {
        let mut conv = Conversation::start(1, "60", SamplingParams::default());
        conv.messages.push(Message::user("50"));
        let conv = trim_conversation(conv, 0, 55, &LiteralCounter);
        assert_eq!(conv.messages, vec![Message::user("50")]);
    }

    #[test]
    fn tiktoken_counts_text() {
        let counter = TiktokenCounter::load().unwrap();
        assert_eq!(counter.count_tokens(""), 0);
        let short = counter.count_tokens("Hello, world!");
        assert!(short > 0 && short < 10, "got {short}");
        assert!(counter.count_tokens(&"hello world ".repeat(50)) > short);
    }
}
