//! Thread pool: folds overlapping per-span message snapshots into canonical
//! conversation threads.
//!
//! Every span carries the whole conversation up to its model call, so most
//! snapshots are prefixes or extensions of one another. A snapshot either
//! extends a thread it starts with, is absorbed by a thread that already
//! contains it, or opens a new thread.

use crate::model::{ChatMessage, Role};
use std::collections::BTreeSet;

/// One reconstructed conversation and the spans that contributed to it.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationThread {
    pub messages: Vec<ChatMessage>,
    /// Indices into the pass's ordered span list, ascending.
    pub span_indices: Vec<usize>,
}

impl ConversationThread {
    fn record(&mut self, span_index: usize) {
        if let Err(pos) = self.span_indices.binary_search(&span_index) {
            self.span_indices.insert(pos, span_index);
        }
    }
}

/// Pool of in-progress threads. Lives for one run in one pass.
#[derive(Debug, Default)]
pub struct ThreadPool {
    threads: Vec<ConversationThread>,
}

impl ThreadPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one span's message sequence into the pool.
    pub fn absorb(&mut self, span_index: usize, messages: Vec<ChatMessage>) {
        if messages.is_empty() {
            return;
        }

        // Already represented: keep the longer thread, backfill empty results.
        for thread in &mut self.threads {
            if thread.messages.len() >= messages.len()
                && matching_prefix(&messages, &thread.messages).is_some()
            {
                backfill(&mut thread.messages, &messages);
                thread.record(span_index);
                return;
            }
        }

        // Extends an existing thread: pick the longest one it starts with.
        let mut best: Option<(usize, usize)> = None;
        for (i, thread) in self.threads.iter().enumerate() {
            if messages.len() > thread.messages.len() {
                if let Some(consumed) = matching_prefix(&thread.messages, &messages) {
                    let longer = best.map_or(true, |(b, _)| {
                        thread.messages.len() > self.threads[b].messages.len()
                    });
                    if longer {
                        best = Some((i, consumed));
                    }
                }
            }
        }
        if let Some((i, consumed)) = best {
            let thread = &mut self.threads[i];
            backfill(&mut thread.messages, &messages[..consumed]);
            append_suffix(&mut thread.messages, &messages[consumed..]);
            thread.record(span_index);
            return;
        }

        self.threads.push(ConversationThread {
            messages,
            span_indices: vec![span_index],
        });
    }

    /// Final threads in order of first appearance. A thread that ended up as
    /// a matching prefix of a later, longer one is folded into it.
    pub fn into_threads(self) -> Vec<ConversationThread> {
        let mut threads = self.threads;
        let mut i = 0;
        while i < threads.len() {
            let absorber = (0..threads.len()).find(|&j| {
                j != i
                    && threads[j].messages.len() >= threads[i].messages.len()
                    && (threads[j].messages.len() > threads[i].messages.len() || j < i)
                    && matching_prefix(&threads[i].messages, &threads[j].messages).is_some()
            });
            match absorber {
                Some(j) => {
                    let absorbed = threads.remove(i);
                    let j = if j > i { j - 1 } else { j };
                    backfill(&mut threads[j].messages, &absorbed.messages);
                    for idx in absorbed.span_indices {
                        threads[j].record(idx);
                    }
                }
                None => i += 1,
            }
        }
        threads.sort_by_key(|t| t.span_indices.first().copied().unwrap_or(usize::MAX));
        threads
    }
}

/// Whether `short` is a matching prefix of `long`. Returns how many messages
/// of `long` the prefix covers, so `long[covered..]` is the new suffix.
///
/// A tool message whose call id already appeared earlier in either sequence
/// may be skipped on either side, since a call and its result can land in
/// different spans at different relative positions.
pub fn matching_prefix(short: &[ChatMessage], long: &[ChatMessage]) -> Option<usize> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let (mut i, mut j) = (0, 0);

    while i < short.len() {
        if j < long.len() && messages_match(&short[i], &long[j]) {
            note_ids(&short[i], &mut seen);
            note_ids(&long[j], &mut seen);
            i += 1;
            j += 1;
        } else if is_seen_tool_result(&short[i], &seen) {
            i += 1;
        } else if j < long.len() && is_seen_tool_result(&long[j], &seen) {
            j += 1;
        } else {
            return None;
        }
    }
    Some(j)
}

/// Tool results match on call id even if the text differs; assistant turns
/// with tool calls match on the set of call ids. Everything else needs the
/// same role and text.
pub fn messages_match(a: &ChatMessage, b: &ChatMessage) -> bool {
    if a.role != b.role {
        return false;
    }
    if a.role == Role::Tool {
        if let (Some(x), Some(y)) = (&a.tool_call_id, &b.tool_call_id) {
            return x == y;
        }
    }
    if a.role == Role::Assistant && (!a.tool_calls.is_empty() || !b.tool_calls.is_empty()) {
        return call_ids(a) == call_ids(b);
    }
    a.content == b.content
}

fn call_ids(m: &ChatMessage) -> BTreeSet<&str> {
    m.tool_calls.iter().map(|c| c.id.as_str()).collect()
}

fn note_ids<'a>(m: &'a ChatMessage, seen: &mut BTreeSet<&'a str>) {
    seen.extend(m.tool_calls.iter().map(|c| c.id.as_str()));
    if let Some(id) = &m.tool_call_id {
        seen.insert(id);
    }
}

fn is_seen_tool_result(m: &ChatMessage, seen: &BTreeSet<&str>) -> bool {
    m.role == Role::Tool
        && m.tool_call_id
            .as_deref()
            .is_some_and(|id| seen.contains(id))
}

/// Replace empty tool results in `thread` with populated ones from `incoming`.
fn backfill(thread: &mut [ChatMessage], incoming: &[ChatMessage]) {
    for fresh in incoming {
        let Some(id) = tool_result_id(fresh) else {
            continue;
        };
        if fresh.content.is_empty() {
            continue;
        }
        for existing in thread.iter_mut() {
            if existing.content.is_empty() && tool_result_id(existing) == Some(id) {
                existing.content = fresh.content.clone();
            }
        }
    }
}

/// Append `suffix`, folding tool results the thread already holds into the
/// existing entry instead of duplicating them.
fn append_suffix(thread: &mut Vec<ChatMessage>, suffix: &[ChatMessage]) {
    for message in suffix {
        if let Some(id) = tool_result_id(message) {
            if let Some(existing) = thread
                .iter_mut()
                .find(|m| tool_result_id(m) == Some(id))
            {
                if existing.content.is_empty() {
                    existing.content = message.content.clone();
                }
                continue;
            }
        }
        thread.push(message.clone());
    }
}

fn tool_result_id(m: &ChatMessage) -> Option<&str> {
    if m.role == Role::Tool {
        m.tool_call_id.as_deref()
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ToolCall;
    use serde_json::Value;

    fn user(text: &str) -> ChatMessage {
        ChatMessage::new(Role::User, text)
    }

    fn assistant(text: &str) -> ChatMessage {
        ChatMessage::new(Role::Assistant, text)
    }

    fn calls(id: &str) -> ChatMessage {
        assistant("").with_tool_call(ToolCall {
            id: id.into(),
            name: "search".into(),
            arguments: Value::Null,
        })
    }

    fn run(spans: &[Vec<ChatMessage>]) -> Vec<ConversationThread> {
        let mut pool = ThreadPool::new();
        for (i, m) in spans.iter().enumerate() {
            pool.absorb(i, m.clone());
        }
        pool.into_threads()
    }

    fn message_sets(threads: &[ConversationThread]) -> Vec<Vec<ChatMessage>> {
        let mut out: Vec<_> = threads.iter().map(|t| t.messages.clone()).collect();
        out.sort_by_key(|m| serde_json::to_string(m).unwrap());
        out
    }

    #[test]
    fn empty_tool_result_is_backfilled() {
        let s1 = vec![user("hi"), calls("42")];
        let s2 = vec![user("hi"), calls("42"), ChatMessage::tool_result("42", "")];
        let s3 = vec![user("hi"), calls("42"), ChatMessage::tool_result("42", "result")];

        let threads = run(&[s1, s2, s3]);
        assert_eq!(threads.len(), 1);
        let tools: Vec<_> = threads[0]
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].content, "result");
        assert_eq!(threads[0].span_indices, vec![0, 1, 2]);
    }

    #[test]
    fn extension_appends_suffix() {
        let threads = run(&[
            vec![user("hi")],
            vec![user("hi"), assistant("hello"), user("bye")],
        ]);
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].messages.len(), 3);
    }

    #[test]
    fn divergent_conversations_stay_separate() {
        let threads = run(&[
            vec![user("hi"), assistant("a")],
            vec![user("hi"), assistant("b")],
        ]);
        assert_eq!(threads.len(), 2);
    }

    #[test]
    fn seen_tool_result_may_be_skipped() {
        let t = vec![
            user("hi"),
            calls("1"),
            ChatMessage::tool_result("1", "x"),
            assistant("done"),
        ];
        // Same conversation but the result was recorded elsewhere.
        let m = vec![user("hi"), calls("1"), assistant("done")];
        assert_eq!(matching_prefix(&m, &t), Some(4));
        assert_eq!(matching_prefix(&t, &m), Some(3));
    }

    #[test]
    fn assistant_tool_turns_match_on_call_ids_only() {
        let mut a = calls("7");
        a.content = "let me search".into();
        assert!(messages_match(&a, &calls("7")));
        assert!(!messages_match(&calls("7"), &calls("8")));
        assert!(!messages_match(&assistant("x"), &assistant("y")));
    }

    #[test]
    fn identical_spans_twice_equal_once() {
        let spans = vec![
            vec![user("hi"), calls("42")],
            vec![user("hi"), calls("42"), ChatMessage::tool_result("42", "r"), assistant("ok")],
            vec![user("other")],
        ];
        let mut doubled = spans.clone();
        doubled.extend(spans.clone());
        assert_eq!(message_sets(&run(&spans)), message_sets(&run(&doubled)));
    }

    #[test]
    fn any_arrival_order_gives_the_same_threads() {
        let spans = vec![
            vec![user("hi")],
            vec![user("hi"), calls("42")],
            vec![user("hi"), calls("42"), ChatMessage::tool_result("42", "")],
            vec![user("hi"), calls("42"), ChatMessage::tool_result("42", "result")],
            vec![user("hi"), assistant("branch")],
        ];
        let expected = message_sets(&run(&spans));
        let orders: [[usize; 5]; 4] = [
            [4, 3, 2, 1, 0],
            [2, 0, 4, 3, 1],
            [3, 1, 0, 2, 4],
            [1, 4, 2, 0, 3],
        ];
        for order in orders {
            let permuted: Vec<_> = order.iter().map(|&i| spans[i].clone()).collect();
            assert_eq!(message_sets(&run(&permuted)), expected, "order {:?}", order);
        }
    }
}
