/// Ceilings for one embedding/upsert request. Two independent token limits:
/// a per-request budget and a per-item budget.
#[derive(Debug, Clone, Copy)]
pub struct BatchLimits {
    pub max_items: usize,
    pub max_request_tokens: usize,
    pub max_item_tokens: usize,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_items: 100,
            max_request_tokens: 50_000,
            max_item_tokens: 8_000,
        }
    }
}

/// Rough token estimate, ~4 characters per token for latin-ish text.
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4).max(1)
}

/// Indices into the input slice, grouped for submission. Items whose own
/// estimated token count exceeds the per-item cap are set aside in
/// `oversized` for splitting or individual retry, never silently included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    pub batches: Vec<Vec<usize>>,
    pub oversized: Vec<usize>,
}

impl BatchPlan {
    pub fn batch_count(&self) -> usize {
        self.batches.len()
    }
}

/// Group texts by both the count ceiling and the request token budget. The
/// effective batch size adapts to the observed average item length:
/// `min(max_items, max_request_tokens / avg_tokens_per_item)`.
pub fn plan_batches(texts: &[String], limits: BatchLimits) -> BatchPlan {
    let mut oversized = Vec::new();
    let mut eligible = Vec::new();
    let mut total_tokens = 0usize;

    for (index, text) in texts.iter().enumerate() {
        let tokens = estimate_tokens(text);
        if tokens > limits.max_item_tokens {
            oversized.push(index);
        } else {
            eligible.push((index, tokens));
            total_tokens += tokens;
        }
    }

    if eligible.is_empty() {
        return BatchPlan {
            batches: Vec::new(),
            oversized,
        };
    }

    let avg_tokens = (total_tokens / eligible.len()).max(1);
    let adaptive_size = (limits.max_request_tokens / avg_tokens)
        .clamp(1, limits.max_items.max(1));

    let batches = eligible
        .chunks(adaptive_size)
        .map(|chunk| chunk.iter().map(|(index, _)| *index).collect())
        .collect();

    BatchPlan { batches, oversized }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts_of(count: usize, chars_each: usize) -> Vec<String> {
        (0..count).map(|_| "a".repeat(chars_each)).collect()
    }

    #[test]
    fn adaptive_size_splits_250_items_into_100_100_50() {
        // 400 chars ≈ 100 tokens each; request budget 10_000 → 100 per batch.
        let texts = texts_of(250, 400);
        let plan = plan_batches(
            &texts,
            BatchLimits {
                max_items: 100,
                max_request_tokens: 10_000,
                max_item_tokens: 8_000,
            },
        );
        assert_eq!(plan.batch_count(), 3);
        assert_eq!(plan.batches[0].len(), 100);
        assert_eq!(plan.batches[1].len(), 100);
        assert_eq!(plan.batches[2].len(), 50);
        assert!(plan.oversized.is_empty());
    }

    #[test]
    fn token_budget_shrinks_batches_below_the_count_cap() {
        // 4000 chars ≈ 1000 tokens each; budget 2000 → 2 items per batch.
        let texts = texts_of(5, 4_000);
        let plan = plan_batches(
            &texts,
            BatchLimits {
                max_items: 100,
                max_request_tokens: 2_000,
                max_item_tokens: 8_000,
            },
        );
        assert_eq!(plan.batch_count(), 3);
        assert_eq!(plan.batches[0], vec![0, 1]);
        assert_eq!(plan.batches[2], vec![4]);
    }

    #[test]
    fn oversized_items_are_flagged_not_batched() {
        let mut texts = texts_of(3, 400);
        texts.push("b".repeat(100_000));
        let plan = plan_batches(&texts, BatchLimits::default());
        assert_eq!(plan.oversized, vec![3]);
        let batched: usize = plan.batches.iter().map(Vec::len).sum();
        assert_eq!(batched, 3);
    }

    #[test]
    fn empty_input_plans_nothing() {
        let plan = plan_batches(&[], BatchLimits::default());
        assert!(plan.batches.is_empty());
        assert!(plan.oversized.is_empty());
    }

    #[test]
    fn estimate_rounds_up_and_never_returns_zero() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcde"), 2);
    }
}
