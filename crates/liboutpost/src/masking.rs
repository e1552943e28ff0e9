use std::borrow::Cow;

use aho_corasick::AhoCorasick;

use crate::error::AgentResult;

/// Replacement written in place of a sensitive value.
pub const MASK: &str = "********";

/// Masks configured secrets out of script output before it is persisted.
///
/// Every occurrence of every secret is found, overlapping ones included,
/// and each run of overlapping occurrences is replaced by a single mask.
#[derive(Debug, Default, Clone)]
pub struct SensitiveValueMasker {
    matcher: Option<AhoCorasick>,
}

impl SensitiveValueMasker {
    pub fn new<I, S>(values: I) -> AgentResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut values: Vec<String> = values
            .into_iter()
            .map(Into::into)
            .filter(|v| !v.is_empty())
            .collect();
        values.sort();
        values.dedup();
        if values.is_empty() {
            return Ok(Self::default());
        }
        Ok(Self {
            matcher: Some(AhoCorasick::new(&values)?),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.matcher.is_none()
    }

    pub fn mask<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let Some(matcher) = &self.matcher else {
            return Cow::Borrowed(text);
        };

        let mut spans: Vec<(usize, usize)> = matcher
            .find_overlapping_iter(text)
            .map(|m| (m.start(), m.end()))
            .collect();
        if spans.is_empty() {
            return Cow::Borrowed(text);
        }
        spans.sort_unstable();

        let mut masked = String::with_capacity(text.len());
        let mut copied = 0;
        let mut current = spans[0];
        for &(start, end) in &spans[1..] {
            if start <= current.1 {
                current.1 = current.1.max(end);
                continue;
            }
            masked.push_str(&text[copied..current.0]);
            masked.push_str(MASK);
            copied = current.1;
            current = (start, end);
        }
        masked.push_str(&text[copied..current.0]);
        masked.push_str(MASK);
        masked.push_str(&text[current.1..]);
        Cow::Owned(masked)
    }
}
