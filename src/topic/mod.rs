//! Topic filters and per-connection subscription storage
//!
//! Each connection owns a [`TopicStore`]: an ordered list of the filters it
//! subscribed to. Filters are tokenized once on insertion and matched
//! against published topics with [`matching::tokens_match`].

pub mod matching;

pub use matching::{tokenize, tokens_match, topic_matches_filter};

use smallvec::SmallVec;

use crate::protocol::QoS;

/// A subscribed topic filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    /// Filter as received in SUBSCRIBE
    filter: String,
    /// Levels of `filter`, never empty
    tokens: SmallVec<[String; 4]>,
    /// Granted QoS
    qos: QoS,
}

impl TopicFilter {
    pub fn new(filter: impl Into<String>, qos: QoS) -> Self {
        let filter = filter.into();
        let tokens = tokenize(&filter).into_iter().map(str::to_owned).collect();
        Self {
            filter,
            tokens,
            qos,
        }
    }

    pub fn filter(&self) -> &str {
        &self.filter
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Test this filter against the levels of a published topic
    #[inline]
    pub fn matches<T: AsRef<str>>(&self, topic: &[T]) -> bool {
        tokens_match(&self.tokens, topic)
    }
}

/// Ordered collection of topic filters owned by one connection
#[derive(Debug, Default)]
pub struct TopicStore {
    filters: Vec<TopicFilter>,
    /// Position before the most recent batch of insertions
    batch_start: usize,
}

impl TopicStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a batch of insertions; see [`TopicStore::last_batch`]
    pub fn begin_batch(&mut self) {
        self.batch_start = self.filters.len();
    }

    /// Filters inserted since the last [`TopicStore::begin_batch`], in insertion order
    pub fn last_batch(&self) -> &[TopicFilter] {
        self.filters.get(self.batch_start..).unwrap_or(&[])
    }

    /// Append a filter
    ///
    /// Subscribing twice to the same filter creates two entries.
    pub fn insert(&mut self, filter: &str, qos: QoS) {
        self.filters.push(TopicFilter::new(filter, qos));
    }

    /// Remove the first entry whose filter string equals `filter`
    pub fn remove(&mut self, filter: &str) -> bool {
        match self.filters.iter().position(|f| f.filter == filter) {
            Some(index) => {
                self.filters.remove(index);
                self.batch_start = self.batch_start.min(self.filters.len());
                true
            }
            None => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TopicFilter> {
        self.filters.iter()
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Filters matching the levels of a published topic, in subscription order
    pub fn matching<'a, T: AsRef<str>>(
        &'a self,
        topic: &'a [T],
    ) -> impl Iterator<Item = &'a TopicFilter> + 'a {
        self.filters.iter().filter(move |f| f.matches(topic))
    }

    /// Whether any filter matches
    pub fn matches<T: AsRef<str>>(&self, topic: &[T]) -> bool {
        self.matching(topic).next().is_some()
    }
}
