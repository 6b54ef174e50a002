use std::ops::Range;
use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::info;

use crate::config::FilterConfig;
use crate::platform::{EntityKind, SourceMessage};

/// Transforms a message before it is forwarded.
///
/// Filters only ever touch the message text; media is passed through untouched.
pub trait MessageFilter: Send + Sync {
    fn process(&self, message: SourceMessage) -> Result<SourceMessage>;
}

/// Passes messages through unchanged
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyMessageFilter;

impl MessageFilter for EmptyMessageFilter {
    fn process(&self, message: SourceMessage) -> Result<SourceMessage> {
        Ok(message)
    }
}

/// Punctuation that ends a sentence rather than a link
const TRAILING_PUNCTUATION: &[char] = &[
    '.', ',', ';', ':', '!', '?', ')', ']', '}', '\'', '"', '»', '…',
];

/// Removes blacklisted links from the message text.
///
/// A link is removed when it contains any blacklist pattern and no whitelist pattern.
/// Patterns match case-insensitively anywhere in the link. Only the link itself is cut:
/// surrounding text, punctuation and whitespace stay as they were. Hidden links behind
/// formatted text lose their target but keep their text.
#[derive(Debug, Clone)]
pub struct UrlMessageFilter {
    blacklist: Vec<String>,
    whitelist: Vec<String>,
    url: Regex,
}

impl UrlMessageFilter {
    pub fn new(blacklist: &[String], whitelist: &[String]) -> Result<Self> {
        let normalize = |patterns: &[String]| -> Vec<String> {
            patterns
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect()
        };

        let url = Regex::new(
            r#"(?i)\b(?:(?:https?|ftp)://[^\s<>«»"]+|www\.[^\s<>«»"]+|[a-z0-9](?:[a-z0-9-]*[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]*[a-z0-9])?)*\.[a-z]{2,}(?::\d+)?(?:[/?#][^\s<>«»"]*)?)"#,
        )
        .context("Failed to compile URL pattern")?;

        Ok(Self {
            blacklist: normalize(blacklist),
            whitelist: normalize(whitelist),
            url,
        })
    }

    fn is_blocked(&self, url: &str) -> bool {
        let lowered = url.to_lowercase();
        let blacklisted = self.blacklist.iter().any(|p| lowered.contains(p.as_str()));
        let whitelisted = self.whitelist.iter().any(|p| lowered.contains(p.as_str()));
        blacklisted && !whitelisted
    }

    /// Byte ranges of the blocked links in `text`, trailing punctuation excluded
    fn blocked_spans(&self, text: &str) -> Vec<Range<usize>> {
        self.url
            .find_iter(text)
            .filter_map(|found| {
                let url = found.as_str().trim_end_matches(TRAILING_PUNCTUATION);
                self.is_blocked(url)
                    .then(|| found.start()..found.start() + url.len())
            })
            .collect()
    }
}

impl MessageFilter for UrlMessageFilter {
    fn process(&self, mut message: SourceMessage) -> Result<SourceMessage> {
        if self.blacklist.is_empty() {
            return Ok(message);
        }

        let spans = self.blocked_spans(&message.text);
        message.remove_spans(&spans);
        message.entities.retain(|entity| match &entity.kind {
            EntityKind::TextLink { url } => !self.is_blocked(url),
            _ => true,
        });
        Ok(message)
    }
}

/// Applies filters in order
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn MessageFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, filter: impl MessageFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }
}

impl MessageFilter for FilterChain {
    fn process(&self, message: SourceMessage) -> Result<SourceMessage> {
        self.filters
            .iter()
            .try_fold(message, |message, filter| filter.process(message))
    }
}

/// Build the filter pipeline described by the configuration
pub fn build_filter(config: &FilterConfig) -> Result<Arc<dyn MessageFilter>> {
    if !config.remove_urls {
        info!("URL filter disabled; messages are forwarded unchanged");
        return Ok(Arc::new(EmptyMessageFilter));
    }

    let chain = FilterChain::new().with(UrlMessageFilter::new(
        &config.blacklist,
        &config.whitelist,
    )?);
    info!(
        "Filter pipeline: {} filter(s), {} blacklisted and {} whitelisted URL pattern(s)",
        chain.len(),
        config.blacklist.len(),
        config.whitelist.len()
    );
    Ok(Arc::new(chain))
}
