// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Feed format detection and parsing into the canonical podcast model.

mod atom;
mod duration;
mod rss;

pub use atom::AtomParser;
pub use duration::parse_duration_seconds;
pub use rss::RssParser;

use url::Url;

use crate::error::FeedError;
use crate::model::{Episode, Podcast};

/// Title used when a feed does not name itself
pub const UNTITLED_PODCAST: &str = "Untitled Podcast";
/// Title used when an item does not name itself
pub const UNTITLED_EPISODE: &str = "Untitled Episode";

/// A parsed feed: podcast metadata plus episodes in feed order
///
/// `podcast.episodes` is left empty; the episodes live alongside it so that
/// callers decide how to merge them.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub podcast: Podcast,
    pub episodes: Vec<Episode>,
}

/// Common contract of the format-specific parsers
pub trait FeedParser {
    /// Cheap structural sniff: does the document carry this format's root tag
    fn validate_document(&self, raw: &str) -> bool;

    /// Parse a whole document. Items without audio are skipped, not fatal.
    fn parse(&self, raw: &[u8], feed_url: &Url) -> Result<ParsedFeed, FeedError>;
}

/// Outcome of sniffing a raw document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedFormat {
    Rss,
    Atom,
    Unknown,
}

/// Pick a format by looking for the root tags, RSS first
pub fn detect_format(raw: &str) -> FeedFormat {
    if RssParser.validate_document(raw) {
        FeedFormat::Rss
    } else if AtomParser.validate_document(raw) {
        FeedFormat::Atom
    } else {
        FeedFormat::Unknown
    }
}

/// A structurally parsed feed document of either format
#[derive(Debug, Clone)]
pub enum FeedDocument {
    Rss(::rss::Channel),
    Atom(atom_syndication::Feed),
}

impl FeedDocument {
    /// Read a raw document, dispatching on the detected format.
    ///
    /// Documents that match neither signature are tried as RSS, then Atom.
    pub fn read(raw: &[u8], feed_url: &Url) -> Result<Self, FeedError> {
        let text = String::from_utf8_lossy(raw);
        match detect_format(&text) {
            FeedFormat::Rss => rss::read_channel(raw, feed_url).map(FeedDocument::Rss),
            FeedFormat::Atom => atom::read_feed(raw, feed_url).map(FeedDocument::Atom),
            FeedFormat::Unknown => rss::read_channel(raw, feed_url)
                .map(FeedDocument::Rss)
                .or_else(|rss_err| {
                    atom::read_feed(raw, feed_url)
                        .map(FeedDocument::Atom)
                        .map_err(|_| rss_err)
                }),
        }
    }

    pub fn format(&self) -> FeedFormat {
        match self {
            FeedDocument::Rss(_) => FeedFormat::Rss,
            FeedDocument::Atom(_) => FeedFormat::Atom,
        }
    }

    /// Map the document onto the canonical model
    pub fn into_parsed(self, feed_url: &Url) -> ParsedFeed {
        match self {
            FeedDocument::Rss(channel) => rss::channel_to_feed(&channel, feed_url),
            FeedDocument::Atom(feed) => atom::atom_to_feed(&feed, feed_url),
        }
    }
}

/// Detect, read and map a raw feed document
pub fn parse_feed(raw: &[u8], feed_url: &Url) -> Result<ParsedFeed, FeedError> {
    let document = FeedDocument::read(raw, feed_url)?;
    Ok(document.into_parsed(feed_url))
}

/// Trim and decode stray HTML entities; `None` when nothing is left
fn clean_text(raw: &str) -> Option<String> {
    let decoded = html_escape::decode_html_entities(raw.trim());
    let trimmed = decoded.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// First candidate that survives [`clean_text`]
fn first_text<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> Option<String> {
    candidates.into_iter().flatten().find_map(clean_text)
}

/// Resolve a possibly relative link against the feed URL
fn resolve_url(feed_url: &Url, raw: &str) -> Option<Url> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    feed_url
        .join(raw)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https"))
}
