// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use atom_syndication::extension::{Extension, ExtensionMap};
use atom_syndication::{Entry, Feed, FixedDateTime, Link};
use chrono::{DateTime, Utc};
use url::Url;

use crate::error::FeedError;
use crate::identity;
use crate::model::{Episode, EpisodeType, Podcast};

use super::{
    FeedParser, ParsedFeed, UNTITLED_EPISODE, UNTITLED_PODCAST, clean_text, first_text,
    parse_duration_seconds, resolve_url,
};

const ITUNES_NAMESPACE: &str = "http://www.itunes.com/dtds/podcast-1.0.dtd";
const MEDIA_NAMESPACE: &str = "http://search.yahoo.com/mrss/";

/// Parser for Atom 1.0 feeds
#[derive(Debug, Default, Clone, Copy)]
pub struct AtomParser;

impl FeedParser for AtomParser {
    fn validate_document(&self, raw: &str) -> bool {
        raw.contains("<feed")
    }

    fn parse(&self, raw: &[u8], feed_url: &Url) -> Result<ParsedFeed, FeedError> {
        let feed = read_feed(raw, feed_url)?;
        Ok(atom_to_feed(&feed, feed_url))
    }
}

pub(super) fn read_feed(raw: &[u8], feed_url: &Url) -> Result<Feed, FeedError> {
    Feed::read_from(raw).map_err(|e| FeedError::parse(feed_url.as_str(), e))
}

/// Extension prefixes as bound by the document
struct Prefixes<'a> {
    itunes: &'a str,
    media: &'a str,
}

impl<'a> Prefixes<'a> {
    fn of(feed: &'a Feed) -> Self {
        let bound = |namespace: &str, fallback: &'a str| {
            feed.namespaces()
                .iter()
                .find(|(_, uri)| uri.as_str() == namespace)
                .map(|(prefix, _)| prefix.as_str())
                .unwrap_or(fallback)
        };
        Self {
            itunes: bound(ITUNES_NAMESPACE, "itunes"),
            media: bound(MEDIA_NAMESPACE, "media"),
        }
    }
}

fn extension<'a>(map: &'a ExtensionMap, prefix: &str, name: &str) -> Option<&'a Extension> {
    map.get(prefix)?.get(name)?.first()
}

fn extension_value<'a>(map: &'a ExtensionMap, prefix: &str, name: &str) -> Option<&'a str> {
    extension(map, prefix, name)?.value()
}

fn extension_attr<'a>(
    map: &'a ExtensionMap,
    prefix: &str,
    name: &str,
    attr: &str,
) -> Option<&'a str> {
    extension(map, prefix, name)?
        .attrs()
        .get(attr)
        .map(String::as_str)
}

pub(super) fn atom_to_feed(feed: &Feed, feed_url: &Url) -> ParsedFeed {
    let prefixes = Prefixes::of(feed);
    let podcast = atom_to_podcast(feed, &prefixes, feed_url);

    let episodes = feed
        .entries()
        .iter()
        .enumerate()
        .filter_map(|(index, entry)| match parse_entry(entry, &prefixes, &podcast.id, feed_url) {
            Ok(episode) => Some(episode),
            Err(reason) => {
                tracing::debug!(
                    feed = %feed_url,
                    index = index,
                    title = entry.title().as_str(),
                    reason = reason,
                    "Skipping feed entry"
                );
                None
            }
        })
        .collect();

    ParsedFeed { podcast, episodes }
}

fn atom_to_podcast(feed: &Feed, prefixes: &Prefixes<'_>, feed_url: &Url) -> Podcast {
    let ext = feed.extensions();
    let title =
        first_text([Some(feed.title().as_str())]).unwrap_or_else(|| UNTITLED_PODCAST.to_string());

    let mut podcast = Podcast::new(feed_url.clone(), title);
    podcast.author = first_text([
        extension_value(ext, prefixes.itunes, "author"),
        feed.authors().first().map(|person| person.name()),
    ])
    .unwrap_or_default();
    podcast.description = first_text([
        extension_value(ext, prefixes.itunes, "summary"),
        feed.subtitle().map(|text| text.as_str()),
    ])
    .unwrap_or_default();
    podcast.image_url = [
        extension_attr(ext, prefixes.itunes, "image", "href"),
        feed.logo(),
        feed.icon(),
    ]
    .into_iter()
    .flatten()
    .find_map(|href| resolve_url(feed_url, href));
    podcast.website_url = feed
        .links()
        .iter()
        .find(|link| link.rel() == "alternate")
        .and_then(|link| resolve_url(feed_url, link.href()));
    podcast.categories = feed
        .categories()
        .iter()
        .filter_map(|category| clean_text(category.label().unwrap_or(category.term())))
        .collect();
    podcast.language = feed.lang().and_then(clean_text);
    podcast
}

fn parse_entry(
    entry: &Entry,
    prefixes: &Prefixes<'_>,
    podcast_id: &str,
    feed_url: &Url,
) -> Result<Episode, &'static str> {
    let enclosure: &Link = entry
        .links()
        .iter()
        .find(|link| link.rel() == "enclosure")
        .ok_or("no enclosure link")?;
    let audio_url =
        resolve_url(feed_url, enclosure.href()).ok_or("enclosure URL is not resolvable")?;

    let guid = Some(entry.id().trim())
        .filter(|id| !id.is_empty())
        .map(str::to_string);
    let ext = entry.extensions();

    Ok(Episode {
        id: identity::episode_id(guid.as_deref(), audio_url.as_str()),
        podcast_id: podcast_id.to_string(),
        title: first_text([Some(entry.title().as_str())])
            .unwrap_or_else(|| UNTITLED_EPISODE.to_string()),
        description: first_text([
            entry.summary().map(|text| text.as_str()),
            entry.content().and_then(|content| content.value()),
            extension_value(ext, prefixes.itunes, "summary"),
        ])
        .unwrap_or_default(),
        duration: extension_value(ext, prefixes.itunes, "duration")
            .map(parse_duration_seconds)
            .unwrap_or(0),
        publish_date: entry
            .published()
            .and_then(to_utc)
            .or_else(|| to_utc(entry.updated())),
        episode_number: extension_value(ext, prefixes.itunes, "episode")
            .and_then(|e| e.trim().parse().ok()),
        season_number: extension_value(ext, prefixes.itunes, "season")
            .and_then(|s| s.trim().parse().ok()),
        episode_type: extension_value(ext, prefixes.itunes, "episodeType")
            .and_then(EpisodeType::from_feed_value),
        image_url: [
            extension_attr(ext, prefixes.itunes, "image", "href"),
            extension_attr(ext, prefixes.media, "thumbnail", "url"),
        ]
        .into_iter()
        .flatten()
        .find_map(|href| resolve_url(feed_url, href)),
        file_size: enclosure
            .length()
            .and_then(|len| len.trim().parse::<u64>().ok())
            .filter(|len| *len > 0),
        mime_type: enclosure.mime_type().and_then(clean_text),
        audio_url,
        guid,
    })
}

/// A missing `<updated>` reads back as the Unix epoch; treat it as undated
fn to_utc(date: &FixedDateTime) -> Option<DateTime<Utc>> {
    (date.timestamp() != 0).then(|| date.with_timezone(&Utc))
}
