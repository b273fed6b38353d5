// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, FixedOffset, Utc};
use url::Url;

use crate::error::FeedError;
use crate::identity;
use crate::model::{Episode, EpisodeType, Podcast};

use super::{
    FeedParser, ParsedFeed, UNTITLED_EPISODE, UNTITLED_PODCAST, clean_text, first_text,
    parse_duration_seconds, resolve_url,
};

/// Parser for RSS 2.0 feeds, including the iTunes podcast namespace
#[derive(Debug, Default, Clone, Copy)]
pub struct RssParser;

impl FeedParser for RssParser {
    fn validate_document(&self, raw: &str) -> bool {
        raw.contains("<rss") || raw.contains("<rdf:RDF")
    }

    fn parse(&self, raw: &[u8], feed_url: &Url) -> Result<ParsedFeed, FeedError> {
        let channel = read_channel(raw, feed_url)?;
        Ok(channel_to_feed(&channel, feed_url))
    }
}

pub(super) fn read_channel(raw: &[u8], feed_url: &Url) -> Result<::rss::Channel, FeedError> {
    ::rss::Channel::read_from(raw).map_err(|e| FeedError::parse(feed_url.as_str(), e))
}

pub(super) fn channel_to_feed(channel: &::rss::Channel, feed_url: &Url) -> ParsedFeed {
    let podcast = channel_to_podcast(channel, feed_url);

    let episodes = channel
        .items()
        .iter()
        .enumerate()
        .filter_map(|(index, item)| match parse_episode(item, &podcast.id, feed_url) {
            Ok(episode) => Some(episode),
            Err(reason) => {
                tracing::debug!(
                    feed = %feed_url,
                    index = index,
                    title = item.title().unwrap_or_default(),
                    reason = reason,
                    "Skipping feed item"
                );
                None
            }
        })
        .collect();

    ParsedFeed { podcast, episodes }
}

fn channel_to_podcast(channel: &::rss::Channel, feed_url: &Url) -> Podcast {
    let itunes = channel.itunes_ext();

    let title = clean_text(channel.title()).unwrap_or_else(|| UNTITLED_PODCAST.to_string());

    let author = first_text([
        itunes.and_then(|ext| ext.author()),
        itunes
            .and_then(|ext| ext.owner())
            .and_then(|owner| owner.name()),
        channel.managing_editor(),
    ])
    .unwrap_or_default();

    let description = first_text([
        itunes.and_then(|ext| ext.summary()),
        Some(channel.description()),
    ])
    .unwrap_or_default();

    let image_url = itunes
        .and_then(|ext| ext.image())
        .and_then(|href| resolve_url(feed_url, href))
        .or_else(|| {
            channel
                .image()
                .and_then(|img| resolve_url(feed_url, img.url()))
        });

    let mut categories: Vec<String> = itunes
        .map(|ext| {
            ext.categories()
                .iter()
                .filter_map(|category| clean_text(category.text()))
                .collect()
        })
        .unwrap_or_default();
    if categories.is_empty() {
        categories = channel
            .categories()
            .iter()
            .filter_map(|category| clean_text(category.name()))
            .collect();
    }

    let mut podcast = Podcast::new(feed_url.clone(), title);
    podcast.author = author;
    podcast.description = description;
    podcast.image_url = image_url;
    podcast.website_url = resolve_url(feed_url, channel.link());
    podcast.categories = categories;
    podcast.language = channel.language().and_then(clean_text);
    podcast
}

fn parse_episode(
    item: &::rss::Item,
    podcast_id: &str,
    feed_url: &Url,
) -> Result<Episode, &'static str> {
    let enclosure = item.enclosure().ok_or("no enclosure")?;
    let audio_url =
        resolve_url(feed_url, enclosure.url()).ok_or("enclosure URL is not resolvable")?;

    let guid = item
        .guid()
        .map(|g| g.value().trim().to_string())
        .filter(|g| !g.is_empty());

    let itunes = item.itunes_ext();

    Ok(Episode {
        id: identity::episode_id(guid.as_deref(), audio_url.as_str()),
        podcast_id: podcast_id.to_string(),
        title: item
            .title()
            .and_then(clean_text)
            .unwrap_or_else(|| UNTITLED_EPISODE.to_string()),
        description: first_text([
            item.description(),
            itunes.and_then(|ext| ext.summary()),
            item.content(),
        ])
        .unwrap_or_default(),
        duration: itunes
            .and_then(|ext| ext.duration())
            .map(parse_duration_seconds)
            .unwrap_or(0),
        publish_date: item.pub_date().and_then(parse_rss_date),
        episode_number: itunes.and_then(|ext| ext.episode().and_then(|e| e.trim().parse().ok())),
        season_number: itunes.and_then(|ext| ext.season().and_then(|s| s.trim().parse().ok())),
        episode_type: itunes
            .and_then(|ext| ext.episode_type())
            .and_then(EpisodeType::from_feed_value),
        image_url: itunes
            .and_then(|ext| ext.image())
            .and_then(|href| resolve_url(feed_url, href)),
        file_size: enclosure
            .length()
            .trim()
            .parse::<u64>()
            .ok()
            .filter(|len| *len > 0),
        mime_type: clean_text(enclosure.mime_type()),
        audio_url,
        guid,
    })
}

/// Parse an RSS date, tolerating the usual deviations from RFC 2822
fn parse_rss_date(date_str: &str) -> Option<DateTime<Utc>> {
    let date_str = date_str.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(date_str) {
        return Some(dt.with_timezone(&Utc));
    }

    // Try common alternative formats
    const FORMATS: [&str; 4] = [
        "%a, %d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M:%S %z",
        "%Y-%m-%dT%H:%M:%S%:z",
        "%Y-%m-%d %H:%M:%S %z",
    ];

    FORMATS
        .iter()
        .find_map(|format| DateTime::<FixedOffset>::parse_from_str(date_str, format).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            DateTime::parse_from_rfc3339(date_str)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const SAMPLE_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:itunes="http://www.itunes.com/dtds/podcast-1.0.dtd">
  <channel>
    <title>Test Podcast</title>
    <description>A test podcast for unit testing</description>
    <link>https://example.com</link>
    <language>en-us</language>
    <managingEditor>editor@example.com</managingEditor>
    <image><url>https://example.com/small.jpg</url><title>t</title><link>https://example.com</link></image>
    <itunes:author>Test Author</itunes:author>
    <itunes:summary>The long podcast summary</itunes:summary>
    <itunes:image href="https://example.com/image.jpg"/>
    <itunes:category text="Technology"/>
    <item>
      <title>Episode 1</title>
      <description>First episode</description>
      <pubDate>Mon, 01 Jan 2024 12:00:00 +0000</pubDate>
      <guid>ep1-guid</guid>
      <enclosure url="https://example.com/ep1.mp3" length="1234567" type="audio/mpeg"/>
      <itunes:duration>30:00</itunes:duration>
      <itunes:episode>1</itunes:episode>
      <itunes:season>1</itunes:season>
      <itunes:episodeType>Trailer</itunes:episodeType>
    </item>
    <item>
      <title>Episode 2</title>
      <enclosure url="https://example.com/ep2.mp3" type="audio/mpeg"/>
      <itunes:duration>soon</itunes:duration>
      <itunes:episodeType>special</itunes:episodeType>
    </item>
  </channel>
</rss>"#;

    fn feed_url() -> Url {
        Url::parse("https://example.com/feed.xml").unwrap()
    }

    #[test]
    fn parse_feed_extracts_podcast_metadata() {
        let parsed = RssParser.parse(SAMPLE_FEED.as_bytes(), &feed_url()).unwrap();
        let podcast = parsed.podcast;

        assert_eq!(podcast.title, "Test Podcast");
        assert_eq!(podcast.description, "The long podcast summary");
        assert_eq!(podcast.author, "Test Author");
        assert_eq!(
            podcast.image_url.as_ref().map(Url::as_str),
            Some("https://example.com/image.jpg")
        );
        assert_eq!(podcast.website_url.as_ref().map(Url::as_str), Some("https://example.com/"));
        assert_eq!(podcast.categories, vec!["Technology".to_string()]);
        assert_eq!(podcast.language.as_deref(), Some("en-us"));
        assert_eq!(podcast.feed_url, feed_url());
        assert_eq!(podcast.id, identity::podcast_id(feed_url().as_str()));
    }

    #[test]
    fn parse_feed_extracts_episodes() {
        let parsed = RssParser.parse(SAMPLE_FEED.as_bytes(), &feed_url()).unwrap();
        assert_eq!(parsed.episodes.len(), 2);

        let ep1 = &parsed.episodes[0];
        assert_eq!(ep1.title, "Episode 1");
        assert_eq!(ep1.guid.as_deref(), Some("ep1-guid"));
        assert_eq!(ep1.id, identity::episode_id(Some("ep1-guid"), "https://example.com/ep1.mp3"));
        assert_eq!(ep1.duration, 1800);
        assert_eq!(ep1.episode_number, Some(1));
        assert_eq!(ep1.season_number, Some(1));
        assert_eq!(ep1.episode_type, Some(EpisodeType::Trailer));
        assert_eq!(ep1.file_size, Some(1234567));
        assert_eq!(ep1.mime_type.as_deref(), Some("audio/mpeg"));
        assert_eq!(
            ep1.publish_date,
            Some(Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap())
        );
    }

    #[test]
    fn parse_feed_handles_missing_optional_fields() {
        let parsed = RssParser.parse(SAMPLE_FEED.as_bytes(), &feed_url()).unwrap();

        let ep2 = &parsed.episodes[1];
        assert_eq!(ep2.title, "Episode 2");
        assert!(ep2.publish_date.is_none());
        assert_eq!(ep2.duration, 0);
        assert!(ep2.episode_number.is_none());
        assert!(ep2.episode_type.is_none());
        assert!(ep2.guid.is_none());
        assert_eq!(ep2.id, identity::episode_id(None, "https://example.com/ep2.mp3"));
    }

    #[test]
    fn parse_feed_skips_items_without_enclosure() {
        let feed = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>Test</title>
    <description>Test</description>
    <item><title>One</title><enclosure url="https://example.com/1.mp3" type="audio/mpeg"/></item>
    <item><title>No Audio</title></item>
    <item><title>Three</title><enclosure url="https://example.com/3.mp3" type="audio/mpeg"/></item>
  </channel>
</rss>"#;

        let parsed = RssParser.parse(feed.as_bytes(), &feed_url()).unwrap();
        let titles: Vec<_> = parsed.episodes.iter().map(|e| e.title.as_str()).collect();
        assert_eq!(titles, vec!["One", "Three"]);
    }

    #[test]
    fn falls_back_to_generic_channel_fields() {
        let feed = r#"<?xml version="1.0"?>
<rss version="2.0">
  <channel>
    <title>   </title>
    <description>Plain description</description>
    <managingEditor>editor@example.com</managingEditor>
    <image><url>/art.png</url><title>t</title><link>https://example.com</link></image>
    <category>News</category>
  </channel>
</rss>"#;

        let podcast = RssParser.parse(feed.as_bytes(), &feed_url()).unwrap().podcast;
        assert_eq!(podcast.title, UNTITLED_PODCAST);
        assert_eq!(podcast.author, "editor@example.com");
        assert_eq!(podcast.description, "Plain description");
        assert_eq!(
            podcast.image_url.as_ref().map(Url::as_str),
            Some("https://example.com/art.png")
        );
        assert_eq!(podcast.categories, vec!["News".to_string()]);
    }

    #[test]
    fn relative_enclosures_resolve_against_feed_url() {
        let feed = r#"<rss version="2.0"><channel><title>T</title>
<item><title>Rel</title><enclosure url="media/rel.mp3" type="audio/mpeg"/></item>
</channel></rss>"#;

        let parsed = RssParser.parse(feed.as_bytes(), &feed_url()).unwrap();
        assert_eq!(
            parsed.episodes[0].audio_url.as_str(),
            "https://example.com/media/rel.mp3"
        );
    }

    #[test]
    fn malformed_document_is_a_parse_error() {
        let err = RssParser
            .parse(b"<rss><channel><title>broken", &feed_url())
            .unwrap_err();
        assert!(matches!(err, FeedError::Parse { .. }));
    }

    #[test]
    fn relaxed_dates_are_accepted() {
        assert!(parse_rss_date("Mon, 01 Jan 2024 12:00:00 +0000").is_some());
        assert!(parse_rss_date("2024-01-01T12:00:00+00:00").is_some());
        assert!(parse_rss_date("yesterday").is_none());
    }
}
