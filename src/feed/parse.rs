// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use chrono::{DateTime, FixedOffset};
use url::Url;

use crate::error::FeedError;
use crate::model::{Episode, EpisodeId};

/// Represents a parsed podcast feed
#[derive(Debug, Clone)]
pub struct Podcast {
    pub title: String,
    pub description: Option<String>,
    pub image_url: Option<Url>,
    pub feed_url: Url,
    pub items: Vec<FeedItem>,
}

/// One playable item of a feed
#[derive(Debug, Clone)]
pub struct FeedItem {
    pub title: String,
    pub description: Option<String>,
    pub pub_date: Option<DateTime<FixedOffset>>,
    pub guid: Option<String>,
    pub enclosure: Enclosure,
    pub duration_secs: Option<f64>,
    pub image_url: Option<Url>,
}

/// Represents the audio file attached to an item
#[derive(Debug, Clone)]
pub struct Enclosure {
    pub url: Url,
    pub length: Option<u64>,
    pub mime_type: Option<String>,
}

impl FeedItem {
    /// Identity key of this item within `feed_url`
    pub fn identity(&self, feed_url: &str) -> EpisodeId {
        EpisodeId::derive(feed_url, self.guid.as_deref(), self.enclosure.url.as_str())
    }

    /// Convert into a fresh store record
    pub fn into_episode(self, feed_url: &str) -> Episode {
        let mut episode = Episode::new(
            self.identity(feed_url),
            self.title,
            self.enclosure.url.to_string(),
        );
        episode.air_date = self.pub_date;
        episode.duration_secs = self.duration_secs;
        episode.description = self.description;
        episode.image_url = self.image_url.map(String::from);
        episode.mime_type = self.enclosure.mime_type;
        episode.enclosure_length = self.enclosure.length;
        episode
    }
}

/// Parse feed XML bytes, trying RSS 2.0 first and Atom second
pub fn parse_feed(xml_bytes: &[u8], feed_url: Url) -> Result<Podcast, FeedError> {
    match rss::Channel::read_from(xml_bytes) {
        Ok(channel) => Ok(parse_rss(&channel, feed_url)),
        Err(rss_err) => match atom_syndication::Feed::read_from(xml_bytes) {
            Ok(feed) => Ok(parse_atom(&feed, feed_url)),
            Err(atom_err) => Err(FeedError::ParseFailed(format!(
                "not RSS ({rss_err}) or Atom ({atom_err})"
            ))),
        },
    }
}

fn parse_rss(channel: &rss::Channel, feed_url: Url) -> Podcast {
    let items = channel
        .items()
        .iter()
        .filter_map(|item| match parse_rss_item(item) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::debug!(feed = %feed_url, error = %e, "Skipping feed item");
                None
            }
        })
        .collect();

    let image_url = channel
        .image()
        .and_then(|img| Url::parse(img.url()).ok())
        .or_else(|| {
            channel
                .itunes_ext()
                .and_then(|ext| ext.image())
                .and_then(|url| Url::parse(url).ok())
        });

    Podcast {
        title: channel.title().to_string(),
        description: Some(channel.description().to_string()).filter(|s| !s.is_empty()),
        image_url,
        feed_url,
        items,
    }
}

fn parse_rss_item(item: &rss::Item) -> Result<FeedItem, FeedError> {
    let title = item
        .title()
        .map(String::from)
        .unwrap_or_else(|| "Untitled Episode".to_string());

    let enclosure = item
        .enclosure()
        .ok_or_else(|| FeedError::MissingEnclosure {
            title: title.clone(),
        })?;

    let enclosure_url = Url::parse(enclosure.url())?;

    let pub_date = item.pub_date().and_then(parse_date);

    let guid = item
        .guid()
        .map(|g| g.value().trim().to_string())
        .filter(|g| !g.is_empty());

    let itunes = item.itunes_ext();

    Ok(FeedItem {
        title,
        description: item.description().map(String::from),
        pub_date,
        guid,
        enclosure: Enclosure {
            url: enclosure_url,
            length: enclosure.length().parse().ok().filter(|&len| len > 0),
            mime_type: Some(enclosure.mime_type().to_string()).filter(|s| !s.is_empty()),
        },
        duration_secs: itunes
            .and_then(|ext| ext.duration())
            .and_then(parse_itunes_duration),
        image_url: itunes
            .and_then(|ext| ext.image())
            .and_then(|url| Url::parse(url).ok()),
    })
}

fn parse_atom(feed: &atom_syndication::Feed, feed_url: Url) -> Podcast {
    let items = feed
        .entries()
        .iter()
        .filter_map(|entry| {
            let enclosure = entry.links().iter().find(|link| link.rel() == "enclosure")?;
            let url = Url::parse(enclosure.href()).ok()?;

            let pub_date = entry
                .published()
                .or_else(|| Some(entry.updated()))
                .and_then(|dt| DateTime::parse_from_rfc3339(&dt.to_rfc3339()).ok());

            Some(FeedItem {
                title: entry.title().as_str().to_string(),
                description: entry.summary().map(|s| s.as_str().to_string()),
                pub_date,
                guid: Some(entry.id().trim().to_string()).filter(|id| !id.is_empty()),
                enclosure: Enclosure {
                    url,
                    length: enclosure.length().and_then(|l| l.parse().ok()),
                    mime_type: enclosure.mime_type().map(String::from),
                },
                duration_secs: None,
                image_url: None,
            })
        })
        .collect();

    Podcast {
        title: feed.title().as_str().to_string(),
        description: feed.subtitle().map(|s| s.as_str().to_string()),
        image_url: feed
            .logo()
            .or_else(|| feed.icon())
            .and_then(|url| Url::parse(url).ok()),
        feed_url,
        items,
    }
}

/// Parse RFC 2822 dates, tolerating a few common deviations
fn parse_date(date_str: &str) -> Option<DateTime<FixedOffset>> {
    let date_str = date_str.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(date_str) {
        return Some(dt);
    }

    let formats = [
        "%a, %d %b %Y %H:%M:%S %z",
        "%Y-%m-%dT%H:%M:%S%:z",
        "%Y-%m-%d %H:%M:%S %z",
    ];

    formats
        .iter()
        .find_map(|format| DateTime::parse_from_str(date_str, format).ok())
        .or_else(|| DateTime::parse_from_rfc3339(date_str).ok())
}

/// `itunes:duration` is either plain seconds or `[[HH:]MM:]SS`
fn parse_itunes_duration(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    let mut total = 0.0;
    let parts: Vec<&str> = raw.split(':').collect();
    if parts.len() > 3 {
        return None;
    }
    for part in parts {
        let value: f64 = part.trim().parse().ok()?;
        if value < 0.0 {
            return None;
        }
        total = total * 60.0 + value;
    }
    Some(total)
}
