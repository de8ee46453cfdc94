mod fetch;
mod parse;

pub use fetch::{feed_location_url, fetch_feed_bytes, is_url, load_feed_bytes, read_feed_file};
pub use parse::{Enclosure, FeedItem, Podcast, parse_feed};
