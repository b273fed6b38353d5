// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Stable identifiers for podcasts and episodes.
//!
//! Identifiers are derived from feed data alone, so the same feed URL or GUID
//! maps to the same id on every run. The hash is a 32-bit rolling hash: it is
//! not collision free, but ids are always interpreted within a single feed.

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Hash an arbitrary string into a short base-36 token
pub fn hash(input: &str) -> String {
    let value = input
        .encode_utf16()
        .fold(0i32, |acc, unit| {
            acc.wrapping_shl(5).wrapping_sub(acc).wrapping_add(i32::from(unit))
        })
        .unsigned_abs();

    to_base36(value)
}

/// Identifier for the podcast published at `feed_url`
pub fn podcast_id(feed_url: &str) -> String {
    format!("podcast-{}", hash(feed_url))
}

/// Identifier for an episode, keyed on the feed GUID when it has one
pub fn episode_id(guid: Option<&str>, audio_url: &str) -> String {
    let key = guid
        .map(str::trim)
        .filter(|g| !g.is_empty())
        .unwrap_or(audio_url);
    format!("episode-{}", hash(key))
}

fn to_base36(mut value: u32) -> String {
    if value == 0 {
        return "0".to_string();
    }

    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36_DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();

    String::from_utf8_lossy(&digits).into_owned()
}
