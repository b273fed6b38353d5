// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/// Parse an episode duration into seconds.
///
/// Accepts `HH:MM:SS`, `MM:SS` and bare integer seconds. Anything else,
/// including values that overflow, yields 0.
pub fn parse_duration_seconds(raw: &str) -> u32 {
    parse_strict(raw.trim()).unwrap_or(0)
}

fn parse_strict(s: &str) -> Option<u32> {
    if s.is_empty() {
        return None;
    }

    let parts: Vec<u64> = s
        .split(':')
        .map(|part| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                None
            } else {
                part.parse().ok()
            }
        })
        .collect::<Option<_>>()?;

    if parts.len() > 3 {
        return None;
    }

    let total = parts
        .iter()
        .rev()
        .zip([1u64, 60, 3600])
        .try_fold(0u64, |acc, (value, unit)| {
            value.checked_mul(unit)?.checked_add(acc)
        })?;

    u32::try_from(total).ok()
}
