//! Text helpers: Telegram HTML formatting, message splitting, Russian
//! duration formatting and a retry wrapper for Telegram API calls.
//!
//! Regexes are declared with `lazy_regex!`, so patterns are validated at
//! compile time and built on first use.

#![allow(clippy::non_std_lazy_statics)]

use anyhow::Result;
use chrono::{DateTime, FixedOffset, Utc};
use lazy_regex::lazy_regex;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::warn;
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

static RE_CODE_BLOCK: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"```[\s\S]*?```");

static RE_CODE_BLOCK_FENCE: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"```(\w+)?\n([\s\S]*?)```");

static RE_BULLET: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"(?m)^[*-] ");

static RE_HEADING: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"(?m)^#{1,6} +(.+)$");

static RE_BOLD: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"\*\*(.*?)\*\*");

static RE_ITALIC: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"\*(.*?)\*");

static RE_INLINE_CODE: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"`(.*?)`");

static RE_MULTI_NEWLINE: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"\n{3,}");

/// Tags Telegram accepts in HTML parse mode
const TELEGRAM_TAGS: &[&str] = &["b", "i", "u", "s", "code", "pre", "a"];

/// Moscow time, used for every date shown to users
const MSK_OFFSET_SECS: i32 = 3 * 3600;

fn is_telegram_tag(name: &str) -> bool {
    let bare = name.strip_prefix('/').unwrap_or(name);
    TELEGRAM_TAGS.contains(&bare)
}

/// Escapes `<` and `>` unless they delimit a tag Telegram understands.
fn escape_angle_brackets(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut inside_tag = false;

    while let Some(pos) = rest.find(['<', '>']) {
        out.push_str(&rest[..pos]);
        let (bracket, tail) = rest[pos..].split_at(1);
        if bracket == "<" {
            let name_len = tail
                .char_indices()
                .find(|&(i, c)| !(c.is_ascii_alphanumeric() || (i == 0 && c == '/')))
                .map_or(tail.len(), |(i, _)| i);
            let name = &tail[..name_len];
            if is_telegram_tag(name) {
                out.push('<');
                inside_tag = true;
            } else {
                out.push_str("&lt;");
            }
        } else if inside_tag {
            out.push('>');
            inside_tag = false;
        } else {
            out.push_str("&gt;");
        }
        rest = tail;
    }
    out.push_str(rest);
    out
}

/// Escapes stray angle brackets while leaving fenced code blocks and
/// Telegram-supported tags untouched.
///
/// # Examples
///
/// ```
/// use neurochat_bot::utils::clean_html;
/// let cleaned = clean_html("1 < 2 but <b>bold</b> works");
/// assert_eq!(cleaned, "1 &lt; 2 but <b>bold</b> works");
/// ```
#[must_use]
pub fn clean_html(text: &str) -> String {
    // Random placeholders, so user text cannot collide with them
    let mut stashed: Vec<(String, String)> = Vec::new();
    let protected = RE_CODE_BLOCK.replace_all(text, |caps: &regex::Captures| {
        let key = format!("\u{0}CODE{}\u{0}", Uuid::new_v4().as_simple());
        stashed.push((key.clone(), caps.get(0).map_or("", |m| m.as_str()).to_owned()));
        key
    });

    let mut escaped = escape_angle_brackets(&protected);
    for (key, block) in stashed {
        escaped = escaped.replacen(&key, &block, 1);
    }
    escaped
}

/// Converts model Markdown into Telegram HTML.
///
/// # Examples
///
/// ```
/// use neurochat_bot::utils::format_text;
/// let html = format_text("**Bold** and *italic* with `code`");
/// assert_eq!(html, "<b>Bold</b> and <i>italic</i> with <code>code</code>");
/// ```
#[must_use]
pub fn format_text(text: &str) -> String {
    let cleaned = clean_html(text);

    let fenced = RE_CODE_BLOCK_FENCE.replace_all(&cleaned, |caps: &regex::Captures| {
        let lang = caps.get(1).map_or("", |m| m.as_str());
        let code = html_escape::encode_text(caps.get(2).map_or("", |m| m.as_str()).trim());
        format!("<pre><code class=\"{lang}\">{code}</code></pre>")
    });
    let headed = RE_HEADING.replace_all(&fenced, "<b>$1</b>");
    let bulleted = RE_BULLET.replace_all(&headed, "• ");
    let bold = RE_BOLD.replace_all(&bulleted, "<b>$1</b>");
    let italic = RE_ITALIC.replace_all(&bold, "<i>$1</i>");
    let inline = RE_INLINE_CODE.replace_all(&italic, |caps: &regex::Captures| {
        let code = html_escape::encode_text(caps.get(1).map_or("", |m| m.as_str()));
        format!("<code>{code}</code>")
    });

    RE_MULTI_NEWLINE
        .replace_all(&inline, "\n\n")
        .trim()
        .to_string()
}

/// Splits text into chunks of at most `max_length` bytes.
///
/// Lines are kept whole where possible. An open code fence is closed at the
/// end of a chunk and reopened at the start of the next one. A single line
/// longer than the limit is cut on grapheme boundaries.
///
/// # Examples
///
/// ```
/// use neurochat_bot::utils::split_long_message;
/// let parts = split_long_message(&"line\n".repeat(2000), 4000);
/// assert!(parts.len() > 1);
/// ```
#[must_use]
pub fn split_long_message(message: &str, max_length: usize) -> Vec<String> {
    const FENCE: &str = "```";

    if message.is_empty() {
        return Vec::new();
    }
    if message.len() <= max_length {
        return vec![message.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_code = false;

    let flush = |current: &mut String, parts: &mut Vec<String>, in_code: bool| {
        if current.is_empty() {
            return;
        }
        if in_code {
            current.push_str(FENCE);
        }
        parts.push(current.trim_end().to_string());
        current.clear();
        if in_code {
            current.push_str(FENCE);
            current.push('\n');
        }
    };

    for line in message.lines() {
        if line.len() > max_length {
            flush(&mut current, &mut parts, in_code);
            let mut chunk = String::new();
            for grapheme in line.graphemes(true) {
                if chunk.len() + grapheme.len() > max_length {
                    parts.push(std::mem::take(&mut chunk));
                }
                chunk.push_str(grapheme);
            }
            current.push_str(&chunk);
            current.push('\n');
            continue;
        }

        let toggles_fence = line.starts_with(FENCE);
        if current.len() + line.len() + 1 > max_length {
            flush(&mut current, &mut parts, in_code);
        }
        if toggles_fence {
            in_code = !in_code;
            // Reopened fence already present after a flush
            if !in_code && current == format!("{FENCE}\n") {
                current.clear();
                continue;
            }
        }
        current.push_str(line);
        current.push('\n');
    }

    if !current.trim().is_empty() {
        if in_code {
            current.push_str(FENCE);
        }
        parts.push(current.trim_end().to_string());
    }
    parts
}

/// Truncates to `max_chars` characters, never splitting a code point.
///
/// ```
/// use neurochat_bot::utils::truncate_str;
/// assert_eq!(truncate_str("Привет, мир!", 6), "Привет");
/// ```
pub fn truncate_str(s: impl AsRef<str>, max_chars: usize) -> String {
    let s = s.as_ref();
    match s.char_indices().nth(max_chars) {
        Some((pos, _)) => s[..pos].to_string(),
        None => s.to_string(),
    }
}

fn plural_ru(n: i64, one: &str, few: &str, many: &str) -> String {
    let word = match (n % 10, n % 100) {
        (1, r) if r != 11 => one,
        (2..=4, r) if !(12..=14).contains(&r) => few,
        _ => many,
    };
    format!("{n} {word}")
}

/// Formats a fractional number of days as e.g. `3 дня 5 часов`.
///
/// Hours are rounded, and 24 rounded hours carry into a day.
///
/// ```
/// use neurochat_bot::utils::format_days_hours;
/// assert_eq!(format_days_hours(1.5), "1 день 12 часов");
/// assert_eq!(format_days_hours(-2.0), "0 часов");
/// ```
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn format_days_hours(value: f64) -> String {
    if !value.is_finite() || value <= 0.0 {
        return "0 часов".to_string();
    }

    let mut days = value.trunc() as i64;
    let mut hours = ((value - value.trunc()) * 24.0).round() as i64;
    if hours == 24 {
        days += 1;
        hours = 0;
    }

    let mut parts = Vec::with_capacity(2);
    if days > 0 {
        parts.push(plural_ru(days, "день", "дня", "дней"));
    }
    if hours > 0 {
        parts.push(plural_ru(hours, "час", "часа", "часов"));
    }
    if parts.is_empty() {
        return "0 часов".to_string();
    }
    parts.join(" ")
}

/// Formats a timestamp in Moscow time as `dd.mm.YYYY HH:MM`
#[must_use]
pub fn format_msk(ts: DateTime<Utc>) -> String {
    FixedOffset::east_opt(MSK_OFFSET_SECS).map_or_else(
        || ts.format("%d.%m.%Y %H:%M").to_string(),
        |msk| ts.with_timezone(&msk).format("%d.%m.%Y %H:%M").to_string(),
    )
}

/// Retries a Telegram API call with exponential backoff and jitter.
///
/// Starts at `TELEGRAM_API_INITIAL_BACKOFF_MS`, caps every delay at
/// `TELEGRAM_API_MAX_BACKOFF_MS` and gives up after
/// `TELEGRAM_API_MAX_RETRIES` retries.
///
/// # Errors
///
/// Returns the last error if every attempt fails.
pub async fn retry_telegram_operation<F, Fut, T>(operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    use crate::config::{
        TELEGRAM_API_INITIAL_BACKOFF_MS, TELEGRAM_API_MAX_BACKOFF_MS, TELEGRAM_API_MAX_RETRIES,
    };

    let strategy = ExponentialBackoff::from_millis(TELEGRAM_API_INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(TELEGRAM_API_MAX_BACKOFF_MS))
        .map(jitter)
        .take(TELEGRAM_API_MAX_RETRIES);

    Retry::spawn(strategy, operation).await.map_err(|e| {
        warn!(
            "Telegram API operation failed after {} retries: {}",
            TELEGRAM_API_MAX_RETRIES, e
        );
        e
    })
}
