//! Text and JSON schedule parsing

use super::OutageWindow;
use crate::error::{PowerwatchError, Result};
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

type Pattern = Lazy<std::result::Result<Regex, regex::Error>>;

static PARAGRAPH_END: Pattern = Lazy::new(|| Regex::new(r"(?i)</p\s*>"));
static TAG: Pattern = Lazy::new(|| Regex::new(r"<[^>]*>"));
static TIME_RANGE: Pattern =
    Lazy::new(|| Regex::new(r"з\s+(\d{1,2}):(\d{2})\s+до\s+(\d{1,2}):(\d{2})"));

fn bad_pattern(e: &regex::Error) -> PowerwatchError {
    PowerwatchError::parse(format!("Bad pattern: {}", e))
}

fn cached(pattern: &'static Pattern) -> Result<&'static Regex> {
    (**pattern).as_ref().map_err(bad_pattern)
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern).map_err(|e| bad_pattern(&e))
}

fn json(document: &str) -> Result<Value> {
    serde_json::from_str(document)
        .map_err(|e| PowerwatchError::parse(format!("Schedule document is not JSON: {}", e)))
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Flatten HTML into one line of text per closed paragraph.
pub fn html_to_lines(html: &str) -> Result<Vec<String>> {
    let paragraph_end = cached(&PARAGRAPH_END)?;
    let tag = cached(&TAG)?;

    let mut chunks: Vec<&str> = paragraph_end.split(html).collect();
    // Text after the last closing tag never forms a paragraph
    chunks.pop();

    Ok(chunks
        .into_iter()
        .map(|chunk| decode_entities(&tag.replace_all(chunk, "")).trim().to_string())
        .filter(|line| !line.is_empty())
        .collect())
}

/// `з HH:MM до HH:MM` ranges from one line of text.
pub fn parse_time_ranges(text: &str, date: NaiveDate) -> Result<Vec<OutageWindow>> {
    cached(&TIME_RANGE)?
        .captures_iter(text)
        .map(|caps| {
            let num = |i: usize| -> Result<u32> {
                caps[i].parse::<u32>().map_err(|e| {
                    PowerwatchError::parse(format!("Bad time in '{}': {}", &caps[0], e))
                })
            };
            OutageWindow::from_clock(date, (num(1)?, num(2)?), (num(3)?, num(4)?))
        })
        .collect()
}

/// Windows listed for `group` in a paragraph document.
///
/// A document that never mentions the group has no windows for it.
pub fn parse_group_windows(html: &str, group: &str, date: NaiveDate) -> Result<Vec<OutageWindow>> {
    let group_line = compile(&format!(r"(?i)^Група\s+{}\.\s+(.+)", regex::escape(group)))?;
    for line in html_to_lines(html)? {
        if let Some(caps) = group_line.captures(&line) {
            return parse_time_ranges(&caps[1], date);
        }
    }
    Ok(Vec::new())
}

/// The `rawHtml` of the "Today" menu item in a Lvivoblenergo menu document.
pub fn lvivoblenergo_today_html(document: &str) -> Result<Option<String>> {
    let body = json(document)?;
    let Some(first) = body
        .get("hydra:member")
        .and_then(|m| m.as_array())
        .and_then(|m| m.first())
    else {
        return Ok(None);
    };
    let items = first
        .get("menuItems")
        .and_then(|items| items.as_array())
        .ok_or_else(|| PowerwatchError::parse("Menu without menuItems"))?;

    Ok(items
        .iter()
        .find(|item| item.get("name").and_then(|n| n.as_str()) == Some("Today"))
        .map(|item| {
            item.get("rawHtml")
                .and_then(|h| h.as_str())
                .unwrap_or_default()
                .to_string()
        }))
}

/// `Definite` slots for `group` today in a YASNO planned-outages document.
pub fn yasno_windows(document: &str, group: &str, date: NaiveDate) -> Result<Vec<OutageWindow>> {
    let body = json(document)?;
    if !body.is_object() {
        return Err(PowerwatchError::parse("YASNO document is not an object"));
    }
    let Some(slots) = body
        .get(group)
        .and_then(|g| g.get("today"))
        .and_then(|t| t.get("slots"))
        .and_then(|s| s.as_array())
    else {
        return Ok(Vec::new());
    };

    let minutes = |slot: &Value, key: &str| -> Result<u32> {
        slot.get(key)
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| PowerwatchError::parse(format!("Slot without numeric '{}'", key)))
    };

    slots
        .iter()
        .filter(|slot| slot.get("type").and_then(|t| t.as_str()) == Some("Definite"))
        .map(|slot| {
            OutageWindow::from_minutes(date, minutes(slot, "start")?, minutes(slot, "end")?)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()
    }

    #[test]
    fn test_fixed_patterns_compile() {
        for pattern in [&PARAGRAPH_END, &TAG, &TIME_RANGE] {
            assert!(cached(pattern).is_ok());
        }
    }

    #[test]
    fn test_html_lines() {
        let html = "<div><p>Графік</p>\
                    <p><b>Група 4.1.</b>&nbsp;Електроенергії немає з 08:00 до 12:00.</p>tail</div>";
        let lines = html_to_lines(html).unwrap();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], "Графік");
        assert!(lines[1].starts_with("Група 4.1. "));
    }

    #[test]
    fn test_group_windows() {
        let html = "<p>Група 4.1. Електроенергії немає з 08:00 до 12:00, з 20:00 до 24:00.</p>\
                    <p>Група 4.2. Електроенергії немає з 12:00 до 16:00.</p>";
        let windows = parse_group_windows(html, "4.1", day()).unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[1].duration_hours(), 4.0);

        let other = parse_group_windows(html, "4.2", day()).unwrap();
        assert_eq!(other.len(), 1);
    }

    #[test]
    fn test_group_is_matched_literally() {
        let html = "<p>Група 411. з 08:00 до 12:00</p>";
        assert!(parse_group_windows(html, "4.1", day()).unwrap().is_empty());
    }

    #[test]
    fn test_bad_clock_is_parse_error() {
        assert!(parse_time_ranges("з 25:00 до 26:00", day()).is_err());
        assert!(parse_time_ranges("нічого", day()).unwrap().is_empty());
    }

    #[test]
    fn test_lvivoblenergo_document() {
        let doc = r#"{"hydra:member":[{"menuItems":[
            {"name":"Tomorrow","rawHtml":"<p>x</p>"},
            {"name":"Today","rawHtml":"<p>Група 4.1. з 10:00 до 14:00</p>"}]}]}"#;
        let html = lvivoblenergo_today_html(doc).unwrap().unwrap();
        assert!(html.contains("10:00"));
        assert_eq!(lvivoblenergo_today_html(r#"{"hydra:member":[]}"#).unwrap(), None);
        assert!(lvivoblenergo_today_html("<html>").is_err());
        assert!(lvivoblenergo_today_html(r#"{"hydra:member":[{}]}"#).is_err());
    }

    #[test]
    fn test_yasno_document() {
        let doc = r#"{"2.1":{"today":{"slots":[
            {"start":0,"end":240,"type":"Definite"},
            {"start":600,"end":720,"type":"Possible"},
            {"start":1200,"end":1440,"type":"Definite"}]}}}"#;
        let windows = yasno_windows(doc, "2.1", day()).unwrap();
        assert_eq!(windows.len(), 2);
        assert_eq!(windows[0].duration_hours(), 4.0);
        assert!(yasno_windows(doc, "3.1", day()).unwrap().is_empty());
        assert!(yasno_windows("[]", "2.1", day()).is_err());
    }
}
