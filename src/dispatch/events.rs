//! Reply parsing: the model's raw text becomes a sequence of typed send
//! events. Blank lines split the reply into separate bubbles; a line of the
//! form `[image] https://... | caption` becomes a media event. Each event
//! carries a pacing delay so the sequence reads like a human typing.

use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendEvent {
    Text { body: String },
    Image { url: String, caption: Option<String> },
    Video { url: String, caption: Option<String> },
    Audio { url: String },
    Document { url: String, filename: Option<String> },
}

const MEDIA_TAGS: [&str; 4] = ["[image]", "[video]", "[audio]", "[document]"];

/// Split the model reply into ordered send events. Empty replies yield an
/// empty vec; the caller treats that as "nothing to send".
pub fn parse_reply(reply: &str) -> Vec<SendEvent> {
    let mut events = Vec::new();

    for paragraph in reply.split("\n\n") {
        let paragraph = paragraph.trim();
        if paragraph.is_empty() {
            continue;
        }

        // A paragraph may mix text lines with media directives.
        let mut text_lines: Vec<&str> = Vec::new();
        for line in paragraph.lines() {
            let trimmed = line.trim();
            if let Some(event) = parse_media_line(trimmed) {
                push_text(&mut events, &mut text_lines);
                events.push(event);
            } else if !trimmed.is_empty() {
                text_lines.push(trimmed);
            }
        }
        push_text(&mut events, &mut text_lines);
    }

    events
}

fn push_text(events: &mut Vec<SendEvent>, lines: &mut Vec<&str>) {
    if !lines.is_empty() {
        events.push(SendEvent::Text {
            body: lines.join("\n"),
        });
        lines.clear();
    }
}

fn parse_media_line(line: &str) -> Option<SendEvent> {
    let tag = MEDIA_TAGS
        .iter()
        .find(|t| line.to_lowercase().starts_with(**t))?;
    let rest = line[tag.len()..].trim();
    if rest.is_empty() {
        return None;
    }

    let (url, extra) = match rest.split_once('|') {
        Some((url, extra)) => (url.trim(), Some(extra.trim()).filter(|e| !e.is_empty())),
        None => (rest, None),
    };
    if !url.starts_with("http") {
        return None;
    }
    let url = url.to_string();
    let extra = extra.map(str::to_string);

    Some(match *tag {
        "[image]" => SendEvent::Image { url, caption: extra },
        "[video]" => SendEvent::Video { url, caption: extra },
        "[audio]" => SendEvent::Audio { url },
        _ => SendEvent::Document {
            url,
            filename: extra,
        },
    })
}

const MIN_TEXT_DELAY_MS: u64 = 800;
const MAX_TEXT_DELAY_MS: u64 = 4_000;
const PER_CHAR_MS: u64 = 35;
const MEDIA_DELAY_MS: u64 = 1_200;

/// Typing-speed pause before sending an event. Proportional to text length,
/// clamped; media gets a fixed pause.
pub fn pacing_delay(event: &SendEvent) -> Duration {
    let millis = match event {
        SendEvent::Text { body } => {
            let chars = body.chars().count() as u64;
            (chars * PER_CHAR_MS).clamp(MIN_TEXT_DELAY_MS, MAX_TEXT_DELAY_MS)
        }
        _ => MEDIA_DELAY_MS,
    };
    Duration::from_millis(millis)
}
