//! Caption-stream parsing and roll-up deduplication.
//!
//! Auto-generated caption streams come in two flavours. Live transcription
//! produces *roll-up* cues: each cue repeats the previous cue's text and
//! extends it with the words recognized since, annotated with word-level
//! timing tags. Plain uploads produce ordinary discrete cues. Parsing is
//! pure (`&str` in, segments out) and tries the roll-up parser first; the
//! discrete parser only runs when the roll-up pass finds nothing.

use regex::Regex;
use std::sync::OnceLock;

/// Marker the platform appends to roll-up cue timing lines. Discrete cue
/// files never carry it, which is what makes the two-tier strategy safe.
const ROLLUP_CUE_MARKER: &str = "align:start position:0%";

/// One timestamped caption line, ready for indexing.
///
/// Timestamps keep the stream's `HH:MM:SS.mmm` shape; `start <= stop` and
/// `text` is non-empty after trimming. Both invariants are enforced here,
/// at parse time, so nothing downstream has to re-check them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub start: String,
    pub stop: String,
    pub text: String,
}

fn inline_tag_regex() -> &'static Regex {
    static INLINE_TAG: OnceLock<Regex> = OnceLock::new();
    // Covers <c>, </c>, <v Name>, and inline word timings like <00:00:01.500>.
    INLINE_TAG.get_or_init(|| Regex::new(r"<[^>]*>").expect("inline tag regex compiles"))
}

/// Parses one raw caption stream into chronological segments.
///
/// Returns an empty vector when neither parser understands the input; the
/// caller decides how to report that (the pipeline logs the file as
/// unparsable and moves on).
pub fn parse_caption_stream(raw: &str) -> Vec<Segment> {
    let segments = parse_rollup_cues(raw);
    if !segments.is_empty() {
        return segments;
    }
    parse_discrete_cues(raw)
}

/// Roll-up parser: collapses incremental near-duplicate cues in place.
///
/// Keeps exactly one "open" segment at the tail of the output. When the
/// next cue's text is a continuation of the open segment's text (it starts
/// with it, after trim-normalization), the open segment is replaced with
/// the fuller text and the new end timestamp while keeping its original
/// start. Unrelated text closes the segment and opens a new one.
pub fn parse_rollup_cues(raw: &str) -> Vec<Segment> {
    let lines: Vec<&str> = raw.lines().collect();
    let mut out: Vec<Segment> = Vec::new();

    for (index, line) in lines.iter().enumerate() {
        if !line.trim_end().ends_with(ROLLUP_CUE_MARKER) {
            continue;
        }
        let Some((start, stop)) = split_timing_line(line) else {
            continue;
        };
        if !timestamps_ordered(&start, &stop) {
            continue;
        }

        // The payload is the single line right below the timing line; the
        // line after that repeats it with word-timing tags and is skipped
        // by construction (it never ends with the cue marker).
        let Some(payload) = lines.get(index + 1) else {
            continue;
        };
        if payload.contains("-->") {
            continue;
        }
        let text = clean_cue_text(payload);
        if text.is_empty() {
            continue;
        }

        match out.last_mut() {
            Some(open) if is_continuation(&open.text, &text) => {
                open.stop = stop;
                open.text = text;
            }
            _ => out.push(Segment { start, stop, text }),
        }
    }

    out
}

/// Discrete-cue fallback for streams without roll-up artifacts.
///
/// Deliberately permissive: header, NOTE/STYLE blocks, and cue identifiers
/// are skipped rather than rejected, because by the time this parser runs
/// the only question left is whether any usable cues exist at all.
pub fn parse_discrete_cues(raw: &str) -> Vec<Segment> {
    let lines: Vec<&str> = raw.lines().collect();
    let mut out = Vec::new();
    let mut index = 0;

    while index < lines.len() {
        let line = lines[index].trim();
        if !line.contains("-->") {
            index += 1;
            continue;
        }
        let Some((start, stop)) = split_timing_line(line) else {
            index += 1;
            continue;
        };

        index += 1;
        let mut payload = Vec::new();
        while index < lines.len() && !lines[index].trim().is_empty() {
            payload.push(lines[index]);
            index += 1;
        }

        if !timestamps_ordered(&start, &stop) {
            continue;
        }
        let text = clean_cue_text(&payload.join(" "));
        if text.is_empty() {
            continue;
        }
        out.push(Segment { start, stop, text });
    }

    out
}

/// Extracts `(start, stop)` from a `start --> stop [settings]` line.
fn split_timing_line(line: &str) -> Option<(String, String)> {
    let (lhs, rhs) = line.split_once("-->")?;
    let start = lhs.trim();
    let stop = rhs.trim().split_whitespace().next()?;
    if timestamp_to_seconds(start).is_none() || timestamp_to_seconds(stop).is_none() {
        return None;
    }
    Some((start.to_owned(), stop.to_owned()))
}

fn timestamps_ordered(start: &str, stop: &str) -> bool {
    match (timestamp_to_seconds(start), timestamp_to_seconds(stop)) {
        (Some(start), Some(stop)) => start <= stop,
        _ => false,
    }
}

/// Converts `HH:MM:SS.mmm` (or `MM:SS.mmm`) to seconds.
pub fn timestamp_to_seconds(timestamp: &str) -> Option<f64> {
    let parts: Vec<&str> = timestamp.split(':').collect();
    let (hours, minutes, seconds_part) = match parts.as_slice() {
        [h, m, s] => (h.parse::<f64>().ok()?, m.parse::<f64>().ok()?, *s),
        [m, s] => (0.0, m.parse::<f64>().ok()?, *s),
        _ => return None,
    };
    let seconds = seconds_part.parse::<f64>().ok()?;
    if hours < 0.0 || minutes < 0.0 || seconds < 0.0 {
        return None;
    }
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Strips inline timing/styling tags and collapses runs of whitespace.
fn clean_cue_text(payload: &str) -> String {
    let without_tags = inline_tag_regex().replace_all(payload, "");
    without_tags.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A cue continues the open segment when its text starts with the open
/// segment's text after trim-normalization. Equality counts: repeating a
/// stabilized line verbatim just refreshes the end timestamp.
fn is_continuation(open_text: &str, new_text: &str) -> bool {
    new_text.trim().starts_with(open_text.trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a roll-up stream where the same line grows by one word per
    /// cue, the way live transcription emits it.
    fn rollup_stream(lines: &[(&str, &str, &str)]) -> String {
        let mut raw = String::from("WEBVTT\nKind: captions\nLanguage: en\n\n");
        for (start, stop, text) in lines {
            raw.push_str(&format!(
                "{start} --> {stop} align:start position:0%\n{text}\n \n"
            ));
        }
        raw
    }

    #[test]
    fn rollup_collapse_keeps_one_segment_with_final_text() {
        let raw = rollup_stream(&[
            ("00:00:01.000", "00:00:02.000", "never"),
            ("00:00:02.000", "00:00:03.000", "never gonna"),
            ("00:00:03.000", "00:00:04.000", "never gonna give"),
            ("00:00:04.000", "00:00:05.000", "never gonna give you"),
            ("00:00:05.000", "00:00:06.500", "never gonna give you up"),
        ]);

        let segments = parse_caption_stream(&raw);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "never gonna give you up");
        assert_eq!(segments[0].start, "00:00:01.000");
        assert_eq!(segments[0].stop, "00:00:06.500");
    }

    #[test]
    fn rollup_unrelated_text_opens_a_new_segment() {
        let raw = rollup_stream(&[
            ("00:00:01.000", "00:00:02.000", "hello there"),
            ("00:00:02.000", "00:00:03.000", "hello there everyone"),
            ("00:00:03.000", "00:00:04.000", "welcome back"),
            ("00:00:04.000", "00:00:05.000", "welcome back to the show"),
        ]);

        let segments = parse_caption_stream(&raw);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "hello there everyone");
        assert_eq!(segments[0].stop, "00:00:03.000");
        assert_eq!(segments[1].text, "welcome back to the show");
        assert_eq!(segments[1].start, "00:00:03.000");
    }

    #[test]
    fn rollup_strips_word_timing_tags() {
        let raw = concat!(
            "WEBVTT\n\n",
            "00:00:01.000 --> 00:00:02.500 align:start position:0%\n",
            "so<00:00:01.200><c> today</c><00:00:01.800><c> we</c>\n",
        );
        let segments = parse_rollup_cues(raw);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "so today we");
    }

    #[test]
    fn rollup_drops_blank_payloads() {
        let raw = concat!(
            "WEBVTT\n\n",
            "00:00:01.000 --> 00:00:02.000 align:start position:0%\n",
            " \n",
            "00:00:02.000 --> 00:00:03.000 align:start position:0%\n",
            "actual words\n",
        );
        let segments = parse_rollup_cues(raw);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "actual words");
    }

    #[test]
    fn discrete_parser_runs_only_when_rollup_finds_nothing() {
        let raw = concat!(
            "WEBVTT\n\n",
            "1\n",
            "00:00:01.000 --> 00:00:04.000\n",
            "First block\n",
            "\n",
            "2\n",
            "00:00:04.000 --> 00:00:08.000\n",
            "Second block\n",
            "continues here\n",
        );

        assert!(parse_rollup_cues(raw).is_empty());

        let segments = parse_caption_stream(raw);
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "First block");
        assert_eq!(segments[1].text, "Second block continues here");
        assert_eq!(segments[1].start, "00:00:04.000");
        assert_eq!(segments[1].stop, "00:00:08.000");
    }

    #[test]
    fn discrete_parser_skips_cue_settings_and_styling() {
        let raw = concat!(
            "WEBVTT\n\n",
            "00:00:01.000 --> 00:00:02.000 line:50% align:middle\n",
            "<b>Styled</b> text\n",
        );
        let segments = parse_discrete_cues(raw);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].stop, "00:00:02.000");
        assert_eq!(segments[0].text, "Styled text");
    }

    #[test]
    fn empty_text_cues_never_survive_parsing() {
        let raw = concat!(
            "WEBVTT\n\n",
            "00:00:01.000 --> 00:00:02.000\n",
            "   \n",
            "\n",
            "00:00:02.000 --> 00:00:03.000\n",
            "<c>  </c>\n",
        );
        assert!(parse_caption_stream(raw).is_empty());
    }

    #[test]
    fn reversed_timestamps_are_discarded() {
        let raw = concat!(
            "WEBVTT\n\n",
            "00:00:05.000 --> 00:00:01.000\n",
            "backwards cue\n",
            "\n",
            "00:00:06.000 --> 00:00:07.000\n",
            "fine cue\n",
        );
        let segments = parse_caption_stream(raw);
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].text, "fine cue");
    }

    #[test]
    fn unparsable_input_yields_nothing() {
        assert!(parse_caption_stream("not a caption file at all\n").is_empty());
        assert!(parse_caption_stream("").is_empty());
    }

    #[test]
    fn output_stays_chronological() {
        let raw = rollup_stream(&[
            ("00:00:01.000", "00:00:02.000", "one"),
            ("00:00:02.000", "00:00:03.000", "two"),
            ("00:00:03.000", "00:00:04.000", "three"),
        ]);
        let segments = parse_caption_stream(&raw);
        let starts: Vec<f64> = segments
            .iter()
            .map(|segment| timestamp_to_seconds(&segment.start).unwrap())
            .collect();
        let mut sorted = starts.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert_eq!(starts, sorted);
    }

    #[test]
    fn timestamp_parsing_handles_short_form() {
        assert_eq!(timestamp_to_seconds("00:01.000"), Some(1.0));
        assert_eq!(timestamp_to_seconds("01:00:06.500"), Some(3606.5));
        assert_eq!(timestamp_to_seconds("nonsense"), None);
    }
}
