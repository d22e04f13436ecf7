use std::path::Path;

use anyhow::{anyhow, Result};
use subparse::timetypes::{TimePoint, TimeSpan};
use subparse::{get_subtitle_format, parse_str, SrtFile, SubtitleFileInterface, SubtitleFormat};

const DEFAULT_FPS: f64 = 25.0;

/// One timed subtitle line, times in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct Cue {
    pub start_ms: i64,
    pub end_ms: i64,
    pub text: String,
}

impl Cue {
    pub fn new(start_ms: i64, end_ms: i64, text: impl Into<String>) -> Self {
        Self {
            start_ms,
            end_ms,
            text: text.into(),
        }
    }
}

pub fn is_subtitle_file(path: &Path) -> bool {
    matches!(
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref(),
        Some("srt" | "ass" | "ssa" | "sub" | "idx")
    )
}

pub fn read_cues(path: &Path) -> Result<Vec<Cue>> {
    let content = std::fs::read_to_string(path)?;
    let format = get_subtitle_format(path.extension(), content.as_bytes())
        .ok_or_else(|| anyhow!("unknown subtitle format: {}", path.display()))?;
    parse_cues(format, &content)
}

pub fn parse_srt(content: &str) -> Result<Vec<Cue>> {
    parse_cues(SubtitleFormat::SubRip, content)
}

fn parse_cues(format: SubtitleFormat, content: &str) -> Result<Vec<Cue>> {
    let file = parse_str(format, content, DEFAULT_FPS).map_err(|e| anyhow!(e))?;
    let entries = file.get_subtitle_entries().map_err(|e| anyhow!(e))?;
    Ok(entries
        .into_iter()
        .map(|entry| Cue {
            start_ms: entry.timespan.start.msecs(),
            end_ms: entry.timespan.end.msecs(),
            text: entry.line.unwrap_or_default(),
        })
        .collect())
}

pub fn to_srt(cues: &[Cue]) -> Result<String> {
    let lines = cues
        .iter()
        .map(|cue| {
            (
                TimeSpan::new(
                    TimePoint::from_msecs(cue.start_ms),
                    TimePoint::from_msecs(cue.end_ms),
                ),
                cue.text.clone(),
            )
        })
        .collect();
    let file = SrtFile::create(lines).map_err(|e| anyhow!(e))?;
    let data = file.to_data().map_err(|e| anyhow!(e))?;
    Ok(String::from_utf8(data)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "1\n00:00:01,000 --> 00:00:02,500\nhello there\n\n2\n00:00:03,000 --> 00:00:04,000\nsecond line\n";

    #[test]
    fn test_parse_srt() -> Result<()> {
        let cues = parse_srt(SAMPLE)?;
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0], Cue::new(1000, 2500, "hello there"));
        assert_eq!(cues[1].text, "second line");
        Ok(())
    }

    #[test]
    fn test_written_srt_parses_back() -> Result<()> {
        let cues = vec![Cue::new(0, 1200, "你好"), Cue::new(1500, 3000, "world")];
        let text = to_srt(&cues)?;
        assert!(text.contains("00:00:01,200"));
        assert_eq!(parse_srt(&text)?, cues);
        Ok(())
    }

    #[test]
    fn test_is_subtitle_file() {
        assert!(is_subtitle_file(Path::new("a/b/movie.SRT")));
        assert!(!is_subtitle_file(Path::new("notes.txt")));
    }
}
