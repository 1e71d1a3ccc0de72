//! Incremental decoder for `text/event-stream` bodies.

/// One decoded event
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    Data(String),
    /// The `[DONE]` sentinel closing an OpenAI-style stream
    Done,
}

/// Splits a byte stream into `data:` events. Chunks may cut lines (and UTF-8 sequences)
/// anywhere; incomplete lines are kept until the rest arrives.
#[derive(Debug, Default)]
pub struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            if let Some(event) = parse_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line that was not newline-terminated
    pub fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.pending);
        parse_line(&rest)
    }
}

fn parse_line(raw: &[u8]) -> Option<SseEvent> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim_end_matches(['\r', '\n']);
    // comments start with ':'
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let (field, value) = line.split_once(':')?;
    if field.trim() != "data" {
        return None;
    }
    let value = value.strip_prefix(' ').unwrap_or(value);
    if value == "[DONE]" {
        Some(SseEvent::Done)
    } else {
        Some(SseEvent::Data(value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn joins_lines_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        let events = decoder.push(b"1}\n\ndata: [DONE]\n");
        assert_eq!(
            events,
            vec![SseEvent::Data("{\"a\":1}".into()), SseEvent::Done]
        );
    }

    #[test]
    fn skips_comments_and_other_fields() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": OPENROUTER PROCESSING\r\nevent: ping\r\ndata: x\r\n");
        assert_eq!(events, vec![SseEvent::Data("x".into())]);
    }

    #[test]
    fn keeps_multibyte_characters_cut_by_chunking() {
        let bytes = "data: caf\u{e9}\n".as_bytes();
        let (head, tail) = bytes.split_at(bytes.len() - 2);
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(head).is_empty());
        assert_eq!(decoder.push(tail), vec![SseEvent::Data("caf\u{e9}".into())]);
    }

    #[test]
    fn finish_flushes_unterminated_line() {
        let mut decoder = SseDecoder::new();
        decoder.push(b"data: tail");
        assert_eq!(decoder.finish(), Some(SseEvent::Data("tail".into())));
        assert_eq!(decoder.finish(), None);
    }
}
