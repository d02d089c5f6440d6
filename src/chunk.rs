//! Line-range text chunker.
//!
//! Groups consecutive lines into [`LineChunk`]s of at most `max_chars`
//! characters (joined with `\n`). Lines are never split, so every chunk
//! maps back to an inclusive 1-based line range of its page; a single line
//! longer than `max_chars` becomes a chunk of its own.

/// A run of consecutive lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineChunk {
    /// First line, 1-based.
    pub line_from: usize,
    /// Last line, 1-based and inclusive.
    pub line_to: usize,
    pub text: String,
}

/// Split `lines` into chunks, skipping blank lines.
///
/// Line numbers count every input line, blank or not.
pub fn chunk_lines(lines: &[String], max_chars: usize) -> Vec<LineChunk> {
    let max_chars = max_chars.max(1);
    let mut chunks = Vec::new();
    let mut current: Option<LineChunk> = None;

    for (idx, line) in lines.iter().enumerate() {
        let number = idx + 1;
        if line.trim().is_empty() {
            continue;
        }
        let line_len = line.chars().count();

        if let Some(chunk) = current.as_mut() {
            // +1 for the joining newline
            if chunk.text.chars().count() + 1 + line_len <= max_chars {
                chunk.text.push('\n');
                chunk.text.push_str(line);
                chunk.line_to = number;
                continue;
            }
        }

        if let Some(done) = current.take() {
            chunks.push(done);
        }
        current = Some(LineChunk {
            line_from: number,
            line_to: number,
            text: line.clone(),
        });
    }

    if let Some(done) = current {
        chunks.push(done);
    }
    chunks
}
