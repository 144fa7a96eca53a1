/// Split plain text into chunks of at most `limit` bytes.
///
/// Prefers line boundaries; a single line longer than `limit` is cut on char boundaries.
pub fn split_text_chunks(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    if text.len() <= limit {
        return vec![text.to_string()];
    }

    let mut out: Vec<String> = Vec::new();
    let mut chunk = String::new();

    for line in text.split_inclusive('\n') {
        if chunk.len() + line.len() <= limit {
            chunk.push_str(line);
            continue;
        }

        if !chunk.is_empty() {
            out.push(std::mem::take(&mut chunk));
        }

        if line.len() <= limit {
            chunk.push_str(line);
            continue;
        }

        for ch in line.chars() {
            if chunk.len() + ch.len_utf8() > limit {
                out.push(std::mem::take(&mut chunk));
            }
            chunk.push(ch);
        }
    }

    if !chunk.is_empty() {
        out.push(chunk);
    }
    out
}
