//! Document chunking with provenance-preserving offset maps.
//!
//! Papers over a per-analyzer character threshold are split into
//! overlapping chunks before being sent to the LLM. Claim provenance
//! must reference positions in the *original* document, so each chunk
//! carries its absolute character range and the pages it spans; a
//! [`PageMap`] converts absolute offsets back to 1-based page numbers.
//!
//! Page boundaries are recognized as form-feed characters (`\x0c`), the
//! convention used by text extracted from paginated PDFs. Documents
//! without form feeds are treated as a single page.

use serde::{Deserialize, Serialize};

/// Map from absolute character offsets to 1-based page numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMap {
    /// Start offset (in chars) of each page, ascending. Page 1 starts
    /// at offset 0.
    page_starts: Vec<usize>,
}

impl PageMap {
    /// Build a page map from extracted text with form-feed page breaks.
    pub fn from_text(text: &str) -> Self {
        let mut page_starts = vec![0];
        for (idx, ch) in text.chars().enumerate() {
            if ch == '\x0c' {
                page_starts.push(idx + 1);
            }
        }
        Self { page_starts }
    }

    /// Total number of pages.
    pub fn page_count(&self) -> usize {
        self.page_starts.len()
    }

    /// 1-based page number containing the given absolute char offset.
    pub fn page_of(&self, offset: usize) -> u32 {
        match self.page_starts.binary_search(&offset) {
            Ok(idx) => (idx + 1) as u32,
            Err(idx) => idx as u32,
        }
    }

    /// All pages intersecting the half-open range `[start, end)`.
    pub fn pages_for_range(&self, start: usize, end: usize) -> Vec<u32> {
        if end <= start {
            return vec![self.page_of(start)];
        }
        let first = self.page_of(start);
        let last = self.page_of(end.saturating_sub(1));
        (first..=last).collect()
    }
}

/// One chunk of a document, with its absolute position retained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    /// Zero-based chunk index.
    pub index: usize,
    /// Absolute char offset of the chunk start in the original document.
    pub char_start: usize,
    /// Exclusive absolute end offset.
    pub char_end: usize,
    /// Chunk text.
    pub text: String,
    /// 1-based pages this chunk spans.
    pub pages: Vec<u32>,
}

/// Split `text` into chunks of at most `threshold` characters with
/// `overlap` fractional overlap between neighbors.
///
/// Documents at or under the threshold come back as a single chunk.
/// Chunk boundaries prefer the nearest whitespace at or before the
/// nominal cut so words are not split; provenance offsets stay exact
/// either way.
pub fn chunk_document(text: &str, threshold: usize, overlap: f64) -> Vec<DocumentChunk> {
    let chars: Vec<char> = text.chars().collect();
    let page_map = PageMap::from_text(text);
    let total = chars.len();

    if total == 0 {
        return Vec::new();
    }
    if threshold == 0 || total <= threshold {
        return vec![DocumentChunk {
            index: 0,
            char_start: 0,
            char_end: total,
            text: text.to_string(),
            pages: page_map.pages_for_range(0, total),
        }];
    }

    let overlap = overlap.clamp(0.0, 0.5);
    let overlap_chars = (threshold as f64 * overlap) as usize;
    let stride = threshold.saturating_sub(overlap_chars).max(1);

    let mut chunks = Vec::new();
    let mut start = 0usize;
    let mut index = 0usize;
    while start < total {
        let nominal_end = (start + threshold).min(total);
        let end = if nominal_end == total {
            total
        } else {
            soften_boundary(&chars, start, nominal_end)
        };

        let chunk_text: String = chars[start..end].iter().collect();
        chunks.push(DocumentChunk {
            index,
            char_start: start,
            char_end: end,
            text: chunk_text,
            pages: page_map.pages_for_range(start, end),
        });

        if end == total {
            break;
        }
        index += 1;
        start = end.saturating_sub(overlap_chars).max(start + 1).min(start + stride);
    }
    chunks
}

/// Pull a cut point back to the nearest whitespace within the final 10%
/// of the chunk, when one exists.
fn soften_boundary(chars: &[char], start: usize, nominal_end: usize) -> usize {
    let window = ((nominal_end - start) / 10).max(1);
    let floor = nominal_end.saturating_sub(window).max(start + 1);
    (floor..nominal_end)
        .rev()
        .find(|&i| chars[i].is_whitespace())
        .map(|i| i + 1)
        .unwrap_or(nominal_end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_page_without_form_feeds() {
        let map = PageMap::from_text("plain text with no page breaks");
        assert_eq!(map.page_count(), 1);
        assert_eq!(map.page_of(0), 1);
        assert_eq!(map.page_of(25), 1);
    }

    #[test]
    fn page_boundaries_at_form_feeds() {
        // "aaaa" | page break | "bbbb" | page break | "cccc"
        let text = "aaaa\x0cbbbb\x0ccccc";
        let map = PageMap::from_text(text);
        assert_eq!(map.page_count(), 3);
        assert_eq!(map.page_of(0), 1);
        assert_eq!(map.page_of(4), 1);
        assert_eq!(map.page_of(5), 2);
        assert_eq!(map.page_of(10), 3);
        assert_eq!(map.pages_for_range(3, 12), vec![1, 2, 3]);
    }

    #[test]
    fn short_document_is_one_chunk() {
        let chunks = chunk_document("short document", 1000, 0.1);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].char_start, 0);
        assert_eq!(chunks[0].char_end, 14);
        assert_eq!(chunks[0].pages, vec![1]);
    }

    #[test]
    fn long_document_chunks_cover_everything() {
        let text = "word ".repeat(1000); // 5000 chars
        let chunks = chunk_document(&text, 1200, 0.1);
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].char_start, 0);
        assert_eq!(chunks.last().unwrap().char_end, 5000);
        // Every offset is covered by at least one chunk.
        for pair in chunks.windows(2) {
            assert!(pair[1].char_start <= pair[0].char_end);
        }
        // Chunk text matches its recorded range.
        let chars: Vec<char> = text.chars().collect();
        for chunk in &chunks {
            let expect: String = chars[chunk.char_start..chunk.char_end].iter().collect();
            assert_eq!(chunk.text, expect);
        }
    }

    #[test]
    fn chunks_overlap_by_requested_fraction() {
        let text = "x".repeat(3000);
        let chunks = chunk_document(&text, 1000, 0.2);
        assert!(chunks.len() >= 3);
        let overlap = chunks[0].char_end - chunks[1].char_start;
        // No whitespace, so boundaries are exact: 20% of 1000.
        assert_eq!(overlap, 200);
    }

    #[test]
    fn boundaries_prefer_whitespace() {
        let mut text = "a".repeat(995);
        text.push(' ');
        text.push_str(&"b".repeat(600));
        let chunks = chunk_document(&text, 1000, 0.0);
        assert_eq!(chunks[0].char_end, 996);
        assert!(chunks[0].text.ends_with(' '));
    }

    #[test]
    fn zero_threshold_means_no_chunking() {
        let chunks = chunk_document("anything at all", 0, 0.1);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn empty_document_yields_no_chunks() {
        assert!(chunk_document("", 1000, 0.1).is_empty());
    }

    #[test]
    fn chunk_pages_track_original_document() {
        let text = format!("{}\x0c{}", "a".repeat(800), "b".repeat(800));
        let chunks = chunk_document(&text, 600, 0.0);
        assert!(chunks.len() >= 3);
        assert_eq!(chunks[0].pages, vec![1]);
        assert!(chunks.last().unwrap().pages.contains(&2));
    }
}
