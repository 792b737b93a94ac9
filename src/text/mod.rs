//! Incremental text segmentation for the LLM token stream.
//!
//! [`ClauseExtractor`] turns a stream of arbitrary-length string fragments
//! into progressively-available speakable clauses so synthesis can start
//! before the model finishes a full sentence. [`split_into_sentences`] is
//! the static variant for pre-known text, with abbreviation handling.

/// Sentence-final punctuation. A cut here is always taken.
const SENTENCE_PUNCT: &[char] = &['.', '!', '?'];

/// Clause punctuation. A cut here is only taken when the candidate clause
/// is long enough to sound natural on its own.
const CLAUSE_PUNCT: &[char] = &[',', ';', ':', '\u{2014}'];

/// Placeholder substituted for the period inside known abbreviations while
/// splitting, then restored.
const ABBREV_MARK: char = '\u{F8FF}';

/// Known abbreviations whose trailing period must not end a sentence.
const ABBREVIATIONS: &[&str] = &[
    "Mr.", "Mrs.", "Ms.", "Dr.", "Prof.", "Sr.", "Jr.", "St.", "vs.", "etc.", "e.g.", "i.e.",
    "a.m.", "p.m.", "U.S.", "U.K.",
];

/// Incremental clause extractor over a token stream.
///
/// Feed fragments with [`push()`](Self::push); each call returns every
/// clause that became extractable. Call [`flush()`](Self::flush) at
/// end-of-stream for the trailing remainder.
#[derive(Debug)]
pub struct ClauseExtractor {
    buffer: String,
    min_clause_words: usize,
}

impl ClauseExtractor {
    /// Create an extractor. `min_clause_words` is the minimum number of
    /// whitespace-separated words before a clause-punctuation cut is taken.
    pub fn new(min_clause_words: usize) -> Self {
        Self {
            buffer: String::new(),
            min_clause_words,
        }
    }

    /// Append a token and return any clauses that are now extractable, in
    /// order.
    pub fn push(&mut self, token: &str) -> Vec<String> {
        self.buffer.push_str(token);
        let mut clauses = Vec::new();
        while let Some(clause) = self.try_extract() {
            clauses.push(clause);
        }
        clauses
    }

    /// Flush the remaining buffer as a final clause, if non-empty.
    pub fn flush(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_owned())
        }
    }

    /// Text currently buffered and not yet extracted.
    pub fn pending(&self) -> &str {
        &self.buffer
    }

    fn try_extract(&mut self) -> Option<String> {
        // Sentence-final punctuation wins over clause punctuation even when
        // a comma appears earlier in the buffer.
        let cut = find_boundary(&self.buffer, SENTENCE_PUNCT)
            .or_else(|| self.find_clause_cut())?;

        let remainder = self.buffer[cut..].trim_start().to_owned();
        let mut clause = std::mem::replace(&mut self.buffer, remainder);
        clause.truncate(cut);
        let clause = clause.trim();
        if clause.is_empty() {
            // Punctuation with nothing before it; drop and keep scanning.
            return self.try_extract();
        }
        Some(clause.to_owned())
    }

    /// First clause-punctuation boundary whose candidate clause is long
    /// enough. Earlier, too-short boundaries are skipped so a later comma
    /// can still produce a natural-sounding cut.
    fn find_clause_cut(&self) -> Option<usize> {
        let mut from = 0;
        while let Some(rel) = find_boundary(&self.buffer[from..], CLAUSE_PUNCT) {
            let cut = from + rel;
            let words = self.buffer[..cut].split_whitespace().count();
            if words >= self.min_clause_words {
                return Some(cut);
            }
            from = cut;
        }
        None
    }
}

/// Find the end byte offset of the first `punct` character that is followed
/// by whitespace.
fn find_boundary(text: &str, punct: &[char]) -> Option<usize> {
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if punct.contains(&c)
            && let Some((_, next)) = chars.peek()
            && next.is_whitespace()
        {
            return Some(i + c.len_utf8());
        }
    }
    None
}

/// Split pre-known text into sentences on `.` `!` `?` followed by
/// whitespace, without false splits inside known abbreviations.
pub fn split_into_sentences(text: &str) -> Vec<String> {
    let mut masked = text.to_owned();
    for abbrev in ABBREVIATIONS {
        if masked.contains(abbrev) {
            let replacement: String = abbrev
                .chars()
                .map(|c| if c == '.' { ABBREV_MARK } else { c })
                .collect();
            masked = masked.replace(abbrev, &replacement);
        }
    }

    let mut sentences = Vec::new();
    let mut rest = masked.as_str();
    while let Some(cut) = find_boundary(rest, SENTENCE_PUNCT) {
        let sentence = rest[..cut].trim();
        if !sentence.is_empty() {
            sentences.push(unmask(sentence));
        }
        rest = rest[cut..].trim_start();
    }
    let tail = rest.trim();
    if !tail.is_empty() {
        sentences.push(unmask(tail));
    }
    sentences
}

fn unmask(sentence: &str) -> String {
    sentence.replace(ABBREV_MARK, ".")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extractor() -> ClauseExtractor {
        ClauseExtractor::new(4)
    }

    // ── Incremental extraction ───────────────────────────────

    #[test]
    fn incremental_stream_yields_sentence_before_next_token() {
        let mut ext = extractor();
        assert!(ext.push("Hello").is_empty());
        assert!(ext.push(", ").is_empty());
        assert!(ext.push("world").is_empty());
        assert_eq!(ext.push(". "), vec!["Hello, world.".to_owned()]);
        assert!(ext.push("Bye").is_empty());
        assert_eq!(ext.flush(), Some("Bye".to_owned()));
    }

    #[test]
    fn sentence_punctuation_beats_earlier_comma() {
        let mut ext = extractor();
        let clauses = ext.push("One, two, three, four. And more ");
        assert_eq!(clauses, vec!["One, two, three, four.".to_owned()]);
        assert_eq!(ext.pending(), "And more ");
    }

    #[test]
    fn clause_cut_requires_minimum_words() {
        let mut ext = extractor();
        // Three words before the comma: too short to cut.
        assert!(ext.push("one two three, ").is_empty());
        // A fourth word arrives, then another comma boundary.
        let clauses = ext.push("four, and onwards");
        assert_eq!(clauses, vec!["one two three, four,".to_owned()]);
    }

    #[test]
    fn em_dash_is_a_clause_boundary() {
        let mut ext = extractor();
        let clauses = ext.push("that was the plan all along \u{2014} or so we thought");
        assert_eq!(
            clauses,
            vec!["that was the plan all along \u{2014}".to_owned()]
        );
        assert_eq!(ext.flush(), Some("or so we thought".to_owned()));
    }

    #[test]
    fn punctuation_without_trailing_whitespace_keeps_buffering() {
        let mut ext = extractor();
        assert!(ext.push("Version 2.").is_empty());
        assert!(ext.push("1 shipped").is_empty());
        assert_eq!(ext.flush(), Some("Version 2.1 shipped".to_owned()));
    }

    #[test]
    fn multiple_sentences_in_one_token() {
        let mut ext = extractor();
        let clauses = ext.push("First. Second! Third? tail");
        assert_eq!(
            clauses,
            vec!["First.".to_owned(), "Second!".to_owned(), "Third?".to_owned()]
        );
        assert_eq!(ext.flush(), Some("tail".to_owned()));
    }

    #[test]
    fn flush_on_empty_buffer_is_none() {
        let mut ext = extractor();
        assert_eq!(ext.flush(), None);
        ext.push("something. ");
        // Extracted everything; whitespace-only remainder flushes to None.
        assert_eq!(ext.flush(), None);
    }

    // ── Static sentence splitting ────────────────────────────

    #[test]
    fn abbreviations_do_not_split() {
        assert_eq!(
            split_into_sentences("Dr. Smith went home. He was tired."),
            vec!["Dr. Smith went home.".to_owned(), "He was tired.".to_owned()]
        );
    }

    #[test]
    fn multi_period_abbreviations_survive() {
        assert_eq!(
            split_into_sentences("Use reds, blues, e.g. cobalt. Then stop."),
            vec![
                "Use reds, blues, e.g. cobalt.".to_owned(),
                "Then stop.".to_owned()
            ]
        );
    }

    #[test]
    fn trailing_fragment_without_punctuation_is_kept() {
        assert_eq!(
            split_into_sentences("Done. And then"),
            vec!["Done.".to_owned(), "And then".to_owned()]
        );
    }

    #[test]
    fn empty_and_whitespace_input() {
        assert!(split_into_sentences("").is_empty());
        assert!(split_into_sentences("   ").is_empty());
    }

    #[test]
    fn exclamation_and_question_marks_split() {
        assert_eq!(
            split_into_sentences("Really! Are you sure? Yes."),
            vec![
                "Really!".to_owned(),
                "Are you sure?".to_owned(),
                "Yes.".to_owned()
            ]
        );
    }
}
