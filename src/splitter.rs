//! Bytes-to-lines adapter.
//!
//! Feeds arbitrary chunks of text to a callback one complete line at a time,
//! buffering the trailing partial line across chunks. The remainder is
//! flushed on drop. Used by the crash reporter for backtrace output and for
//! multi-line broker error bodies.

/// Splits a stream of text chunks into lines delivered to `sink`.
pub struct LineSplitter<F: FnMut(&str)> {
    sink: F,
    partial: String,
}

impl<F: FnMut(&str)> LineSplitter<F> {
    pub fn new(sink: F) -> Self {
        Self { sink, partial: String::new() }
    }

    /// Feed one chunk. Every `\n`-terminated line is forwarded; the tail is
    /// kept until the next chunk completes it.
    pub fn feed(&mut self, chunk: &str) {
        let mut rest = chunk;
        while let Some(lf) = rest.find('\n') {
            if self.partial.is_empty() {
                (self.sink)(&rest[..lf]);
            } else {
                self.partial.push_str(&rest[..lf]);
                let line = std::mem::take(&mut self.partial);
                (self.sink)(&line);
            }
            rest = &rest[lf + 1..];
        }
        self.partial.push_str(rest);
    }
}

impl<F: FnMut(&str)> Drop for LineSplitter<F> {
    fn drop(&mut self) {
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            (self.sink)(&line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn split(chunks: &[&str]) -> Vec<String> {
        let lines = RefCell::new(Vec::new());
        {
            let mut splitter = LineSplitter::new(|line: &str| {
                lines.borrow_mut().push(line.to_owned());
            });
            for chunk in chunks {
                splitter.feed(chunk);
            }
        }
        lines.into_inner()
    }

    #[test]
    fn emits_one_line_per_linefeed() {
        assert_eq!(split(&["a\nb\nc\n"]), vec!["a", "b", "c"]);
    }

    #[test]
    fn trailing_partial_is_flushed_on_drop() {
        // three line feeds, input does not end with \n => 3 lines + 1 partial
        assert_eq!(split(&["a\nb\nc\ntail"]), vec!["a", "b", "c", "tail"]);
    }

    #[test]
    fn partial_line_spans_chunks() {
        assert_eq!(split(&["hel", "lo\nwor", "ld\n"]), vec!["hello", "world"]);
    }

    #[test]
    fn empty_lines_are_preserved() {
        assert_eq!(split(&["\n\nx\n"]), vec!["", "", "x"]);
    }

    #[test]
    fn no_input_no_lines() {
        assert_eq!(split(&[]), Vec::<String>::new());
        assert_eq!(split(&[""]), Vec::<String>::new());
    }
}
