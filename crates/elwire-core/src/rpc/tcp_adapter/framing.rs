use crate::error::RpcError;

/// Largest partial line held while waiting for its delimiter.
pub(super) const MAX_LINE_LEN: usize = 4 * 1024 * 1024;

/// Accumulates raw socket bytes and yields complete `\n`-terminated lines
/// with the delimiter removed.
#[derive(Debug)]
pub(super) struct LineBuffer {
    buf: Vec<u8>,
    /// Bytes after the last delimiter seen.
    tail: usize,
    limit: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_limit(MAX_LINE_LEN)
    }
}

impl LineBuffer {
    pub(super) fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            tail: 0,
            limit,
        }
    }

    /// Append raw bytes. Fails once an unterminated line outgrows the limit;
    /// the connection is not recoverable after that.
    pub(super) fn extend(&mut self, bytes: &[u8]) -> Result<(), RpcError> {
        self.buf.extend_from_slice(bytes);
        self.tail = match bytes.iter().rposition(|&b| b == b'\n') {
            Some(end) => bytes.len() - end - 1,
            None => self.tail + bytes.len(),
        };
        if self.tail > self.limit {
            return Err(RpcError::InvalidResponse(format!(
                "line exceeds {} bytes without a delimiter",
                self.limit
            )));
        }
        Ok(())
    }

    /// Next complete line, skipping blank ones. A trailing `\r` is dropped.
    pub(super) fn next_line(&mut self) -> Option<Vec<u8>> {
        loop {
            if self.tail == self.buf.len() {
                return None;
            }
            let end = self.buf.iter().position(|&b| b == b'\n')?;
            let mut line: Vec<u8> = self.buf.drain(..=end).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            return Some(line);
        }
    }

    /// Bytes held back waiting for a delimiter.
    pub(super) fn buffered(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_multiple_lines_from_one_chunk() {
        let mut lines = LineBuffer::default();
        lines.extend(b"{\"a\":1}\n{\"b\":2}\n").expect("within limit");
        assert_eq!(lines.next_line().as_deref(), Some(&b"{\"a\":1}"[..]));
        assert_eq!(lines.next_line().as_deref(), Some(&b"{\"b\":2}"[..]));
        assert_eq!(lines.next_line(), None);
        assert_eq!(lines.buffered(), 0);
    }

    #[test]
    fn holds_partial_line_until_delimiter_arrives() {
        let mut lines = LineBuffer::default();
        lines.extend(b"{\"id\":").expect("within limit");
        assert_eq!(lines.next_line(), None);
        assert_eq!(lines.buffered(), 6);

        lines.extend(b"3}\n{\"id\"").expect("within limit");
        assert_eq!(lines.next_line().as_deref(), Some(&b"{\"id\":3}"[..]));
        assert_eq!(lines.next_line(), None);
        assert_eq!(lines.buffered(), 5);
    }

    #[test]
    fn skips_blank_lines_and_carriage_returns() {
        let mut lines = LineBuffer::default();
        lines.extend(b"\n\r\n{}\r\n").expect("within limit");
        assert_eq!(lines.next_line().as_deref(), Some(&b"{}"[..]));
        assert_eq!(lines.next_line(), None);
    }

    #[test]
    fn unterminated_line_over_limit_is_rejected() {
        let mut lines = LineBuffer::with_limit(8);
        lines.extend(b"{\"id\":1}\n1234").expect("complete line plus short tail");
        assert_eq!(lines.next_line().as_deref(), Some(&b"{\"id\":1}"[..]));

        lines.extend(b"5678").expect("tail exactly at limit");
        let err = lines.extend(b"9").expect_err("tail over limit");
        assert!(err.to_string().contains("8 bytes"));
    }

    #[test]
    fn long_complete_lines_only_count_their_tail() {
        let mut lines = LineBuffer::with_limit(4);
        lines
            .extend(b"0123456789\nab")
            .expect("delimited bytes do not count");
        assert_eq!(lines.next_line().as_deref(), Some(&b"0123456789"[..]));
        assert_eq!(lines.buffered(), 2);
    }
}
