//! Byte-offset to line/column mapping.

/// Computes the 1-based line and column for a byte offset.
///
/// Scans from the start of the source: LF increments the line and resets
/// the column, CR does not count towards the column. Offsets past the end
/// of the source resolve to the position of the last byte.
///
/// # Example
///
/// ```
/// use risa_util::line_column;
///
/// assert_eq!(line_column("var x;\nvar y;", 7), (2, 1));
/// ```
pub fn line_column(source: &str, index: u32) -> (usize, usize) {
    let mut line = 1;
    let mut column = 1;

    for byte in source.bytes().take(index as usize) {
        if byte == b'\n' {
            line += 1;
            column = 1;
        } else if byte != b'\r' {
            column += 1;
        }
    }

    (line, column)
}
