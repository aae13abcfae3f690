//! Line parsers turning raw device output into [`ImuSample`]s.
//!
//! Lines arrive straight off a serial port, so partial and garbled lines are
//! routine. Parsers report them as `None` and never fail the caller.

use crate::{ImuSample, SAMPLE_LEN};

/// Capability shared by every supported device: turn one text line into a
/// fixed 9-scalar frame.
pub trait FrameParser {
    /// Returns `None` for anything that is not a complete frame.
    fn parse(&self, line: &str) -> Option<ImuSample>;
}

/// Separator that must directly follow every numeric token.
const DELIMITER: &[u8] = b", ";

/// Parser for the ICM-20948 firmware output:
///
/// ```text
/// &<ac_x>, <ac_y>, <ac_z>, <gyr_x>, <gyr_y>, <gyr_z>, <mag_x>, <mag_y>, <mag_z>, \r\n
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Icm20948Parser {
    sentinel: char,
}

impl Icm20948Parser {
    pub fn new(sentinel: char) -> Self {
        Self { sentinel }
    }

    pub fn sentinel(&self) -> char {
        self.sentinel
    }
}

impl Default for Icm20948Parser {
    fn default() -> Self {
        Self::new('&')
    }
}

impl FrameParser for Icm20948Parser {
    fn parse(&self, line: &str) -> Option<ImuSample> {
        // Check the start character first, garbage never reaches the scanner.
        if line.chars().next()? != self.sentinel {
            return None;
        }

        let mut values = [0.0; SAMPLE_LEN];
        let mut tokens = Tokens::new(line);
        for value in values.iter_mut() {
            // Overflowing tokens such as `1e999` convert to infinity
            *value = tokens.next()?.parse().ok().filter(|v: &f64| v.is_finite())?;
        }
        Some(ImuSample::from_array(values))
    }
}

/// Iterator over the numeric tokens of a line that are followed by `", "`.
/// Characters that do not start such a token are skipped.
struct Tokens<'a> {
    line: &'a str,
    pos: usize,
}

impl<'a> Tokens<'a> {
    fn new(line: &'a str) -> Self {
        Self { line, pos: 0 }
    }
}

impl<'a> Iterator for Tokens<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        let bytes = self.line.as_bytes();
        while self.pos < bytes.len() {
            let start = self.pos;
            if let Some(end) = scan_number(bytes, start) {
                if bytes[end..].starts_with(DELIMITER) {
                    self.pos = end + DELIMITER.len();
                    return Some(&self.line[start..end]);
                }
            }
            self.pos += 1;
        }
        None
    }
}

/// Matches `[+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?` at `start` and returns
/// the end offset of the match.
fn scan_number(bytes: &[u8], start: usize) -> Option<usize> {
    let mut pos = start;
    if matches!(bytes.get(pos), Some(b'+' | b'-')) {
        pos += 1;
    }

    let int_digits = count_digits(bytes, pos);
    pos += int_digits;

    let mut frac_digits = 0;
    if bytes.get(pos) == Some(&b'.') {
        frac_digits = count_digits(bytes, pos + 1);
        if int_digits > 0 || frac_digits > 0 {
            pos += 1 + frac_digits;
        }
    }
    if int_digits == 0 && frac_digits == 0 {
        return None;
    }

    if matches!(bytes.get(pos), Some(b'e' | b'E')) {
        let mut exp = pos + 1;
        if matches!(bytes.get(exp), Some(b'+' | b'-')) {
            exp += 1;
        }
        let exp_digits = count_digits(bytes, exp);
        if exp_digits > 0 {
            pos = exp + exp_digits;
        }
    }

    Some(pos)
}

fn count_digits(bytes: &[u8], from: usize) -> usize {
    bytes
        .get(from..)
        .map_or(0, |rest| rest.iter().take_while(|b| b.is_ascii_digit()).count())
}
