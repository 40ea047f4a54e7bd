//! Spreadsheet gateway: the four row/column operations session tracking
//! needs, addressed by 1-based row and column indices.

#[cfg(feature = "io")]
pub mod google;

use std::fmt;

/// Spreadsheet operations consumed by the handlers.
#[allow(async_fn_in_trait)]
pub trait SheetGateway {
    /// Append `values` as a new row and return the row index it landed on.
    async fn append_row(&self, values: &[String]) -> Result<u32, SheetError>;

    /// Every value in `column`, top to bottom, trailing blanks dropped.
    async fn read_column(&self, column: u32) -> Result<Vec<String>, SheetError>;

    async fn update_cell(&self, row: u32, column: u32, value: &str) -> Result<(), SheetError>;

    /// The values of `row`, trailing blanks dropped.
    async fn read_row(&self, row: u32) -> Result<Vec<String>, SheetError>;
}

#[derive(Debug)]
pub enum SheetError {
    /// Non-success status from the spreadsheet API.
    Api { status: u16, body: String },
    /// Network failure talking to the API.
    Transport(String),
    /// Response did not have the expected shape.
    Parse(String),
    /// Could not obtain an access token.
    Auth(String),
}

impl fmt::Display for SheetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SheetError::Api { status, body } => {
                write!(f, "spreadsheet API error {}: {}", status, body)
            }
            SheetError::Transport(e) => write!(f, "spreadsheet transport error: {}", e),
            SheetError::Parse(e) => write!(f, "unexpected spreadsheet response: {}", e),
            SheetError::Auth(e) => write!(f, "spreadsheet auth error: {}", e),
        }
    }
}

impl std::error::Error for SheetError {}

// ---------------------------------------------------------------------------
// A1 notation
// ---------------------------------------------------------------------------

/// 1-based column index to letters: 1 → `A`, 27 → `AA`.
pub fn column_letters(mut column: u32) -> String {
    let mut letters = Vec::new();
    while column > 0 {
        let rem = (column - 1) % 26;
        letters.push(b'A' + rem as u8);
        column = (column - 1) / 26;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

/// `A1`-style reference for a single cell.
pub fn cell_ref(row: u32, column: u32) -> String {
    format!("{}{}", column_letters(column), row)
}

/// First row number in a range such as `Sheet1!A5:D5` or `'My Sheet'!A12`.
pub fn range_start_row(range: &str) -> Option<u32> {
    let cells = range.rsplit_once('!').map_or(range, |(_, cells)| cells);
    let first = cells.split(':').next()?;
    let digits: String = first
        .chars()
        .skip_while(|c| c.is_ascii_alphabetic() || *c == '$')
        .filter(|c| *c != '$')
        .collect();
    digits.parse().ok().filter(|&row| row > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_letters_roll_over() {
        assert_eq!(column_letters(1), "A");
        assert_eq!(column_letters(4), "D");
        assert_eq!(column_letters(26), "Z");
        assert_eq!(column_letters(27), "AA");
        assert_eq!(column_letters(703), "AAA");
    }

    #[test]
    fn cell_ref_puts_column_first() {
        assert_eq!(cell_ref(12, 3), "C12");
    }

    #[test]
    fn range_start_row_handles_sheet_prefixes() {
        assert_eq!(range_start_row("Sheet1!A5:D5"), Some(5));
        assert_eq!(range_start_row("'GPU log'!A120:D120"), Some(120));
        assert_eq!(range_start_row("B7"), Some(7));
        assert_eq!(range_start_row("Sheet1!$A$9"), Some(9));
        assert_eq!(range_start_row("Sheet1!A:A"), None);
    }
}
