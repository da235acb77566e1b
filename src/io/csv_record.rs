//! Single-line CSV record encoding for chat logs.
//!
//! Every record occupies exactly one physical line. Fields that contain the
//! delimiter or a quote are quoted with doubled inner quotes; line breaks inside
//! a field are folded to a space before encoding.

use thiserror::Error;

/// Field delimiter of chat log records
pub const FIELD_DELIMITER: char = ',';

/// Why a record line could not be split into fields.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("unterminated quoted field")]
    UnterminatedQuote,

    #[error("unexpected character after closing quote at column {column}")]
    TrailingAfterQuote { column: usize },

    #[error("bare quote inside unquoted field at column {column}")]
    BareQuote { column: usize },
}

/// CSVフィールドをエスケープ
pub fn escape_field(field: &str) -> String {
    let field = fold_line_breaks(field);
    if field.contains(FIELD_DELIMITER) || field.contains('"') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field
    }
}

/// Encode fields as one record line, including the trailing newline.
pub fn encode_record(fields: &[&str]) -> String {
    let mut line = fields
        .iter()
        .map(|f| escape_field(f))
        .collect::<Vec<_>>()
        .join(&FIELD_DELIMITER.to_string());
    line.push('\n');
    line
}

/// Split one record line (without its line terminator) into fields.
pub fn parse_record(line: &str) -> Result<Vec<String>, RecordError> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut chars = line.chars().enumerate().peekable();
    let mut in_quotes = false;
    let mut was_quoted = false;

    while let Some((column, c)) = chars.next() {
        if in_quotes {
            if c == '"' {
                if matches!(chars.peek(), Some((_, '"'))) {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                    match chars.peek() {
                        None | Some((_, FIELD_DELIMITER)) => {}
                        Some((column, _)) => {
                            return Err(RecordError::TrailingAfterQuote { column: *column })
                        }
                    }
                }
            } else {
                current.push(c);
            }
            continue;
        }

        match c {
            FIELD_DELIMITER => {
                fields.push(std::mem::take(&mut current));
                was_quoted = false;
            }
            '"' if current.is_empty() && !was_quoted => {
                in_quotes = true;
                was_quoted = true;
            }
            '"' => return Err(RecordError::BareQuote { column }),
            _ => current.push(c),
        }
    }

    if in_quotes {
        return Err(RecordError::UnterminatedQuote);
    }

    fields.push(current);
    Ok(fields)
}

fn fold_line_breaks(field: &str) -> String {
    if !field.contains(['\r', '\n']) {
        return field.to_string();
    }
    field.replace("\r\n", " ").replace(['\r', '\n'], " ")
}
