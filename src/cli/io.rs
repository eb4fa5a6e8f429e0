//! JSON output for the CLI
//!
//! One JSON object per line on stdout, UTF-8 only.

use std::io::{self, Write};

use serde::Serialize;
use serde_json::Value;

use super::errors::CliResult;

/// Write one record as a JSON line.
pub fn write_line<W: Write, T: Serialize>(out: &mut W, record: &T) -> CliResult<()> {
    serde_json::to_writer(&mut *out, record)?;
    writeln!(out)?;
    Ok(())
}

/// Write records to stdout, one per line.
pub fn write_records<T: Serialize>(records: &[T]) -> CliResult<()> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for record in records {
        write_line(&mut out, record)?;
    }
    out.flush()?;
    Ok(())
}

/// Write a success response to stdout
pub fn write_response(data: Value) -> CliResult<()> {
    write_records(&[serde_json::json!({
        "status": "ok",
        "data": data
    })])
}

/// Write an error response to stdout
pub fn write_error(code: &str, message: &str) -> CliResult<()> {
    write_records(&[serde_json::json!({
        "status": "error",
        "code": code,
        "message": message
    })])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_line_is_newline_terminated() {
        let mut buf = Vec::new();
        write_line(&mut buf, &serde_json::json!({"seq": 1})).unwrap();
        write_line(&mut buf, &serde_json::json!({"seq": 2})).unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "{\"seq\":1}\n{\"seq\":2}\n");
    }
}
