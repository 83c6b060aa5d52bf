//! Content-type lookup from the system mime table.
//!
//! `/etc/mime.types` is parsed once on first use. Lookup tries the last
//! extension, then the second-to-last for double extensions such as
//! `archive.tar.gz`.

use std::collections::HashMap;
use std::sync::OnceLock;

const DEFAULT_MIME_FILE: &str = "/etc/mime.types";
const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

static MIME_TABLE: OnceLock<HashMap<String, String>> = OnceLock::new();

fn parse_table(text: &str) -> HashMap<String, String> {
    let mut table = HashMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(mimetype) = fields.next() else {
            continue;
        };
        for ext in fields {
            table.insert(ext.to_string(), mimetype.to_string());
        }
    }
    table
}

fn table() -> &'static HashMap<String, String> {
    MIME_TABLE.get_or_init(|| {
        std::fs::read_to_string(DEFAULT_MIME_FILE)
            .map(|text| parse_table(&text))
            .unwrap_or_default()
    })
}

/// Guess the content type of an object name from its extension.
pub fn guess(name: &str) -> &'static str {
    lookup(table(), name)
}

fn lookup<'t>(table: &'t HashMap<String, String>, name: &str) -> &'t str {
    let Some(last_dot) = name.rfind('.') else {
        return DEFAULT_MIME_TYPE;
    };
    let ext = &name[last_dot + 1..];
    if let Some(mimetype) = table.get(ext) {
        return mimetype;
    }
    // Second chance for double extensions.
    if let Some(prev_dot) = name[..last_dot].rfind('.') {
        if let Some(mimetype) = table.get(&name[prev_dot + 1..last_dot]) {
            return mimetype;
        }
    }
    DEFAULT_MIME_TYPE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_table() -> HashMap<String, String> {
        parse_table(
            "# comment line\n\
             text/plain\ttxt text\n\
             application/gzip gz\n\
             application/x-tar tar\n",
        )
    }

    #[test]
    fn looks_up_last_extension() {
        let table = test_table();
        assert_eq!(lookup(&table, "notes.txt"), "text/plain");
        assert_eq!(lookup(&table, "dir/file.text"), "text/plain");
    }

    #[test]
    fn falls_back_to_second_extension() {
        let table = test_table();
        // .gz wins over .tar when both are known.
        assert_eq!(lookup(&table, "backup.tar.gz"), "application/gzip");
        // Unknown outer extension falls back to the inner one.
        assert_eq!(lookup(&table, "backup.tar.unknown"), "application/x-tar");
    }

    #[test]
    fn unknown_names_get_the_default() {
        let table = test_table();
        assert_eq!(lookup(&table, "Makefile"), DEFAULT_MIME_TYPE);
        assert_eq!(lookup(&table, "weird.zzz"), DEFAULT_MIME_TYPE);
    }
}
