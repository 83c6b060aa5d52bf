//! Extended-attribute codec.
//!
//! All xattrs of one object live in a single user-metadata value, formatted
//! `name1:base64(value1);name2:base64(value2);…` with records kept in
//! ascending name order so lookups can stop at the first greater name.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{FsError, Result};

/// One decoded attribute record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XattrRecord {
    pub name: String,
    pub value: Vec<u8>,
}

/// Parse the serialised form into ordered records.
///
/// Records written by older tools may be out of order; sorting here keeps
/// the early-termination lookups sound either way.
pub fn parse(raw: &str) -> Vec<XattrRecord> {
    let mut records: Vec<XattrRecord> = raw
        .split(';')
        .filter(|rec| !rec.is_empty())
        .map(|rec| match rec.split_once(':') {
            Some((name, value)) => XattrRecord {
                name: name.to_string(),
                value: BASE64.decode(value).unwrap_or_default(),
            },
            None => XattrRecord {
                name: rec.to_string(),
                value: Vec::new(),
            },
        })
        .collect();
    records.sort_by(|a, b| a.name.cmp(&b.name));
    records
}

/// Serialise records back into the user-metadata value.
pub fn encode(records: &[XattrRecord]) -> String {
    records
        .iter()
        .map(|rec| format!("{}:{}", rec.name, BASE64.encode(&rec.value)))
        .collect::<Vec<_>>()
        .join(";")
}

/// Fetch one attribute's raw bytes.
pub fn get(raw: &str, name: &str) -> Option<Vec<u8>> {
    for record in parse(raw) {
        match record.name.as_str().cmp(name) {
            std::cmp::Ordering::Less => continue,
            std::cmp::Ordering::Equal => return Some(record.value),
            std::cmp::Ordering::Greater => return None,
        }
    }
    None
}

/// All attribute names in order.
pub fn names(raw: &str) -> Vec<String> {
    parse(raw).into_iter().map(|rec| rec.name).collect()
}

/// Insert or replace one attribute, honouring the create/replace flags.
///
/// `create_only` refuses an existing name with `EEXIST`; `replace_only`
/// refuses a missing name with `ENODATA`. The record lands at its sorted
/// position.
pub fn set(
    raw: &str,
    name: &str,
    value: &[u8],
    create_only: bool,
    replace_only: bool,
) -> Result<String> {
    let mut records = parse(raw);
    match records.binary_search_by(|rec| rec.name.as_str().cmp(name)) {
        Ok(idx) => {
            if create_only {
                return Err(FsError::Exists(name.to_string()));
            }
            records[idx].value = value.to_vec();
        }
        Err(idx) => {
            if replace_only {
                return Err(FsError::NoAttr(name.to_string()));
            }
            records.insert(
                idx,
                XattrRecord {
                    name: name.to_string(),
                    value: value.to_vec(),
                },
            );
        }
    }
    Ok(encode(&records))
}

/// Remove one attribute; `ENODATA` when absent.
pub fn remove(raw: &str, name: &str) -> Result<String> {
    let mut records = parse(raw);
    match records.binary_search_by(|rec| rec.name.as_str().cmp(name)) {
        Ok(idx) => {
            records.remove(idx);
            Ok(encode(&records))
        }
        Err(_) => Err(FsError::NoAttr(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_round_trip() {
        let raw = set("", "user.color", b"blue", false, false).unwrap();
        assert_eq!(get(&raw, "user.color"), Some(b"blue".to_vec()));
        assert_eq!(get(&raw, "user.shape"), None);
        assert_eq!(names(&raw), ["user.color"]);
    }

    #[test]
    fn records_stay_sorted() {
        let raw = set("", "user.b", b"2", false, false).unwrap();
        let raw = set(&raw, "user.a", b"1", false, false).unwrap();
        let raw = set(&raw, "user.c", b"3", false, false).unwrap();
        assert_eq!(names(&raw), ["user.a", "user.b", "user.c"]);
        assert_eq!(get(&raw, "user.a"), Some(b"1".to_vec()));
        assert_eq!(get(&raw, "user.c"), Some(b"3".to_vec()));
    }

    #[test]
    fn create_and_replace_flags() {
        let raw = set("", "user.a", b"1", true, false).unwrap();
        assert!(matches!(
            set(&raw, "user.a", b"2", true, false),
            Err(FsError::Exists(_))
        ));
        assert!(matches!(
            set(&raw, "user.missing", b"2", false, true),
            Err(FsError::NoAttr(_))
        ));
        let raw = set(&raw, "user.a", b"2", false, true).unwrap();
        assert_eq!(get(&raw, "user.a"), Some(b"2".to_vec()));
    }

    #[test]
    fn remove_drops_only_the_named_record() {
        let raw = set("", "user.a", b"1", false, false).unwrap();
        let raw = set(&raw, "user.b", b"2", false, false).unwrap();
        let raw = remove(&raw, "user.a").unwrap();
        assert_eq!(names(&raw), ["user.b"]);
        assert!(matches!(remove(&raw, "user.a"), Err(FsError::NoAttr(_))));
    }

    #[test]
    fn parse_tolerates_unsorted_and_binary_values() {
        let encoded = format!(
            "zeta:{};alpha:{}",
            BASE64.encode([0u8, 255, 7]),
            BASE64.encode(b"x")
        );
        let records = parse(&encoded);
        assert_eq!(records[0].name, "alpha");
        assert_eq!(records[1].value, vec![0u8, 255, 7]);
        assert_eq!(get(&encoded, "zeta"), Some(vec![0u8, 255, 7]));
    }
}
