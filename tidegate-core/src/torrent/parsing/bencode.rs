//! Bencode decoding of metainfo files and info dictionaries

use std::ops::Range;

use super::types::{Info, MetaInfo};
use crate::torrent::TorrentError;

pub(super) type BencodeDict<'a> = std::collections::HashMap<&'a [u8], bencode_rs::Value<'a>>;
pub(super) type ParseResult<T> = Result<T, TorrentError>;

fn invalid(reason: impl Into<String>) -> TorrentError {
    TorrentError::InvalidTorrentFile {
        reason: reason.into(),
    }
}

/// Bencode parsing utilities for metainfo extraction.
pub struct BencodeParser;

impl BencodeParser {
    /// Decodes a metainfo file.
    ///
    /// The info dictionary is kept as the exact byte span from the input, so
    /// its hash matches the one peers and magnet links use. A metainfo without
    /// an `info` key decodes with empty `info_bytes`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - Malformed bencode or wrongly typed fields
    pub fn parse_metainfo(data: &[u8]) -> ParseResult<MetaInfo> {
        let parsed = bencode_rs::Value::parse(data)
            .map_err(|e| invalid(format!("Bencode parsing failed: {e:?}")))?;
        let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
            return Err(invalid("Root element must be dictionary"));
        };

        let info_bytes = match Self::find_dictionary_value(data, b"info")? {
            Some(span) if data[span.start] == b'd' => data[span].to_vec(),
            Some(_) => return Err(invalid("Info field must be dictionary")),
            None => Vec::new(),
        };

        Ok(MetaInfo {
            info_bytes,
            announce: Self::optional_string(dict, b"announce")?,
            announce_list: Self::extract_announce_list(dict),
            nodes: Self::extract_nodes(dict),
            creation_date: Self::optional_integer(dict, b"creation date")?,
            comment: Self::optional_string(dict, b"comment")?,
            created_by: Self::optional_string(dict, b"created by")?,
            encoding: Self::optional_string(dict, b"encoding")?,
            url_list: Self::extract_url_list(dict),
        })
    }

    /// Decodes a bare info dictionary.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - Missing fields, bad piece table or
    ///   piece count inconsistent with the total length
    pub fn parse_info(info_bytes: &[u8]) -> ParseResult<Info> {
        let parsed = bencode_rs::Value::parse(info_bytes)
            .map_err(|e| invalid(format!("Bencode parsing failed: {e:?}")))?;
        let Some(bencode_rs::Value::Dictionary(dict)) = parsed.first() else {
            return Err(invalid("Info must be dictionary"));
        };

        let name = Self::extract_bytes_as_string(dict, b"name")?;
        let piece_length = Self::extract_integer(dict, b"piece length")?;
        if piece_length <= 0 {
            return Err(invalid(format!("Invalid piece length: {piece_length}")));
        }
        let piece_length = piece_length as u64;

        let pieces_bytes = Self::extract_bytes(dict, b"pieces")?;
        if !pieces_bytes.len().is_multiple_of(20) {
            return Err(invalid("Invalid pieces length"));
        }
        let pieces: Vec<[u8; 20]> = pieces_bytes
            .chunks(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        let info = if let Some(bencode_rs::Value::Integer(length)) = dict.get(b"length".as_slice())
        {
            if *length < 0 {
                return Err(invalid("Negative length"));
            }
            Info::single_file(name, piece_length, pieces, *length as u64)
        } else if let Some(bencode_rs::Value::List(files)) = dict.get(b"files".as_slice()) {
            let files = Self::extract_files(files)?;
            files
                .iter()
                .try_fold(0u64, |total, (_, length)| total.checked_add(*length))
                .ok_or_else(|| invalid("Total length overflows"))?;
            Info::multi_file(name, piece_length, pieces, files)
        } else {
            return Err(invalid("Missing 'files' or 'length' field"));
        };

        let expected = info.total_length().div_ceil(piece_length);
        if expected != info.pieces.len() as u64 {
            return Err(invalid(format!(
                "Piece count {} does not cover {} bytes",
                info.pieces.len(),
                info.total_length()
            )));
        }
        Ok(info)
    }

    /// Returns the exclusive end position of the bencode value starting at `start`.
    ///
    /// # Errors
    ///
    /// - `TorrentError::InvalidTorrentFile` - Truncated value or invalid leading byte
    pub fn find_value_end(data: &[u8], start: usize) -> ParseResult<usize> {
        match data.get(start) {
            Some(b'i') => {
                let terminator = data[start..]
                    .iter()
                    .position(|&b| b == b'e')
                    .ok_or_else(|| invalid("Unterminated integer"))?;
                Ok(start + terminator + 1)
            }
            Some(b'0'..=b'9') => {
                let (content_start, length) = Self::string_header(data, start)?;
                let end = content_start + length;
                if end > data.len() {
                    return Err(invalid("String runs past end of data"));
                }
                Ok(end)
            }
            Some(b'l' | b'd') => {
                let mut pos = start + 1;
                loop {
                    match data.get(pos) {
                        Some(b'e') => return Ok(pos + 1),
                        Some(_) => pos = Self::find_value_end(data, pos)?,
                        None => return Err(invalid("Incomplete bencode container")),
                    }
                }
            }
            Some(other) => Err(invalid(format!(
                "Invalid bencode character {:?}",
                *other as char
            ))),
            None => Err(invalid("Unexpected end of bencode data")),
        }
    }

    /// Locates the value stored under `key` in the top-level dictionary.
    fn find_dictionary_value(data: &[u8], key: &[u8]) -> ParseResult<Option<Range<usize>>> {
        if data.first() != Some(&b'd') {
            return Err(invalid("Expected dictionary start"));
        }
        let mut pos = 1;
        while data.get(pos).is_some_and(|&b| b != b'e') {
            let (key_start, key_length) = Self::string_header(data, pos)?;
            let value_start = key_start + key_length;
            let value_end = Self::find_value_end(data, value_start)?;
            if data.get(key_start..value_start) == Some(key) {
                return Ok(Some(value_start..value_end));
            }
            pos = value_end;
        }
        Ok(None)
    }

    /// Parses `<len>:` and returns the content start and length.
    fn string_header(data: &[u8], start: usize) -> ParseResult<(usize, usize)> {
        let colon = data[start..]
            .iter()
            .position(|&b| b == b':')
            .map(|offset| start + offset)
            .ok_or_else(|| invalid("Invalid string format"))?;
        let length = std::str::from_utf8(&data[start..colon])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| invalid("Invalid string length"))?;
        Ok((colon + 1, length))
    }

    fn extract_bytes_as_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<String> {
        let bytes = Self::extract_bytes(dict, key)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| {
            invalid(format!(
                "Invalid UTF-8 in field: {:?}",
                String::from_utf8_lossy(key)
            ))
        })
    }

    fn extract_bytes<'a>(dict: &'a BencodeDict<'_>, key: &[u8]) -> ParseResult<&'a [u8]> {
        match dict.get(key) {
            Some(bencode_rs::Value::Bytes(bytes)) => Ok(bytes),
            _ => Err(invalid(format!(
                "Missing or invalid field: {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    fn extract_integer(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<i64> {
        match dict.get(key) {
            Some(bencode_rs::Value::Integer(value)) => Ok(*value),
            _ => Err(invalid(format!(
                "Missing or invalid integer field: {:?}",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    fn optional_string(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<Option<String>> {
        match dict.get(key) {
            None => Ok(None),
            Some(_) => Self::extract_bytes_as_string(dict, key).map(Some),
        }
    }

    fn optional_integer(dict: &BencodeDict<'_>, key: &[u8]) -> ParseResult<Option<i64>> {
        match dict.get(key) {
            None => Ok(None),
            Some(_) => Self::extract_integer(dict, key).map(Some),
        }
    }

    fn extract_files(files_list: &[bencode_rs::Value<'_>]) -> ParseResult<Vec<(Vec<String>, u64)>> {
        let mut files = Vec::with_capacity(files_list.len());

        for file_value in files_list {
            let bencode_rs::Value::Dictionary(file_dict) = file_value else {
                return Err(invalid("Invalid file entry type"));
            };
            let length = Self::extract_integer(file_dict, b"length")?;
            if length < 0 {
                return Err(invalid("Negative file length"));
            }

            let Some(bencode_rs::Value::List(path_list)) = file_dict.get(b"path".as_slice()) else {
                return Err(invalid("Missing or invalid path in file"));
            };

            let mut path = Vec::with_capacity(path_list.len());
            for component in path_list {
                let bencode_rs::Value::Bytes(component) = component else {
                    return Err(invalid("Invalid path component type"));
                };
                let component = String::from_utf8(component.to_vec())
                    .map_err(|_| invalid("Invalid UTF-8 in file path"))?;
                path.push(component);
            }
            if path.is_empty() {
                return Err(invalid("Empty file path"));
            }

            files.push((path, length as u64));
        }

        Ok(files)
    }

    /// Tracker tiers. Non-string entries and empty tiers are skipped.
    fn extract_announce_list(dict: &BencodeDict<'_>) -> Vec<Vec<String>> {
        let Some(bencode_rs::Value::List(tiers)) = dict.get(b"announce-list".as_slice()) else {
            return Vec::new();
        };
        tiers
            .iter()
            .filter_map(|tier| match tier {
                bencode_rs::Value::List(urls) => {
                    let urls: Vec<String> = urls.iter().filter_map(Self::value_as_string).collect();
                    (!urls.is_empty()).then_some(urls)
                }
                _ => None,
            })
            .collect()
    }

    /// DHT nodes, either `[host, port]` pairs or `host:port` strings.
    fn extract_nodes(dict: &BencodeDict<'_>) -> Vec<String> {
        let Some(bencode_rs::Value::List(nodes)) = dict.get(b"nodes".as_slice()) else {
            return Vec::new();
        };
        nodes
            .iter()
            .filter_map(|node| match node {
                bencode_rs::Value::List(pair) => match pair.as_slice() {
                    [bencode_rs::Value::Bytes(host), bencode_rs::Value::Integer(port)] => Some(
                        format!("{}:{port}", String::from_utf8_lossy(host)),
                    ),
                    _ => None,
                },
                other => Self::value_as_string(other),
            })
            .collect()
    }

    /// Web seeds. `url-list` may be a single string or a list.
    fn extract_url_list(dict: &BencodeDict<'_>) -> Vec<String> {
        match dict.get(b"url-list".as_slice()) {
            Some(bencode_rs::Value::List(urls)) => {
                urls.iter().filter_map(Self::value_as_string).collect()
            }
            Some(value) => Self::value_as_string(value)
                .filter(|url| !url.is_empty())
                .into_iter()
                .collect(),
            None => Vec::new(),
        }
    }

    fn value_as_string(value: &bencode_rs::Value<'_>) -> Option<String> {
        match value {
            bencode_rs::Value::Bytes(bytes) => String::from_utf8(bytes.to_vec()).ok(),
            _ => None,
        }
    }
}
