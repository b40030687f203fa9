//! Bencode encoding of info dictionaries and metainfo files
//!
//! Dictionary keys are written in sorted byte order as bencode requires.

use super::types::{Info, MetaInfo};

/// Minimal bencode writer. Callers are responsible for key ordering.
#[derive(Debug, Default)]
pub struct BencodeWriter {
    buf: Vec<u8>,
}

impl BencodeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&mut self, value: &[u8]) -> &mut Self {
        self.buf
            .extend_from_slice(value.len().to_string().as_bytes());
        self.buf.push(b':');
        self.buf.extend_from_slice(value);
        self
    }

    pub fn string(&mut self, value: &str) -> &mut Self {
        self.bytes(value.as_bytes())
    }

    pub fn integer(&mut self, value: i64) -> &mut Self {
        self.buf.push(b'i');
        self.buf.extend_from_slice(value.to_string().as_bytes());
        self.buf.push(b'e');
        self
    }

    pub fn begin_list(&mut self) -> &mut Self {
        self.buf.push(b'l');
        self
    }

    pub fn begin_dict(&mut self) -> &mut Self {
        self.buf.push(b'd');
        self
    }

    pub fn end(&mut self) -> &mut Self {
        self.buf.push(b'e');
        self
    }

    /// Appends an already encoded value verbatim.
    pub fn raw(&mut self, encoded: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(encoded);
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

impl Info {
    /// Canonical bencoding. Single-file form when `length` is set.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = BencodeWriter::new();
        writer.begin_dict();

        match self.length {
            Some(length) => {
                writer.string("length").integer(length as i64);
            }
            None => {
                writer.string("files").begin_list();
                for file in &self.files {
                    writer
                        .begin_dict()
                        .string("length")
                        .integer(file.length as i64)
                        .string("path")
                        .begin_list();
                    for component in &file.path {
                        writer.string(component);
                    }
                    writer.end().end();
                }
                writer.end();
            }
        }

        writer
            .string("name")
            .string(&self.name)
            .string("piece length")
            .integer(self.piece_length as i64)
            .string("pieces")
            .bytes(&self.pieces.concat());
        writer.end();
        writer.into_bytes()
    }
}

impl MetaInfo {
    /// Bencodes the metainfo, embedding `info_bytes` unchanged.
    ///
    /// The `info` key is omitted when no info is known.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut writer = BencodeWriter::new();
        writer.begin_dict();

        if let Some(announce) = &self.announce {
            writer.string("announce").string(announce);
        }
        if !self.announce_list.is_empty() {
            writer.string("announce-list").begin_list();
            for tier in &self.announce_list {
                writer.begin_list();
                for url in tier {
                    writer.string(url);
                }
                writer.end();
            }
            writer.end();
        }
        if let Some(comment) = &self.comment {
            writer.string("comment").string(comment);
        }
        if let Some(created_by) = &self.created_by {
            writer.string("created by").string(created_by);
        }
        if let Some(creation_date) = self.creation_date {
            writer.string("creation date").integer(creation_date);
        }
        if let Some(encoding) = &self.encoding {
            writer.string("encoding").string(encoding);
        }
        if self.has_info() {
            writer.string("info").raw(&self.info_bytes);
        }
        if !self.nodes.is_empty() {
            writer.string("nodes").begin_list();
            for node in &self.nodes {
                match node.rsplit_once(':').and_then(|(host, port)| {
                    port.parse::<u16>().ok().map(|port| (host, port))
                }) {
                    Some((host, port)) => {
                        writer.begin_list().string(host).integer(i64::from(port)).end();
                    }
                    None => {
                        writer.string(node);
                    }
                }
            }
            writer.end();
        }
        if !self.url_list.is_empty() {
            writer.string("url-list").begin_list();
            for url in &self.url_list {
                writer.string(url);
            }
            writer.end();
        }

        writer.end();
        writer.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::parsing::bencode::BencodeParser;

    #[test]
    fn test_writer_primitives() {
        let mut writer = BencodeWriter::new();
        writer
            .begin_dict()
            .string("a")
            .integer(-3)
            .string("b")
            .begin_list()
            .bytes(b"xy")
            .end()
            .end();
        assert_eq!(writer.into_bytes(), b"d1:ai-3e1:bl2:xyee");
    }

    #[test]
    fn test_single_file_info_encoding() {
        let info = Info::single_file("a".to_string(), 16, vec![[b'a'; 20]], 1);
        assert_eq!(
            info.to_bytes(),
            b"d6:lengthi1e4:name1:a12:piece lengthi16e6:pieces20:aaaaaaaaaaaaaaaaaaaae".to_vec()
        );
    }

    #[test]
    fn test_multi_file_info_reparses() {
        let info = Info::multi_file(
            "dir".to_string(),
            16,
            vec![[1u8; 20], [2u8; 20]],
            vec![
                (vec!["x".to_string()], 10),
                (vec!["y".to_string(), "z".to_string()], 12),
            ],
        );
        let decoded = BencodeParser::parse_info(&info.to_bytes()).unwrap();
        assert_eq!(decoded, info);
    }

    #[test]
    fn test_metainfo_keeps_foreign_info_bytes() {
        // Unusual but valid info dictionary that a canonical encoder would not produce.
        let info_bytes =
            b"d6:lengthi1e4:name1:a12:piece lengthi16e6:pieces20:aaaaaaaaaaaaaaaaaaaa1:zi0ee";
        let metainfo = MetaInfo {
            info_bytes: info_bytes.to_vec(),
            announce: Some("http://t".to_string()),
            nodes: vec!["router.example:6881".to_string()],
            creation_date: Some(42),
            ..MetaInfo::default()
        };
        let decoded = BencodeParser::parse_metainfo(&metainfo.to_bytes()).unwrap();
        assert_eq!(decoded.info_bytes, info_bytes.to_vec());
        assert_eq!(decoded.info_hash(), metainfo.info_hash());
        assert_eq!(decoded.nodes, metainfo.nodes);
        assert_eq!(decoded.creation_date, Some(42));
    }
}
