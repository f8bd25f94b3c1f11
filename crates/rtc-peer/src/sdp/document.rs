//! SDP text codec
//!
//! Parses session descriptions into an ordered line model and writes them
//! back deterministically: `v=`, `o=`, `s=` first, then the remaining
//! session-level lines in their original order, then each media section.
//! Lines are always terminated with CRLF on output.

use std::fmt;
use std::str::FromStr;

use crate::error::SdpParseError;

type ParseResult<T> = std::result::Result<T, SdpParseError>;

/// One `<type>=<value>` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpLine {
    pub kind: char,
    pub value: String,
}

impl SdpLine {
    pub fn new(kind: char, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    /// `a=<name>` or `a=<name>:<value>`
    pub fn attribute(name: &str, value: Option<&str>) -> Self {
        match value {
            Some(v) => Self::new('a', format!("{name}:{v}")),
            None => Self::new('a', name),
        }
    }

    /// Split an `a=` line into name and optional value
    pub fn as_attribute(&self) -> Option<(&str, Option<&str>)> {
        if self.kind != 'a' {
            return None;
        }
        Some(match self.value.split_once(':') {
            Some((name, value)) => (name, Some(value)),
            None => (self.value.as_str(), None),
        })
    }
}

impl fmt::Display for SdpLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.kind, self.value)
    }
}

/// `o=` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub session_id: u64,
    pub session_version: u64,
    pub net_type: String,
    pub addr_type: String,
    pub unicast_address: String,
}

impl Origin {
    fn parse(line: usize, value: &str) -> ParseResult<Self> {
        let fields: Vec<&str> = value.split_whitespace().collect();
        if fields.len() != 6 {
            return Err(SdpParseError::new(
                line,
                "o",
                format!("expected 6 fields, found {}", fields.len()),
            ));
        }

        let session_id = fields[1].parse::<u64>().map_err(|_| {
            SdpParseError::new(line, "o.sess-id", format!("not a number: {:?}", fields[1]))
        })?;
        let session_version = fields[2].parse::<u64>().map_err(|_| {
            SdpParseError::new(
                line,
                "o.sess-version",
                format!("not a number: {:?}", fields[2]),
            )
        })?;

        Ok(Self {
            username: fields[0].to_string(),
            session_id,
            session_version,
            net_type: fields[3].to_string(),
            addr_type: fields[4].to_string(),
            unicast_address: fields[5].to_string(),
        })
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.username,
            self.session_id,
            self.session_version,
            self.net_type,
            self.addr_type,
            self.unicast_address
        )
    }
}

/// One `m=` section and the lines that follow it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub media: String,
    pub port: u16,
    pub port_count: Option<u16>,
    pub protocol: String,
    pub formats: Vec<String>,
    pub lines: Vec<SdpLine>,
}

impl MediaDescription {
    pub fn new(media: &str, port: u16, protocol: &str, formats: &[&str]) -> Self {
        Self {
            media: media.to_string(),
            port,
            port_count: None,
            protocol: protocol.to_string(),
            formats: formats.iter().map(|f| f.to_string()).collect(),
            lines: Vec::new(),
        }
    }

    fn parse(line: usize, value: &str) -> ParseResult<Self> {
        let fields: Vec<&str> = value.split_whitespace().collect();
        if fields.len() < 4 {
            return Err(SdpParseError::new(
                line,
                "m",
                format!("expected at least 4 fields, found {}", fields.len()),
            ));
        }

        let (port, port_count) = match fields[1].split_once('/') {
            Some((port, count)) => (port, Some(count)),
            None => (fields[1], None),
        };
        let port = port
            .parse::<u16>()
            .map_err(|_| SdpParseError::new(line, "m.port", format!("invalid port {port:?}")))?;
        let port_count = port_count
            .map(|c| {
                c.parse::<u16>().map_err(|_| {
                    SdpParseError::new(line, "m.port", format!("invalid port count {c:?}"))
                })
            })
            .transpose()?;

        Ok(Self {
            media: fields[0].to_string(),
            port,
            port_count,
            protocol: fields[2].to_string(),
            formats: fields[3..].iter().map(|f| f.to_string()).collect(),
            lines: Vec::new(),
        })
    }

    /// Append an `a=` line
    pub fn push_attribute(&mut self, name: &str, value: Option<&str>) {
        self.lines.push(SdpLine::attribute(name, value));
    }

    /// First value of attribute `name`
    pub fn attribute(&self, name: &str) -> Option<&str> {
        find_attribute(&self.lines, name)
    }

    /// True if `a=<name>` (with or without value) is present
    pub fn has_attribute(&self, name: &str) -> bool {
        self.lines
            .iter()
            .filter_map(SdpLine::as_attribute)
            .any(|(n, _)| n == name)
    }

    /// Media identification tag (`a=mid`)
    pub fn mid(&self) -> Option<&str> {
        self.attribute("mid")
    }

    fn m_line(&self) -> String {
        let port = match self.port_count {
            Some(count) => format!("{}/{}", self.port, count),
            None => self.port.to_string(),
        };
        format!(
            "{} {} {} {}",
            self.media,
            port,
            self.protocol,
            self.formats.join(" ")
        )
    }
}

/// Parsed session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpDocument {
    pub origin: Origin,
    pub session_name: String,
    /// Session-level lines after `s=`, in order
    pub lines: Vec<SdpLine>,
    pub media: Vec<MediaDescription>,
}

impl SdpDocument {
    /// Minimal document with `t=0 0` timing
    pub fn new(origin: Origin) -> Self {
        Self {
            origin,
            session_name: "-".to_string(),
            lines: vec![SdpLine::new('t', "0 0")],
            media: Vec::new(),
        }
    }

    /// Parse SDP text.
    ///
    /// Accepts LF or CRLF line endings. Trailing blank lines are ignored; a
    /// blank line anywhere else is an error.
    pub fn parse(text: &str) -> ParseResult<Self> {
        let raw: Vec<&str> = text
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .collect();
        let last = raw.iter().rposition(|l| !l.is_empty()).map_or(0, |i| i + 1);

        let mut origin = None;
        let mut session_name = None;
        let mut lines = Vec::new();
        let mut media: Vec<MediaDescription> = Vec::new();
        let mut has_timing = false;

        for (idx, raw_line) in raw[..last].iter().enumerate() {
            let line_no = idx + 1;
            let (kind, value) = split_line(line_no, raw_line)?;

            match (idx, kind) {
                (0, 'v') => {
                    if value != "0" {
                        return Err(SdpParseError::new(
                            line_no,
                            "v",
                            format!("unsupported version {value:?}"),
                        ));
                    }
                    continue;
                }
                (0, _) => return Err(SdpParseError::new(line_no, "v", "expected v= line")),
                (1, 'o') => {
                    origin = Some(Origin::parse(line_no, value)?);
                    continue;
                }
                (1, _) => return Err(SdpParseError::new(line_no, "o", "expected o= line")),
                (2, 's') => {
                    if value.is_empty() {
                        return Err(SdpParseError::new(line_no, "s", "empty session name"));
                    }
                    session_name = Some(value.to_string());
                    continue;
                }
                (2, _) => return Err(SdpParseError::new(line_no, "s", "expected s= line")),
                (_, 'v' | 'o' | 's') if media.is_empty() => {
                    return Err(SdpParseError::new(
                        line_no,
                        kind.to_string(),
                        "duplicate line",
                    ))
                }
                _ => {}
            }

            match kind {
                'm' => {
                    media.push(MediaDescription::parse(line_no, value)?);
                    continue;
                }
                't' => {
                    if !media.is_empty() {
                        return Err(SdpParseError::new(
                            line_no,
                            "t",
                            "timing line inside a media section",
                        ));
                    }
                    validate_timing(line_no, value)?;
                    has_timing = true;
                }
                'c' => validate_connection(line_no, value)?,
                'a' if value.is_empty() => {
                    return Err(SdpParseError::new(line_no, "a", "empty attribute"))
                }
                'v' | 'o' | 's' => {
                    return Err(SdpParseError::new(
                        line_no,
                        kind.to_string(),
                        "session-level line inside a media section",
                    ))
                }
                _ => {}
            }

            let line = SdpLine::new(kind, value);
            match media.last_mut() {
                Some(section) => section.lines.push(line),
                None => lines.push(line),
            }
        }

        let next_line = last + 1;
        let origin =
            origin.ok_or_else(|| SdpParseError::new(next_line, "o", "missing origin line"))?;
        let session_name = session_name
            .ok_or_else(|| SdpParseError::new(next_line, "s", "missing session name line"))?;
        if !has_timing {
            return Err(SdpParseError::new(next_line, "t", "missing timing line"));
        }

        Ok(Self {
            origin,
            session_name,
            lines,
            media,
        })
    }

    /// Write the document as CRLF-terminated SDP text
    pub fn serialize(&self) -> String {
        self.to_string()
    }

    /// First value of session-level attribute `name`
    pub fn attribute(&self, name: &str) -> Option<&str> {
        find_attribute(&self.lines, name)
    }

    /// Append a session-level `a=` line
    pub fn push_attribute(&mut self, name: &str, value: Option<&str>) {
        self.lines.push(SdpLine::attribute(name, value));
    }

    /// Media ids listed in `a=group:BUNDLE`
    pub fn bundle_mids(&self) -> Vec<&str> {
        self.attribute("group")
            .and_then(|g| g.strip_prefix("BUNDLE"))
            .map(|mids| mids.split_whitespace().collect())
            .unwrap_or_default()
    }

    /// ICE ufrag, session level first, then the first media section carrying one
    pub fn ice_ufrag(&self) -> Option<&str> {
        self.find_anywhere("ice-ufrag")
    }

    pub fn ice_pwd(&self) -> Option<&str> {
        self.find_anywhere("ice-pwd")
    }

    /// DTLS fingerprint (`a=fingerprint:<alg> <hex>`)
    pub fn fingerprint(&self) -> Option<&str> {
        self.find_anywhere("fingerprint")
    }

    /// Media section with the given mid
    pub fn media_by_mid(&self, mid: &str) -> Option<&MediaDescription> {
        self.media.iter().find(|m| m.mid() == Some(mid))
    }

    fn find_anywhere(&self, name: &str) -> Option<&str> {
        self.attribute(name)
            .or_else(|| self.media.iter().find_map(|m| m.attribute(name)))
    }
}

impl fmt::Display for SdpDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v=0\r\no={}\r\ns={}\r\n", self.origin, self.session_name)?;
        for line in &self.lines {
            write!(f, "{line}\r\n")?;
        }
        for section in &self.media {
            write!(f, "m={}\r\n", section.m_line())?;
            for line in &section.lines {
                write!(f, "{line}\r\n")?;
            }
        }
        Ok(())
    }
}

impl FromStr for SdpDocument {
    type Err = SdpParseError;

    fn from_str(s: &str) -> ParseResult<Self> {
        Self::parse(s)
    }
}

fn split_line(line_no: usize, line: &str) -> ParseResult<(char, &str)> {
    if line.is_empty() {
        return Err(SdpParseError::new(line_no, "line", "blank line"));
    }
    let mut chars = line.chars();
    let kind = chars.next().unwrap_or_default();
    if !kind.is_ascii_lowercase() || chars.next() != Some('=') {
        return Err(SdpParseError::new(
            line_no,
            "line",
            format!("expected <type>=<value>, found {line:?}"),
        ));
    }
    Ok((kind, &line[2..]))
}

fn validate_timing(line_no: usize, value: &str) -> ParseResult<()> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() != 2 || fields.iter().any(|f| f.parse::<u64>().is_err()) {
        return Err(SdpParseError::new(
            line_no,
            "t",
            format!("expected '<start> <stop>', found {value:?}"),
        ));
    }
    Ok(())
}

fn validate_connection(line_no: usize, value: &str) -> ParseResult<()> {
    let fields: Vec<&str> = value.split_whitespace().collect();
    if fields.len() != 3 {
        return Err(SdpParseError::new(
            line_no,
            "c",
            format!("expected 3 fields, found {}", fields.len()),
        ));
    }
    if fields[0] != "IN" || !matches!(fields[1], "IP4" | "IP6") {
        return Err(SdpParseError::new(
            line_no,
            "c.addrtype",
            format!("unsupported address {:?}", value),
        ));
    }
    Ok(())
}

fn find_attribute<'a>(lines: &'a [SdpLine], name: &str) -> Option<&'a str> {
    lines
        .iter()
        .filter_map(SdpLine::as_attribute)
        .find(|(n, _)| *n == name)
        .map(|(_, v)| v.unwrap_or(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BROWSER_OFFER: &str = "v=0\r\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
s=-\r\n\
t=0 0\r\n\
a=group:BUNDLE 0 1\r\n\
a=msid-semantic: WMS\r\n\
m=audio 9 UDP/TLS/RTP/SAVPF 111 0\r\n\
c=IN IP4 0.0.0.0\r\n\
a=rtcp:9 IN IP4 0.0.0.0\r\n\
a=ice-ufrag:Wf3k\r\n\
a=ice-pwd:x9bq3KjvTcrgJv0n9dCFUnTp\r\n\
a=fingerprint:sha-256 0F:74:31:25:CB:A2:13:EC\r\n\
a=setup:actpass\r\n\
a=mid:0\r\n\
a=sendrecv\r\n\
a=rtpmap:111 opus/48000/2\r\n\
m=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n\
c=IN IP4 0.0.0.0\r\n\
a=ice-ufrag:Wf3k\r\n\
a=ice-pwd:x9bq3KjvTcrgJv0n9dCFUnTp\r\n\
a=mid:1\r\n\
a=sctp-port:5000\r\n";

    #[test]
    fn test_parse_browser_offer() {
        let doc = SdpDocument::parse(BROWSER_OFFER).unwrap();
        assert_eq!(doc.origin.session_id, 4611731400430051336);
        assert_eq!(doc.origin.session_version, 2);
        assert_eq!(doc.session_name, "-");
        assert_eq!(doc.bundle_mids(), vec!["0", "1"]);
        assert_eq!(doc.media.len(), 2);
        assert_eq!(doc.media[0].formats, vec!["111", "0"]);
        assert!(doc.media[0].has_attribute("sendrecv"));
        assert_eq!(doc.media[1].protocol, "UDP/DTLS/SCTP");
        assert_eq!(doc.ice_ufrag(), Some("Wf3k"));
        assert_eq!(doc.media_by_mid("1").unwrap().attribute("sctp-port"), Some("5000"));
    }

    #[test]
    fn test_serialize_is_byte_stable() {
        let doc = SdpDocument::parse(BROWSER_OFFER).unwrap();
        assert_eq!(doc.serialize(), BROWSER_OFFER);
    }

    #[test]
    fn test_lf_line_endings_normalize() {
        let lf = BROWSER_OFFER.replace("\r\n", "\n");
        let doc = SdpDocument::parse(&lf).unwrap();
        assert_eq!(doc.serialize(), BROWSER_OFFER);
    }

    #[test]
    fn test_rejects_bad_leading_lines() {
        let err = SdpDocument::parse("o=- 1 1 IN IP4 0.0.0.0\r\n").unwrap_err();
        assert_eq!((err.line, err.field.as_str()), (1, "v"));

        let err = SdpDocument::parse("v=1\r\n").unwrap_err();
        assert_eq!((err.line, err.field.as_str()), (1, "v"));

        let err = SdpDocument::parse("v=0\r\ns=-\r\n").unwrap_err();
        assert_eq!((err.line, err.field.as_str()), (2, "o"));

        let err = SdpDocument::parse("v=0\r\n").unwrap_err();
        assert_eq!((err.line, err.field.as_str()), (2, "o"));
    }

    #[test]
    fn test_rejects_bad_origin() {
        let err = SdpDocument::parse("v=0\r\no=- abc 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\n").unwrap_err();
        assert_eq!((err.line, err.field.as_str()), (2, "o.sess-id"));

        let err = SdpDocument::parse("v=0\r\no=- 1 1 IN IP4\r\ns=-\r\nt=0 0\r\n").unwrap_err();
        assert_eq!(err.field, "o");
    }

    #[test]
    fn test_rejects_bad_media_line() {
        let text = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\nm=audio nine RTP/AVP 0\r\n";
        let err = SdpDocument::parse(text).unwrap_err();
        assert_eq!((err.line, err.field.as_str()), (5, "m.port"));

        let text = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\nm=audio 9\r\n";
        let err = SdpDocument::parse(text).unwrap_err();
        assert_eq!((err.line, err.field.as_str()), (5, "m"));
    }

    #[test]
    fn test_rejects_garbage_and_blank_lines() {
        let err = SdpDocument::parse("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nhello\r\n").unwrap_err();
        assert_eq!((err.line, err.field.as_str()), (4, "line"));

        let err =
            SdpDocument::parse("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n\r\ns=-\r\nt=0 0\r\n").unwrap_err();
        assert_eq!(err.line, 3);
    }

    #[test]
    fn test_requires_timing() {
        let err = SdpDocument::parse("v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\n").unwrap_err();
        assert_eq!(err.field, "t");
        // Reported one past the last line, like the other missing lines
        assert_eq!(err.line, 4);

        let text = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\nm=audio 9 RTP/AVP 0\r\nt=0 0\r\n";
        assert_eq!(SdpDocument::parse(text).unwrap_err().line, 6);
    }

    #[test]
    fn test_rejects_bad_connection_line() {
        let text = "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\ns=-\r\nt=0 0\r\nc=IN IPX 0.0.0.0\r\n";
        let err = SdpDocument::parse(text).unwrap_err();
        assert_eq!((err.line, err.field.as_str()), (5, "c.addrtype"));
    }

    #[test]
    fn test_build_document() {
        let mut doc = SdpDocument::new(Origin {
            username: "-".to_string(),
            session_id: 42,
            session_version: 1,
            net_type: "IN".to_string(),
            addr_type: "IP4".to_string(),
            unicast_address: "127.0.0.1".to_string(),
        });
        doc.push_attribute("group", Some("BUNDLE 0"));
        let mut section = MediaDescription::new("application", 9, "UDP/DTLS/SCTP", &["webrtc-datachannel"]);
        section.push_attribute("mid", Some("0"));
        doc.media.push(section);

        let text = doc.serialize();
        assert!(text.starts_with("v=0\r\no=- 42 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\n"));
        assert_eq!(SdpDocument::parse(&text).unwrap(), doc);
    }
}
