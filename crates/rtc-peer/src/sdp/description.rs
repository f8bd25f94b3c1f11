//! Typed session descriptions and their JSON interchange form

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::document::SdpDocument;
use crate::error::SdpParseError;
use crate::Result;

/// Description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    #[serde(rename = "pranswer")]
    PrAnswer,
    Answer,
}

impl SdpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpType::Offer => "offer",
            SdpType::PrAnswer => "pranswer",
            SdpType::Answer => "answer",
        }
    }

    /// Answer or provisional answer
    pub fn is_answer(&self) -> bool {
        matches!(self, SdpType::Answer | SdpType::PrAnswer)
    }
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SdpType {
    type Err = SdpParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "offer" => Ok(SdpType::Offer),
            "pranswer" => Ok(SdpType::PrAnswer),
            "answer" => Ok(SdpType::Answer),
            other => Err(SdpParseError::new(
                0,
                "type",
                format!("unknown description type {other:?}"),
            )),
        }
    }
}

/// An offer, answer or provisional answer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    sdp_type: SdpType,
    document: SdpDocument,
}

#[derive(Serialize, Deserialize)]
struct WireDescription {
    #[serde(rename = "type")]
    sdp_type: String,
    sdp: String,
}

impl SessionDescription {
    pub fn new(sdp_type: SdpType, document: SdpDocument) -> Self {
        Self { sdp_type, document }
    }

    /// Parse SDP text of a known type
    pub fn parse(sdp_type: SdpType, text: &str) -> std::result::Result<Self, SdpParseError> {
        Ok(Self {
            sdp_type,
            document: SdpDocument::parse(text)?,
        })
    }

    /// Parse a type string (`offer`, `pranswer`, `answer`) and SDP text
    pub fn from_parts(sdp_type: &str, text: &str) -> std::result::Result<Self, SdpParseError> {
        Self::parse(sdp_type.parse()?, text)
    }

    pub fn sdp_type(&self) -> SdpType {
        self.sdp_type
    }

    pub fn document(&self) -> &SdpDocument {
        &self.document
    }

    pub fn into_document(self) -> SdpDocument {
        self.document
    }

    /// Serialized SDP text
    pub fn to_sdp(&self) -> String {
        self.document.serialize()
    }

    /// `{"type":"offer","sdp":"v=0..."}`
    pub fn to_json(&self) -> Result<String> {
        let wire = WireDescription {
            sdp_type: self.sdp_type.to_string(),
            sdp: self.to_sdp(),
        };
        Ok(serde_json::to_string(&wire)?)
    }

    /// Inverse of [`to_json`](Self::to_json); both fields are required and
    /// the SDP must parse.
    pub fn from_json(json: &str) -> Result<Self> {
        let wire: WireDescription = serde_json::from_str(json)?;
        Ok(Self::from_parts(&wire.sdp_type, &wire.sdp)?)
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.document, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;

    const OFFER: &str = "v=0\r\no=- 7 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\na=mid:0\r\n";

    #[test]
    fn test_sdp_type_strings() {
        assert_eq!("pranswer".parse::<SdpType>().unwrap(), SdpType::PrAnswer);
        assert_eq!(SdpType::PrAnswer.to_string(), "pranswer");
        assert!(SdpType::Answer.is_answer());
        assert!(!SdpType::Offer.is_answer());

        let err = "rollback".parse::<SdpType>().unwrap_err();
        assert_eq!((err.line, err.field.as_str()), (0, "type"));
    }

    #[test]
    fn test_json_shape() {
        let desc = SessionDescription::parse(SdpType::Offer, OFFER).unwrap();
        let json = desc.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["sdp"], OFFER);
        assert_eq!(SessionDescription::from_json(&json).unwrap(), desc);
    }

    #[test]
    fn test_from_json_errors() {
        let err = SessionDescription::from_json(r#"{"type":"answer"}"#).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));

        let err = SessionDescription::from_json(r#"{"type":"answer","sdp":"fake"}"#).unwrap_err();
        assert!(matches!(err, Error::SdpParse(SdpParseError { line: 1, .. })));

        let err = SessionDescription::from_json(r#"{"type":"bogus","sdp":""}"#).unwrap_err();
        assert!(matches!(err, Error::SdpParse(_)));
    }

    #[test]
    fn test_display_matches_sdp() {
        let desc = SessionDescription::parse(SdpType::Answer, OFFER).unwrap();
        assert_eq!(desc.to_string(), desc.to_sdp());
        assert_eq!(desc.document().media[0].mid(), Some("0"));
    }
}
