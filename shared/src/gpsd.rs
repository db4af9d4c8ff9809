//! Wire types for the gpsd JSON protocol.
//!
//! gpsd emits one self-describing JSON object per line, tagged by `class`.
//! Only `TPV` (time-position-velocity) reports carry a position fix; every
//! other class decodes to [`Message::Other`] and is ignored by consumers.

use serde::Deserialize;
use thiserror::Error;

/// Sent once after connecting to start the JSON report stream.
pub const WATCH_COMMAND: &str = "?WATCH={\"enable\":true,\"json\":true};\n";

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed gpsd message: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "class")]
pub enum Message {
    #[serde(rename = "TPV")]
    Tpv(Tpv),
    #[serde(other)]
    Other,
}

/// A TPV report. gpsd omits any field it cannot currently compute.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Tpv {
    pub device: Option<String>,
    pub mode: Option<u8>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    /// Ground speed, m/s.
    pub speed: Option<f64>,
    /// Course over ground, degrees from true north.
    pub track: Option<f64>,
    /// Longitude error estimate, metres.
    pub epx: Option<f64>,
    /// Latitude error estimate, metres.
    pub epy: Option<f64>,
    /// Vertical error estimate, metres.
    pub epv: Option<f64>,
    /// Speed error estimate, m/s.
    pub eps: Option<f64>,
}

/// Decodes one line exactly as received. Bytes that are not UTF-8 are a
/// decode error like any other malformed JSON.
pub fn decode(raw: impl AsRef<[u8]>) -> Result<Message, DecodeError> {
    Ok(serde_json::from_slice(raw.as_ref().trim_ascii())?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_tpv_report() {
        let raw = r#"{"class":"TPV","device":"/dev/ttyACM0","mode":3,"time":"2024-05-01T12:00:00.000Z","lat":40.7128,"lon":-74.006,"alt":10.2,"speed":1.5,"track":270.25,"epx":3.1,"epy":4.2,"epv":9.8,"eps":0.6}"#;
        let Message::Tpv(tpv) = decode(raw).unwrap() else {
            panic!("expected a TPV report");
        };
        assert_eq!(tpv.mode, Some(3));
        assert_eq!(tpv.lat, Some(40.7128));
        assert_eq!(tpv.lon, Some(-74.006));
        assert_eq!(tpv.speed, Some(1.5));
        assert_eq!(tpv.track, Some(270.25));
        assert_eq!(tpv.epx, Some(3.1));
        assert_eq!(tpv.eps, Some(0.6));
    }

    #[test]
    fn tpv_without_fix_has_no_position() {
        let Message::Tpv(tpv) = decode(r#"{"class":"TPV","device":"/dev/ttyACM0","mode":1}"#).unwrap()
        else {
            panic!("expected a TPV report");
        };
        assert_eq!(tpv.lat, None);
        assert_eq!(tpv.lon, None);
    }

    #[test]
    fn other_classes_are_not_position_reports() {
        for raw in [
            r#"{"class":"VERSION","release":"3.22","rev":"3.22","proto_major":3,"proto_minor":14}"#,
            r#"{"class":"SKY","device":"/dev/ttyACM0","satellites":[]}"#,
            r#"{"class":"WATCH","enable":true,"json":true}"#,
        ] {
            assert_eq!(decode(raw).unwrap(), Message::Other);
        }
    }

    #[test]
    fn malformed_messages_are_errors() {
        assert!(decode("{\"class\":\"TPV\",\"lat\":").is_err());
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"lat":1.0,"lon":2.0}"#).is_err());
        assert!(decode(r#"{"class":"TPV","lat":"north"}"#).is_err());
    }

    #[test]
    fn invalid_utf8_is_malformed() {
        assert!(decode(b"{\"class\":\"TPV\",\"x\":\"\xff\xfe\"}").is_err());
        assert!(decode(b"\xff\xfe").is_err());
        assert_eq!(
            decode(b"  {\"class\":\"SKY\"}\r\n").unwrap(),
            Message::Other
        );
    }
}
