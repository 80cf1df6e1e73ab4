//! Pairing descriptor codec.
//!
//! The descriptor is the text rendered into the QR code on the serving device:
//! `KEYTRANSFER:<HOST>/<PORT>/<PSK_HEX>[/SSID:<SSID_HEX>]`, upper-cased.
//! Decoding is case-insensitive for the scheme and hex fields; hosts are kept
//! in lower case so a decoded descriptor equals the one that was encoded.

use std::fmt;
use std::str::FromStr;

use crate::error::TransferError;
use crate::phrase::{derive_phrase, ComparisonPhrase};
use crate::psk::PresharedKey;

pub const SCHEME: &str = "KEYTRANSFER";
const SSID_PREFIX: &str = "SSID:";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingDescriptor {
    pub host: String,
    pub port: u16,
    pub preshared_key: PresharedKey,
    pub wifi_ssid: Option<String>,
}

impl PairingDescriptor {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        preshared_key: PresharedKey,
    ) -> Result<Self, TransferError> {
        let host = host.into().to_ascii_lowercase();
        if host.is_empty() {
            return Err(TransferError::malformed("empty host"));
        }
        if port == 0 {
            return Err(TransferError::malformed("port out of range"));
        }
        Ok(Self {
            host,
            port,
            preshared_key,
            wifi_ssid: None,
        })
    }

    pub fn with_wifi_ssid(mut self, ssid: Option<String>) -> Self {
        self.wifi_ssid = ssid;
        self
    }

    pub fn encode(&self) -> String {
        let mut out = format!(
            "{}:{}/{}/{}",
            SCHEME,
            self.host,
            self.port,
            self.preshared_key.to_hex()
        );
        if let Some(ssid) = &self.wifi_ssid {
            out.push('/');
            out.push_str(SSID_PREFIX);
            out.push_str(&hex::encode(ssid.as_bytes()));
        }
        out.to_ascii_uppercase()
    }

    pub fn decode(input: &str) -> Result<Self, TransferError> {
        let (scheme, rest) = input
            .trim()
            .split_once(':')
            .ok_or_else(|| TransferError::malformed("missing scheme"))?;
        if !scheme.eq_ignore_ascii_case(SCHEME) {
            return Err(TransferError::malformed("missing scheme"));
        }

        let fields: Vec<&str> = rest.split('/').collect();
        if fields.len() < 3 {
            return Err(TransferError::malformed(format!(
                "expected at least 3 fields, found {}",
                fields.len()
            )));
        }

        let port: u16 = fields[1]
            .parse()
            .map_err(|_| TransferError::malformed(format!("invalid port {:?}", fields[1])))?;
        let psk = hex::decode(fields[2])
            .map_err(|e| TransferError::malformed(format!("invalid key hex: {e}")))?;
        let descriptor = Self::new(fields[0], port, PresharedKey::from_bytes(psk)?)?;

        let wifi_ssid = fields.get(3).and_then(|field| parse_ssid(field));
        if fields.len() > 4 {
            tracing::debug!(extra = fields.len() - 4, "Ignoring trailing descriptor fields");
        }

        Ok(descriptor.with_wifi_ssid(wifi_ssid))
    }

    /// Phrase derived from the descriptor's secret and endpoint.
    pub fn comparison_phrase(&self) -> ComparisonPhrase {
        let mut material = Vec::with_capacity(self.preshared_key.as_bytes().len() + 32);
        material.extend_from_slice(self.preshared_key.as_bytes());
        material.extend_from_slice(self.host.as_bytes());
        material.extend_from_slice(&self.port.to_be_bytes());
        derive_phrase(&material)
    }
}

fn parse_ssid(field: &str) -> Option<String> {
    let hex_part = match field.get(..SSID_PREFIX.len()) {
        Some(prefix) if prefix.eq_ignore_ascii_case(SSID_PREFIX) => &field[SSID_PREFIX.len()..],
        _ => {
            tracing::warn!(field, "Descriptor field is not an SSID; ignoring");
            return None;
        }
    };
    let bytes = match hex::decode(hex_part) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::warn!(error = %e, "Invalid SSID hex in descriptor; ignoring");
            return None;
        }
    };
    match String::from_utf8(bytes) {
        Ok(ssid) => Some(ssid),
        Err(e) => {
            tracing::warn!(error = %e, "SSID in descriptor is not UTF-8; ignoring");
            None
        }
    }
}

impl fmt::Display for PairingDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl FromStr for PairingDescriptor {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::decode(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;

    fn psk(bytes: &[u8]) -> PresharedKey {
        PresharedKey::from_bytes(bytes.to_vec()).unwrap()
    }

    fn sample_key() -> PresharedKey {
        psk(&[
            0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0xF6, 0x07, 0x18, 0x29, 0x3A, 0x4B, 0x5C, 0x6D, 0x7E,
            0x8F, 0x90,
        ])
    }

    fn is_malformed(result: Result<PairingDescriptor, TransferError>) -> bool {
        matches!(
            result,
            Err(TransferError::Protocol(ProtocolError::MalformedDescriptor(_)))
        )
    }

    #[test]
    fn encodes_upper_case_without_ssid() {
        let d = PairingDescriptor::new("192.168.1.5", 1336, sample_key()).unwrap();
        let encoded = d.encode();
        assert_eq!(
            encoded,
            "KEYTRANSFER:192.168.1.5/1336/A1B2C3D4E5F60718293A4B5C6D7E8F90"
        );
        assert_eq!(encoded.rsplit('/').next().unwrap().len(), 32);
        assert_eq!(encoded, encoded.to_ascii_uppercase());
    }

    #[test]
    fn decodes_what_it_encodes() {
        let d = PairingDescriptor::new("laptop.local", 7001, sample_key())
            .unwrap()
            .with_wifi_ssid(Some("Home Net 5G".into()));
        let decoded = PairingDescriptor::decode(&d.encode()).unwrap();
        assert_eq!(decoded, d);
        assert_eq!(decoded.wifi_ssid.as_deref(), Some("Home Net 5G"));

        let plain = PairingDescriptor::new("10.0.0.2", 1, psk(&[0x01])).unwrap();
        assert_eq!(plain.to_string().parse::<PairingDescriptor>().unwrap(), plain);
    }

    #[test]
    fn lower_case_input_is_accepted() {
        let d = PairingDescriptor::decode("keytransfer:10.0.0.7/1336/a1b2").unwrap();
        assert_eq!(d.host, "10.0.0.7");
        assert_eq!(d.port, 1336);
        assert_eq!(d.preshared_key.as_bytes(), &[0xA1, 0xB2]);
        assert_eq!(d.wifi_ssid, None);
    }

    #[test]
    fn bad_port_is_malformed() {
        let result = PairingDescriptor::decode("keytransfer:badhost/notanumber/zz");
        match result {
            Err(TransferError::Protocol(ProtocolError::MalformedDescriptor(reason))) => {
                assert!(reason.contains("port"), "{reason}");
            }
            other => panic!("expected malformed port, got {other:?}"),
        }
        assert!(is_malformed(PairingDescriptor::decode("KEYTRANSFER:h/0/AA")));
        assert!(is_malformed(PairingDescriptor::decode("KEYTRANSFER:h/70000/AA")));
    }

    #[test]
    fn rejects_missing_scheme_short_input_and_bad_hex() {
        assert!(is_malformed(PairingDescriptor::decode("192.168.1.5/1336/AABB")));
        assert!(is_malformed(PairingDescriptor::decode("OTHER:192.168.1.5/1336/AABB")));
        assert!(is_malformed(PairingDescriptor::decode("KEYTRANSFER:192.168.1.5/1336")));
        assert!(is_malformed(PairingDescriptor::decode("KEYTRANSFER:192.168.1.5/1336/XYZ")));
        assert!(is_malformed(PairingDescriptor::decode("KEYTRANSFER:192.168.1.5/1336/")));
        assert!(is_malformed(PairingDescriptor::decode("KEYTRANSFER:/1336/AABB")));
    }

    #[test]
    fn broken_ssid_is_dropped_not_fatal() {
        let d = PairingDescriptor::decode("KEYTRANSFER:10.0.0.7/1336/AABB/SSID:NOTHEX").unwrap();
        assert_eq!(d.wifi_ssid, None);

        let d = PairingDescriptor::decode("KEYTRANSFER:10.0.0.7/1336/AABB/SSID:FF").unwrap();
        assert_eq!(d.wifi_ssid, None);

        let d = PairingDescriptor::decode("KEYTRANSFER:10.0.0.7/1336/AABB/SOMETHING").unwrap();
        assert_eq!(d.wifi_ssid, None);
        assert_eq!(d.port, 1336);
    }

    #[test]
    fn descriptor_phrase_is_stable() {
        let d = PairingDescriptor::new("10.0.0.7", 1336, sample_key()).unwrap();
        let again = PairingDescriptor::decode(&d.encode()).unwrap();
        assert_eq!(d.comparison_phrase(), again.comparison_phrase());
    }
}
