//! NIP-19: bech32-encoded entities.
//!
//! Bare 32-byte payloads (`npub`, `nsec`, `note`) and TLV-composed pointers
//! (`nprofile`, `nevent`, `naddr`). TLV types: 0 = special, 1 = relay,
//! 2 = author, 3 = kind (u32 big-endian). Unknown TLV types are skipped on
//! decode so future extensions stay readable.

use bech32::{Bech32, Hrp};
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum Nip19Error {
    #[error("bech32 encoding error: {0}")]
    EncodeFailed(String),

    #[error("bech32 decoding error: {0}")]
    DecodeFailed(String),

    #[error("invalid hrp: expected {expected}, got {got}")]
    InvalidHrp { expected: String, got: String },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

const TLV_SPECIAL: u8 = 0;
const TLV_RELAY: u8 = 1;
const TLV_AUTHOR: u8 = 2;
const TLV_KIND: u8 = 3;

/// `nprofile`: a pubkey plus relay hints.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProfilePointer {
    /// 32-byte pubkey, hex
    pub pubkey: String,
    pub relays: Vec<String>,
}

/// `nevent`: an event id plus optional relay hints, author, and kind.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EventPointer {
    /// 32-byte event id, hex
    pub id: String,
    pub relays: Vec<String>,
    pub author: Option<String>,
    pub kind: Option<u64>,
}

/// `naddr`: an addressable-event coordinate.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AddressPointer {
    /// The `d` tag value
    pub identifier: String,
    /// 32-byte author pubkey, hex
    pub pubkey: String,
    pub kind: u64,
    pub relays: Vec<String>,
}

/// Any decoded NIP-19 entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Nip19 {
    Npub([u8; 32]),
    Nsec(Zeroizing<[u8; 32]>),
    Note([u8; 32]),
    Nprofile(ProfilePointer),
    Nevent(EventPointer),
    Naddr(AddressPointer),
}

fn encode(hrp: &str, data: &[u8]) -> Result<String, Nip19Error> {
    let hrp = Hrp::parse(hrp).map_err(|e| Nip19Error::EncodeFailed(e.to_string()))?;
    bech32::encode::<Bech32>(hrp, data).map_err(|e| Nip19Error::EncodeFailed(e.to_string()))
}

fn decode_expecting(expected_hrp: &str, encoded: &str) -> Result<Vec<u8>, Nip19Error> {
    let (hrp, data) =
        bech32::decode(encoded).map_err(|e| Nip19Error::DecodeFailed(e.to_string()))?;
    if hrp.to_string() != expected_hrp {
        return Err(Nip19Error::InvalidHrp {
            expected: expected_hrp.to_string(),
            got: hrp.to_string(),
        });
    }
    Ok(data)
}

fn expect_32(data: Vec<u8>) -> Result<[u8; 32], Nip19Error> {
    data.try_into()
        .map_err(|v: Vec<u8>| Nip19Error::InvalidPayload(format!("expected 32 bytes, got {}", v.len())))
}

fn decode_hex32(hex_str: &str, what: &str) -> Result<[u8; 32], Nip19Error> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(hex_str, &mut out)
        .map_err(|e| Nip19Error::InvalidPayload(format!("bad {what} hex: {e}")))?;
    Ok(out)
}

pub fn encode_npub(pubkey: &[u8; 32]) -> Result<String, Nip19Error> {
    encode("npub", pubkey)
}

pub fn decode_npub(npub: &str) -> Result<[u8; 32], Nip19Error> {
    expect_32(decode_expecting("npub", npub)?)
}

pub fn encode_nsec(seckey: &[u8; 32]) -> Result<String, Nip19Error> {
    encode("nsec", seckey)
}

pub fn decode_nsec(nsec: &str) -> Result<Zeroizing<[u8; 32]>, Nip19Error> {
    let mut data = Zeroizing::new(decode_expecting("nsec", nsec)?);
    if data.len() != 32 {
        return Err(Nip19Error::InvalidPayload(format!(
            "expected 32 bytes, got {}",
            data.len()
        )));
    }
    let mut out = Zeroizing::new([0u8; 32]);
    out.copy_from_slice(&data);
    data.as_mut_slice().fill(0);
    Ok(out)
}

pub fn encode_note(event_id: &[u8; 32]) -> Result<String, Nip19Error> {
    encode("note", event_id)
}

pub fn decode_note(note: &str) -> Result<[u8; 32], Nip19Error> {
    expect_32(decode_expecting("note", note)?)
}

fn push_tlv(buf: &mut Vec<u8>, tlv_type: u8, value: &[u8]) -> Result<(), Nip19Error> {
    if value.len() > 255 {
        return Err(Nip19Error::EncodeFailed(format!(
            "tlv value too long: {}",
            value.len()
        )));
    }
    buf.push(tlv_type);
    buf.push(value.len() as u8);
    buf.extend_from_slice(value);
    Ok(())
}

/// Iterate `(type, value)` pairs; truncated trailing bytes are an error.
fn parse_tlv(data: &[u8]) -> Result<Vec<(u8, &[u8])>, Nip19Error> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        if pos + 2 > data.len() {
            return Err(Nip19Error::InvalidPayload("truncated tlv header".to_string()));
        }
        let tlv_type = data[pos];
        let len = data[pos + 1] as usize;
        pos += 2;
        if pos + len > data.len() {
            return Err(Nip19Error::InvalidPayload("truncated tlv value".to_string()));
        }
        out.push((tlv_type, &data[pos..pos + len]));
        pos += len;
    }
    Ok(out)
}

fn tlv_string(value: &[u8], what: &str) -> Result<String, Nip19Error> {
    String::from_utf8(value.to_vec())
        .map_err(|e| Nip19Error::InvalidPayload(format!("bad {what} utf-8: {e}")))
}

fn tlv_kind(value: &[u8]) -> Result<u64, Nip19Error> {
    let bytes: [u8; 4] = value
        .try_into()
        .map_err(|_| Nip19Error::InvalidPayload("kind tlv must be 4 bytes".to_string()))?;
    Ok(u32::from_be_bytes(bytes) as u64)
}

pub fn encode_nprofile(profile: &ProfilePointer) -> Result<String, Nip19Error> {
    let pubkey = decode_hex32(&profile.pubkey, "pubkey")?;
    let mut buf = Vec::new();
    push_tlv(&mut buf, TLV_SPECIAL, &pubkey)?;
    for relay in &profile.relays {
        push_tlv(&mut buf, TLV_RELAY, relay.as_bytes())?;
    }
    encode("nprofile", &buf)
}

pub fn decode_nprofile(nprofile: &str) -> Result<ProfilePointer, Nip19Error> {
    let data = decode_expecting("nprofile", nprofile)?;
    let mut out = ProfilePointer::default();
    for (tlv_type, value) in parse_tlv(&data)? {
        match tlv_type {
            TLV_SPECIAL if value.len() == 32 => out.pubkey = hex::encode(value),
            TLV_RELAY => out.relays.push(tlv_string(value, "relay")?),
            _ => {}
        }
    }
    if out.pubkey.is_empty() {
        return Err(Nip19Error::InvalidPayload("missing pubkey tlv".to_string()));
    }
    Ok(out)
}

pub fn encode_nevent(pointer: &EventPointer) -> Result<String, Nip19Error> {
    let id = decode_hex32(&pointer.id, "event id")?;
    let mut buf = Vec::new();
    push_tlv(&mut buf, TLV_SPECIAL, &id)?;
    for relay in &pointer.relays {
        push_tlv(&mut buf, TLV_RELAY, relay.as_bytes())?;
    }
    if let Some(ref author) = pointer.author {
        let author = decode_hex32(author, "author")?;
        push_tlv(&mut buf, TLV_AUTHOR, &author)?;
    }
    if let Some(kind) = pointer.kind {
        push_tlv(&mut buf, TLV_KIND, &(kind as u32).to_be_bytes())?;
    }
    encode("nevent", &buf)
}

pub fn decode_nevent(nevent: &str) -> Result<EventPointer, Nip19Error> {
    let data = decode_expecting("nevent", nevent)?;
    let mut out = EventPointer::default();
    for (tlv_type, value) in parse_tlv(&data)? {
        match tlv_type {
            TLV_SPECIAL if value.len() == 32 => out.id = hex::encode(value),
            TLV_RELAY => out.relays.push(tlv_string(value, "relay")?),
            TLV_AUTHOR if value.len() == 32 => out.author = Some(hex::encode(value)),
            TLV_KIND => out.kind = Some(tlv_kind(value)?),
            _ => {}
        }
    }
    if out.id.is_empty() {
        return Err(Nip19Error::InvalidPayload("missing event id tlv".to_string()));
    }
    Ok(out)
}

pub fn encode_naddr(pointer: &AddressPointer) -> Result<String, Nip19Error> {
    let pubkey = decode_hex32(&pointer.pubkey, "pubkey")?;
    let mut buf = Vec::new();
    push_tlv(&mut buf, TLV_SPECIAL, pointer.identifier.as_bytes())?;
    for relay in &pointer.relays {
        push_tlv(&mut buf, TLV_RELAY, relay.as_bytes())?;
    }
    push_tlv(&mut buf, TLV_AUTHOR, &pubkey)?;
    push_tlv(&mut buf, TLV_KIND, &(pointer.kind as u32).to_be_bytes())?;
    encode("naddr", &buf)
}

pub fn decode_naddr(naddr: &str) -> Result<AddressPointer, Nip19Error> {
    let data = decode_expecting("naddr", naddr)?;
    let mut out = AddressPointer::default();
    let mut have_kind = false;
    for (tlv_type, value) in parse_tlv(&data)? {
        match tlv_type {
            TLV_SPECIAL => out.identifier = tlv_string(value, "identifier")?,
            TLV_RELAY => out.relays.push(tlv_string(value, "relay")?),
            TLV_AUTHOR if value.len() == 32 => out.pubkey = hex::encode(value),
            TLV_KIND => {
                out.kind = tlv_kind(value)?;
                have_kind = true;
            }
            _ => {}
        }
    }
    if out.pubkey.is_empty() || !have_kind {
        return Err(Nip19Error::InvalidPayload(
            "naddr requires author and kind tlvs".to_string(),
        ));
    }
    Ok(out)
}

/// Decode any NIP-19 entity by its hrp.
pub fn decode(encoded: &str) -> Result<Nip19, Nip19Error> {
    let (hrp, _) = bech32::decode(encoded).map_err(|e| Nip19Error::DecodeFailed(e.to_string()))?;
    match hrp.to_string().as_str() {
        "npub" => Ok(Nip19::Npub(decode_npub(encoded)?)),
        "nsec" => Ok(Nip19::Nsec(decode_nsec(encoded)?)),
        "note" => Ok(Nip19::Note(decode_note(encoded)?)),
        "nprofile" => Ok(Nip19::Nprofile(decode_nprofile(encoded)?)),
        "nevent" => Ok(Nip19::Nevent(decode_nevent(encoded)?)),
        "naddr" => Ok(Nip19::Naddr(decode_naddr(encoded)?)),
        other => Err(Nip19Error::InvalidHrp {
            expected: "npub|nsec|note|nprofile|nevent|naddr".to_string(),
            got: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// NIP-19 reference vectors.
    #[test]
    fn test_npub_vector() {
        let pubkey =
            decode_hex32("3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d", "pk")
                .unwrap();
        let npub = encode_npub(&pubkey).unwrap();
        assert_eq!(
            npub,
            "npub180cvv07tjdrrgpa0j7j7tmnyl2yr6yr7l8j4s3evf6u64th6gkwsyjh6w6"
        );
        assert_eq!(decode_npub(&npub).unwrap(), pubkey);
    }

    #[test]
    fn test_nsec_vector() {
        let seckey =
            decode_hex32("67dea2ed018072d675f5415ecfaed7d2597555e202d85b3d65ea4e58d2d92ffa", "sk")
                .unwrap();
        let nsec = encode_nsec(&seckey).unwrap();
        assert_eq!(
            nsec,
            "nsec1vl029mgpspedva04g90vltkh6fvh240zqtv9k0t9af8935ke9laqsnlfe5"
        );
        assert_eq!(&*decode_nsec(&nsec).unwrap(), &seckey);
    }

    #[test]
    fn test_wrong_hrp_rejected() {
        let npub = "npub180cvv07tjdrrgpa0j7j7tmnyl2yr6yr7l8j4s3evf6u64th6gkwsyjh6w6";
        assert!(matches!(
            decode_nsec(npub),
            Err(Nip19Error::InvalidHrp { .. })
        ));
        assert!(decode_note(npub).is_err());
    }

    #[test]
    fn test_note_round_trip() {
        let id = [0x5cu8; 32];
        let note = encode_note(&id).unwrap();
        assert!(note.starts_with("note1"));
        assert_eq!(decode_note(&note).unwrap(), id);
    }

    #[test]
    fn test_nprofile_round_trip() {
        let profile = ProfilePointer {
            pubkey: "3bf0c63fcb93463407af97a5e5ee64fa883d107ef9e558472c4eb9aaaefa459d"
                .to_string(),
            relays: vec![
                "wss://r.x.com".to_string(),
                "wss://djbas.sadkb.com".to_string(),
            ],
        };
        let encoded = encode_nprofile(&profile).unwrap();
        assert!(encoded.starts_with("nprofile1"));
        assert_eq!(decode_nprofile(&encoded).unwrap(), profile);
    }

    #[test]
    fn test_nevent_round_trip_with_optionals() {
        let pointer = EventPointer {
            id: "aa".repeat(32),
            relays: vec!["wss://relay.example.com".to_string()],
            author: Some("bb".repeat(32)),
            kind: Some(1),
        };
        let encoded = encode_nevent(&pointer).unwrap();
        assert_eq!(decode_nevent(&encoded).unwrap(), pointer);

        let minimal = EventPointer {
            id: "cc".repeat(32),
            ..Default::default()
        };
        let encoded = encode_nevent(&minimal).unwrap();
        assert_eq!(decode_nevent(&encoded).unwrap(), minimal);
    }

    #[test]
    fn test_naddr_round_trip() {
        let pointer = AddressPointer {
            identifier: "banana".to_string(),
            pubkey: "ab".repeat(32),
            kind: 30023,
            relays: vec!["wss://relay.nostr.example".to_string()],
        };
        let encoded = encode_naddr(&pointer).unwrap();
        assert!(encoded.starts_with("naddr1"));
        assert_eq!(decode_naddr(&encoded).unwrap(), pointer);
    }

    #[test]
    fn test_decode_dispatch() {
        let id = [1u8; 32];
        match decode(&encode_note(&id).unwrap()).unwrap() {
            Nip19::Note(decoded) => assert_eq!(decoded, id),
            other => panic!("expected note, got {other:?}"),
        }
        assert!(decode("nrelay1qq").is_err());
        assert!(decode("garbage").is_err());
    }

    #[test]
    fn test_unknown_tlv_types_skipped() {
        // special(32) then an unknown type 99 entry.
        let mut buf = Vec::new();
        push_tlv(&mut buf, TLV_SPECIAL, &[0x11u8; 32]).unwrap();
        push_tlv(&mut buf, 99, b"future").unwrap();
        let encoded = encode("nevent", &buf).unwrap();
        let pointer = decode_nevent(&encoded).unwrap();
        assert_eq!(pointer.id, "11".repeat(32));
    }

    #[test]
    fn test_truncated_tlv_rejected() {
        let encoded = encode("nprofile", &[TLV_SPECIAL, 40, 0x00]).unwrap();
        assert!(decode_nprofile(&encoded).is_err());
    }

    proptest! {
        #[test]
        fn prop_npub_round_trip(pubkey in prop::array::uniform32(any::<u8>())) {
            let npub = encode_npub(&pubkey).unwrap();
            prop_assert_eq!(decode_npub(&npub).unwrap(), pubkey);
        }
    }
}
