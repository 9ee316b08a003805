//! Firmware image container parsing.
//!
//! Layout of a dump:
//!
//! ```text
//! fe ed be ef 20 14   magic
//! ll ll ll            payload length (LE)
//! vv vv               container version (LE)
//! cc cc               code size, unused
//! ...                 payload: signed bytes | sig len (LE u16) | signature | rest of trailer
//! ```
//!
//! The trailer (signature length, signature and padding) occupies the last
//! 600 bytes of the payload for versions below 3 and the last 680 bytes
//! from version 3 on. Anything after the payload is ignored.

use std::io::{self, Read};

use log::{debug, info};

use crate::crypto::SignatureVerifier;
use crate::types::{FirmwareImage, VerifiedFirmware};
use crate::{OneRngError, Result};

pub const MAGIC: [u8; 6] = [0xfe, 0xed, 0xbe, 0xef, 0x20, 0x14];

/// Length + version + code size.
pub const HEADER_LEN: usize = 7;

pub const TRAILER_OFFSET_LEGACY: usize = 600;
pub const TRAILER_OFFSET_V3: usize = 680;

/// Size of the trailer that follows the signed region for `version`.
pub fn trailer_offset(version: u16) -> usize {
    if version >= 3 {
        TRAILER_OFFSET_V3
    } else {
        TRAILER_OFFSET_LEGACY
    }
}

fn read_byte<R: Read + ?Sized>(r: &mut R) -> io::Result<Option<u8>> {
    let mut b = [0u8; 1];
    loop {
        match r.read(&mut b) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(b[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// Consume input up to and including the magic marker.
///
/// A mismatching byte restarts the match without being compared against the
/// first magic byte again, so `fe fe ed be ef 20 14` is not recognised.
pub fn read_magic<R: Read + ?Sized>(r: &mut R) -> Result<()> {
    let mut state = 0;
    while state < MAGIC.len() {
        let Some(x) = read_byte(r)? else {
            return Err(OneRngError::MagicNotFound);
        };
        if x == MAGIC[state] {
            state += 1;
        } else {
            state = 0;
        }
    }
    Ok(())
}

/// Decode the header following the magic: `(payload length, version)`.
pub fn read_header<R: Read + ?Sized>(r: &mut R) -> Result<(usize, u16)> {
    let mut h = [0u8; HEADER_LEN];
    r.read_exact(&mut h).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => OneRngError::TruncatedHeader,
        _ => OneRngError::Io(e),
    })?;
    let length = u32::from_le_bytes([h[0], h[1], h[2], 0]) as usize;
    let version = u16::from_le_bytes([h[3], h[4]]);
    Ok((length, version))
}

fn read_payload<R: Read + ?Sized>(r: &mut R, length: usize) -> Result<Vec<u8>> {
    let mut payload = Vec::with_capacity(length);
    r.take(length as u64).read_to_end(&mut payload)?;
    if payload.len() != length {
        return Err(OneRngError::WrongLength {
            expected: length,
            got: payload.len(),
        });
    }
    Ok(payload)
}

/// Split a payload into `(signed, signature)`.
pub fn split_payload(payload: &[u8], version: u16) -> Result<(&[u8], &[u8])> {
    let offset = trailer_offset(version);
    let sig_len_at = payload.len().checked_sub(offset).ok_or_else(|| {
        OneRngError::BadTrailer(format!(
            "{}b payload is shorter than the {offset}b trailer",
            payload.len()
        ))
    })?;

    let len_bytes = payload
        .get(sig_len_at..sig_len_at + 2)
        .ok_or_else(|| OneRngError::BadTrailer("missing signature length".into()))?;
    let sig_len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;

    let start = sig_len_at + 2;
    let signature = payload.get(start..start + sig_len).ok_or_else(|| {
        OneRngError::BadTrailer(format!(
            "{sig_len}b signature at offset {start} overruns {}b payload",
            payload.len()
        ))
    })?;
    Ok((&payload[..sig_len_at], signature))
}

/// Locate and decode a firmware container in `r`.
pub fn parse_image<R: Read + ?Sized>(r: &mut R) -> Result<FirmwareImage> {
    read_magic(r)?;
    let (length, version) = read_header(r)?;
    debug!("image header: length={length} version={version}");
    let payload = read_payload(r, length)?;
    let (signed, signature) = split_payload(&payload, version)?;
    Ok(FirmwareImage {
        version,
        signed: signed.to_vec(),
        signature: signature.to_vec(),
    })
}

/// Parse a firmware dump and check its signature with `verifier`.
pub fn verify_image<R, V>(r: &mut R, verifier: &V) -> Result<VerifiedFirmware>
where
    R: Read + ?Sized,
    V: SignatureVerifier + ?Sized,
{
    let image = parse_image(r)?;
    let signer = verifier.verify(&image.signed, &image.signature)?;

    info!("firmware verification passed OK - version={}", image.version);
    info!("signed by: {:?}", signer.name);
    if let Some(created) = signer.created {
        info!("\tcreated: {created}");
    }
    info!("\tfingerprint: {}", signer.fingerprint);

    Ok(VerifiedFirmware {
        version: image.version,
        signer,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SignerIdentity;

    fn container(version: u16, signed: &[u8], signature: &[u8]) -> Vec<u8> {
        let mut payload = signed.to_vec();
        payload.extend_from_slice(&(signature.len() as u16).to_le_bytes());
        payload.extend_from_slice(signature);
        payload.resize(signed.len() + trailer_offset(version), 0xa5);

        let mut out = MAGIC.to_vec();
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes()[..3]);
        out.extend_from_slice(&version.to_le_bytes());
        out.extend_from_slice(&[0x34, 0x12]);
        out.extend_from_slice(&payload);
        out
    }

    struct ExpectSignature(&'static [u8]);

    impl SignatureVerifier for ExpectSignature {
        fn verify(&self, _signed: &[u8], signature: &[u8]) -> Result<SignerIdentity> {
            if signature != self.0 {
                return Err(OneRngError::VerificationFailed("signature mismatch".into()));
            }
            Ok(SignerIdentity {
                name: "Moonbase Otago (OneRNG)".into(),
                created: None,
                fingerprint: "ABCD".into(),
            })
        }
    }

    #[test]
    fn magic() {
        assert!(matches!(read_magic(&mut &b""[..]), Err(OneRngError::MagicNotFound)));
        assert!(read_magic(&mut &b"abcdefg"[..]).is_err());
        let broken: &[u8] = &[0x00, 0x01, 0x02, 0xfe, 0xed, 0xbe, 0xee, 0xff];
        assert!(read_magic(&mut &broken[..]).is_err());
        let good: &[u8] = &[0x00, 0x01, 0x02, 0xfe, 0xed, 0xbe, 0xef, 0x20, 0x14];
        assert!(read_magic(&mut &good[..]).is_ok());
    }

    #[test]
    fn magic_leaves_following_bytes() {
        let input: &[u8] = &[0xfe, 0xed, 0xbe, 0xef, 0x20, 0x14, 0x99];
        let mut r = input;
        read_magic(&mut r).unwrap();
        assert_eq!(r, &[0x99]);
    }

    #[test]
    fn magic_scan_does_not_rewind() {
        let input: &[u8] = &[0xfe, 0xfe, 0xed, 0xbe, 0xef, 0x20, 0x14];
        assert!(matches!(read_magic(&mut &input[..]), Err(OneRngError::MagicNotFound)));
    }

    #[test]
    fn header() {
        assert!(matches!(read_header(&mut &b""[..]), Err(OneRngError::TruncatedHeader)));
        assert!(read_header(&mut &[0u8, 0, 0][..]).is_err());
        assert!(read_header(&mut &[0u8, 0, 0, 0][..]).is_err());

        let (l, v) = read_header(&mut &[0x0f, 0x00, 0x00, 0x07, 0x00, 0xff, 0xee][..]).unwrap();
        assert_eq!(l, 15);
        assert_eq!(v, 7);

        let (l, v) =
            read_header(&mut &[0x0f, 0xf0, 0x01, 0x07, 0x70, 0xff, 0xee, 0x11, 0x42][..]).unwrap();
        assert_eq!(l, 0x01f00f);
        assert_eq!(v, 0x7007);
    }

    #[test]
    fn trailer_offset_depends_on_version() {
        assert_eq!(trailer_offset(0), 600);
        assert_eq!(trailer_offset(2), 600);
        assert_eq!(trailer_offset(3), 680);
        assert_eq!(trailer_offset(4), 680);
    }

    #[test]
    fn parse_recovers_signed_and_signature() {
        let signed: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let signature = hex::decode("89021c04000102000605025fd0c3").unwrap();
        for version in [2u16, 3] {
            let mut raw = vec![0x13, 0x37, 0xfe, 0x00];
            raw.extend(container(version, &signed, &signature));
            raw.extend_from_slice(&[0u8; 256]);

            let image = parse_image(&mut raw.as_slice()).unwrap();
            assert_eq!(image.version, version);
            assert_eq!(image.signed, signed);
            assert_eq!(image.signature, signature);
        }
    }

    #[test]
    fn empty_signed_region() {
        let raw = container(3, &[], b"sig");
        let image = parse_image(&mut raw.as_slice()).unwrap();
        assert!(image.signed.is_empty());
        assert_eq!(image.signature, b"sig");
    }

    #[test]
    fn truncated_payload() {
        let mut raw = container(3, &[1u8; 100], b"sig");
        raw.truncate(raw.len() - 10);
        let err = parse_image(&mut raw.as_slice()).unwrap_err();
        assert!(matches!(err, OneRngError::WrongLength { expected: 780, got: 770 }));
        assert!(err.is_malformed_image());
    }

    #[test]
    fn payload_shorter_than_trailer() {
        let mut raw = MAGIC.to_vec();
        raw.extend_from_slice(&[0x10, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00]);
        raw.extend_from_slice(&[0u8; 16]);
        let err = parse_image(&mut raw.as_slice()).unwrap_err();
        assert!(matches!(err, OneRngError::BadTrailer(_)));
    }

    #[test]
    fn signature_length_overruns_payload() {
        let mut payload = vec![0u8; 680];
        payload[0..2].copy_from_slice(&700u16.to_le_bytes());
        assert!(matches!(split_payload(&payload, 3), Err(OneRngError::BadTrailer(_))));

        payload[0..2].copy_from_slice(&678u16.to_le_bytes());
        let (signed, signature) = split_payload(&payload, 3).unwrap();
        assert!(signed.is_empty());
        assert_eq!(signature.len(), 678);
    }

    #[test]
    fn verify_uses_detached_signature() {
        let raw = container(3, b"firmware body", b"good");
        let verified = verify_image(&mut raw.as_slice(), &ExpectSignature(b"good")).unwrap();
        assert_eq!(verified.version, 3);
        assert_eq!(verified.signer.fingerprint, "ABCD");
    }

    #[test]
    fn verification_failure_is_not_malformed() {
        let raw = container(3, b"firmware body", b"evil");
        let err = verify_image(&mut raw.as_slice(), &ExpectSignature(b"good")).unwrap_err();
        assert!(matches!(err, OneRngError::VerificationFailed(_)));
        assert!(!err.is_malformed_image());
    }

    #[test]
    fn verify_with_pgp_keyring() {
        use crate::crypto::PgpKeyring;

        let keyring = PgpKeyring::from_armored(include_str!("testdata/signer.asc")).unwrap();
        let signed = include_bytes!("testdata/payload.bin");
        let signature = include_bytes!("testdata/payload.sig");

        let mut raw = vec![0x00, 0x42];
        raw.extend(container(3, signed, signature));
        let verified = verify_image(&mut raw.as_slice(), &keyring).unwrap();
        assert_eq!(verified.version, 3);
        assert_eq!(
            verified.signer.fingerprint,
            "F4BE0C914BA98478BE65D90388CC16A34F115E17"
        );

        let forged = container(3, b"other firmware body", signature);
        let err = verify_image(&mut forged.as_slice(), &keyring).unwrap_err();
        assert!(matches!(err, OneRngError::VerificationFailed(_)));
        assert!(!err.is_malformed_image());
    }

    #[test]
    fn malformed_image_never_reaches_verifier() {
        let err = verify_image(&mut &[0u8; 64][..], &ExpectSignature(b"good")).unwrap_err();
        assert!(err.is_malformed_image());
    }
}
