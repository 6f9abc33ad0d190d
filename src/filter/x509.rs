//! Just enough DER to read a certificate's subject name.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::error::{GensioError, Result};

const TAG_SEQUENCE: u8 = 0x30;
const TAG_SET: u8 = 0x31;
const TAG_OID: u8 = 0x06;
const TAG_VERSION: u8 = 0xa0;

/// Subject attribute OIDs (DER content bytes) and their short names.
const FIELDS: &[(&[u8], &str)] = &[
    (&[0x55, 0x04, 0x03], "CN"),
    (&[0x55, 0x04, 0x06], "C"),
    (&[0x55, 0x04, 0x07], "L"),
    (&[0x55, 0x04, 0x08], "ST"),
    (&[0x55, 0x04, 0x0a], "O"),
    (&[0x55, 0x04, 0x0b], "OU"),
    (
        &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x09, 0x01],
        "emailAddress",
    ),
];

fn malformed() -> GensioError {
    GensioError::comm("malformed certificate")
}

/// Split one TLV off the front of `der`: (tag, contents, rest).
fn next_tlv(der: &[u8]) -> Result<(u8, &[u8], &[u8])> {
    let (&tag, rest) = der.split_first().ok_or_else(malformed)?;
    let (&first, rest) = rest.split_first().ok_or_else(malformed)?;
    let (len, rest) = if first & 0x80 == 0 {
        (first as usize, rest)
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 || rest.len() < n {
            return Err(malformed());
        }
        let len = rest[..n].iter().fold(0usize, |acc, b| acc << 8 | *b as usize);
        (len, &rest[n..])
    };
    if rest.len() < len {
        return Err(malformed());
    }
    Ok((tag, &rest[..len], &rest[len..]))
}

fn expect(der: &[u8], want: u8) -> Result<(&[u8], &[u8])> {
    let (tag, body, rest) = next_tlv(der)?;
    if tag != want {
        return Err(malformed());
    }
    Ok((body, rest))
}

/// Subject name entries in certificate order, as (short name, value).
pub(crate) fn subject_fields(der: &[u8]) -> Result<Vec<(&'static str, String)>> {
    let (cert, _) = expect(der, TAG_SEQUENCE)?;
    let (tbs, _) = expect(cert, TAG_SEQUENCE)?;
    let mut rest = tbs;
    let (tag, _, after) = next_tlv(rest)?;
    if tag == TAG_VERSION {
        rest = after;
    }
    // serialNumber, signature, issuer, validity
    for _ in 0..4 {
        rest = next_tlv(rest)?.2;
    }
    let (mut subject, _) = expect(rest, TAG_SEQUENCE)?;

    let mut out = Vec::new();
    while !subject.is_empty() {
        let (mut rdn, next) = expect(subject, TAG_SET)?;
        subject = next;
        while !rdn.is_empty() {
            let (atv, next) = expect(rdn, TAG_SEQUENCE)?;
            rdn = next;
            let (oid, value) = expect(atv, TAG_OID)?;
            let (_, text, _) = next_tlv(value)?;
            if let Some((_, name)) = FIELDS.iter().find(|(o, _)| *o == oid) {
                out.push((*name, String::from_utf8_lossy(text).into_owned()));
            }
        }
    }
    Ok(out)
}

/// Answer a peer-name query: operand `<index>[,<field>]`, result
/// `<index>,<field>=<value>`. Index -1 picks the first entry of the field.
pub(crate) fn peer_cert_name(der: &[u8], operand: &str) -> Result<String> {
    let (index, field) = match operand.split_once(',') {
        Some((i, f)) => (i.trim(), f.trim()),
        None => (operand.trim(), "CN"),
    };
    let index: i64 = index
        .parse()
        .map_err(|_| GensioError::config(format!("bad certificate name index '{index}'")))?;
    let fields = subject_fields(der)?;
    let found = if index < 0 {
        fields.iter().enumerate().find(|(_, (name, _))| name.eq_ignore_ascii_case(field))
    } else {
        fields
            .iter()
            .enumerate()
            .skip(index as usize)
            .find(|(_, (name, _))| name.eq_ignore_ascii_case(field))
    };
    match found {
        Some((i, (name, value))) => Ok(format!("{i},{name}={value}")),
        None => Err(GensioError::OutOfRange(format!("no {field} in peer certificate"))),
    }
}

pub(crate) fn to_pem(der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in body.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tlv(tag: u8, body: &[u8]) -> Vec<u8> {
        let mut v = vec![tag];
        if body.len() < 0x80 {
            v.push(body.len() as u8);
        } else {
            v.push(0x82);
            v.extend_from_slice(&(body.len() as u16).to_be_bytes());
        }
        v.extend_from_slice(body);
        v
    }

    fn attr(oid: &[u8], value: &str) -> Vec<u8> {
        let atv = [tlv(TAG_OID, oid), tlv(0x0c, value.as_bytes())].concat();
        tlv(TAG_SET, &tlv(TAG_SEQUENCE, &atv))
    }

    fn cert(subject: &[u8]) -> Vec<u8> {
        let tbs = [
            tlv(TAG_VERSION, &tlv(0x02, &[2])),
            tlv(0x02, &[1]),
            tlv(TAG_SEQUENCE, &[]),
            tlv(TAG_SEQUENCE, &[]),
            tlv(TAG_SEQUENCE, &[]),
            tlv(TAG_SEQUENCE, subject),
            tlv(TAG_SEQUENCE, &[]),
        ]
        .concat();
        tlv(TAG_SEQUENCE, &[tlv(TAG_SEQUENCE, &tbs), tlv(TAG_SEQUENCE, &[])].concat())
    }

    fn sample() -> Vec<u8> {
        let subject = [
            attr(&[0x55, 0x04, 0x06], "US"),
            attr(&[0x55, 0x04, 0x0a], "gensio"),
            attr(&[0x55, 0x04, 0x03], "ser2net.org"),
        ]
        .concat();
        cert(&subject)
    }

    #[test]
    fn walks_subject() {
        let fields = subject_fields(&sample()).unwrap();
        assert_eq!(
            fields,
            vec![
                ("C", "US".to_string()),
                ("O", "gensio".to_string()),
                ("CN", "ser2net.org".to_string())
            ]
        );
    }

    #[test]
    fn name_queries() {
        let der = sample();
        assert_eq!(peer_cert_name(&der, "-1,CN").unwrap(), "2,CN=ser2net.org");
        assert_eq!(peer_cert_name(&der, "-1").unwrap(), "2,CN=ser2net.org");
        assert_eq!(peer_cert_name(&der, "0,O").unwrap(), "1,O=gensio");
        assert!(peer_cert_name(&der, "-1,OU").is_err());
        assert!(peer_cert_name(&der, "x,CN").is_err());
    }

    #[test]
    fn truncated_input_is_rejected() {
        let der = sample();
        assert!(subject_fields(&der[..der.len() / 2]).is_err());
        assert!(subject_fields(&[]).is_err());
    }

    #[test]
    fn pem_wraps_lines() {
        let pem = to_pem(&[0u8; 100]);
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----\n"));
        assert!(pem.lines().all(|l| l.len() <= 64));
    }
}
