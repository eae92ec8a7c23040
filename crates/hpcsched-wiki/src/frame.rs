//! Message framing, checksum sealing and response status parsing.
//!
//! Every message on the socket is an eight-digit decimal length, a newline,
//! then the body:
//!
//! ```text
//! 00000052
//! CK=<checksum> TS=<unix time> AUTH=<user> DT=<payload>
//! ```
//!
//! The checksum covers everything from `TS=` to the end of the body. When
//! authentication is off the body is the bare payload.

use hpc_core::{AuthKind, RmConfig, RmSubtype, bounded_message};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::auth::checksum;
use crate::error::{WikiError, WikiResult};

/// Width of the length header, newline included.
pub const HEADER_LEN: usize = 9;

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Wrap `payload` in the checksum envelope configured for the RM.
pub fn seal(cfg: &RmConfig, payload: &str, now: u64) -> WikiResult<String> {
    match cfg.auth {
        AuthKind::None => Ok(payload.to_string()),
        AuthKind::Checksum => {
            let key = cfg
                .checksum_key
                .as_deref()
                .ok_or_else(|| WikiError::Auth(format!("rm {} has no checksum key", cfg.name)))?;
            let signed = format!("TS={now} AUTH={} DT={payload}", cfg.user);
            let ck = checksum(cfg.checksum_algo, key, &signed);
            Ok(format!("CK={ck} {signed}"))
        }
    }
}

/// Strip and verify the checksum envelope, returning the payload.
pub fn open<'a>(cfg: &RmConfig, body: &'a str) -> WikiResult<&'a str> {
    let body = body.trim_start();
    let Some(rest) = body.strip_prefix("CK=") else {
        if cfg.auth == AuthKind::Checksum {
            return Err(WikiError::Auth("response is not checksummed".to_string()));
        }
        return Ok(body);
    };

    let (ck, signed) = rest
        .split_once(' ')
        .ok_or_else(|| WikiError::malformed("checksum without message"))?;
    if cfg.auth == AuthKind::Checksum {
        let key = cfg.checksum_key.as_deref().unwrap_or_default();
        if checksum(cfg.checksum_algo, key, signed) != ck {
            return Err(WikiError::Auth(format!("bad checksum from rm {}", cfg.name)));
        }
    }
    let payload = find_keyword(signed, "DT=")
        .map(|pos| &signed[pos + 3..])
        .ok_or_else(|| WikiError::malformed("envelope without DT="))?;
    Ok(payload)
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &str) -> WikiResult<()> {
    let header = format!("{:08}\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> WikiResult<String> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len: usize = std::str::from_utf8(&header)
        .ok()
        .and_then(|h| h.trim().parse().ok())
        .ok_or_else(|| WikiError::malformed(format!("bad frame header {header:?}")))?;
    if len > MAX_FRAME_LEN {
        return Err(WikiError::malformed(format!("frame of {len} bytes exceeds limit")));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    String::from_utf8(body).map_err(|e| WikiError::malformed(format!("frame is not utf-8: {e}")))
}

/// Position of `keyword` where it starts a token.
fn find_keyword(haystack: &str, keyword: &str) -> Option<usize> {
    haystack.match_indices(keyword).map(|(i, _)| i).find(|&i| {
        i == 0
            || haystack[..i]
                .chars()
                .next_back()
                .is_some_and(char::is_whitespace)
    })
}

/// End of a free-text field value: the next whitespace-led `KEY=` token,
/// or the end of `value`.
fn field_end(value: &str) -> usize {
    value
        .char_indices()
        .filter(|(_, c)| c.is_whitespace())
        .map(|(i, c)| i + c.len_utf8())
        .find(|&next| starts_key(&value[next..]))
        .unwrap_or(value.len())
}

fn starts_key(s: &str) -> bool {
    let key_len = s
        .bytes()
        .take_while(|b| b.is_ascii_uppercase() || *b == b'_')
        .count();
    key_len > 0 && s.as_bytes().get(key_len) == Some(&b'=')
}

/// Decoded `SC=` / `RESPONSE=` / `ARG=` fields of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiResponse {
    pub status: i32,
    pub message: Option<String>,
    pub data: Option<String>,
}

/// Parse a reply payload. Negative status codes fail; SLURM fails on any
/// non-zero code.
pub fn parse_response(subtype: RmSubtype, payload: &str) -> WikiResult<WikiResponse> {
    let pos = find_keyword(payload, "SC=")
        .ok_or_else(|| WikiError::malformed(format!("no status code in '{payload}'")))?;
    let digits: String = payload[pos + 3..]
        .chars()
        .enumerate()
        .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '-'))
        .map(|(_, c)| c)
        .collect();
    let status: i32 = digits
        .parse()
        .map_err(|_| WikiError::malformed(format!("bad status code in '{payload}'")))?;

    let message = find_keyword(payload, "RESPONSE=").map(|p| {
        let value = &payload[p + 9..];
        value[..field_end(value)].trim().to_string()
    });
    let data = find_keyword(payload, "ARG=").map(|p| payload[p + 4..].trim().to_string());

    let failed = status < 0 || (subtype == RmSubtype::Slurm && status != 0);
    if failed {
        return Err(WikiError::Status {
            code: status,
            message: bounded_message(message.unwrap_or_default()),
        });
    }
    Ok(WikiResponse {
        status,
        message,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpc_core::ChecksumAlgo;

    fn checksum_cfg(algo: ChecksumAlgo) -> RmConfig {
        let mut cfg = RmConfig::new("slurm", "127.0.0.1", 7321);
        cfg.auth = AuthKind::Checksum;
        cfg.checksum_algo = algo;
        cfg.checksum_key = Some("42".into());
        cfg
    }

    #[test]
    fn seal_and_open_round_trip() {
        for algo in [ChecksumAlgo::Des, ChecksumAlgo::HmacSha256] {
            let cfg = checksum_cfg(algo);
            let body = seal(&cfg, "CMD=GETJOBS ARG=0:ALL", 1_700_000_000).unwrap();
            assert!(body.starts_with("CK="));
            assert!(body.ends_with("TS=1700000000 AUTH=root DT=CMD=GETJOBS ARG=0:ALL"));
            assert_eq!(open(&cfg, &body).unwrap(), "CMD=GETJOBS ARG=0:ALL");
        }
    }

    #[test]
    fn tampered_body_fails_auth() {
        let cfg = checksum_cfg(ChecksumAlgo::Des);
        let body = seal(&cfg, "CMD=GETJOBS ARG=0:ALL", 10).unwrap();
        let tampered = body.replace("GETJOBS", "GETNODE");
        assert!(matches!(open(&cfg, &tampered), Err(WikiError::Auth(_))));
    }

    #[test]
    fn unsealed_body_passes_without_auth() {
        let cfg = RmConfig::new("wiki", "127.0.0.1", 7321);
        assert_eq!(seal(&cfg, "SC=0", 1).unwrap(), "SC=0");
        assert_eq!(open(&cfg, "SC=0 RESPONSE=ok").unwrap(), "SC=0 RESPONSE=ok");
        assert!(open(&checksum_cfg(ChecksumAlgo::Des), "SC=0").is_err());
    }

    #[test]
    fn status_rules_depend_on_subtype() {
        let ok = parse_response(RmSubtype::Wiki, "SC=5 RESPONSE=queued").unwrap();
        assert_eq!(ok.status, 5);
        assert_eq!(ok.message.as_deref(), Some("queued"));

        let err = parse_response(RmSubtype::Slurm, "SC=5 RESPONSE=queued").unwrap_err();
        assert!(matches!(err, WikiError::Status { code: 5, .. }));

        let err = parse_response(RmSubtype::Wiki, "SC=-300 RESPONSE=no such job").unwrap_err();
        match err {
            WikiError::Status { code, message } => {
                assert_eq!(code, -300);
                assert_eq!(message, "no such job");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn response_message_stops_at_next_key() {
        let resp = parse_response(RmSubtype::Wiki, "SC=0 RESPONSE=job 7 held ARG=1#j7:STATE=Hold").unwrap();
        assert_eq!(resp.message.as_deref(), Some("job 7 held"));
        assert_eq!(resp.data.as_deref(), Some("1#j7:STATE=Hold"));

        let resp = parse_response(RmSubtype::Wiki, "SC=0 RESPONSE=a=b c").unwrap();
        assert_eq!(resp.message.as_deref(), Some("a=b c"));
    }

    #[test]
    fn data_follows_arg() {
        let resp = parse_response(RmSubtype::Slurm, "SC=0 ARG=1#n1:STATE=Idle;").unwrap();
        assert_eq!(resp.data.as_deref(), Some("1#n1:STATE=Idle;"));
        assert!(parse_response(RmSubtype::Slurm, "ARG=1#n1:DESC=x").is_err());
    }

    #[tokio::test]
    async fn frames_round_trip_over_a_pipe() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(&mut a, "SC=0 RESPONSE=ok").await.unwrap();
        assert_eq!(read_frame(&mut b).await.unwrap(), "SC=0 RESPONSE=ok");
    }

    #[tokio::test]
    async fn bad_header_is_malformed() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(b"garbage!\nxx").await.unwrap();
        assert!(matches!(read_frame(&mut b).await, Err(WikiError::Malformed(_))));
    }
}
