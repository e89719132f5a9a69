//! Wire protocol
//!
//! Commands travel as RESP arrays of bulk strings; replies use the full
//! RESP reply grammar. The mutation commands carry a fixed magic string
//! so a hub never mistakes an ordinary key-value server for a peer hub,
//! plus a packed position blob naming the mutation's recency stamp and
//! its position in the sending hub's log.

use std::io::BufRead;

use crate::error::{Error, Result};
use crate::record::{LogRecord, PositionBlob, RecordOp, MAX_FRAME_LEN};

/// Guard constant carried by every mutation command.
pub const BINLOG_MAGIC: &str = "__FLUX_HUB#MAGIC";

/// Handshake command name.
pub const TRYSYNC_COMMAND: &str = "internaltrysync";

/// One parsed RESP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    Nil,
    Array(Vec<Reply>),
}

impl Reply {
    /// Whether this is the positive handshake/heartbeat acknowledgment.
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Status(s) if s.eq_ignore_ascii_case("ok"))
    }

    pub fn is_pong(&self) -> bool {
        matches!(self, Reply::Status(s) if s.eq_ignore_ascii_case("pong"))
    }
}

/// Encode a command as a RESP array of bulk strings.
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + args.iter().map(|a| a.len() + 16).sum::<usize>());
    buf.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        buf.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        buf.extend_from_slice(arg);
        buf.extend_from_slice(b"\r\n");
    }
    buf
}

/// Render a status reply (`+ok`, `+PONG`).
pub fn encode_status(status: &str) -> Vec<u8> {
    format!("+{}\r\n", status).into_bytes()
}

/// Render an error reply.
pub fn encode_error(msg: &str) -> Vec<u8> {
    format!("-ERR {}\r\n", msg).into_bytes()
}

fn read_line(reader: &mut impl BufRead) -> Result<Option<String>> {
    let mut line = String::new();
    let n = reader.read_line(&mut line)?;
    if n == 0 {
        return Ok(None);
    }
    if !line.ends_with("\r\n") {
        return Err(Error::protocol("line missing CRLF terminator"));
    }
    line.truncate(line.len() - 2);
    Ok(Some(line))
}

fn read_bulk(reader: &mut impl BufRead, len: i64) -> Result<Option<Vec<u8>>> {
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::protocol(format!("bulk string of {} bytes", len)));
    }
    let mut buf = vec![0u8; len + 2];
    std::io::Read::read_exact(reader, &mut buf)?;
    if &buf[len..] != b"\r\n" {
        return Err(Error::protocol("bulk string missing CRLF terminator"));
    }
    buf.truncate(len);
    Ok(Some(buf))
}

fn parse_int(s: &str) -> Result<i64> {
    s.parse()
        .map_err(|_| Error::protocol(format!("bad integer: {:?}", s)))
}

/// Read one RESP reply.
pub fn read_reply(reader: &mut impl BufRead) -> Result<Reply> {
    let line = read_line(reader)?
        .ok_or_else(|| Error::Io(std::io::ErrorKind::UnexpectedEof.into()))?;
    let kind = match line.as_bytes().first() {
        Some(b) if b.is_ascii() => *b,
        _ => return Err(Error::protocol("empty or malformed reply line")),
    };
    let rest = &line[1..];
    match kind {
        b'+' => Ok(Reply::Status(rest.to_string())),
        b'-' => Ok(Reply::Error(rest.to_string())),
        b':' => Ok(Reply::Integer(parse_int(rest)?)),
        b'$' => match read_bulk(reader, parse_int(rest)?)? {
            Some(bulk) => Ok(Reply::Bulk(bulk)),
            None => Ok(Reply::Nil),
        },
        b'*' => {
            let count = parse_int(rest)?;
            if count < 0 {
                return Ok(Reply::Nil);
            }
            let mut items = Vec::with_capacity(count.min(64) as usize);
            for _ in 0..count {
                items.push(read_reply(reader)?);
            }
            Ok(Reply::Array(items))
        }
        other => Err(Error::protocol(format!(
            "unknown reply type {:?}",
            other as char
        ))),
    }
}

/// Read one inbound command: an array of bulk strings. `None` on a clean
/// end of stream.
pub fn read_command(reader: &mut impl BufRead) -> Result<Option<Vec<Vec<u8>>>> {
    let Some(line) = read_line(reader)? else {
        return Ok(None);
    };
    let count = line
        .strip_prefix('*')
        .ok_or_else(|| Error::protocol(format!("expected array, got {:?}", line)))
        .and_then(parse_int)?;
    if !(1..=1024).contains(&count) {
        return Err(Error::protocol(format!("bad argument count {}", count)));
    }
    let mut args = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let line = read_line(reader)?
            .ok_or_else(|| Error::Io(std::io::ErrorKind::UnexpectedEof.into()))?;
        let len = line
            .strip_prefix('$')
            .ok_or_else(|| Error::protocol(format!("expected bulk string, got {:?}", line)))
            .and_then(parse_int)?;
        let bulk = read_bulk(reader, len)?
            .ok_or_else(|| Error::protocol("nil argument in command"))?;
        args.push(bulk);
    }
    Ok(Some(args))
}

/// Trysync handshake: `[internaltrysync, ip, port, sequence, offset]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrysyncRequest {
    pub ip: String,
    pub port: u16,
    pub sequence: u64,
    pub offset: u64,
}

pub fn build_trysync(ip: &str, port: u16, sequence: u64, offset: u64) -> Vec<u8> {
    encode_command(&[
        TRYSYNC_COMMAND.as_bytes(),
        ip.as_bytes(),
        port.to_string().as_bytes(),
        sequence.to_string().as_bytes(),
        offset.to_string().as_bytes(),
    ])
}

fn arg_str(arg: &[u8]) -> Result<&str> {
    std::str::from_utf8(arg).map_err(|_| Error::protocol("non-UTF-8 argument"))
}

fn arg_num<T: std::str::FromStr>(arg: &[u8], what: &str) -> Result<T> {
    arg_str(arg)?
        .parse()
        .map_err(|_| Error::protocol(format!("bad {} argument", what)))
}

pub fn parse_trysync(args: &[Vec<u8>]) -> Result<TrysyncRequest> {
    if args.len() != 5 || !args[0].eq_ignore_ascii_case(TRYSYNC_COMMAND.as_bytes()) {
        return Err(Error::protocol("malformed trysync request"));
    }
    Ok(TrysyncRequest {
        ip: arg_str(&args[1])?.to_string(),
        port: arg_num(&args[2], "port")?,
        sequence: arg_num(&args[3], "sequence")?,
        offset: arg_num(&args[4], "offset")?,
    })
}

pub fn build_auth(password: &str) -> Vec<u8> {
    encode_command(&[b"AUTH", password.as_bytes()])
}

pub fn build_ping() -> Vec<u8> {
    encode_command(&[b"PING"])
}

/// Translate a log record into the peer-facing mutation command,
/// stamping the record's position in the local log.
pub fn build_mutation(record: &LogRecord, sequence: u64, offset: u64) -> Vec<u8> {
    let blob = PositionBlob {
        logical_time: record.logical_time as u32,
        sequence: sequence as u32,
        offset,
    }
    .pack();
    let origin = record.origin_id.to_string();
    match record.op {
        RecordOp::Set => encode_command(&[
            b"SET",
            &record.key,
            &record.value,
            BINLOG_MAGIC.as_bytes(),
            origin.as_bytes(),
            &blob,
        ]),
        RecordOp::Delete => encode_command(&[
            b"DEL",
            &record.key,
            BINLOG_MAGIC.as_bytes(),
            origin.as_bytes(),
            &blob,
        ]),
        RecordOp::ExpireAt => encode_command(&[
            b"EXPIREAT",
            &record.key,
            &record.value,
            BINLOG_MAGIC.as_bytes(),
            origin.as_bytes(),
            &blob,
        ]),
    }
}

/// Parse an inbound mutation command. `Ok(None)` when the command name
/// is not a mutation (the caller routes it elsewhere); a mutation with a
/// wrong magic or arity is a protocol error.
pub fn parse_mutation(args: &[Vec<u8>]) -> Result<Option<(LogRecord, u64, u64)>> {
    if args.is_empty() {
        return Err(Error::protocol("empty command"));
    }
    let name = args[0].to_ascii_uppercase();
    let (op, arity, value_at) = match name.as_slice() {
        b"SET" => (RecordOp::Set, 6, Some(2)),
        b"DEL" => (RecordOp::Delete, 5, None),
        b"EXPIREAT" => (RecordOp::ExpireAt, 6, Some(2)),
        _ => return Ok(None),
    };
    if args.len() != arity {
        return Err(Error::protocol(format!(
            "{} expects {} arguments, got {}",
            String::from_utf8_lossy(&name),
            arity,
            args.len()
        )));
    }
    let magic_at = arity - 3;
    if args[magic_at] != BINLOG_MAGIC.as_bytes() {
        return Err(Error::protocol("bad magic, not a hub peer"));
    }
    let origin_id: i32 = arg_num(&args[magic_at + 1], "origin id")?;
    let blob = PositionBlob::unpack(&args[magic_at + 2])?;
    let key = args[1].clone();
    let value = value_at.map(|i| args[i].clone()).unwrap_or_default();
    let record = LogRecord::new(op, key, value, origin_id, blob.logical_time as i32);
    Ok(Some((record, blob.sequence as u64, blob.offset)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::BufReader;

    fn reply_of(bytes: &[u8]) -> Reply {
        read_reply(&mut BufReader::new(bytes)).unwrap()
    }

    #[test]
    fn test_encode_command_layout() {
        let buf = encode_command(&[b"PING"]);
        assert_eq!(buf, b"*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn test_reply_kinds() {
        assert!(reply_of(b"+ok\r\n").is_ok());
        assert!(reply_of(b"+PONG\r\n").is_pong());
        assert_eq!(reply_of(b":42\r\n"), Reply::Integer(42));
        assert_eq!(reply_of(b"$2\r\nhi\r\n"), Reply::Bulk(b"hi".to_vec()));
        assert_eq!(reply_of(b"$-1\r\n"), Reply::Nil);
        assert!(matches!(reply_of(b"-ERR nope\r\n"), Reply::Error(_)));
    }

    #[test]
    fn test_read_command_roundtrip() {
        let buf = encode_command(&[b"SET", b"k", b"v"]);
        let mut reader = BufReader::new(buf.as_slice());
        let args = read_command(&mut reader).unwrap().unwrap();
        assert_eq!(args, vec![b"SET".to_vec(), b"k".to_vec(), b"v".to_vec()]);
        // Clean EOF afterwards.
        assert!(read_command(&mut reader).unwrap().is_none());
    }

    #[test]
    fn test_trysync_roundtrip() {
        let buf = build_trysync("10.0.0.1", 9221, 7, 4096);
        let mut reader = BufReader::new(buf.as_slice());
        let args = read_command(&mut reader).unwrap().unwrap();
        let req = parse_trysync(&args).unwrap();
        assert_eq!(
            req,
            TrysyncRequest {
                ip: "10.0.0.1".into(),
                port: 9221,
                sequence: 7,
                offset: 4096,
            }
        );
    }

    #[test]
    fn test_mutation_roundtrip_set() {
        let record = LogRecord::new(RecordOp::Set, b"k".to_vec(), b"v".to_vec(), 3, 99);
        let buf = build_mutation(&record, 5, 1234);
        let args = read_command(&mut BufReader::new(buf.as_slice()))
            .unwrap()
            .unwrap();
        let (decoded, sequence, offset) = parse_mutation(&args).unwrap().unwrap();
        assert_eq!(decoded, record);
        assert_eq!((sequence, offset), (5, 1234));
    }

    #[test]
    fn test_mutation_roundtrip_del() {
        let record = LogRecord::new(RecordOp::Delete, b"k".to_vec(), Vec::new(), 3, 99);
        let buf = build_mutation(&record, 1, 0);
        let args = read_command(&mut BufReader::new(buf.as_slice()))
            .unwrap()
            .unwrap();
        let (decoded, _, _) = parse_mutation(&args).unwrap().unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_mutation_bad_magic_rejected() {
        let record = LogRecord::new(RecordOp::Set, b"k".to_vec(), b"v".to_vec(), 3, 99);
        let buf = build_mutation(&record, 5, 1234);
        let mut args = read_command(&mut BufReader::new(buf.as_slice()))
            .unwrap()
            .unwrap();
        args[3] = b"not-the-magic".to_vec();
        assert!(matches!(parse_mutation(&args), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_non_mutation_passes_through() {
        let args = vec![b"INFO".to_vec()];
        assert!(parse_mutation(&args).unwrap().is_none());
    }
}
